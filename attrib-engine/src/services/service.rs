//! Engine facade
//!
//! Wires the store, geo provider, and configuration into the builder,
//! reader, resolver, and pass runner, and exposes the operations the CLI
//! (and tests) call.

use crate::config::EngineConfig;
use crate::context::RunContext;
use crate::error::EngineResult;
use crate::models::{
    AttributionRecord, BatchReport, BuildReport, MatchOptions, SignalKind, VisitSummary,
};
use crate::services::attribution_pass::{Attributor, WritePolicy};
use crate::services::geo_cache::GeoLookupCache;
use crate::services::geo_client::GeoProvider;
use crate::services::geo_correlator::GeoCorrelator;
use crate::services::index_builder::IndexBuilder;
use crate::services::index_reader::IndexReader;
use crate::services::matcher::{GeoTier, IdentityResolver, MatchTier, SignalTier};
use attrib_common::store::RecordStore;
use std::sync::Arc;
use std::time::Duration;

const CONVERSION_PREFIX: &str = "conversion:";

pub struct AttributionEngine {
    store: Arc<dyn RecordStore>,
    config: EngineConfig,
    builder: IndexBuilder,
    reader: IndexReader,
    attributor: Attributor,
}

impl AttributionEngine {
    pub fn new(
        store: Arc<dyn RecordStore>,
        provider: Arc<dyn GeoProvider>,
        config: EngineConfig,
    ) -> Self {
        let reader = IndexReader::new(store.clone());

        let cache = Arc::new(GeoLookupCache::new(
            store.clone(),
            provider,
            Duration::from_secs(config.geo.cache_ttl_secs),
            Duration::from_secs(config.geo.failure_ttl_secs.max(60)),
        ));
        let correlator = Arc::new(GeoCorrelator::new(
            cache,
            config.matching.geo_acceptance_score,
            config.matching.max_geo_ips,
            config.matching.max_geo_candidates,
        ));

        let mut tiers: Vec<Arc<dyn MatchTier>> = SignalTier::standard_tiers(&reader)
            .into_iter()
            .map(|tier| Arc::new(tier) as Arc<dyn MatchTier>)
            .collect();
        tiers.push(Arc::new(GeoTier::new(correlator, reader.clone())));
        let resolver = Arc::new(IdentityResolver::new(tiers));

        Self {
            builder: IndexBuilder::new(store.clone(), config.index.builder_config()),
            attributor: Attributor::new(store.clone(), resolver),
            reader,
            store,
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    /// Context for one invocation; a budget of 0 means unbounded
    pub fn new_run_context(&self, budget_secs: u64) -> RunContext {
        let budget = (budget_secs > 0).then(|| Duration::from_secs(budget_secs));
        RunContext::new(budget, self.config.geo.call_budget)
    }

    /// Build or continue building the signal indexes
    ///
    /// `restart` discards any saved progress and starts a fresh build.
    pub async fn build_indexes(
        &self,
        ctx: &RunContext,
        restart: bool,
    ) -> EngineResult<BuildReport> {
        let progress = if restart {
            tracing::info!("Discarding saved build progress");
            Some(Default::default())
        } else {
            None
        };
        self.builder.build(ctx, progress).await
    }

    /// Resolve one conversion by id or full key
    ///
    /// With `persist` the result is written back (keeping the prior result
    /// as history); otherwise the store is left untouched.
    pub async fn resolve_attribution(
        &self,
        ctx: &RunContext,
        conversion_ref: &str,
        options: &MatchOptions,
        persist: bool,
    ) -> EngineResult<AttributionRecord> {
        let key = conversion_key(conversion_ref);
        let conversion = self.attributor.load_conversion(&key).await?;
        let policy = if persist {
            WritePolicy::Always
        } else {
            WritePolicy::Never
        };

        let (record, _) = self
            .attributor
            .attribute(ctx, &key, conversion, options, None, policy)
            .await?;

        tracing::info!(
            key = %key,
            method = ?record.method(),
            confidence = record.confidence(),
            run_id = %ctx.run_id(),
            "Conversion resolved"
        );
        Ok(record)
    }

    pub async fn query_index(
        &self,
        kind: SignalKind,
        value: &str,
        limit: usize,
    ) -> EngineResult<Vec<VisitSummary>> {
        self.reader.query(kind, value, limit).await
    }

    /// Remove expired records (staging chunks, markers, geo entries) from the store
    pub async fn purge_expired(&self) -> EngineResult<u64> {
        Ok(self.store.purge_expired().await?)
    }

    pub async fn attribute_pending(
        &self,
        ctx: &RunContext,
        options: MatchOptions,
    ) -> EngineResult<BatchReport> {
        let pass = self.config.pending_pass(options);
        self.attributor.run_pass(ctx, &pass).await
    }

    pub async fn run_recovery(
        &self,
        ctx: &RunContext,
        pass_name: &str,
    ) -> EngineResult<BatchReport> {
        let pass = self.config.recovery_pass(pass_name)?;
        self.attributor.run_pass(ctx, &pass).await
    }
}

fn conversion_key(conversion_ref: &str) -> String {
    let conversion_ref = conversion_ref.trim();
    if conversion_ref.starts_with(CONVERSION_PREFIX) {
        conversion_ref.to_string()
    } else {
        format!("{CONVERSION_PREFIX}{conversion_ref}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conversion_key() {
        assert_eq!(conversion_key("1042"), "conversion:1042");
        assert_eq!(conversion_key(" conversion:1042 "), "conversion:1042");
    }
}
