//! Record fixtures and engine construction

use attrib_common::store::{MemoryRecordStore, RecordStore};
use attrib_engine::models::{BuildReport, Conversion, MatchOptions};
use attrib_engine::services::GeoProvider;
use attrib_engine::{AttributionEngine, EngineConfig};
use chrono::{DateTime, Duration, TimeZone, Utc};
use serde_json::{json, Value};
use std::sync::Arc;

/// Conversion time used throughout the tests
pub fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 15, 14, 0, 0).unwrap()
}

/// Visit JSON `minutes_before` the base time
pub fn visit(minutes_before: i64, ip: &str, session: Option<&str>) -> Value {
    let mut value = json!({
        "timestamp": (base_time() - Duration::minutes(minutes_before)).to_rfc3339(),
        "ip": ip,
        "landing_page": "https://shop.example.com/spring-sale?utm_source=google",
        "source": "google",
    });
    if let Some(session) = session {
        value["session_token"] = json!(session);
    }
    value
}

pub async fn put_visit(store: &dyn RecordStore, key: &str, value: Value) {
    store.set(key, &value.to_string(), None).await.unwrap();
}

pub async fn put_conversion(store: &dyn RecordStore, id: &str, value: Value) {
    store
        .set(&format!("conversion:{id}"), &value.to_string(), None)
        .await
        .unwrap();
}

pub async fn read_conversion(store: &dyn RecordStore, id: &str) -> Conversion {
    let json = store
        .get(&format!("conversion:{id}"))
        .await
        .unwrap()
        .expect("conversion exists");
    serde_json::from_str(&json).unwrap()
}

/// Default options with a single geo window
pub fn geo_window(minutes: u32) -> MatchOptions {
    MatchOptions {
        geo_windows_minutes: vec![minutes],
        ..Default::default()
    }
}

/// Small pages, visit records only, no verification pass
pub fn test_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.index.patterns = vec!["visit:*".to_string()];
    config.index.high_risk_ranges = Vec::new();
    config.index.page_size = 10;
    config.index.concurrency = 4;
    config.batch.page_size = 5;
    config.batch.concurrency = 2;
    config
}

pub fn engine_with(
    store: Arc<MemoryRecordStore>,
    provider: Arc<dyn GeoProvider>,
    config: EngineConfig,
) -> AttributionEngine {
    AttributionEngine::new(store, provider, config)
}

/// Run a build to completion in one unbounded invocation
pub async fn build(engine: &AttributionEngine) -> BuildReport {
    let ctx = engine.new_run_context(0);
    let report = engine.build_indexes(&ctx, false).await.unwrap();
    assert!(report.complete, "build did not complete: {:?}", report.stop_reason);
    report
}
