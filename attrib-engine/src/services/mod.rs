//! Engine services
//!
//! Index building and reading, geolocation, matching, journey assembly,
//! and the batch passes that tie them together.

pub mod attribution_pass;
pub mod geo_cache;
pub mod geo_client;
pub mod geo_correlator;
pub mod index_builder;
pub mod index_reader;
pub mod isp;
pub mod journey;
pub mod matcher;
pub mod paged_scan;
pub mod service;

pub use attribution_pass::{Attributor, PassDefinition, PassKind, RevisitTarget, WritePolicy};
pub use geo_cache::GeoLookupCache;
pub use geo_client::{GeoClientSettings, GeoError, GeoProvider, HttpGeoProvider};
pub use geo_correlator::{GeoCorrelator, GeoMatch};
pub use index_builder::{IndexBuilder, IndexBuilderConfig};
pub use index_reader::IndexReader;
pub use matcher::{GeoTier, IdentityResolver, MatchTier, SignalTier};
pub use paged_scan::{PageHandler, PagedScan, ScanOutcome};
pub use service::AttributionEngine;
