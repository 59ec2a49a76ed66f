//! Data models

pub mod attribution;
pub mod conversion;
pub mod geo;
pub mod index_entry;
pub mod progress;
pub mod timestamp;
pub mod visit;

pub use attribution::{
    AttributionMethod, AttributionModel, AttributionOutcome, AttributionRecord, ConfidenceBand,
    GeoEvidence, GeoGranularity, IspAgreement, Journey, JourneySummary, MatchOptions,
    MatchedAttribution, Touchpoint,
};
pub use conversion::{Conversion, ConversionSignals, IpField};
pub use geo::{GeoCacheEntry, GeoCacheStatus, GeoInfo, GeoLookup};
pub use index_entry::{IndexEntry, SignalKind};
pub use progress::{
    BatchReport, BuildPhase, BuildProgress, BuildReport, BuildStats, ScanCheckpoint, StopReason,
};
pub use visit::{Visit, VisitGeo, VisitSummary};
