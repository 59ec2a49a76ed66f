//! Signal normalization and key derivation shared by the index builder and the matcher

pub mod ip;
pub mod keys;

pub use ip::{normalize_ip, normalize_ips};
pub use keys::{
    checkpoint_key, geo_cache_key, hour_bucket, index_key, normalize_landing_page,
    normalize_signal, normalize_token, processed_marker_key, stage_key, PROGRESS_KEY,
};

use crate::models::{SignalKind, Visit, VisitSummary};

/// Every (signal, normalized value) pair a visit is indexed under
pub fn visit_signals(visit: &Visit, summary: &VisitSummary) -> Vec<(SignalKind, String)> {
    let mut signals: Vec<(SignalKind, String)> = summary
        .ips
        .iter()
        .map(|ip| (SignalKind::Ip, ip.clone()))
        .collect();

    let mut push = |kind: SignalKind, raw: Option<&str>| {
        if let Some(value) = raw.and_then(|raw| normalize_signal(kind, raw)) {
            signals.push((kind, value));
        }
    };
    push(SignalKind::Session, visit.session_token.as_deref());
    push(SignalKind::Fingerprint, visit.device_fingerprint.as_deref());
    push(SignalKind::Screen, visit.screen_hash.as_deref());
    push(SignalKind::Webgl, visit.webgl_hash.as_deref());
    push(SignalKind::Page, visit.landing_page.as_deref());
    push(SignalKind::Source, visit.source.as_deref());

    signals.push((SignalKind::Hour, hour_bucket(visit.timestamp)));
    signals
}
