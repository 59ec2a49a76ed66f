//! Store key layout and signal normalization
//!
//! ```text
//! idx:{signal}:{encoded value}     index entry
//! idx:hour:{YYYYMMDDHH}            hour bucket (geo candidate pool)
//! idx:progress                     build progress
//! idx:stage:{build_id}:{n}         staged partial accumulation
//! geo:{encoded ip}                 geolocation cache
//! attr:checkpoint:{namespace}      pass checkpoint
//! attr:done:{namespace}:{hash}:{ms} processed marker
//! ```

use crate::models::SignalKind;
use crate::signals::ip::normalize_ip;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use url::Url;

pub const PROGRESS_KEY: &str = "idx:progress";

const PAGE_KEY_MAX_LEN: usize = 200;
const SOURCE_KEY_MAX_LEN: usize = 100;
const TOKEN_KEY_MAX_LEN: usize = 128;

/// Trimmed non-empty value
pub fn normalize_token(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

/// `host/path` without scheme, query, fragment, or trailing slash
pub fn normalize_landing_page(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }

    let parsed = Url::parse(trimmed)
        .ok()
        .filter(|url| url.has_host())
        .or_else(|| Url::parse(&format!("https://{}", trimmed)).ok());

    let normalized = match parsed {
        Some(url) => {
            let host = url.host_str().unwrap_or_default();
            let path = url.path().trim_end_matches('/');
            format!("{}{}", host, path)
        }
        None => trimmed
            .split(|c: char| c == '?' || c == '#')
            .next()
            .unwrap_or(trimmed)
            .trim_end_matches('/')
            .to_lowercase(),
    };
    (!normalized.is_empty()).then_some(normalized)
}

/// Normalize a raw signal value the same way on the write and read paths
pub fn normalize_signal(kind: SignalKind, raw: &str) -> Option<String> {
    match kind {
        SignalKind::Ip => normalize_ip(raw),
        SignalKind::Page => normalize_landing_page(raw),
        SignalKind::Source => normalize_token(raw).map(|s| s.to_lowercase()),
        SignalKind::Session
        | SignalKind::Fingerprint
        | SignalKind::Screen
        | SignalKind::Webgl
        | SignalKind::Hour => normalize_token(raw),
    }
}

/// Index key for an already-normalized value
pub fn index_key(kind: SignalKind, value: &str) -> String {
    let encoded = match kind {
        SignalKind::Ip => encode_ip(value),
        SignalKind::Page => encode_component(value, PAGE_KEY_MAX_LEN),
        SignalKind::Source => encode_component(value, SOURCE_KEY_MAX_LEN),
        SignalKind::Hour => value.to_string(),
        SignalKind::Session | SignalKind::Fingerprint | SignalKind::Screen | SignalKind::Webgl => {
            encode_component(value, TOKEN_KEY_MAX_LEN)
        }
    };
    format!("idx:{}:{}", kind.key_segment(), encoded)
}

/// IPv6 colons would collide with the key separator
pub fn encode_ip(ip: &str) -> String {
    ip.replace(':', "_")
}

/// Percent-encode and truncate to `max_len` bytes
pub fn encode_component(value: &str, max_len: usize) -> String {
    let mut encoded: String = url::form_urlencoded::byte_serialize(value.as_bytes()).collect();
    // byte_serialize output is ASCII
    encoded.truncate(max_len);
    encoded
}

/// `YYYYMMDDHH` bucket of a timestamp
pub fn hour_bucket(ts: DateTime<Utc>) -> String {
    ts.format("%Y%m%d%H").to_string()
}

pub fn stage_key(build_id: &str, chunk: u32) -> String {
    format!("idx:stage:{}:{}", build_id, chunk)
}

pub fn geo_cache_key(ip: &str) -> String {
    format!("geo:{}", encode_ip(ip))
}

pub fn checkpoint_key(namespace: &str) -> String {
    format!("attr:checkpoint:{}", namespace)
}

pub fn processed_marker_key(namespace: &str, identity: &str, ts: DateTime<Utc>) -> String {
    format!(
        "attr:done:{}:{}:{}",
        namespace,
        identity_hash(identity),
        ts.timestamp_millis()
    )
}

/// Truncated SHA-256 of the lowercased identity, keeps emails out of keys
pub fn identity_hash(identity: &str) -> String {
    let digest = Sha256::digest(identity.trim().to_lowercase().as_bytes());
    digest[..8].iter().map(|b| format!("{:02x}", b)).collect()
}
