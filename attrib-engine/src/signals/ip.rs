//! IP address normalization
//!
//! Proxies and CDNs hand us strings like `"2001:db8::1, 198.51.100.7"`,
//! `"[2001:db8::1]:443"` or `"::ffff:203.0.113.9"`. Each raw value is split
//! into individual addresses, parsed, and written in canonical form so the
//! index builder and the matcher agree on keys.

use std::net::{IpAddr, SocketAddr};

/// Split, parse, canonicalize, and deduplicate IPs, keeping first-seen order
pub fn normalize_ips<'a, I>(raw_values: I) -> Vec<String>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut normalized: Vec<String> = Vec::new();
    for raw in raw_values {
        for token in raw.split(|c: char| c == ',' || c == ';' || c.is_whitespace()) {
            if let Some(ip) = parse_ip(token) {
                let canonical = ip.to_string();
                if !normalized.contains(&canonical) {
                    normalized.push(canonical);
                }
            }
        }
    }
    normalized
}

/// Canonical form of a single address, or `None` if it is not one
pub fn normalize_ip(raw: &str) -> Option<String> {
    parse_ip(raw).map(|ip| ip.to_string())
}

fn parse_ip(token: &str) -> Option<IpAddr> {
    let token = token.trim().trim_matches(|c| c == '"' || c == '\'');
    if token.is_empty() {
        return None;
    }

    let ip = token
        .parse::<IpAddr>()
        .or_else(|_| token.parse::<SocketAddr>().map(|addr| addr.ip()))
        .ok()
        .or_else(|| {
            token
                .strip_prefix('[')
                .and_then(|rest| rest.split(']').next())
                .and_then(|inner| inner.parse::<IpAddr>().ok())
        })?;

    let ip = match ip {
        IpAddr::V6(v6) => v6
            .to_ipv4_mapped()
            .map(IpAddr::V4)
            .unwrap_or(IpAddr::V6(v6)),
        v4 => v4,
    };

    if ip.is_unspecified() || ip.is_loopback() {
        return None;
    }
    Some(ip)
}
