//! ISP name normalization
//!
//! Geolocation providers describe the same network in many ways:
//! "AS7922 Comcast Cable Communications, LLC", "Comcast Cable", "Xfinity".
//! Names are reduced to a canonical carrier so they can be compared.

use crate::models::IspAgreement;
use once_cell::sync::Lazy;

/// Jaro-Winkler similarity at or above which two normalized names are "similar"
const SIMILARITY_THRESHOLD: f64 = 0.92;

const CORPORATE_SUFFIXES: &[&str] = &[
    "inc", "llc", "ltd", "lp", "corp", "corporation", "co", "company", "limited", "gmbh", "sa",
    "plc", "ag", "bv",
];

const GENERIC_WORDS: &[&str] = &[
    "communications", "communication", "cable", "wireless", "mobility", "broadband", "internet",
    "services", "service", "telecom", "network", "networks", "holdings", "the",
];

/// Known aliases, matched on the leading words of a cleaned name
static CARRIER_ALIASES: Lazy<Vec<(&'static str, &'static str)>> = Lazy::new(|| {
    vec![
        ("tmobile", "tmobile"),
        ("t mobile", "tmobile"),
        ("metro by tmobile", "tmobile"),
        ("metropcs", "tmobile"),
        ("sprint", "tmobile"),
        ("att", "att"),
        ("at and t", "att"),
        ("cricket", "att"),
        ("verizon", "verizon"),
        ("cellco partnership", "verizon"),
        ("cellco", "verizon"),
        ("comcast", "comcast"),
        ("xfinity", "comcast"),
        ("charter", "charter"),
        ("spectrum", "charter"),
        ("cox", "cox"),
    ]
});

/// Canonical carrier name, or `None` for an empty name
pub fn normalize_isp(name: &str) -> Option<String> {
    let lowered = name.to_lowercase().replace('&', " and ");
    let mut words: Vec<String> = lowered
        .split_whitespace()
        .map(|w| w.chars().filter(|c| c.is_alphanumeric()).collect::<String>())
        .filter(|w| !w.is_empty())
        .collect();

    // "AS7922 Comcast ..." → drop the autonomous system number
    let is_asn = |w: &String| {
        w.len() > 2 && w.starts_with("as") && w[2..].chars().all(|c| c.is_ascii_digit())
    };
    if words.first().is_some_and(is_asn) {
        words.remove(0);
    }
    words.retain(|w| !CORPORATE_SUFFIXES.contains(&w.as_str()));

    let cleaned = words.join(" ");

    for (alias, canonical) in CARRIER_ALIASES.iter() {
        if cleaned == *alias || cleaned.starts_with(&format!("{} ", alias)) {
            return Some((*canonical).to_string());
        }
    }

    let significant: Vec<&str> = cleaned
        .split(' ')
        .filter(|w| !GENERIC_WORDS.contains(w))
        .collect();
    let result = if significant.is_empty() {
        cleaned.clone()
    } else {
        significant.join(" ")
    };
    (!result.is_empty()).then_some(result)
}

/// Compare two raw ISP names
pub fn compare_isps(a: Option<&str>, b: Option<&str>) -> IspAgreement {
    let (Some(a), Some(b)) = (a.and_then(normalize_isp), b.and_then(normalize_isp)) else {
        return IspAgreement::Unknown;
    };
    if a == b {
        IspAgreement::Exact
    } else if strsim::jaro_winkler(&a, &b) >= SIMILARITY_THRESHOLD {
        IspAgreement::Similar
    } else {
        IspAgreement::Different
    }
}
