//! Conversion records and the signals extracted from them

use crate::models::AttributionRecord;
use crate::signals::{normalize_ips, normalize_token};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// IP fields arrive either as one (possibly comma-separated) string or a list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IpField {
    One(String),
    Many(Vec<String>),
}

impl IpField {
    pub fn raw_values(&self) -> Vec<&str> {
        match self {
            IpField::One(value) => vec![value.as_str()],
            IpField::Many(values) => values.iter().map(String::as_str).collect(),
        }
    }
}

/// A conversion (purchase) record
///
/// Fields this crate does not interpret are preserved through `extra` so a
/// rewrite never drops data written by other producers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversion {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    #[serde(with = "crate::models::timestamp")]
    pub timestamp: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none", alias = "customerEmail")]
    pub email: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none", alias = "orderTotal")]
    pub order_total: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none", alias = "ipAddress")]
    pub ip: Option<IpField>,

    /// IPs observed across the customer's session
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "ipAddresses")]
    pub ip_addresses: Option<IpField>,

    #[serde(default, skip_serializing_if = "Option::is_none", alias = "checkoutIp")]
    pub checkout_ip: Option<IpField>,

    #[serde(default, skip_serializing_if = "Option::is_none", alias = "pageviewIp")]
    pub pageview_ip: Option<IpField>,

    #[serde(default, skip_serializing_if = "Option::is_none", alias = "sessionToken")]
    pub session_token: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none", alias = "deviceFingerprint")]
    pub device_fingerprint: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none", alias = "screenHash")]
    pub screen_hash: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none", alias = "webglHash")]
    pub webgl_hash: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attribution: Option<AttributionRecord>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Conversion {
    /// Identity used for processed markers: email when present, else the record key
    pub fn identity<'a>(&'a self, key: &'a str) -> &'a str {
        self.email
            .as_deref()
            .map(str::trim)
            .filter(|email| !email.is_empty())
            .unwrap_or(key)
    }
}

/// Normalized matching signals of one conversion, grouped per tier
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConversionSignals {
    pub session_token: Option<String>,
    /// `ip` and `ip_addresses`
    pub primary_ips: Vec<String>,
    /// Checkout IPs not already among the primary IPs
    pub checkout_ips: Vec<String>,
    /// Page-view IPs not already covered above
    pub pageview_ips: Vec<String>,
    pub device_fingerprint: Option<String>,
    pub screen_hash: Option<String>,
    pub webgl_hash: Option<String>,
}

impl ConversionSignals {
    pub fn from_conversion(conversion: &Conversion) -> Self {
        fn raw(field: &Option<IpField>) -> Vec<&str> {
            field.as_ref().map(IpField::raw_values).unwrap_or_default()
        }

        let mut primary_raw = raw(&conversion.ip);
        primary_raw.extend(raw(&conversion.ip_addresses));
        let primary_ips = normalize_ips(primary_raw);

        let checkout_ips: Vec<String> = normalize_ips(raw(&conversion.checkout_ip))
            .into_iter()
            .filter(|ip| !primary_ips.contains(ip))
            .collect();

        let pageview_ips = normalize_ips(raw(&conversion.pageview_ip))
            .into_iter()
            .filter(|ip| !primary_ips.contains(ip) && !checkout_ips.contains(ip))
            .collect();

        Self {
            session_token: conversion.session_token.as_deref().and_then(normalize_token),
            primary_ips,
            checkout_ips,
            pageview_ips,
            device_fingerprint: conversion
                .device_fingerprint
                .as_deref()
                .and_then(normalize_token),
            screen_hash: conversion.screen_hash.as_deref().and_then(normalize_token),
            webgl_hash: conversion.webgl_hash.as_deref().and_then(normalize_token),
        }
    }

    /// Records written before checkout/page-view IP and device signals were
    /// captured carry only the primary IP and session token
    pub fn has_enhanced_signals(&self) -> bool {
        !self.checkout_ips.is_empty()
            || !self.pageview_ips.is_empty()
            || self.device_fingerprint.is_some()
            || self.screen_hash.is_some()
            || self.webgl_hash.is_some()
    }

    /// Every known IP in tier order, without duplicates
    pub fn all_ips(&self) -> Vec<String> {
        self.primary_ips
            .iter()
            .chain(&self.checkout_ips)
            .chain(&self.pageview_ips)
            .cloned()
            .collect()
    }
}
