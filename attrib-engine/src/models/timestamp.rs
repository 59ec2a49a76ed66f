//! Lenient timestamp (de)serialization
//!
//! Records written over the years carry timestamps as RFC 3339 strings,
//! epoch seconds, or epoch milliseconds (numeric or string). Everything is
//! normalized to `DateTime<Utc>` on read and written back as RFC 3339 with
//! millisecond precision.

use attrib_common::time::from_epoch;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{de, Deserialize, Deserializer, Serializer};

#[derive(Deserialize)]
#[serde(untagged)]
enum RawTimestamp {
    Integer(i64),
    Float(f64),
    Text(String),
}

/// Parse a timestamp from its textual form
pub fn parse_timestamp(text: &str) -> Option<DateTime<Utc>> {
    let text = text.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(text) {
        return Some(ts.with_timezone(&Utc));
    }
    text.parse::<i64>().ok().and_then(from_epoch)
}

/// Canonical textual form used in every record this crate writes
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn serialize<S>(ts: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&format_timestamp(ts))
}

pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let parsed = match RawTimestamp::deserialize(deserializer)? {
        RawTimestamp::Integer(value) => from_epoch(value),
        RawTimestamp::Float(value) => from_epoch(value as i64),
        RawTimestamp::Text(text) => parse_timestamp(&text),
    };
    parsed.ok_or_else(|| de::Error::custom("unrecognized timestamp"))
}

/// Same as the parent module, for `Option<DateTime<Utc>>` fields
pub mod option {
    use super::*;

    pub fn serialize<S>(ts: &Option<DateTime<Utc>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match ts {
            Some(ts) => serializer.serialize_some(&format_timestamp(ts)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Option::<RawTimestamp>::deserialize(deserializer)? {
            None => Ok(None),
            Some(RawTimestamp::Integer(value)) => Ok(from_epoch(value)),
            Some(RawTimestamp::Float(value)) => Ok(from_epoch(value as i64)),
            Some(RawTimestamp::Text(text)) => Ok(parse_timestamp(&text)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Serialize;

    #[derive(Debug, Serialize, Deserialize)]
    struct Stamped {
        #[serde(with = "super")]
        at: DateTime<Utc>,
    }

    #[test]
    fn test_accepts_all_stored_forms() {
        let forms = [
            r#"{"at":"2024-06-15T14:30:00Z"}"#,
            r#"{"at":"2024-06-15T16:30:00+02:00"}"#,
            r#"{"at":1718461800}"#,
            r#"{"at":1718461800000}"#,
            r#"{"at":"1718461800000"}"#,
        ];
        for form in forms {
            let parsed: Stamped = serde_json::from_str(form).unwrap();
            assert_eq!(format_timestamp(&parsed.at), "2024-06-15T14:30:00.000Z", "{form}");
        }
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(serde_json::from_str::<Stamped>(r#"{"at":"yesterday"}"#).is_err());
    }
}
