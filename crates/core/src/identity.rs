use chrono::{DateTime, Utc};
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Longest sender-supplied identifier accepted verbatim.
pub const MAX_EVENT_ID_LEN: usize = 200;

/// Prefix marking identifiers derived from payload content.
pub const DERIVED_ID_PREFIX: &str = "h-";

/// Where an event identifier came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentitySource {
    Header,
    Payload,
    Derived,
}

impl IdentitySource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Header => "header",
            Self::Payload => "payload",
            Self::Derived => "derived",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventIdentity {
    pub id: String,
    pub source: IdentitySource,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdentityError {
    #[error("event id must not be empty")]
    Empty,
    #[error("event id exceeds {MAX_EVENT_ID_LEN} bytes")]
    TooLong,
    #[error("event id contains control or whitespace characters")]
    InvalidCharacters,
}

/// Resolves the identity of an inbound event.
///
/// Preference order: explicit id header, top-level `id` of a JSON payload,
/// then a content hash of the raw bytes salted with the arrival bucket. The
/// bucket makes byte-identical payloads sent far apart distinct events while
/// collapsing sender retries that land in the same window.
pub fn resolve_event_id(
    header_id: Option<&str>,
    payload: Option<&Value>,
    raw_payload: &[u8],
    received_at: DateTime<Utc>,
    bucket: std::time::Duration,
) -> Result<EventIdentity, IdentityError> {
    if let Some(header_id) = header_id {
        return Ok(EventIdentity {
            id: validate(header_id)?,
            source: IdentitySource::Header,
        });
    }

    if let Some(payload_id) = payload.and_then(payload_event_id) {
        return Ok(EventIdentity {
            id: validate(&payload_id)?,
            source: IdentitySource::Payload,
        });
    }

    Ok(EventIdentity {
        id: derive_event_id(raw_payload, received_at, bucket),
        source: IdentitySource::Derived,
    })
}

/// Extracts a top-level string or integer `id` field.
pub fn payload_event_id(payload: &Value) -> Option<String> {
    match payload.get("id")? {
        Value::String(value) => Some(value.clone()),
        Value::Number(value) if value.is_i64() || value.is_u64() => Some(value.to_string()),
        _ => None,
    }
}

/// Deterministic identifier from the raw payload and arrival bucket.
pub fn derive_event_id(
    raw_payload: &[u8],
    received_at: DateTime<Utc>,
    bucket: std::time::Duration,
) -> String {
    let bucket_secs = bucket.as_secs().max(1) as i64;
    let arrival_bucket = received_at.timestamp().div_euclid(bucket_secs);

    let mut hasher = Sha256::new();
    hasher.update(raw_payload);
    hasher.update(arrival_bucket.to_be_bytes());
    format!("{DERIVED_ID_PREFIX}{}", hex::encode(hasher.finalize()))
}

fn validate(value: &str) -> Result<String, IdentityError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(IdentityError::Empty);
    }
    if trimmed.len() > MAX_EVENT_ID_LEN {
        return Err(IdentityError::TooLong);
    }
    if trimmed.chars().any(|c| c.is_control() || c.is_whitespace()) {
        return Err(IdentityError::InvalidCharacters);
    }
    Ok(trimmed.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    fn at(seconds: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_100 + seconds, 0).expect("timestamp")
    }

    #[test]
    fn header_takes_precedence_over_payload() {
        let payload = json!({ "id": "evt-body" });
        let identity = resolve_event_id(
            Some("evt-header"),
            Some(&payload),
            b"{}",
            at(0),
            Duration::from_secs(300),
        )
        .expect("identity");
        assert_eq!(identity.id, "evt-header");
        assert_eq!(identity.source, IdentitySource::Header);
    }

    #[test]
    fn payload_id_is_used_when_header_missing() {
        let payload = json!({ "id": "evt-1" });
        let identity =
            resolve_event_id(None, Some(&payload), b"{}", at(0), Duration::from_secs(300))
                .expect("identity");
        assert_eq!(identity.id, "evt-1");
        assert_eq!(identity.source, IdentitySource::Payload);

        let numeric = json!({ "id": 42 });
        assert_eq!(payload_event_id(&numeric).as_deref(), Some("42"));
        assert_eq!(payload_event_id(&json!({ "id": 1.5 })), None);
        assert_eq!(payload_event_id(&json!(["id"])), None);
    }

    #[test]
    fn derived_id_is_stable_within_bucket() {
        let bucket = Duration::from_secs(300);
        let first = derive_event_id(b"payload", at(0), bucket);
        let same_bucket = derive_event_id(b"payload", at(10), bucket);
        let next_bucket = derive_event_id(b"payload", at(400), bucket);
        let other_payload = derive_event_id(b"payload!", at(0), bucket);

        assert!(first.starts_with(DERIVED_ID_PREFIX));
        assert_eq!(first, same_bucket);
        assert_ne!(first, next_bucket);
        assert_ne!(first, other_payload);
    }

    #[test]
    fn rejects_invalid_sender_ids() {
        let bucket = Duration::from_secs(300);
        assert_eq!(
            resolve_event_id(Some("  "), None, b"", at(0), bucket),
            Err(IdentityError::Empty)
        );
        let long = "x".repeat(MAX_EVENT_ID_LEN + 1);
        assert_eq!(
            resolve_event_id(Some(&long), None, b"", at(0), bucket),
            Err(IdentityError::TooLong)
        );
        assert_eq!(
            resolve_event_id(Some("evt 1"), None, b"", at(0), bucket),
            Err(IdentityError::InvalidCharacters)
        );
    }
}
