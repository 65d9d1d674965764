//! Duration parsing and serde codecs, used wherever kiln config structs hold
//! a `std::time::Duration` (lock timeouts, retry backoff, readiness polls).

use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Deserialize a `Duration` from either a human-readable string ("30s",
/// "5m") or a plain `u64` of milliseconds.
pub fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum DurationHelper {
        String(String),
        Millis(u64),
    }

    match DurationHelper::deserialize(deserializer)? {
        DurationHelper::String(s) => humantime::parse_duration(&s)
            .map_err(|e| serde::de::Error::custom(format!("invalid duration {s:?}: {e}"))),
        DurationHelper::Millis(ms) => Ok(Duration::from_millis(ms)),
    }
}

/// Serialize a `Duration` as milliseconds so it round-trips through
/// `deserialize_duration`.
pub fn serialize_duration<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_u64(duration.as_millis() as u64)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SerdeDuration(
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub Duration,
);

impl From<Duration> for SerdeDuration {
    fn from(d: Duration) -> Self {
        SerdeDuration(d)
    }
}

impl From<SerdeDuration> for Duration {
    fn from(d: SerdeDuration) -> Self {
        d.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_human_readable_string() {
        let json = "\"30s\"";
        let d: SerdeDuration = serde_json::from_str(json).expect("parse");
        assert_eq!(Duration::from(d), Duration::from_secs(30));
    }

    #[test]
    fn parses_millis_integer() {
        let json = "1500";
        let d: SerdeDuration = serde_json::from_str(json).expect("parse");
        assert_eq!(Duration::from(d), Duration::from_millis(1500));
    }

    #[test]
    fn serializes_as_millis() {
        let d = SerdeDuration(Duration::from_secs(2));
        let json = serde_json::to_string(&d).expect("serialize");
        assert_eq!(json, "2000");
    }

    #[test]
    fn rejects_garbage_string() {
        let json = "\"not-a-duration\"";
        let result: Result<SerdeDuration, _> = serde_json::from_str(json);
        assert!(result.is_err());
    }

    proptest::proptest! {
        #[test]
        fn millis_round_trip(ms in 0u64..10_000_000) {
            let d = SerdeDuration(Duration::from_millis(ms));
            let json = serde_json::to_string(&d).unwrap();
            let parsed: SerdeDuration = serde_json::from_str(&json).unwrap();
            proptest::prop_assert_eq!(Duration::from(parsed), Duration::from_millis(ms));
        }
    }
}
