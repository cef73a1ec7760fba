//! Serde adapters for durations expressed as integer nanoseconds, the
//! encoding the broker's admin API uses everywhere.

use serde::{Deserialize, Deserializer, Serializer};
use std::time::Duration;

pub(crate) fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(value.as_nanos().min(u64::MAX as u128) as u64)
}

pub(crate) fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    let nanos = u64::deserialize(deserializer)?;
    Ok(Duration::from_nanos(nanos))
}

/// `Option<Duration>` as nanoseconds, omitted when `None`.
pub(crate) mod option {
    use super::*;

    pub(crate) fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(duration) => super::serialize(duration, serializer),
            None => serializer.serialize_none(),
        }
    }

    pub(crate) fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        let nanos = Option::<u64>::deserialize(deserializer)?;
        Ok(nanos.map(Duration::from_nanos))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Serialize;

    #[derive(Serialize, Deserialize)]
    struct Wrapper {
        #[serde(with = "super")]
        ack_wait: Duration,
    }

    #[test]
    fn test_duration_as_nanos() {
        let json = serde_json::to_string(&Wrapper {
            ack_wait: Duration::from_secs(30),
        })
        .unwrap();
        assert_eq!(json, r#"{"ack_wait":30000000000}"#);

        let back: Wrapper = serde_json::from_str(&json).unwrap();
        assert_eq!(back.ack_wait, Duration::from_secs(30));
    }
}
