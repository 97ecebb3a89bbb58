//! Human-readable duration (de)serialization, e.g. `"5m"`, `"1h 30m"`.

/// `Duration` <-> humantime string.
pub mod human {
    use serde::{de, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(raw.trim()).map_err(de::Error::custom)
    }
}

/// `BTreeMap<PrState, Duration>` <-> map of humantime strings.
pub mod human_map {
    use serde::ser::SerializeMap;
    use serde::{de, Deserialize, Deserializer, Serializer};
    use std::collections::BTreeMap;
    use std::time::Duration;

    use crate::types::PrState;

    pub fn serialize<S>(map: &BTreeMap<PrState, Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut out = serializer.serialize_map(Some(map.len()))?;
        for (state, duration) in map {
            out.serialize_entry(state, &humantime::format_duration(*duration).to_string())?;
        }
        out.end()
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<BTreeMap<PrState, Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = BTreeMap::<PrState, String>::deserialize(deserializer)?;
        raw.into_iter()
            .map(|(state, text)| {
                humantime::parse_duration(text.trim())
                    .map(|d| (state, d))
                    .map_err(|e| de::Error::custom(format!("{state}: {e}")))
            })
            .collect()
    }
}
