//! Serde adapters for the LCD wire format, which encodes integers as JSON
//! strings.

pub mod num_as_str {
    use std::{fmt::Display, str::FromStr};

    use serde::{de, Deserialize, Deserializer};

    pub fn deserialize<'de, T, D>(deserializer: D) -> Result<T, D::Error>
    where
        T: FromStr,
        T::Err: Display,
        D: Deserializer<'de>,
    {
        String::deserialize(deserializer)?
            .parse()
            .map_err(de::Error::custom)
    }
}
