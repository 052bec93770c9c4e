// SPDX-FileCopyrightText: 2022 Profian Inc. <opensource@profian.com>
// SPDX-License-Identifier: Apache-2.0

use chrono::NaiveDate;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// The usage condition that travels with provided data.
///
/// On the wire an unrestricted dimension is the empty string.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Condition {
    /// Remaining number of sessions; `None` is unlimited.
    #[serde(default, with = "counter")]
    pub counter: Option<i64>,

    #[serde(default, with = "empty")]
    pub location: Option<String>,

    #[serde(default, rename = "expirationDate", with = "empty")]
    pub expiration_date: Option<NaiveDate>,
}

impl Condition {
    /// Whether the counter is bounded and used up.
    pub fn exhausted(&self) -> bool {
        matches!(self.counter, Some(n) if n <= 0)
    }

    /// Records one use of the data.
    pub fn consume(&mut self) {
        if let Some(n) = self.counter.as_mut() {
            *n -= 1;
        }
    }
}

mod empty {
    use super::*;

    use std::fmt::Display;
    use std::str::FromStr;

    pub fn serialize<T: Display, S: Serializer>(
        value: &Option<T>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(value) => serializer.collect_str(value),
            None => serializer.serialize_str(""),
        }
    }

    pub fn deserialize<'de, T, D>(deserializer: D) -> Result<Option<T>, D::Error>
    where
        T: FromStr,
        T::Err: Display,
        D: Deserializer<'de>,
    {
        use serde::de::Error;

        let value = Option::<String>::deserialize(deserializer)?.unwrap_or_default();
        match value.trim() {
            "" => Ok(None),
            value => value.parse().map(Some).map_err(Error::custom),
        }
    }
}

mod counter {
    use super::*;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Wire {
        Number(i64),
        Text(String),
    }

    pub fn serialize<S: Serializer>(value: &Option<i64>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(n) => serializer.serialize_i64(*n),
            None => serializer.serialize_str(""),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<i64>, D::Error> {
        use serde::de::Error;

        match Option::<Wire>::deserialize(deserializer)? {
            None => Ok(None),
            Some(Wire::Number(n)) => Ok(Some(n)),
            Some(Wire::Text(s)) if s.trim().is_empty() => Ok(None),
            Some(Wire::Text(s)) => s.trim().parse().map(Some).map_err(Error::custom),
        }
    }
}
