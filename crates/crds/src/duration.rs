//! Retention durations
//!
//! Accepts ISO-8601 durations limited to weeks, days and time components
//! (`PT1H`, `P1DT12H`, `PT0.5S`) or a plain number of seconds.

use std::borrow::Cow;
use std::time::Duration;

use schemars::{JsonSchema, Schema, SchemaGenerator, json_schema};
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DurationError {
    #[error("invalid duration {0:?}")]
    Invalid(String),

    #[error("calendar units are not supported in duration {0:?}")]
    CalendarUnit(String),
}

/// A duration as written by the user
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct IsoDuration(pub String);

impl Default for IsoDuration {
    fn default() -> Self {
        Self("PT0S".to_string())
    }
}

impl IsoDuration {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn to_std(&self) -> Result<Duration, DurationError> {
        parse_duration(&self.0)
    }
}

impl<'de> Deserialize<'de> for IsoDuration {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Text(String),
            Seconds(u64),
        }

        Ok(match Raw::deserialize(deserializer)? {
            Raw::Text(s) => IsoDuration(s),
            Raw::Seconds(n) => IsoDuration(n.to_string()),
        })
    }
}

impl JsonSchema for IsoDuration {
    fn schema_name() -> Cow<'static, str> {
        "IsoDuration".into()
    }

    fn json_schema(_: &mut SchemaGenerator) -> Schema {
        json_schema!({
            "x-kubernetes-int-or-string": true
        })
    }
}

pub fn parse_duration(raw: &str) -> Result<Duration, DurationError> {
    let s = raw.trim();
    let invalid = || DurationError::Invalid(raw.to_string());

    if s.is_empty() {
        return Err(invalid());
    }
    if s.bytes().all(|b| b.is_ascii_digit()) {
        return s.parse::<u64>().map(Duration::from_secs).map_err(|_| invalid());
    }

    let body = s
        .strip_prefix('P')
        .or_else(|| s.strip_prefix('p'))
        .ok_or_else(invalid)?;
    if body.is_empty() {
        return Err(invalid());
    }

    let mut total = 0f64;
    let mut in_time = false;
    let mut number = String::new();
    let mut seen_component = false;

    for c in body.chars() {
        match c.to_ascii_uppercase() {
            'T' if !in_time && number.is_empty() => in_time = true,
            d if d.is_ascii_digit() || d == '.' || d == ',' => {
                number.push(if d == ',' { '.' } else { d })
            }
            unit => {
                let value: f64 = number.parse().map_err(|_| invalid())?;
                number.clear();
                let factor = match (in_time, unit) {
                    (false, 'W') => 7.0 * 86_400.0,
                    (false, 'D') => 86_400.0,
                    (false, 'Y' | 'M') => return Err(DurationError::CalendarUnit(raw.to_string())),
                    (true, 'H') => 3_600.0,
                    (true, 'M') => 60.0,
                    (true, 'S') => 1.0,
                    _ => return Err(invalid()),
                };
                total += value * factor;
                seen_component = true;
            }
        }
    }

    if !number.is_empty() || !seen_component {
        return Err(invalid());
    }
    Duration::try_from_secs_f64(total).map_err(|_| invalid())
}
