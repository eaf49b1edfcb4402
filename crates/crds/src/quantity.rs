//! Kubernetes resource quantities
//!
//! Quantities arrive either as strings (`"4Gi"`, `"500m"`) or bare integers.
//! Everything that feeds a content hash goes through [`Quantity::bytes`] or
//! [`Quantity::millicores`] first, so `4Gi` and `4294967296` hash the same.

use std::borrow::Cow;
use std::fmt;

use schemars::{JsonSchema, Schema, SchemaGenerator, json_schema};
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QuantityError {
    #[error("empty quantity")]
    Empty,

    #[error("invalid number in quantity {0:?}")]
    InvalidNumber(String),

    #[error("unknown suffix {suffix:?} in quantity {quantity:?}")]
    UnknownSuffix { quantity: String, suffix: String },

    #[error("quantity {0:?} is out of range")]
    Overflow(String),
}

/// A resource quantity as written by the user
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct Quantity(pub String);

impl Quantity {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Value in whole units (bytes for memory), rounded up
    pub fn bytes(&self) -> Result<u64, QuantityError> {
        parse_scaled(&self.0, 1)
    }

    /// Value in thousandths of a unit (millicores for CPU), rounded up
    pub fn millicores(&self) -> Result<u64, QuantityError> {
        parse_scaled(&self.0, 1000)
    }
}

impl Default for Quantity {
    fn default() -> Self {
        Quantity::new("0")
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Quantity {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl<'de> Deserialize<'de> for Quantity {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Text(String),
            Unsigned(u64),
            Float(f64),
        }

        Ok(match Raw::deserialize(deserializer)? {
            Raw::Text(s) => Quantity(s),
            Raw::Unsigned(n) => Quantity(n.to_string()),
            Raw::Float(n) => Quantity(n.to_string()),
        })
    }
}

impl JsonSchema for Quantity {
    fn schema_name() -> Cow<'static, str> {
        "Quantity".into()
    }

    fn json_schema(_: &mut SchemaGenerator) -> Schema {
        json_schema!({
            "x-kubernetes-int-or-string": true
        })
    }
}

/// Multiplier of a suffix as a fraction
fn suffix_multiplier(suffix: &str) -> Option<(u128, u128)> {
    let m = match suffix {
        "" => (1, 1),
        "m" => (1, 1000),
        "k" => (1_000, 1),
        "M" => (1_000_000, 1),
        "G" => (1_000_000_000, 1),
        "T" => (1_000_000_000_000, 1),
        "P" => (1_000_000_000_000_000, 1),
        "E" => (1_000_000_000_000_000_000, 1),
        "Ki" => (1 << 10, 1),
        "Mi" => (1 << 20, 1),
        "Gi" => (1 << 30, 1),
        "Ti" => (1 << 40, 1),
        "Pi" => (1 << 50, 1),
        "Ei" => (1 << 60, 1),
        _ => return None,
    };
    Some(m)
}

fn parse_scaled(raw: &str, scale: u128) -> Result<u64, QuantityError> {
    let s = raw.trim();
    if s.is_empty() {
        return Err(QuantityError::Empty);
    }

    let split = s
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(s.len());
    let (number, suffix) = s.split_at(split);
    let (num, den) = suffix_multiplier(suffix).ok_or_else(|| QuantityError::UnknownSuffix {
        quantity: s.to_string(),
        suffix: suffix.to_string(),
    })?;

    let (int_part, frac_part) = match number.split_once('.') {
        Some((i, f)) => (i, f),
        None => (number, ""),
    };
    if (int_part.is_empty() && frac_part.is_empty())
        || int_part.contains('.')
        || frac_part.contains('.')
        || frac_part.len() > 18
    {
        return Err(QuantityError::InvalidNumber(s.to_string()));
    }

    let overflow = || QuantityError::Overflow(s.to_string());
    let digits = format!("{}{}", int_part, frac_part);
    let mantissa: u128 = digits
        .parse()
        .map_err(|_| QuantityError::InvalidNumber(s.to_string()))?;
    let frac_den = 10u128.pow(frac_part.len() as u32);

    let numerator = mantissa
        .checked_mul(num)
        .and_then(|v| v.checked_mul(scale))
        .ok_or_else(overflow)?;
    let denominator = frac_den * den;
    let value = numerator.div_ceil(denominator);
    u64::try_from(value).map_err(|_| overflow())
}

/// Render bytes with the largest binary suffix that divides them exactly
pub fn format_binary(bytes: u64) -> String {
    const SUFFIXES: [(&str, u32); 6] = [
        ("Ei", 60),
        ("Pi", 50),
        ("Ti", 40),
        ("Gi", 30),
        ("Mi", 20),
        ("Ki", 10),
    ];
    if bytes == 0 {
        return "0".to_string();
    }
    for (suffix, shift) in SUFFIXES {
        let unit = 1u64 << shift;
        if bytes % unit == 0 {
            return format!("{}{}", bytes / unit, suffix);
        }
    }
    bytes.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_equivalent_memory_forms() {
        assert_eq!(Quantity::from("4Gi").bytes().unwrap(), 4_294_967_296);
        assert_eq!(Quantity::from("4294967296").bytes().unwrap(), 4_294_967_296);
        assert_eq!(Quantity::from("4096Mi").bytes().unwrap(), 4_294_967_296);
        assert_eq!(Quantity::from("1.5Gi").bytes().unwrap(), 1_610_612_736);
        assert_eq!(Quantity::from("2G").bytes().unwrap(), 2_000_000_000);
    }

    #[test]
    fn test_cpu_forms() {
        assert_eq!(Quantity::from("500m").millicores().unwrap(), 500);
        assert_eq!(Quantity::from("2").millicores().unwrap(), 2000);
        assert_eq!(Quantity::from("0.25").millicores().unwrap(), 250);
    }

    #[test]
    fn test_rounds_up() {
        assert_eq!(Quantity::from("1500m").bytes().unwrap(), 2);
    }

    #[test]
    fn test_invalid() {
        assert_eq!(Quantity::from("").bytes(), Err(QuantityError::Empty));
        assert!(matches!(
            Quantity::from("4Gb").bytes(),
            Err(QuantityError::UnknownSuffix { .. })
        ));
        assert!(matches!(
            Quantity::from("Gi").bytes(),
            Err(QuantityError::InvalidNumber(_))
        ));
        assert!(matches!(
            Quantity::from("1.2.3").bytes(),
            Err(QuantityError::InvalidNumber(_))
        ));
        assert!(matches!(
            Quantity::from("100Ei").bytes(),
            Err(QuantityError::Overflow(_))
        ));
    }

    #[test]
    fn test_deserialize_int_or_string() {
        let q: Quantity = serde_json::from_str("4294967296").unwrap();
        assert_eq!(q.0, "4294967296");
        let q: Quantity = serde_json::from_str("\"4Gi\"").unwrap();
        assert_eq!(q.0, "4Gi");
    }

    #[test]
    fn test_format_binary() {
        assert_eq!(format_binary(4_294_967_296), "4Gi");
        assert_eq!(format_binary(1536 * 1024 * 1024), "1536Mi");
        assert_eq!(format_binary(1000), "1000");
    }
}
