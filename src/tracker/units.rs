//! Mass unit handling for submitted savings quantities.
//!
//! Everything downstream of `append` works in kilograms of CO2-equivalent;
//! conversion happens once at the submission boundary.

use crate::models::{TrackerError, TrackerResult};

/// Units accepted on submission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MassUnit {
    Grams,
    Kilograms,
    Tonnes,
    Pounds,
}

impl MassUnit {
    pub fn parse(s: &str) -> TrackerResult<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "g" | "gram" | "grams" => Ok(MassUnit::Grams),
            "kg" | "kilogram" | "kilograms" => Ok(MassUnit::Kilograms),
            "t" | "tonne" | "tonnes" | "ton" => Ok(MassUnit::Tonnes),
            "lb" | "lbs" | "pound" | "pounds" => Ok(MassUnit::Pounds),
            other => Err(TrackerError::InvalidInput(format!(
                "unknown mass unit: {}",
                other
            ))),
        }
    }

    /// Convert a quantity in this unit to kilograms
    pub fn to_kg(&self, quantity: f64) -> f64 {
        match self {
            MassUnit::Grams => quantity / 1000.0,
            MassUnit::Kilograms => quantity,
            MassUnit::Tonnes => quantity * 1000.0,
            MassUnit::Pounds => quantity * 0.453_592_37,
        }
    }
}

/// Round to the 4-decimal precision used for every stored rollup value.
/// Keeps drift from repeated small increments below the reconcile tolerance.
pub fn round4(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_accepts_aliases() {
        assert_eq!(MassUnit::parse("KG").unwrap(), MassUnit::Kilograms);
        assert_eq!(MassUnit::parse(" grams ").unwrap(), MassUnit::Grams);
        assert_eq!(MassUnit::parse("tonne").unwrap(), MassUnit::Tonnes);
        assert_eq!(MassUnit::parse("lbs").unwrap(), MassUnit::Pounds);
        assert!(MassUnit::parse("stone").is_err());
    }

    #[test]
    fn test_to_kg() {
        assert_eq!(MassUnit::Grams.to_kg(1500.0), 1.5);
        assert_eq!(MassUnit::Kilograms.to_kg(2.5), 2.5);
        assert_eq!(MassUnit::Tonnes.to_kg(0.002), 2.0);
        assert!((MassUnit::Pounds.to_kg(10.0) - 4.5359237).abs() < 1e-9);
    }

    #[test]
    fn test_round4() {
        assert_eq!(round4(1.00004), 1.0);
        assert_eq!(round4(1.00005), 1.0001);
        assert_eq!(round4(0.123456), 0.1235);
    }
}
