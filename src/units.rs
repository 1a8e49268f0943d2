//! # Units and Measurements
//!
//! Numeric values travel with a one-sigma uncertainty ([`Measurement`]). Unit
//! conversion is a service interface ([`UnitConverter`]) injected into QC suites; the
//! bundled [`LinearUnitConverter`] covers the affine units that observation records
//! use in practice (lengths, pressures, temperatures, angles, speeds).

use std::collections::HashMap;

use crate::error::{QcError, Result};

/// Mean earth radius in metres, with its own uncertainty
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;
pub const EARTH_RADIUS_UNCERTAINTY_M: f64 = 10_000.0;

/// A value with a one-sigma uncertainty
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Measurement {
    pub value: f64,
    pub uncertainty: f64,
}

impl Measurement {
    pub fn new(value: f64, uncertainty: f64) -> Self {
        Self {
            value,
            uncertainty: uncertainty.abs(),
        }
    }

    pub fn exact(value: f64) -> Self {
        Self::new(value, 0.0)
    }

    pub fn lower(&self) -> f64 {
        self.value - self.uncertainty
    }

    pub fn upper(&self) -> f64 {
        self.value + self.uncertainty
    }

    /// Two measurements are close when their uncertainty ranges overlap, or when the
    /// nearest range ends agree under the given tolerances
    pub fn is_close(&self, other: &Measurement, rel_tol: f64, abs_tol: f64) -> bool {
        let (low, high) = if self.value > other.value {
            (other.upper(), self.lower())
        } else {
            (self.upper(), other.lower())
        };
        high < low || float_is_close(high, low, rel_tol, abs_tol)
    }

    /// One-tailed check: `self` is at least `other`, allowing for uncertainty
    pub fn is_at_least(&self, other: &Measurement, rel_tol: f64, abs_tol: f64) -> bool {
        self.value >= other.value || self.is_close(other, rel_tol, abs_tol)
    }

    /// One-tailed check: `self` is at most `other`, allowing for uncertainty
    pub fn is_at_most(&self, other: &Measurement, rel_tol: f64, abs_tol: f64) -> bool {
        self.value <= other.value || self.is_close(other, rel_tol, abs_tol)
    }
}

/// `math.isclose` semantics
pub fn float_is_close(a: f64, b: f64, rel_tol: f64, abs_tol: f64) -> bool {
    if a == b {
        return true;
    }
    let diff = (a - b).abs();
    diff <= (rel_tol * a.abs().max(b.abs())).max(abs_tol)
}

/// Great-circle distance in metres between two points given in degrees.
///
/// The result carries the earth radius uncertainty plus the positional
/// uncertainty of both points converted to metres.
pub fn haversine(
    lat1: Measurement,
    lon1: Measurement,
    lat2: Measurement,
    lon2: Measurement,
) -> Measurement {
    let phi1 = lat1.value.to_radians();
    let phi2 = lat2.value.to_radians();
    let d_phi = (lat2.value - lat1.value).to_radians();
    let d_lambda = (lon2.value - lon1.value).to_radians();
    let a = (d_phi * 0.5).sin().powi(2) + phi1.cos() * phi2.cos() * (d_lambda * 0.5).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());

    let metres_per_degree = EARTH_RADIUS_M.to_radians();
    let position_uncertainty = |lat: Measurement, lon: Measurement| {
        let dy = lat.uncertainty * metres_per_degree;
        let dx = lon.uncertainty * metres_per_degree * lat.value.to_radians().cos().abs();
        (dx * dx + dy * dy).sqrt()
    };
    let uncertainty = c * EARTH_RADIUS_UNCERTAINTY_M
        + position_uncertainty(lat1, lon1)
        + position_uncertainty(lat2, lon2);
    Measurement::new(c * EARTH_RADIUS_M, uncertainty)
}

/// Unit conversion service
pub trait UnitConverter: Send + Sync {
    fn is_valid_unit(&self, units: &str) -> bool;

    /// Whether values in the two units can be converted into each other
    fn compatible(&self, units_a: &str, units_b: &str) -> bool;

    fn convert(&self, value: Measurement, from_units: &str, to_units: &str) -> Result<Measurement>;
}

#[derive(Debug, Clone)]
struct LinearUnit {
    dimension: &'static str,
    factor: f64,
    offset: f64,
}

/// Table-driven converter for affine units (`base = value * factor + offset`)
#[derive(Debug, Clone)]
pub struct LinearUnitConverter {
    units: HashMap<String, LinearUnit>,
}

impl Default for LinearUnitConverter {
    fn default() -> Self {
        let mut converter = Self {
            units: HashMap::new(),
        };
        let table: &[(&str, &'static str, f64, f64)] = &[
            ("m", "length", 1.0, 0.0),
            ("km", "length", 1000.0, 0.0),
            ("cm", "length", 0.01, 0.0),
            ("mm", "length", 0.001, 0.0),
            ("ft", "length", 0.3048, 0.0),
            ("fathom", "length", 1.8288, 0.0),
            ("Pa", "pressure", 1.0, 0.0),
            ("hPa", "pressure", 100.0, 0.0),
            ("kPa", "pressure", 1000.0, 0.0),
            ("bar", "pressure", 100_000.0, 0.0),
            ("dbar", "pressure", 10_000.0, 0.0),
            ("K", "temperature", 1.0, 0.0),
            ("°C", "temperature", 1.0, 273.15),
            ("degC", "temperature", 1.0, 273.15),
            ("°F", "temperature", 5.0 / 9.0, 255.372_222_222_222_2),
            ("degrees", "angle", 1.0, 0.0),
            ("degree_north", "angle", 1.0, 0.0),
            ("degree_east", "angle", 1.0, 0.0),
            ("rad", "angle", 180.0 / std::f64::consts::PI, 0.0),
            ("s", "time", 1.0, 0.0),
            ("min", "time", 60.0, 0.0),
            ("h", "time", 3600.0, 0.0),
            ("m s-1", "speed", 1.0, 0.0),
            ("m/s", "speed", 1.0, 0.0),
            ("knots", "speed", 0.514_444, 0.0),
            ("km/h", "speed", 1.0 / 3.6, 0.0),
            ("0.001", "ratio", 0.001, 0.0),
            ("psu", "ratio", 0.001, 0.0),
            ("1", "ratio", 1.0, 0.0),
        ];
        for (name, dimension, factor, offset) in table {
            converter.register(name, dimension, *factor, *offset);
        }
        converter
    }
}

impl LinearUnitConverter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace a unit
    pub fn register(&mut self, name: &str, dimension: &'static str, factor: f64, offset: f64) {
        self.units.insert(
            name.to_string(),
            LinearUnit {
                dimension,
                factor,
                offset,
            },
        );
    }

    fn lookup(&self, units: &str) -> Result<&LinearUnit> {
        self.units
            .get(units.trim())
            .ok_or_else(|| QcError::invariant(format!("unknown unit [{units}]")))
    }
}

impl UnitConverter for LinearUnitConverter {
    fn is_valid_unit(&self, units: &str) -> bool {
        self.units.contains_key(units.trim())
    }

    fn compatible(&self, units_a: &str, units_b: &str) -> bool {
        match (self.lookup(units_a), self.lookup(units_b)) {
            (Ok(a), Ok(b)) => a.dimension == b.dimension,
            _ => false,
        }
    }

    fn convert(&self, value: Measurement, from_units: &str, to_units: &str) -> Result<Measurement> {
        if from_units == to_units {
            return Ok(value);
        }
        let from = self.lookup(from_units)?;
        let to = self.lookup(to_units)?;
        if from.dimension != to.dimension {
            return Err(QcError::invariant(format!(
                "cannot convert [{from_units}] to [{to_units}]"
            )));
        }
        let base = value.value * from.factor + from.offset;
        Ok(Measurement::new(
            (base - to.offset) / to.factor,
            value.uncertainty * from.factor / to.factor,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_close_with_uncertainty() {
        let a = Measurement::new(10.0, 5.0);
        let b = Measurement::new(15.0, 5.0);
        assert!(a.is_close(&b, 1e-9, 0.0));
        assert!(b.is_close(&a, 1e-9, 0.0));
        assert!(!Measurement::exact(10.0).is_close(&Measurement::exact(10.5), 1e-9, 0.0));
        assert!(Measurement::exact(10.0).is_close(&Measurement::exact(10.0), 1e-9, 0.0));
    }

    #[test]
    fn test_one_tailed_checks() {
        let a = Measurement::exact(12.0);
        let b = Measurement::exact(10.0);
        assert!(a.is_at_least(&b, 1e-9, 0.0));
        assert!(!a.is_at_most(&b, 1e-9, 0.0));
    }

    #[test]
    fn test_temperature_and_pressure_conversion() {
        let converter = LinearUnitConverter::new();
        let k = converter
            .convert(Measurement::new(10.0, 0.1), "°C", "K")
            .unwrap();
        assert!((k.value - 283.15).abs() < 1e-9);
        assert!((k.uncertainty - 0.1).abs() < 1e-12);

        let dbar = converter
            .convert(Measurement::exact(1.0), "bar", "dbar")
            .unwrap();
        assert!((dbar.value - 10.0).abs() < 1e-9);
        assert!(converter.compatible("m", "ft"));
        assert!(!converter.compatible("m", "K"));
        assert!(converter.convert(Measurement::exact(1.0), "m", "K").is_err());
    }

    #[test]
    fn test_haversine_one_degree_of_latitude() {
        let d = haversine(
            Measurement::exact(0.0),
            Measurement::exact(0.0),
            Measurement::exact(1.0),
            Measurement::exact(0.0),
        );
        assert!((d.value - 111_194.9).abs() < 1.0);
        assert!(d.uncertainty > 0.0);
    }

    #[test]
    fn test_haversine_is_symmetric() {
        let p = (Measurement::new(45.0, 0.01), Measurement::exact(-63.0));
        let q = (Measurement::exact(45.02), Measurement::new(-63.01, 0.02));
        let ab = haversine(p.0, p.1, q.0, q.1);
        let ba = haversine(q.0, q.1, p.0, p.1);
        assert!((ab.value - ba.value).abs() < 1e-6);
        assert!((ab.uncertainty - ba.uncertainty).abs() < 1e-6);
    }
}
