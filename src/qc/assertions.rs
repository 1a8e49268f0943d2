//! Assertion helpers for value checks.
//!
//! Each helper returns `Ok(())` when the expectation holds and a `Review` signal with
//! the conventional WorkingQuality flag otherwise. Override the flag by building the
//! [`Assertion`] yourself and calling [`ensure`].

use chrono::Utc;
use serde_json::Value as JsonValue;

use super::context::{Assertion, QcFlow, QcSignal};
use crate::constants::quality;
use crate::record::{Element, ElementMap, Value};
use crate::units::{Measurement, UnitConverter};

/// Review with `assertion` unless `condition` holds
pub fn ensure(condition: bool, assertion: impl FnOnce() -> Assertion) -> QcFlow {
    if condition {
        Ok(())
    } else {
        Err(QcSignal::Review(assertion()))
    }
}

fn flagged(code: &str, flag: i64) -> impl FnOnce() -> Assertion + '_ {
    move || Assertion::new(code).with_flag(flag)
}

pub fn not_empty(value: &Value, code: &str) -> QcFlow {
    ensure(!value.is_empty(), flagged(code, quality::MISSING_PENDING))
}

pub fn empty(value: &Value, code: &str) -> QcFlow {
    ensure(value.is_empty(), flagged(code, quality::ERRONEOUS_PENDING))
}

pub fn not_multi(element: &Element, code: &str) -> QcFlow {
    ensure(!element.is_multi(), flagged(code, quality::MULTI_PENDING))
}

pub fn iso_datetime(value: &Value, code: &str) -> QcFlow {
    ensure(value.is_iso_datetime(), flagged(code, quality::ERRONEOUS_PENDING))
}

pub fn numeric(value: &Value, code: &str) -> QcFlow {
    ensure(value.is_numeric(), flagged(code, quality::ERRONEOUS_PENDING))
}

pub fn integer(value: &Value, code: &str) -> QcFlow {
    ensure(value.is_integer(), flagged(code, quality::ERRONEOUS_PENDING))
}

/// The best value is one of `allowed`
pub fn one_of(value: &Value, allowed: &[JsonValue], code: &str) -> QcFlow {
    ensure(allowed.contains(value.best()), flagged(code, quality::ERRONEOUS_PENDING))
}

pub fn string_like(value: &Value, code: &str) -> QcFlow {
    ensure(value.best().is_string(), flagged(code, quality::ERRONEOUS_PENDING))
}

pub fn list_like(value: &Value, code: &str) -> QcFlow {
    ensure(value.best().is_array(), flagged(code, quality::ERRONEOUS_PENDING))
}

/// Inclusive range check, allowing for the value's uncertainty. Non-numeric values fail.
pub fn between(value: &Value, min: Option<f64>, max: Option<f64>, code: &str) -> QcFlow {
    let within = value.measurement().is_some_and(|m| {
        min.map_or(true, |lo| m.is_at_least(&Measurement::exact(lo), 1e-9, 0.0))
            && max.map_or(true, |hi| m.is_at_most(&Measurement::exact(hi), 1e-9, 0.0))
    });
    ensure(within, flagged(code, quality::ERRONEOUS_PENDING))
}

pub fn less_than(value: &Value, limit: f64, code: &str) -> QcFlow {
    let ok = value
        .measurement()
        .is_some_and(|m| m.lower() < limit);
    ensure(ok, flagged(code, quality::ERRONEOUS_PENDING))
}

pub fn greater_than(value: &Value, limit: f64, code: &str) -> QcFlow {
    let ok = value
        .measurement()
        .is_some_and(|m| m.upper() > limit);
    ensure(ok, flagged(code, quality::ERRONEOUS_PENDING))
}

/// The value is a date-time no later than now
pub fn in_past(value: &Value, code: &str) -> QcFlow {
    let ok = value.as_datetime().is_some_and(|t| t <= Utc::now());
    ensure(ok, flagged(code, quality::ERRONEOUS_PENDING))
}

pub fn close_to(value: &Value, expected: Measurement, tolerance: f64, code: &str) -> QcFlow {
    let ok = value
        .measurement()
        .is_some_and(|m| is_close(m, expected, tolerance));
    ensure(ok, flagged(code, quality::ERRONEOUS_PENDING))
}

/// The value's units are convertible to `expected_units`
pub fn units_compatible(value: &Value, expected_units: &str, converter: &dyn UnitConverter, code: &str) -> QcFlow {
    let ok = value
        .units()
        .is_some_and(|u| converter.compatible(&u, expected_units));
    ensure(ok, flagged(code, quality::UNITS_PENDING))
}

/// Values without units pass; otherwise the units must be known to the converter
pub fn valid_units(value: &Value, converter: &dyn UnitConverter, code: &str) -> QcFlow {
    let ok = value.units().map_or(true, |u| converter.is_valid_unit(&u));
    ensure(ok, flagged(code, quality::UNITS_PENDING))
}

pub fn has_coordinate(coordinates: &ElementMap, name: &str, code: &str) -> QcFlow {
    ensure(coordinates.has_value(name), flagged(code, quality::MISSING_PENDING))
}

/// `|a - b|` within `tolerance` widened by both uncertainties
pub fn is_close(a: Measurement, b: Measurement, tolerance: f64) -> bool {
    (a.value - b.value).abs() <= tolerance.abs() + a.uncertainty + b.uncertainty
}

/// Numeric value converted to `units`, or `Skip` when the value is unusable.
///
/// Missing values (WQ 9/19) are always skipped. Dubious (3/13) and bad (4/14) values
/// are skipped unless explicitly allowed. A value without units is taken as-is.
pub fn value_in_units(
    value: &Value,
    units: Option<&str>,
    converter: &dyn UnitConverter,
    allow_dubious: bool,
    allow_bad: bool,
) -> QcFlow<Measurement> {
    match value.working_quality() {
        quality::MISSING | quality::MISSING_PENDING => return Err(QcSignal::Skip),
        quality::DUBIOUS | quality::DUBIOUS_PENDING if !allow_dubious => return Err(QcSignal::Skip),
        quality::ERRONEOUS | quality::ERRONEOUS_PENDING if !allow_bad => return Err(QcSignal::Skip),
        _ => {}
    }
    let measurement = value.measurement().ok_or(QcSignal::Skip)?;
    match (units, value.units()) {
        (Some(target), Some(source)) if target != source => {
            Ok(converter.convert(measurement, &source, target)?)
        }
        _ => Ok(measurement),
    }
}

/// The element's ideal value when present and good, else `Skip`
pub fn require_good_value<'a>(map: &'a ElementMap, name: &str, allow_dubious: bool) -> QcFlow<&'a Value> {
    map.get(name)
        .and_then(Element::ideal)
        .filter(|v| v.is_good(allow_dubious))
        .ok_or(QcSignal::Skip)
}
