//! Immutable reading values: raw, bucket-normalized and duration-bounded.
//!
//! All timestamps are `DateTime<Utc>`; conversion from offset-carrying input
//! goes through [`utc_timestamp`], which refuses anything but a zero offset.

use chrono::{DateTime, FixedOffset, Utc};
use core::fmt;
use serde::Serialize;
use std::collections::BTreeSet;
use std::error::Error;

use crate::register::unit::{UnitError, UnitValue};

/// Below this share of the subtrahend's magnitude a negative delta is a meter quirk.
const QUIRK_FRACTION: f64 = 0.05;
/// Above this share of the subtrahend's magnitude a negative delta is a counter wrap.
const WRAP_FRACTION: f64 = 0.75;

#[derive(Debug, Clone, PartialEq)]
pub enum RegisterValueError {
    Unit(UnitError),
    DeviceMismatch { minuend: String, subtrahend: String },
    /// Negative delta that is neither a quirk nor a wrap.
    UnexplainedNegativeDelta { minuend: f64, subtrahend: f64 },
    InvalidSpan { start: DateTime<Utc>, end: DateTime<Utc> },
    NotUtc(DateTime<FixedOffset>),
}

impl fmt::Display for RegisterValueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegisterValueError::Unit(e) => write!(f, "{}", e),
            RegisterValueError::DeviceMismatch { minuend, subtrahend } => {
                write!(f, "device mismatch: {} vs {}", minuend, subtrahend)
            }
            RegisterValueError::UnexplainedNegativeDelta { minuend, subtrahend } => write!(
                f,
                "data misaligned: {} - {} is negative but neither a quirk nor a wrap",
                minuend, subtrahend
            ),
            RegisterValueError::InvalidSpan { start, end } => {
                write!(f, "invalid span: {} is after {}", start, end)
            }
            RegisterValueError::NotUtc(ts) => write!(f, "timestamp {} is not UTC", ts.to_rfc3339()),
        }
    }
}

impl Error for RegisterValueError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            RegisterValueError::Unit(e) => Some(e),
            _ => None,
        }
    }
}

impl From<UnitError> for RegisterValueError {
    fn from(value: UnitError) -> Self {
        RegisterValueError::Unit(value)
    }
}

pub fn utc_timestamp(ts: DateTime<FixedOffset>) -> Result<DateTime<Utc>, RegisterValueError> {
    if ts.offset().local_minus_utc() == 0 {
        Ok(ts.with_timezone(&Utc))
    } else {
        Err(RegisterValueError::NotUtc(ts))
    }
}

/// The timestamp time-ordered algorithms sort and stream by.
pub trait OrderedValue {
    fn order_timestamp(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimeRegisterValue {
    pub device_id: String,
    pub timestamp: DateTime<Utc>,
    pub unit_value: UnitValue,
}

/// Smallest power of ten not below `value`, the assumed register width.
fn counter_magnitude(value: f64) -> f64 {
    let mut magnitude = 1.0;
    while magnitude < value {
        magnitude *= 10.0;
    }
    magnitude
}

impl TimeRegisterValue {
    pub fn new(device_id: impl Into<String>, timestamp: DateTime<Utc>, unit_value: UnitValue) -> Self {
        TimeRegisterValue {
            device_id: device_id.into(),
            timestamp,
            unit_value,
        }
    }

    /// Counter-aware `self - subtrahend`.
    ///
    /// A negative raw delta is clamped to zero when it is under 5% of the
    /// subtrahend's magnitude, treated as a wrap when it is over 75%, and is
    /// an error otherwise. The result carries the minuend's timestamp.
    pub fn subtract(&self, subtrahend: &TimeRegisterValue) -> Result<TimeRegisterValue, RegisterValueError> {
        if self.device_id != subtrahend.device_id {
            return Err(RegisterValueError::DeviceMismatch {
                minuend: self.device_id.clone(),
                subtrahend: subtrahend.device_id.clone(),
            });
        }
        let raw = self.unit_value.checked_sub(&subtrahend.unit_value)?;
        let delta = if raw.value >= 0.0 {
            raw.value
        } else {
            let base = subtrahend.unit_value.value;
            if base <= 0.0 {
                return Err(RegisterValueError::UnexplainedNegativeDelta {
                    minuend: self.unit_value.value,
                    subtrahend: base,
                });
            }
            let magnitude = counter_magnitude(base);
            let drop = raw.value.abs();
            if drop < magnitude * QUIRK_FRACTION {
                0.0
            } else if drop > magnitude * WRAP_FRACTION {
                (magnitude - base) + self.unit_value.value
            } else {
                return Err(RegisterValueError::UnexplainedNegativeDelta {
                    minuend: self.unit_value.value,
                    subtrahend: base,
                });
            }
        };
        Ok(TimeRegisterValue::new(
            self.device_id.clone(),
            self.timestamp,
            UnitValue::new(delta, raw.unit),
        ))
    }
}

impl OrderedValue for TimeRegisterValue {
    fn order_timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NormalizedTimeRegisterValue {
    pub value: TimeRegisterValue,
    pub normalized_timestamp: DateTime<Utc>,
}

impl NormalizedTimeRegisterValue {
    pub fn new(value: TimeRegisterValue, normalized_timestamp: DateTime<Utc>) -> Self {
        NormalizedTimeRegisterValue {
            value,
            normalized_timestamp,
        }
    }

    pub fn device_id(&self) -> &str {
        &self.value.device_id
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.value.timestamp
    }

    pub fn unit_value(&self) -> UnitValue {
        self.value.unit_value
    }
}

impl OrderedValue for NormalizedTimeRegisterValue {
    // Source order survives normalization.
    fn order_timestamp(&self) -> DateTime<Utc> {
        self.value.timestamp
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NormalizedDurationRegisterValue {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    normalized_start: DateTime<Utc>,
    normalized_end: DateTime<Utc>,
    unit_value: UnitValue,
    device_ids: BTreeSet<String>,
}

impl NormalizedDurationRegisterValue {
    pub fn new(
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        normalized_start: DateTime<Utc>,
        normalized_end: DateTime<Utc>,
        unit_value: UnitValue,
        device_ids: BTreeSet<String>,
    ) -> Result<Self, RegisterValueError> {
        if start > end {
            return Err(RegisterValueError::InvalidSpan { start, end });
        }
        if normalized_start > normalized_end {
            return Err(RegisterValueError::InvalidSpan {
                start: normalized_start,
                end: normalized_end,
            });
        }
        Ok(NormalizedDurationRegisterValue {
            start,
            end,
            normalized_start,
            normalized_end,
            unit_value,
            device_ids,
        })
    }

    /// Degenerate span holding an instantaneous reading.
    pub fn instant(value: &NormalizedTimeRegisterValue) -> Self {
        NormalizedDurationRegisterValue {
            start: value.timestamp(),
            end: value.timestamp(),
            normalized_start: value.normalized_timestamp,
            normalized_end: value.normalized_timestamp,
            unit_value: value.unit_value(),
            device_ids: BTreeSet::from([value.device_id().to_string()]),
        }
    }

    pub fn start(&self) -> DateTime<Utc> {
        self.start
    }

    pub fn end(&self) -> DateTime<Utc> {
        self.end
    }

    pub fn normalized_start(&self) -> DateTime<Utc> {
        self.normalized_start
    }

    pub fn normalized_end(&self) -> DateTime<Utc> {
        self.normalized_end
    }

    pub fn unit_value(&self) -> UnitValue {
        self.unit_value
    }

    pub fn device_ids(&self) -> &BTreeSet<String> {
        &self.device_ids
    }
}

impl OrderedValue for NormalizedDurationRegisterValue {
    fn order_timestamp(&self) -> DateTime<Utc> {
        self.end
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::register::unit::Unit;
    use chrono::TimeZone;

    fn reading(device: &str, minute: u32, value: f64) -> TimeRegisterValue {
        let ts = Utc.with_ymd_and_hms(2024, 5, 1, 12, minute, 0).unwrap();
        TimeRegisterValue::new(device, ts, UnitValue::new(value, Unit::WattHour))
    }

    #[test]
    fn subtracting_itself_is_zero() {
        let a = reading("m1", 0, 1234.0);
        assert_eq!(a.subtract(&a).unwrap().unit_value.value, 0.0);
    }

    #[test]
    fn increasing_values_subtract_plainly() {
        let a = reading("m1", 5, 130.0);
        let b = reading("m1", 0, 100.0);
        let d = a.subtract(&b).unwrap();
        assert_eq!(d.unit_value, UnitValue::new(30.0, Unit::WattHour));
        assert_eq!(d.timestamp, a.timestamp);
    }

    #[test]
    fn wraparound_uses_decimal_magnitude() {
        let d = reading("m1", 5, 5.0).subtract(&reading("m1", 0, 9999.0)).unwrap();
        assert_eq!(d.unit_value.value, 6.0);
    }

    #[test]
    fn small_drop_is_clamped_to_zero() {
        let d = reading("m1", 5, 9998.0).subtract(&reading("m1", 0, 10000.0)).unwrap();
        assert_eq!(d.unit_value.value, 0.0);
    }

    #[test]
    fn unexplained_drop_fails() {
        let err = reading("m1", 5, 6000.0)
            .subtract(&reading("m1", 0, 10000.0))
            .unwrap_err();
        assert!(matches!(err, RegisterValueError::UnexplainedNegativeDelta { .. }));
    }

    #[test]
    fn drop_from_zero_fails() {
        let err = reading("m1", 5, -1.0).subtract(&reading("m1", 0, 0.0)).unwrap_err();
        assert!(matches!(err, RegisterValueError::UnexplainedNegativeDelta { .. }));
    }

    #[test]
    fn device_and_unit_must_match() {
        let a = reading("m1", 5, 10.0);
        assert!(matches!(
            a.subtract(&reading("m2", 0, 5.0)),
            Err(RegisterValueError::DeviceMismatch { .. })
        ));
        let mut b = reading("m1", 0, 5.0);
        b.unit_value.unit = Unit::CubicMetre;
        assert!(matches!(a.subtract(&b), Err(RegisterValueError::Unit(_))));
    }

    #[test]
    fn duration_rejects_reversed_spans() {
        let t0 = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();
        let t1 = Utc.with_ymd_and_hms(2024, 5, 2, 0, 0, 0).unwrap();
        let v = UnitValue::new(1.0, Unit::WattHour);
        assert!(NormalizedDurationRegisterValue::new(t1, t0, t0, t1, v, BTreeSet::new()).is_err());
        assert!(NormalizedDurationRegisterValue::new(t0, t1, t1, t0, v, BTreeSet::new()).is_err());
        assert!(NormalizedDurationRegisterValue::new(t0, t1, t0, t1, v, BTreeSet::new()).is_ok());
    }

    #[test]
    fn normalized_value_orders_by_source_timestamp() {
        let raw = reading("m1", 7, 1.0);
        let bucket = Utc.with_ymd_and_hms(2024, 5, 1, 12, 5, 0).unwrap();
        let n = NormalizedTimeRegisterValue::new(raw.clone(), bucket);
        assert_eq!(n.order_timestamp(), raw.timestamp);
    }

    #[test]
    fn only_zero_offsets_are_utc() {
        let utc = DateTime::parse_from_rfc3339("2024-05-01T12:00:00Z").unwrap();
        assert!(utc_timestamp(utc).is_ok());
        let cest = DateTime::parse_from_rfc3339("2024-05-01T14:00:00+02:00").unwrap();
        assert!(matches!(utc_timestamp(cest), Err(RegisterValueError::NotUtc(_))));
    }
}
