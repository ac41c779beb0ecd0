//! Physical units and unit-tagged values.

use core::fmt;
use serde::{Deserialize, Serialize};
use std::error::Error;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Unit {
    Watt,
    WattHour,
    CubicMetre,
    CubicMetrePrHour,
    DegreeCelsius,
    Joule,
    JoulePrHour,
    Percentage,
    Dkk,
    Eur,
    NoUnit,
}

#[derive(Debug, Clone, PartialEq)]
pub enum UnitError {
    UnknownCode(i16),
    Mismatch { left: Unit, right: Unit },
}

impl fmt::Display for UnitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnitError::UnknownCode(c) => write!(f, "unknown unit code {}", c),
            UnitError::Mismatch { left, right } => {
                write!(f, "unit mismatch: {} vs {}", left.symbol(), right.symbol())
            }
        }
    }
}

impl Error for UnitError {}

impl Unit {
    /// Compact code used in the `registers.unit` column.
    pub fn code(self) -> i16 {
        match self {
            Unit::Watt => 1,
            Unit::WattHour => 2,
            Unit::CubicMetre => 3,
            Unit::CubicMetrePrHour => 4,
            Unit::DegreeCelsius => 5,
            Unit::Joule => 6,
            Unit::JoulePrHour => 7,
            Unit::Percentage => 8,
            Unit::Dkk => 20,
            Unit::Eur => 21,
            Unit::NoUnit => 99,
        }
    }

    pub fn from_code(code: i16) -> Result<Self, UnitError> {
        Ok(match code {
            1 => Unit::Watt,
            2 => Unit::WattHour,
            3 => Unit::CubicMetre,
            4 => Unit::CubicMetrePrHour,
            5 => Unit::DegreeCelsius,
            6 => Unit::Joule,
            7 => Unit::JoulePrHour,
            8 => Unit::Percentage,
            20 => Unit::Dkk,
            21 => Unit::Eur,
            99 => Unit::NoUnit,
            other => return Err(UnitError::UnknownCode(other)),
        })
    }

    pub fn symbol(self) -> &'static str {
        match self {
            Unit::Watt => "W",
            Unit::WattHour => "Wh",
            Unit::CubicMetre => "m3",
            Unit::CubicMetrePrHour => "m3/h",
            Unit::DegreeCelsius => "C",
            Unit::Joule => "J",
            Unit::JoulePrHour => "J/h",
            Unit::Percentage => "%",
            Unit::Dkk => "DKK",
            Unit::Eur => "EUR",
            Unit::NoUnit => "",
        }
    }

    /// Rate counterpart of a cumulative unit (energy -> power, volume -> flow).
    pub fn rate_unit(self) -> Option<Unit> {
        match self {
            Unit::WattHour => Some(Unit::Watt),
            Unit::CubicMetre => Some(Unit::CubicMetrePrHour),
            Unit::Joule => Some(Unit::JoulePrHour),
            _ => None,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Serialize)]
pub struct UnitValue {
    pub value: f64,
    pub unit: Unit,
}

fn pow10(exp: u32) -> f64 {
    10f64.powi(exp as i32)
}

impl UnitValue {
    pub fn new(value: f64, unit: Unit) -> Self {
        UnitValue { value, unit }
    }

    pub fn zero(unit: Unit) -> Self {
        UnitValue { value: 0.0, unit }
    }

    /// `value * 10^scale`, dividing for negative scales to keep decimals exact.
    pub fn from_scaled(value: i64, scale: i16, unit: Unit) -> Self {
        let magnitude = pow10(u32::from(scale.unsigned_abs()));
        let value = if scale < 0 {
            value as f64 / magnitude
        } else {
            value as f64 * magnitude
        };
        UnitValue { value, unit }
    }

    pub fn to_scaled(&self, scale: i16) -> i64 {
        let magnitude = pow10(u32::from(scale.unsigned_abs()));
        let scaled = if scale < 0 {
            self.value * magnitude
        } else {
            self.value / magnitude
        };
        scaled.round() as i64
    }

    fn ensure_same_unit(&self, other: &UnitValue) -> Result<(), UnitError> {
        if self.unit == other.unit {
            Ok(())
        } else {
            Err(UnitError::Mismatch {
                left: self.unit,
                right: other.unit,
            })
        }
    }

    pub fn checked_add(&self, other: &UnitValue) -> Result<UnitValue, UnitError> {
        self.ensure_same_unit(other)?;
        Ok(UnitValue::new(self.value + other.value, self.unit))
    }

    /// Plain difference; may be negative. Counter semantics live in `TimeRegisterValue`.
    pub fn checked_sub(&self, other: &UnitValue) -> Result<UnitValue, UnitError> {
        self.ensure_same_unit(other)?;
        Ok(UnitValue::new(self.value - other.value, self.unit))
    }

    /// Sum of a sequence of values sharing one unit; `None` for an empty sequence.
    pub fn sum<'a, I>(values: I) -> Result<Option<UnitValue>, UnitError>
    where
        I: IntoIterator<Item = &'a UnitValue>,
    {
        let mut total: Option<UnitValue> = None;
        for v in values {
            total = Some(match total {
                None => *v,
                Some(t) => t.checked_add(v)?,
            });
        }
        Ok(total)
    }
}

impl fmt::Display for UnitValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.value, self.unit.symbol())
    }
}
