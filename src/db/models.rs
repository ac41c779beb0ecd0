//! Diesel row structs and the domain-side shape of a stored reading.
//!
//! All four granularities live in `readings`, told apart by [`Tier`].

use chrono::{DateTime, Utc};
use diesel::prelude::*;

use crate::register::code::RegisterCode;
use crate::register::unit::{Unit, UnitValue};
use crate::schema;
use crate::series::interval::Granularity;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Tier {
    Raw,
    Day,
    Month,
    Year,
}

impl Tier {
    /// Rollup destinations in the order they must run.
    pub const DESTINATIONS: [Tier; 3] = [Tier::Day, Tier::Month, Tier::Year];

    pub fn code(self) -> i16 {
        match self {
            Tier::Raw => 0,
            Tier::Day => 1,
            Tier::Month => 2,
            Tier::Year => 3,
        }
    }

    pub fn from_code(code: i16) -> Option<Tier> {
        match code {
            0 => Some(Tier::Raw),
            1 => Some(Tier::Day),
            2 => Some(Tier::Month),
            3 => Some(Tier::Year),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Tier::Raw => "raw",
            Tier::Day => "day",
            Tier::Month => "month",
            Tier::Year => "year",
        }
    }

    /// Tier a destination is rolled up from.
    pub fn source(self) -> Option<Tier> {
        match self {
            Tier::Raw => None,
            Tier::Day => Some(Tier::Raw),
            Tier::Month => Some(Tier::Day),
            Tier::Year => Some(Tier::Month),
        }
    }

    pub fn granularity(self) -> Option<Granularity> {
        match self {
            Tier::Raw => None,
            Tier::Day => Some(Granularity::Day),
            Tier::Month => Some(Granularity::Month),
            Tier::Year => Some(Granularity::Year),
        }
    }
}

#[derive(Debug, Clone, Queryable, Identifiable, Selectable)]
#[diesel(table_name = schema::readings)]
pub struct Reading {
    pub id: i64,
    pub tier: i16,
    pub label: String,
    pub device_id: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = schema::readings)]
pub struct NewReading<'a> {
    pub tier: i16,
    pub label: &'a str,
    pub device_id: &'a str,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Queryable, Selectable, Insertable)]
#[diesel(table_name = schema::registers)]
pub struct RegisterRow {
    pub reading_id: i64,
    pub register: i64,
    pub value: i64,
    pub scale: i16,
    pub unit: i16,
}

#[derive(Debug, Clone, Queryable, Selectable, Insertable)]
#[diesel(table_name = schema::stream_positions)]
pub struct StreamPosition {
    pub stream: i16,
    pub label: String,
    pub position: i64,
}

/// A register value in storage form: `value * 10^scale` of `unit`.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct StoredRegister {
    pub register: RegisterCode,
    pub value: i64,
    pub scale: i16,
    pub unit: Unit,
}

impl StoredRegister {
    pub fn unit_value(&self) -> UnitValue {
        UnitValue::from_scaled(self.value, self.scale, self.unit)
    }

    pub fn to_row(&self, reading_id: i64) -> RegisterRow {
        RegisterRow {
            reading_id,
            register: self.register.to_i64(),
            value: self.value,
            scale: self.scale,
            unit: self.unit.code(),
        }
    }
}

/// One reading with its registers; `id` is the row id in its own tier.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredReading {
    pub id: i64,
    pub label: String,
    pub device_id: String,
    pub timestamp: DateTime<Utc>,
    pub registers: Vec<StoredRegister>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tier_codes_round_trip() {
        for tier in [Tier::Raw, Tier::Day, Tier::Month, Tier::Year] {
            assert_eq!(Tier::from_code(tier.code()), Some(tier));
        }
        assert_eq!(Tier::from_code(7), None);
    }

    #[test]
    fn destinations_chain_back_to_raw() {
        assert_eq!(Tier::Day.source(), Some(Tier::Raw));
        assert_eq!(Tier::Month.source(), Some(Tier::Day));
        assert_eq!(Tier::Year.source(), Some(Tier::Month));
        assert_eq!(Tier::Raw.granularity(), None);
        assert_eq!(Tier::Year.granularity(), Some(Granularity::Year));
    }

    #[test]
    fn stored_register_keeps_scale() {
        let reg = StoredRegister {
            register: RegisterCode::ELECTR_ACTIVE_ENERGY_IMPORT,
            value: 123_456,
            scale: -3,
            unit: Unit::WattHour,
        };
        assert_eq!(reg.unit_value(), UnitValue::new(123.456, Unit::WattHour));
        let row = reg.to_row(9);
        assert_eq!(row.reading_id, 9);
        assert_eq!(row.register, RegisterCode::ELECTR_ACTIVE_ENERGY_IMPORT.to_i64());
        assert_eq!(row.unit, Unit::WattHour.code());
    }
}
