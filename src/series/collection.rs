//! Per-label register series and the query-window set that groups them.
//!
//! Series are assembled through [`LabelSeriesBuilder`] and frozen on
//! `build()`: every register list is sorted by its order timestamp once and
//! never reordered afterwards. The only later mutation is [`LabelSeries::add`],
//! which appends a register code that is not yet present.

use chrono::{DateTime, Utc};
use core::fmt;
use std::collections::BTreeMap;
use std::error::Error;

use crate::register::code::RegisterCode;
use crate::register::value::{NormalizedTimeRegisterValue, OrderedValue, TimeRegisterValue};

#[derive(Debug, Clone, PartialEq)]
pub enum SeriesError {
    InvalidWindow { start: DateTime<Utc>, end: DateTime<Utc> },
    DuplicateRegister { label: String, register: RegisterCode },
    DuplicateLabel(String),
}

impl fmt::Display for SeriesError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SeriesError::InvalidWindow { start, end } => write!(f, "window start {} is after end {}", start, end),
            SeriesError::DuplicateRegister { label, register } => {
                write!(f, "label {} already has register {}", label, register)
            }
            SeriesError::DuplicateLabel(label) => write!(f, "label {} appears twice in series set", label),
        }
    }
}

impl Error for SeriesError {}

#[derive(Debug, Clone, PartialEq)]
pub struct LabelSeries<T> {
    label: String,
    registers: BTreeMap<RegisterCode, Vec<T>>,
}

#[derive(Debug)]
pub struct LabelSeriesBuilder<T> {
    label: String,
    registers: BTreeMap<RegisterCode, Vec<T>>,
}

impl<T: OrderedValue> LabelSeriesBuilder<T> {
    pub fn new(label: impl Into<String>) -> Self {
        LabelSeriesBuilder {
            label: label.into(),
            registers: BTreeMap::new(),
        }
    }

    pub fn push(&mut self, register: RegisterCode, value: T) -> &mut Self {
        self.registers.entry(register).or_default().push(value);
        self
    }

    pub fn extend<I: IntoIterator<Item = T>>(&mut self, register: RegisterCode, values: I) -> &mut Self {
        self.registers.entry(register).or_default().extend(values);
        self
    }

    pub fn build(self) -> LabelSeries<T> {
        let mut registers = self.registers;
        for values in registers.values_mut() {
            values.sort_by_key(|v| v.order_timestamp());
        }
        LabelSeries {
            label: self.label,
            registers,
        }
    }
}

impl<T: OrderedValue> LabelSeries<T> {
    pub fn builder(label: impl Into<String>) -> LabelSeriesBuilder<T> {
        LabelSeriesBuilder::new(label)
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn get(&self, register: &RegisterCode) -> Option<&[T]> {
        self.registers.get(register).map(Vec::as_slice)
    }

    pub fn contains(&self, register: &RegisterCode) -> bool {
        self.registers.contains_key(register)
    }

    pub fn register_codes(&self) -> impl Iterator<Item = &RegisterCode> {
        self.registers.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&RegisterCode, &[T])> {
        self.registers.iter().map(|(code, values)| (code, values.as_slice()))
    }

    pub fn is_empty(&self) -> bool {
        self.registers.is_empty()
    }

    /// Append a new register; existing registers are never replaced.
    pub fn add(&mut self, register: RegisterCode, mut values: Vec<T>) -> Result<(), SeriesError> {
        if self.registers.contains_key(&register) {
            return Err(SeriesError::DuplicateRegister {
                label: self.label.clone(),
                register,
            });
        }
        values.sort_by_key(|v| v.order_timestamp());
        self.registers.insert(register, values);
        Ok(())
    }
}

impl LabelSeries<TimeRegisterValue> {
    pub fn normalize<F>(&self, divider: F) -> LabelSeries<NormalizedTimeRegisterValue>
    where
        F: Fn(DateTime<Utc>) -> DateTime<Utc>,
    {
        let registers = self
            .registers
            .iter()
            .map(|(code, values)| {
                let normalized = values
                    .iter()
                    .map(|v| NormalizedTimeRegisterValue::new(v.clone(), divider(v.timestamp)))
                    .collect();
                (*code, normalized)
            })
            .collect();
        LabelSeries {
            label: self.label.clone(),
            registers,
        }
    }
}

impl LabelSeries<NormalizedTimeRegisterValue> {
    /// One value per normalized timestamp: the latest reading of each bucket.
    pub fn last_per_bucket(&self) -> Self {
        let registers = self
            .registers
            .iter()
            .map(|(code, values)| {
                let mut kept: Vec<NormalizedTimeRegisterValue> = Vec::with_capacity(values.len());
                for v in values {
                    match kept.last_mut() {
                        Some(last) if last.normalized_timestamp == v.normalized_timestamp => *last = v.clone(),
                        _ => kept.push(v.clone()),
                    }
                }
                (*code, kept)
            })
            .collect();
        LabelSeries {
            label: self.label.clone(),
            registers,
        }
    }
}

/// Label series over the UTC window `[start, end)`.
#[derive(Debug, Clone, PartialEq)]
pub struct LabelSeriesSet<T> {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    series: Vec<LabelSeries<T>>,
}

impl<T: OrderedValue> LabelSeriesSet<T> {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>, series: Vec<LabelSeries<T>>) -> Result<Self, SeriesError> {
        if start > end {
            return Err(SeriesError::InvalidWindow { start, end });
        }
        for (i, s) in series.iter().enumerate() {
            if series[..i].iter().any(|other| other.label == s.label) {
                return Err(SeriesError::DuplicateLabel(s.label.clone()));
            }
        }
        Ok(LabelSeriesSet { start, end, series })
    }

    pub fn start(&self) -> DateTime<Utc> {
        self.start
    }

    pub fn end(&self) -> DateTime<Utc> {
        self.end
    }

    pub fn iter(&self) -> impl Iterator<Item = &LabelSeries<T>> {
        self.series.iter()
    }

    pub fn get(&self, label: &str) -> Option<&LabelSeries<T>> {
        self.series.iter().find(|s| s.label == label)
    }

    pub fn len(&self) -> usize {
        self.series.len()
    }

    pub fn is_empty(&self) -> bool {
        self.series.is_empty()
    }

    pub fn into_series(self) -> Vec<LabelSeries<T>> {
        self.series
    }
}

impl LabelSeriesSet<TimeRegisterValue> {
    pub fn normalize<F>(&self, divider: F) -> LabelSeriesSet<NormalizedTimeRegisterValue>
    where
        F: Fn(DateTime<Utc>) -> DateTime<Utc>,
    {
        LabelSeriesSet {
            start: self.start,
            end: self.end,
            series: self.series.iter().map(|s| s.normalize(&divider)).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::register::unit::{Unit, UnitValue};
    use chrono::{TimeDelta, TimeZone};

    fn at(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, minute, 0).unwrap()
    }

    fn wh(minute: u32, value: f64) -> TimeRegisterValue {
        TimeRegisterValue::new("m1", at(minute), UnitValue::new(value, Unit::WattHour))
    }

    fn ten_minute_divider(ts: DateTime<Utc>) -> DateTime<Utc> {
        let secs = ts.timestamp();
        ts - TimeDelta::seconds(secs - secs.div_euclid(600) * 600)
    }

    #[test]
    fn builder_sorts_by_timestamp() {
        let mut b = LabelSeries::builder("meter");
        b.push(RegisterCode::ELECTR_ACTIVE_ENERGY_IMPORT, wh(5, 2.0))
            .push(RegisterCode::ELECTR_ACTIVE_ENERGY_IMPORT, wh(1, 1.0));
        let series = b.build();
        let values = series.get(&RegisterCode::ELECTR_ACTIVE_ENERGY_IMPORT).unwrap();
        assert_eq!(values[0].timestamp, at(1));
        assert_eq!(values[1].timestamp, at(5));
        assert_eq!(series.label(), "meter");
    }

    #[test]
    fn add_appends_but_never_replaces() {
        let mut b = LabelSeries::builder("meter");
        b.push(RegisterCode::ELECTR_ACTIVE_ENERGY_IMPORT, wh(1, 1.0));
        let mut series = b.build();
        let err = series
            .add(RegisterCode::ELECTR_ACTIVE_ENERGY_IMPORT, vec![wh(2, 9.0)])
            .unwrap_err();
        assert!(matches!(err, SeriesError::DuplicateRegister { .. }));
        series.add(RegisterCode::COLD_WATER_VOLUME, vec![wh(3, 3.0)]).unwrap();
        assert_eq!(series.register_codes().count(), 2);
        assert_eq!(series.get(&RegisterCode::ELECTR_ACTIVE_ENERGY_IMPORT).unwrap().len(), 1);
    }

    #[test]
    fn normalize_produces_new_set_and_keeps_source() {
        let mut b = LabelSeries::builder("meter");
        b.extend(RegisterCode::ELECTR_ACTIVE_ENERGY_IMPORT, [wh(1, 1.0), wh(7, 2.0), wh(12, 3.0)]);
        let set = LabelSeriesSet::new(at(0), at(30), vec![b.build()]).unwrap();
        let normalized = set.normalize(ten_minute_divider);

        let values = normalized
            .get("meter")
            .and_then(|s| s.get(&RegisterCode::ELECTR_ACTIVE_ENERGY_IMPORT))
            .unwrap();
        let keys: Vec<_> = values.iter().map(|v| v.normalized_timestamp).collect();
        assert_eq!(keys, vec![at(0), at(0), at(10)]);
        assert_eq!(values[1].timestamp(), at(7));
        assert_eq!(set.get("meter").unwrap().get(&RegisterCode::ELECTR_ACTIVE_ENERGY_IMPORT).unwrap()[0].timestamp, at(1));
    }

    #[test]
    fn last_per_bucket_keeps_latest_reading() {
        let mut b = LabelSeries::builder("meter");
        b.extend(RegisterCode::ELECTR_ACTIVE_ENERGY_IMPORT, [wh(1, 1.0), wh(7, 2.0), wh(12, 3.0)]);
        let reduced = b.build().normalize(ten_minute_divider).last_per_bucket();
        let values: Vec<f64> = reduced
            .get(&RegisterCode::ELECTR_ACTIVE_ENERGY_IMPORT)
            .unwrap()
            .iter()
            .map(|v| v.unit_value().value)
            .collect();
        assert_eq!(values, vec![2.0, 3.0]);
    }

    #[test]
    fn set_validates_window_and_labels() {
        let a = LabelSeries::<TimeRegisterValue>::builder("a").build();
        let a2 = LabelSeries::<TimeRegisterValue>::builder("a").build();
        assert!(matches!(
            LabelSeriesSet::<TimeRegisterValue>::new(at(10), at(0), vec![]),
            Err(SeriesError::InvalidWindow { .. })
        ));
        assert!(matches!(
            LabelSeriesSet::new(at(0), at(10), vec![a, a2]),
            Err(SeriesError::DuplicateLabel(_))
        ));
    }
}
