//! Single-pass generators turning a cumulative register into derived series.
//!
//! Every generator consumes normalized readings of one register in source
//! order and keeps only the previous observation (or a running total) as
//! state.

use chrono::{DateTime, TimeDelta, Utc};
use log::debug;
use std::collections::{BTreeMap, BTreeSet};

use crate::register::code::RegisterCode;
use crate::register::unit::UnitValue;
use crate::register::value::{NormalizedDurationRegisterValue, NormalizedTimeRegisterValue, RegisterValueError};
use crate::series::collection::{LabelSeries, LabelSeriesBuilder};

/// Cumulative register -> the average rate register derived from it.
pub static RATE_REGISTERS: &[(RegisterCode, RegisterCode)] = &[
    (RegisterCode::ELECTR_ACTIVE_ENERGY_IMPORT, RegisterCode::ELECTR_ACTUAL_POWER_IMPORT),
    (RegisterCode::ELECTR_ACTIVE_ENERGY_EXPORT, RegisterCode::ELECTR_ACTUAL_POWER_EXPORT),
    (RegisterCode::ELECTR_ACTIVE_ENERGY_L1_IMPORT, RegisterCode::ELECTR_ACTUAL_POWER_L1_IMPORT),
    (RegisterCode::ELECTR_ACTIVE_ENERGY_L2_IMPORT, RegisterCode::ELECTR_ACTUAL_POWER_L2_IMPORT),
    (RegisterCode::ELECTR_ACTIVE_ENERGY_L3_IMPORT, RegisterCode::ELECTR_ACTUAL_POWER_L3_IMPORT),
    (RegisterCode::COLD_WATER_VOLUME, RegisterCode::COLD_WATER_FLOW),
    (RegisterCode::HOT_WATER_VOLUME, RegisterCode::HOT_WATER_FLOW),
    (RegisterCode::HEAT_ENERGY, RegisterCode::HEAT_POWER),
    (RegisterCode::HEAT_VOLUME, RegisterCode::HEAT_FLOW),
];

/// (minuend, subtrahend, result) of the paired net series.
pub static NET_REGISTERS: &[(RegisterCode, RegisterCode, RegisterCode)] = &[
    (
        RegisterCode::ELECTR_ACTIVE_ENERGY_IMPORT.to_delta_variant(),
        RegisterCode::ELECTR_ACTIVE_ENERGY_EXPORT.to_delta_variant(),
        RegisterCode::ELECTR_ACTIVE_ENERGY_NET_DELTA,
    ),
    (
        RegisterCode::ELECTR_ACTIVE_ENERGY_IMPORT.to_interim_variant(),
        RegisterCode::ELECTR_ACTIVE_ENERGY_EXPORT.to_interim_variant(),
        RegisterCode::ELECTR_ACTIVE_ENERGY_NET_INTERIM,
    ),
];

const MIN_RATE_GAP_SECONDS: i64 = 96;
const MAX_RATE_GAP_SECONDS: i64 = 6 * 60;

pub fn rate_register(register: &RegisterCode) -> Option<RegisterCode> {
    RATE_REGISTERS
        .iter()
        .find(|(cumulative, _)| cumulative == register)
        .map(|(_, rate)| *rate)
}

pub trait SeriesGenerator {
    fn next(
        &mut self,
        value: &NormalizedTimeRegisterValue,
    ) -> Result<Option<NormalizedDurationRegisterValue>, RegisterValueError>;
}

pub fn generate<G: SeriesGenerator>(
    mut generator: G,
    values: &[NormalizedTimeRegisterValue],
) -> Result<Vec<NormalizedDurationRegisterValue>, RegisterValueError> {
    let mut out = Vec::with_capacity(values.len());
    for value in values {
        if let Some(derived) = generator.next(value)? {
            out.push(derived);
        }
    }
    Ok(out)
}

fn devices<'a>(ids: impl IntoIterator<Item = &'a str>) -> BTreeSet<String> {
    ids.into_iter().map(str::to_string).collect()
}

/// Running total from the first observation at or after `start`.
pub struct PeriodGenerator {
    start: DateTime<Utc>,
    normalized_start: DateTime<Utc>,
    previous: Option<NormalizedTimeRegisterValue>,
    total: Option<UnitValue>,
    device_ids: BTreeSet<String>,
}

impl PeriodGenerator {
    pub fn new(start: DateTime<Utc>, normalized_start: DateTime<Utc>) -> Self {
        PeriodGenerator {
            start,
            normalized_start,
            previous: None,
            total: None,
            device_ids: BTreeSet::new(),
        }
    }
}

impl SeriesGenerator for PeriodGenerator {
    fn next(
        &mut self,
        value: &NormalizedTimeRegisterValue,
    ) -> Result<Option<NormalizedDurationRegisterValue>, RegisterValueError> {
        if value.timestamp() < self.start {
            return Ok(None);
        }
        let step = match &self.previous {
            Some(prev) if prev.device_id() == value.device_id() => value.value.subtract(&prev.value)?.unit_value,
            // first observation or a meter exchange: the new counter starts the baseline over
            _ => UnitValue::zero(value.unit_value().unit),
        };
        let total = match self.total {
            Some(total) => total.checked_add(&step)?,
            None => step,
        };
        self.total = Some(total);
        self.device_ids.insert(value.device_id().to_string());
        self.previous = Some(value.clone());

        NormalizedDurationRegisterValue::new(
            self.start,
            value.timestamp(),
            self.normalized_start.min(value.normalized_timestamp),
            value.normalized_timestamp,
            total,
            self.device_ids.clone(),
        )
        .map(Some)
    }
}

/// Difference between consecutive observations.
#[derive(Default)]
pub struct DeltaGenerator {
    previous: Option<NormalizedTimeRegisterValue>,
}

impl DeltaGenerator {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SeriesGenerator for DeltaGenerator {
    fn next(
        &mut self,
        value: &NormalizedTimeRegisterValue,
    ) -> Result<Option<NormalizedDurationRegisterValue>, RegisterValueError> {
        let derived = match self.previous.take() {
            None => NormalizedDurationRegisterValue::new(
                value.timestamp(),
                value.timestamp(),
                value.normalized_timestamp,
                value.normalized_timestamp,
                UnitValue::zero(value.unit_value().unit),
                devices([value.device_id()]),
            )?,
            Some(prev) if prev.device_id() != value.device_id() => NormalizedDurationRegisterValue::new(
                prev.timestamp(),
                value.timestamp(),
                prev.normalized_timestamp,
                value.normalized_timestamp,
                UnitValue::zero(value.unit_value().unit),
                devices([prev.device_id(), value.device_id()]),
            )?,
            Some(prev) => NormalizedDurationRegisterValue::new(
                prev.timestamp(),
                value.timestamp(),
                prev.normalized_timestamp,
                value.normalized_timestamp,
                value.value.subtract(&prev.value)?.unit_value,
                devices([value.device_id()]),
            )?,
        };
        self.previous = Some(value.clone());
        Ok(Some(derived))
    }
}

/// Average rate (delta per hour) between close, same-device observations.
///
/// Pairs further apart than six minutes or closer than 1.6 minutes, and pairs
/// spanning a meter exchange, produce no value.
#[derive(Default)]
pub struct AverageRateGenerator {
    previous: Option<NormalizedTimeRegisterValue>,
}

impl AverageRateGenerator {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SeriesGenerator for AverageRateGenerator {
    fn next(
        &mut self,
        value: &NormalizedTimeRegisterValue,
    ) -> Result<Option<NormalizedDurationRegisterValue>, RegisterValueError> {
        let Some(prev) = self.previous.replace(value.clone()) else {
            return Ok(None);
        };
        if prev.device_id() != value.device_id() {
            return Ok(None);
        }
        let gap = value.timestamp() - prev.timestamp();
        if gap < TimeDelta::seconds(MIN_RATE_GAP_SECONDS) || gap > TimeDelta::seconds(MAX_RATE_GAP_SECONDS) {
            return Ok(None);
        }
        let delta = value.value.subtract(&prev.value)?.unit_value;
        let Some(unit) = delta.unit.rate_unit() else {
            debug!("No rate unit for {}, skipping rate", delta.unit.symbol());
            return Ok(None);
        };
        let per_hour = delta.value * 3_600_000.0 / gap.num_milliseconds() as f64;

        NormalizedDurationRegisterValue::new(
            prev.timestamp(),
            value.timestamp(),
            prev.normalized_timestamp,
            value.normalized_timestamp,
            UnitValue::new(per_hour, unit),
            devices([value.device_id()]),
        )
        .map(Some)
    }
}

/// `minuend - subtrahend` for buckets present on both sides, joined on the
/// normalized end timestamp. The result may be negative.
pub fn net_delta(
    minuend: &[NormalizedDurationRegisterValue],
    subtrahend: &[NormalizedDurationRegisterValue],
) -> Result<Vec<NormalizedDurationRegisterValue>, RegisterValueError> {
    let by_end: BTreeMap<DateTime<Utc>, &NormalizedDurationRegisterValue> =
        subtrahend.iter().map(|v| (v.normalized_end(), v)).collect();

    let mut out = Vec::new();
    for left in minuend {
        let Some(right) = by_end.get(&left.normalized_end()) else {
            continue;
        };
        let value = left.unit_value().checked_sub(&right.unit_value())?;
        let device_ids = left.device_ids().union(right.device_ids()).cloned().collect();
        out.push(NormalizedDurationRegisterValue::new(
            left.start().min(right.start()),
            left.end().max(right.end()),
            left.normalized_start().min(right.normalized_start()),
            left.normalized_end(),
            value,
            device_ids,
        )?);
    }
    Ok(out)
}

/// All derived series for one label.
///
/// Every input register passes through as instantaneous values. Cumulative
/// registers additionally get a delta series, an interim (period) series and,
/// when mapped, an average rate series. Paired net series follow once both
/// inputs exist. Generated codes already present in the input are left alone.
pub fn derive_label_series(
    series: &LabelSeries<NormalizedTimeRegisterValue>,
    query_start: DateTime<Utc>,
    normalized_query_start: DateTime<Utc>,
) -> Result<LabelSeries<NormalizedDurationRegisterValue>, RegisterValueError> {
    let mut generated: BTreeMap<RegisterCode, Vec<NormalizedDurationRegisterValue>> = BTreeMap::new();

    for (code, values) in series.iter() {
        generated.insert(*code, values.iter().map(NormalizedDurationRegisterValue::instant).collect());
    }

    for (code, values) in series.iter() {
        if !code.is_cumulative() {
            continue;
        }
        let delta = code.to_delta_variant();
        if !series.contains(&delta) {
            generated.insert(delta, generate(DeltaGenerator::new(), values)?);
        }
        let interim = code.to_interim_variant();
        if !series.contains(&interim) {
            let period = PeriodGenerator::new(query_start, normalized_query_start);
            generated.insert(interim, generate(period, values)?);
        }
        if let Some(rate) = rate_register(code).filter(|rate| !series.contains(rate)) {
            generated.insert(rate, generate(AverageRateGenerator::new(), values)?);
        }
    }

    for (minuend, subtrahend, target) in NET_REGISTERS {
        if series.contains(target) {
            continue;
        }
        let (Some(left), Some(right)) = (generated.get(minuend), generated.get(subtrahend)) else {
            debug!("{}: {} needs both {} and {}, skipping", series.label(), target, minuend, subtrahend);
            continue;
        };
        let net = net_delta(left, right)?;
        generated.insert(*target, net);
    }

    let mut builder = LabelSeriesBuilder::new(series.label());
    for (code, values) in generated {
        builder.extend(code, values);
    }
    Ok(builder.build())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::register::unit::Unit;
    use crate::register::value::TimeRegisterValue;
    use chrono::TimeZone;

    fn at(hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, hour, minute, 0).unwrap()
    }

    fn reading(device: &str, ts: DateTime<Utc>, value: f64) -> NormalizedTimeRegisterValue {
        NormalizedTimeRegisterValue::new(TimeRegisterValue::new(device, ts, UnitValue::new(value, Unit::WattHour)), ts)
    }

    fn values(derived: &[NormalizedDurationRegisterValue]) -> Vec<f64> {
        derived.iter().map(|v| v.unit_value().value).collect()
    }

    #[test]
    fn delta_resets_on_meter_exchange() {
        let input = [
            reading("old", at(12, 0), 100.0),
            reading("old", at(12, 10), 130.0),
            reading("new", at(12, 20), 90.0),
        ];
        let deltas = generate(DeltaGenerator::new(), &input).unwrap();
        assert_eq!(values(&deltas), vec![0.0, 30.0, 0.0]);
        assert_eq!(deltas[0].start(), deltas[0].end());
        assert_eq!(deltas[1].start(), at(12, 0));
        assert_eq!(deltas[1].end(), at(12, 10));
        assert_eq!(deltas[2].device_ids().len(), 2);
    }

    #[test]
    fn delta_applies_counter_wrap() {
        let input = [reading("m", at(12, 0), 9999.0), reading("m", at(12, 10), 5.0)];
        let deltas = generate(DeltaGenerator::new(), &input).unwrap();
        assert_eq!(values(&deltas), vec![0.0, 6.0]);
    }

    #[test]
    fn delta_surfaces_unexplained_drop() {
        let input = [reading("m", at(12, 0), 10000.0), reading("m", at(12, 10), 6000.0)];
        assert!(matches!(
            generate(DeltaGenerator::new(), &input),
            Err(RegisterValueError::UnexplainedNegativeDelta { .. })
        ));
    }

    #[test]
    fn period_accumulates_from_query_start() {
        let input = [
            reading("m", at(11, 50), 50.0),
            reading("m", at(12, 0), 100.0),
            reading("m", at(12, 10), 110.0),
            reading("m", at(12, 20), 125.0),
            reading("n", at(12, 30), 3.0),
            reading("n", at(12, 40), 7.0),
        ];
        let period = generate(PeriodGenerator::new(at(12, 0), at(12, 0)), &input).unwrap();
        assert_eq!(values(&period), vec![0.0, 10.0, 25.0, 25.0, 29.0]);
        assert!(period.iter().all(|v| v.start() == at(12, 0)));
        assert_eq!(period[4].end(), at(12, 40));
        assert_eq!(period[4].device_ids().len(), 2);
    }

    #[test]
    fn rate_only_for_close_same_device_pairs() {
        let input = [
            reading("m", at(12, 0), 1000.0),
            reading("m", at(12, 2), 1010.0),
            reading("m", at(12, 3), 1011.0),
            reading("m", at(12, 13), 1100.0),
            reading("n", at(12, 15), 5.0),
            reading("n", at(12, 21), 6.0),
        ];
        let rates = generate(AverageRateGenerator::new(), &input).unwrap();
        // 10 Wh over two minutes, then 1 Wh over six minutes
        assert_eq!(values(&rates), vec![300.0, 10.0]);
        assert!(rates.iter().all(|v| v.unit_value().unit == Unit::Watt));
        assert_eq!(rates[1].start(), at(12, 15));
    }

    fn label(registers: &[(RegisterCode, &[f64])]) -> LabelSeries<NormalizedTimeRegisterValue> {
        let mut b = LabelSeries::builder("house");
        for (code, vals) in registers {
            for (i, v) in vals.iter().enumerate() {
                b.push(*code, reading("m", at(12, 2 * i as u32), *v));
            }
        }
        b.build()
    }

    #[test]
    fn net_delta_needs_both_sides() {
        let only_import = label(&[(RegisterCode::ELECTR_ACTIVE_ENERGY_IMPORT, &[10.0, 12.0])]);
        let derived = derive_label_series(&only_import, at(12, 0), at(12, 0)).unwrap();
        assert!(!derived.contains(&RegisterCode::ELECTR_ACTIVE_ENERGY_NET_DELTA));
        assert!(!derived.contains(&RegisterCode::ELECTR_ACTIVE_ENERGY_NET_INTERIM));
        assert!(derived.contains(&RegisterCode::ELECTR_ACTIVE_ENERGY_IMPORT.to_delta_variant()));
    }

    #[test]
    fn net_delta_subtracts_matching_buckets() {
        let both = label(&[
            (RegisterCode::ELECTR_ACTIVE_ENERGY_IMPORT, &[10.0, 12.0, 20.0]),
            (RegisterCode::ELECTR_ACTIVE_ENERGY_EXPORT, &[5.0, 9.0, 10.0]),
        ]);
        let derived = derive_label_series(&both, at(12, 0), at(12, 0)).unwrap();
        let net = derived.get(&RegisterCode::ELECTR_ACTIVE_ENERGY_NET_DELTA).unwrap();
        assert_eq!(values(net), vec![0.0, -2.0, 7.0]);
        let interim = derived.get(&RegisterCode::ELECTR_ACTIVE_ENERGY_NET_INTERIM).unwrap();
        assert_eq!(values(interim), vec![0.0, -2.0, 5.0]);
    }

    #[test]
    fn non_cumulative_registers_pass_through() {
        let input = label(&[(RegisterCode::HEAT_FLOW_TEMPERATURE, &[55.0, 56.0])]);
        let derived = derive_label_series(&input, at(12, 0), at(12, 0)).unwrap();
        assert_eq!(derived.register_codes().count(), 1);
        let temps = derived.get(&RegisterCode::HEAT_FLOW_TEMPERATURE).unwrap();
        assert_eq!(values(temps), vec![55.0, 56.0]);
        assert_eq!(temps[0].start(), temps[0].end());
    }

    #[test]
    fn existing_rate_register_is_not_regenerated() {
        let input = label(&[
            (RegisterCode::ELECTR_ACTIVE_ENERGY_IMPORT, &[10.0, 12.0]),
            (RegisterCode::ELECTR_ACTUAL_POWER_IMPORT, &[400.0, 410.0]),
        ]);
        let derived = derive_label_series(&input, at(12, 0), at(12, 0)).unwrap();
        assert_eq!(values(derived.get(&RegisterCode::ELECTR_ACTUAL_POWER_IMPORT).unwrap()), vec![400.0, 410.0]);
    }
}
