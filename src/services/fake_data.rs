//! Deterministic synthetic raw readings for local development.
//!
//! Three labels at a two-minute cadence: `house` (electricity import/export,
//! with a counter wrap and later a meter exchange), `water` (cold water) and
//! `heating` (heat energy, volume and temperatures).

use crate::db::models::{StoredReading, StoredRegister, Tier};
use crate::db::store::{PgReadingStore, ReadingStore};
use crate::register::code::RegisterCode;
use crate::register::unit::Unit;
use crate::services::ingest::insert_raw_readings;
use chrono::{DateTime, Duration, Timelike, Utc};
use diesel::PgConnection;
use log::info;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use std::f64::consts::PI;

const STEP_MINUTES: i64 = 2;
const LABELS: [&str; 3] = ["house", "water", "heating"];
/// Eight-digit Wh register close enough to its end to wrap within a few weeks.
const ELECTRICITY_START_WH: i64 = 99_500_000;
const ELECTRICITY_WRAP_WH: i64 = 100_000_000;

struct Meters {
    electricity_device: &'static str,
    import_wh: i64,
    export_wh: i64,
    /// litres, stored with scale -3 as m3
    water_l: i64,
    heat_wh: i64,
    heat_volume_l: i64,
}

impl Meters {
    fn new() -> Self {
        Meters {
            electricity_device: "elec-1",
            import_wh: ELECTRICITY_START_WH,
            export_wh: 1_200_000,
            water_l: 431_000,
            heat_wh: 18_400_000,
            heat_volume_l: 902_000,
        }
    }
}

pub fn run(conn: &mut PgConnection, days: u32) -> Result<(), String> {
    let existing = PgReadingStore::new(conn)
        .labels(Tier::Raw)
        .map_err(|e| format!("listing labels failed: {}", e))?;
    if LABELS.iter().any(|l| existing.iter().any(|e| e.as_str() == *l)) {
        info!("Fake data: readings already present, skipping");
        return Ok(());
    }

    let end = align_to_step(Utc::now())?;
    let start = end - Duration::days(i64::from(days));
    let exchange_at = start + (end - start) * 2 / 3;
    let mut rng = SmallRng::seed_from_u64(0x0420_1337_DEAD_BEEFu64);
    let mut meters = Meters::new();

    info!(
        "Fake data: generating {} day(s) of readings from {} to {} (meter exchange at {})",
        days, start, end, exchange_at
    );

    let mut batch = Vec::with_capacity(3 * samples_per_day());
    let mut inserted = 0;
    let mut ts = start;
    let mut current_day = start.date_naive();
    let step = Duration::minutes(STEP_MINUTES);

    while ts < end {
        if ts.date_naive() != current_day {
            inserted += insert_raw_readings(conn, &batch)?;
            batch.clear();
            current_day = ts.date_naive();
        }

        if meters.electricity_device == "elec-1" && ts >= exchange_at {
            info!("Fake data: exchanging electricity meter at {}", ts);
            meters.electricity_device = "elec-2";
            meters.import_wh = 0;
            meters.export_wh = 0;
        }

        let day_fraction = f64::from(ts.time().num_seconds_from_midnight()) / 86_400.0;
        batch.push(electricity_reading(&mut meters, ts, day_fraction, &mut rng));
        batch.push(water_reading(&mut meters, ts, day_fraction, &mut rng));
        batch.push(heat_reading(&mut meters, ts, day_fraction, &mut rng));

        ts += step;
    }
    inserted += insert_raw_readings(conn, &batch)?;

    info!("Fake data: complete (readings={})", inserted);
    Ok(())
}

fn register(register: RegisterCode, value: i64, scale: i16, unit: Unit) -> StoredRegister {
    StoredRegister {
        register,
        value,
        scale,
        unit,
    }
}

fn reading(label: &str, device_id: &str, ts: DateTime<Utc>, registers: Vec<StoredRegister>) -> StoredReading {
    StoredReading {
        id: 0,
        label: label.to_string(),
        device_id: device_id.to_string(),
        timestamp: ts,
        registers,
    }
}

fn electricity_reading(meters: &mut Meters, ts: DateTime<Utc>, day_fraction: f64, rng: &mut SmallRng) -> StoredReading {
    let evening_peak = ((day_fraction - 0.55) * 2.0 * PI).cos().max(0.0) * 40.0;
    let import = 6 + evening_peak as i64 + rng.random_range(0..=12);
    let daylight = ((day_fraction - 0.5) * 2.0 * PI).cos().max(0.0);
    let export = (daylight * rng.random_range(0.0..=30.0)) as i64;

    meters.import_wh = (meters.import_wh + import) % ELECTRICITY_WRAP_WH;
    meters.export_wh += export;

    let scale_watts = |wh: i64| wh * 60 / STEP_MINUTES;
    reading(
        "house",
        meters.electricity_device,
        ts,
        vec![
            register(RegisterCode::ELECTR_ACTIVE_ENERGY_IMPORT, meters.import_wh, 0, Unit::WattHour),
            register(RegisterCode::ELECTR_ACTIVE_ENERGY_EXPORT, meters.export_wh, 0, Unit::WattHour),
            register(RegisterCode::ELECTR_ACTUAL_POWER_IMPORT, scale_watts(import), 0, Unit::Watt),
        ],
    )
}

fn water_reading(meters: &mut Meters, ts: DateTime<Utc>, day_fraction: f64, rng: &mut SmallRng) -> StoredReading {
    let morning = ((day_fraction - 0.3) * 2.0 * PI).cos().max(0.0);
    if rng.random_bool(0.2 + 0.6 * morning) {
        meters.water_l += rng.random_range(1..=15);
    }
    reading(
        "water",
        "water-1",
        ts,
        vec![register(RegisterCode::COLD_WATER_VOLUME, meters.water_l, -3, Unit::CubicMetre)],
    )
}

fn heat_reading(meters: &mut Meters, ts: DateTime<Utc>, day_fraction: f64, rng: &mut SmallRng) -> StoredReading {
    let night_setback = if !(0.25..0.9).contains(&day_fraction) { 0.5 } else { 1.0 };
    let energy = (rng.random_range(40.0..=90.0) * night_setback) as i64;
    meters.heat_wh += energy;
    meters.heat_volume_l += energy / 20;
    let flow: f64 = 55.0 + rng.random_range(-1.5..=1.5);
    let ret = flow - 12.0 * night_setback - rng.random_range(0.0..=2.0);

    reading(
        "heating",
        "heat-1",
        ts,
        vec![
            register(RegisterCode::HEAT_ENERGY, meters.heat_wh, 0, Unit::WattHour),
            register(RegisterCode::HEAT_VOLUME, meters.heat_volume_l, -3, Unit::CubicMetre),
            register(RegisterCode::HEAT_FLOW_TEMPERATURE, (flow * 100.0).round() as i64, -2, Unit::DegreeCelsius),
            register(RegisterCode::HEAT_RETURN_TEMPERATURE, (ret * 100.0).round() as i64, -2, Unit::DegreeCelsius),
        ],
    )
}

fn align_to_step(ts: DateTime<Utc>) -> Result<DateTime<Utc>, String> {
    let step_seconds = STEP_MINUTES * 60;
    let aligned = ts.timestamp().div_euclid(step_seconds) * step_seconds;
    DateTime::<Utc>::from_timestamp(aligned, 0).ok_or_else(|| format!("timestamp {} out of range", aligned))
}

fn samples_per_day() -> usize {
    (24 * 60 / STEP_MINUTES) as usize
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::register::unit::UnitValue;
    use crate::register::value::TimeRegisterValue;
    use chrono::TimeZone;

    fn at(minute: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap() + Duration::minutes(minute)
    }

    fn import_value(reading: &StoredReading) -> TimeRegisterValue {
        let reg = reading
            .registers
            .iter()
            .find(|r| r.register == RegisterCode::ELECTR_ACTIVE_ENERGY_IMPORT)
            .unwrap();
        TimeRegisterValue::new(reading.device_id.clone(), reading.timestamp, reg.unit_value())
    }

    #[test]
    fn electricity_counter_wraps_into_small_positive_delta() {
        let mut rng = SmallRng::seed_from_u64(7);
        let mut meters = Meters::new();
        meters.import_wh = ELECTRICITY_WRAP_WH - 1;
        let before = TimeRegisterValue::new("elec-1", at(0), UnitValue::new(99_999_999.0, Unit::WattHour));

        let after = import_value(&electricity_reading(&mut meters, at(2), 0.5, &mut rng));
        assert!(after.unit_value.value < before.unit_value.value);

        let delta = after.subtract(&before).unwrap();
        assert!(delta.unit_value.value >= 6.0 && delta.unit_value.value < 100.0);
    }

    #[test]
    fn same_seed_same_readings() {
        let mut a = SmallRng::seed_from_u64(1);
        let mut b = SmallRng::seed_from_u64(1);
        let (mut ma, mut mb) = (Meters::new(), Meters::new());
        for minute in (0..60).step_by(2) {
            assert_eq!(
                heat_reading(&mut ma, at(minute), 0.4, &mut a),
                heat_reading(&mut mb, at(minute), 0.4, &mut b)
            );
        }
    }

    #[test]
    fn heat_temperatures_are_centi_degrees_with_return_below_flow() {
        let mut rng = SmallRng::seed_from_u64(3);
        let mut meters = Meters::new();
        for (minute, fraction) in [(0, 0.1), (2, 0.5), (4, 0.95)] {
            let reading = heat_reading(&mut meters, at(minute), fraction, &mut rng);
            let centi = |code: RegisterCode| reading.registers.iter().find(|r| r.register == code).unwrap().value;
            let flow = centi(RegisterCode::HEAT_FLOW_TEMPERATURE);
            let ret = centi(RegisterCode::HEAT_RETURN_TEMPERATURE);
            assert!((5_350..=5_650).contains(&flow), "flow {flow}");
            assert!(ret < flow, "return {ret} flow {flow}");
        }
    }

    #[test]
    fn alignment_floors_to_two_minutes() {
        let ts = Utc.with_ymd_and_hms(2024, 5, 1, 10, 3, 59).unwrap();
        assert_eq!(align_to_step(ts).unwrap(), Utc.with_ymd_and_hms(2024, 5, 1, 10, 2, 0).unwrap());
    }
}
