//! Storage contract consumed by the rollup pipeline and its Postgres adapter.

use chrono::{DateTime, Utc};
use core::fmt;
use diesel::dsl::sql;
use diesel::prelude::*;
use diesel::result::{DatabaseErrorKind, Error as DieselError};
use diesel::sql_types::BigInt;
use diesel::PgConnection;
use std::collections::BTreeMap;
use std::error::Error;

use crate::db::models::{NewReading, Reading, RegisterRow, StoredReading, StoredRegister, StreamPosition, Tier};
use crate::register::code::RegisterCode;
use crate::register::unit::Unit;
use crate::register::value::TimeRegisterValue;
use crate::schema;
use crate::series::collection::{LabelSeries, LabelSeriesSet};

#[derive(Debug, Clone, PartialEq)]
pub enum StoreError {
    /// Busy, locked or disconnected; the next periodic run may succeed.
    Transient(String),
    /// Stored data is unreadable; needs an operator.
    Corruption(String),
    Other(String),
}

impl StoreError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Transient(msg) => write!(f, "transient storage error: {}", msg),
            StoreError::Corruption(msg) => write!(f, "storage corruption: {}", msg),
            StoreError::Other(msg) => write!(f, "storage error: {}", msg),
        }
    }
}

impl Error for StoreError {}

fn classify_message(message: &str) -> Option<fn(String) -> StoreError> {
    let lower = message.to_ascii_lowercase();
    if lower.contains("corrupt") || lower.contains("invalid page") {
        Some(StoreError::Corruption)
    } else if lower.contains("deadlock") || lower.contains("lock") || lower.contains("busy") {
        Some(StoreError::Transient)
    } else {
        None
    }
}

impl From<DieselError> for StoreError {
    fn from(value: DieselError) -> Self {
        let message = value.to_string();
        match &value {
            DieselError::DatabaseError(DatabaseErrorKind::SerializationFailure, _)
            | DieselError::DatabaseError(DatabaseErrorKind::ClosedConnection, _) => StoreError::Transient(message),
            DieselError::DatabaseError(_, info) => match classify_message(info.message()) {
                Some(variant) => variant(message),
                None => StoreError::Other(message),
            },
            _ => StoreError::Other(message),
        }
    }
}

pub trait ReadingStore {
    /// Readings of `tier` for `label` with id above `position`, oldest id first.
    fn fetch_since(&mut self, tier: Tier, label: &str, position: i64, limit: usize) -> Result<Vec<StoredReading>, StoreError>;

    fn resume_position(&mut self, destination: Tier, label: &str) -> Result<Option<i64>, StoreError>;

    /// Device of the `tier` reading with id `id`, if it exists.
    fn device_at(&mut self, tier: Tier, label: &str, id: i64) -> Result<Option<String>, StoreError>;

    /// Insert into `destination`; returns the new row id.
    fn insert_rolled_up(&mut self, destination: Tier, reading: &StoredReading) -> Result<i64, StoreError>;

    /// Never lowers an existing position.
    fn upsert_resume_position(&mut self, destination: Tier, label: &str, position: i64) -> Result<(), StoreError>;

    /// Insert plus position upsert to `reading.id`, as one unit of work.
    fn commit_rolled_up(&mut self, destination: Tier, reading: &StoredReading) -> Result<i64, StoreError>;

    fn labels(&mut self, tier: Tier) -> Result<Vec<String>, StoreError>;
}

pub struct PgReadingStore<'a> {
    conn: &'a mut PgConnection,
}

impl<'a> PgReadingStore<'a> {
    pub fn new(conn: &'a mut PgConnection) -> Self {
        PgReadingStore { conn }
    }

    /// Readings of `tier` for `label` in `[start, end)` as a series set.
    pub fn load_series(
        &mut self,
        tier: Tier,
        label: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<LabelSeriesSet<TimeRegisterValue>, StoreError> {
        use schema::readings::dsl as R;

        let rows = R::readings
            .filter(R::tier.eq(tier.code()))
            .filter(R::label.eq(label))
            .filter(R::timestamp.ge(start))
            .filter(R::timestamp.lt(end))
            .order(R::id.asc())
            .select(Reading::as_select())
            .load(self.conn)?;
        let readings = attach_registers(self.conn, rows)?;

        let mut builder = LabelSeries::builder(label);
        for reading in &readings {
            for reg in &reading.registers {
                builder.push(
                    reg.register,
                    TimeRegisterValue::new(reading.device_id.clone(), reading.timestamp, reg.unit_value()),
                );
            }
        }
        LabelSeriesSet::new(start, end, vec![builder.build()]).map_err(|e| StoreError::Other(e.to_string()))
    }
}

fn to_stored_register(row: &RegisterRow) -> Result<StoredRegister, StoreError> {
    let register = RegisterCode::from_i64(row.register)
        .map_err(|e| StoreError::Corruption(format!("reading {}: {}", row.reading_id, e)))?;
    let unit = Unit::from_code(row.unit).map_err(|e| StoreError::Corruption(format!("reading {}: {}", row.reading_id, e)))?;
    Ok(StoredRegister {
        register,
        value: row.value,
        scale: row.scale,
        unit,
    })
}

fn attach_registers(conn: &mut PgConnection, rows: Vec<Reading>) -> Result<Vec<StoredReading>, StoreError> {
    if rows.is_empty() {
        return Ok(Vec::new());
    }

    use schema::registers::dsl as G;

    let ids: Vec<i64> = rows.iter().map(|r| r.id).collect();
    let register_rows: Vec<RegisterRow> = G::registers
        .filter(G::reading_id.eq_any(ids))
        .order((G::reading_id.asc(), G::register.asc()))
        .select(RegisterRow::as_select())
        .load(conn)?;

    let mut by_reading: BTreeMap<i64, Vec<StoredRegister>> = BTreeMap::new();
    for row in &register_rows {
        by_reading.entry(row.reading_id).or_default().push(to_stored_register(row)?);
    }

    Ok(rows
        .into_iter()
        .map(|r| StoredReading {
            registers: by_reading.remove(&r.id).unwrap_or_default(),
            id: r.id,
            label: r.label,
            device_id: r.device_id,
            timestamp: r.timestamp,
        })
        .collect())
}

pub(crate) fn insert_reading(conn: &mut PgConnection, tier: Tier, reading: &StoredReading) -> QueryResult<i64> {
    use schema::readings::dsl as R;
    use schema::registers::dsl as G;

    let id = diesel::insert_into(R::readings)
        .values(&NewReading {
            tier: tier.code(),
            label: &reading.label,
            device_id: &reading.device_id,
            timestamp: reading.timestamp,
        })
        .returning(R::id)
        .get_result::<i64>(conn)?;

    let rows: Vec<RegisterRow> = reading.registers.iter().map(|r| r.to_row(id)).collect();
    if !rows.is_empty() {
        diesel::insert_into(G::registers).values(&rows).execute(conn)?;
    }
    Ok(id)
}

fn upsert_position(conn: &mut PgConnection, destination: Tier, label: &str, position: i64) -> QueryResult<()> {
    use schema::stream_positions::dsl as S;

    diesel::insert_into(S::stream_positions)
        .values(&StreamPosition {
            stream: destination.code(),
            label: label.to_string(),
            position,
        })
        .on_conflict((S::stream, S::label))
        .do_update()
        .set(S::position.eq(sql::<BigInt>("GREATEST(stream_positions.position, excluded.position)")))
        .execute(conn)
        .map(|_| ())
}

impl ReadingStore for PgReadingStore<'_> {
    fn fetch_since(&mut self, tier: Tier, label: &str, position: i64, limit: usize) -> Result<Vec<StoredReading>, StoreError> {
        use schema::readings::dsl as R;

        let rows = R::readings
            .filter(R::tier.eq(tier.code()))
            .filter(R::label.eq(label))
            .filter(R::id.gt(position))
            .order(R::id.asc())
            .limit(i64::try_from(limit).unwrap_or(i64::MAX))
            .select(Reading::as_select())
            .load(self.conn)?;
        attach_registers(self.conn, rows)
    }

    fn resume_position(&mut self, destination: Tier, label: &str) -> Result<Option<i64>, StoreError> {
        use schema::stream_positions::dsl as S;

        Ok(S::stream_positions
            .filter(S::stream.eq(destination.code()))
            .filter(S::label.eq(label))
            .select(S::position)
            .first::<i64>(self.conn)
            .optional()?)
    }

    fn device_at(&mut self, tier: Tier, label: &str, id: i64) -> Result<Option<String>, StoreError> {
        use schema::readings::dsl as R;

        Ok(R::readings
            .filter(R::tier.eq(tier.code()))
            .filter(R::label.eq(label))
            .filter(R::id.eq(id))
            .select(R::device_id)
            .first::<String>(self.conn)
            .optional()?)
    }

    fn insert_rolled_up(&mut self, destination: Tier, reading: &StoredReading) -> Result<i64, StoreError> {
        Ok(insert_reading(self.conn, destination, reading)?)
    }

    fn upsert_resume_position(&mut self, destination: Tier, label: &str, position: i64) -> Result<(), StoreError> {
        Ok(upsert_position(self.conn, destination, label, position)?)
    }

    fn commit_rolled_up(&mut self, destination: Tier, reading: &StoredReading) -> Result<i64, StoreError> {
        let id = self.conn.transaction::<i64, DieselError, _>(|conn| {
            let id = insert_reading(conn, destination, reading)?;
            upsert_position(conn, destination, &reading.label, reading.id)?;
            Ok(id)
        })?;
        Ok(id)
    }

    fn labels(&mut self, tier: Tier) -> Result<Vec<String>, StoreError> {
        use schema::readings::dsl as R;

        Ok(R::readings
            .filter(R::tier.eq(tier.code()))
            .select(R::label)
            .distinct()
            .order(R::label.asc())
            .load::<String>(self.conn)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transient_errors_are_retryable() {
        assert!(StoreError::Transient("busy".into()).is_retryable());
        assert!(!StoreError::Corruption("bad page".into()).is_retryable());
        assert!(!StoreError::Other("oops".into()).is_retryable());
    }

    #[test]
    fn messages_are_classified() {
        assert_eq!(
            classify_message("could not obtain lock on row").map(|f| f("x".into())),
            Some(StoreError::Transient("x".into()))
        );
        assert_eq!(
            classify_message("invalid page in block 12 of relation").map(|f| f("x".into())),
            Some(StoreError::Corruption("x".into()))
        );
        assert_eq!(classify_message("duplicate key value").map(|f| f("x".into())), None);
    }

    #[test]
    fn non_database_errors_are_not_retryable() {
        let err: StoreError = DieselError::NotFound.into();
        assert!(matches!(err, StoreError::Other(_)));
    }
}
