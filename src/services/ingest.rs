use crate::db::models::{NewReading, RegisterRow, StoredReading, Tier};
use crate::schema;
use diesel::prelude::*;
use diesel::PgConnection;

/// Insert raw readings in one transaction, skipping (label, device, timestamp)
/// duplicates. Returns the number of readings inserted.
pub fn insert_raw_readings(conn: &mut PgConnection, readings: &[StoredReading]) -> Result<usize, String> {
    if readings.is_empty() {
        return Ok(0);
    }

    use schema::readings::dsl as R;
    use schema::registers::dsl as G;

    conn.transaction::<usize, diesel::result::Error, _>(|conn| {
        let mut inserted = 0;
        for reading in readings {
            let id = diesel::insert_into(R::readings)
                .values(&NewReading {
                    tier: Tier::Raw.code(),
                    label: &reading.label,
                    device_id: &reading.device_id,
                    timestamp: reading.timestamp,
                })
                .on_conflict_do_nothing()
                .returning(R::id)
                .get_result::<i64>(conn)
                .optional()?;
            let Some(id) = id else {
                continue;
            };

            let rows: Vec<RegisterRow> = reading.registers.iter().map(|r| r.to_row(id)).collect();
            if !rows.is_empty() {
                diesel::insert_into(G::registers).values(&rows).execute(conn)?;
            }
            inserted += 1;
        }
        Ok(inserted)
    })
    .map_err(|e| format!("insert raw readings failed: {}", e))
}
