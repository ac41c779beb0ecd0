//! Resumable rollup of readings into day, month and year tiers.
//!
//! Per (destination, label) a run fetches source rows past the stored resume
//! position, keeps the latest reading of every destination bucket plus both
//! sides of any meter exchange, holds back the newest bucket while it is
//! incomplete, and commits each kept reading together with the new position.

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use core::fmt;
use log::{debug, info, warn};
use std::collections::{BTreeMap, BTreeSet};
use std::error::Error;
use std::num::NonZeroUsize;

use crate::db::models::{StoredReading, Tier};
use crate::db::store::{ReadingStore, StoreError};
use crate::series::interval::Granularity;

#[derive(Debug, Clone, PartialEq)]
pub enum RollupError {
    Store(StoreError),
    NotADestination(Tier),
}

impl RollupError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, RollupError::Store(e) if e.is_retryable())
    }
}

impl fmt::Display for RollupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RollupError::Store(e) => write!(f, "{}", e),
            RollupError::NotADestination(tier) => write!(f, "{} is not a rollup destination", tier.as_str()),
        }
    }
}

impl Error for RollupError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            RollupError::Store(e) => Some(e),
            RollupError::NotADestination(_) => None,
        }
    }
}

impl From<StoreError> for RollupError {
    fn from(value: StoreError) -> Self {
        RollupError::Store(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RollupOutcome {
    pub fetched: usize,
    pub written: usize,
    /// Resume position after the run; `None` if nothing was ever rolled up.
    pub position: Option<i64>,
    pub full_batch: bool,
}

/// Indices into a batch that should be written, in id order.
#[derive(Debug, PartialEq, Eq)]
struct Selection {
    write: Vec<usize>,
    held_back: Option<usize>,
    /// The held-back reading was written anyway so a full batch can advance.
    forced: bool,
}

/// Pick the readings of `rows` (sorted by id) to write to `granularity`.
///
/// `previous_device` is the device of the source reading at the resume
/// position, so an exchange straddling two batches is still seen.
fn select_readings(
    rows: &[StoredReading],
    previous_device: Option<&str>,
    granularity: Granularity,
    tz: &Tz,
    full_batch: bool,
) -> Selection {
    let mut by_time: Vec<usize> = (0..rows.len()).collect();
    by_time.sort_by_key(|&i| (rows[i].timestamp, rows[i].id));

    let mut latest_per_bucket: BTreeMap<DateTime<Utc>, usize> = BTreeMap::new();
    for &i in &by_time {
        latest_per_bucket.insert(granularity.floor(rows[i].timestamp, tz), i);
    }

    let mut exchange: BTreeSet<usize> = BTreeSet::new();
    if let (Some(previous), Some(&first)) = (previous_device, by_time.first())
        && rows[first].device_id != previous
    {
        exchange.insert(first);
    }
    for pair in by_time.windows(2) {
        if rows[pair[0]].device_id != rows[pair[1]].device_id {
            exchange.insert(pair[0]);
            exchange.insert(pair[1]);
        }
    }

    let held_back = latest_per_bucket
        .last_key_value()
        .map(|(_, &i)| i)
        .filter(|i| !exchange.contains(i) && !granularity.is_complete(rows[*i].timestamp, tz));

    let keep = latest_per_bucket.values().copied().chain(exchange).collect::<BTreeSet<usize>>();
    let mut write: Vec<usize> = match held_back {
        // everything from the held-back reading's id on is refetched next run
        Some(cutoff) => keep.into_iter().filter(|&i| rows[i].id < rows[cutoff].id).collect(),
        None => keep.into_iter().collect(),
    };

    if write.is_empty()
        && full_batch
        && let Some(i) = held_back
    {
        return Selection {
            write: vec![i],
            held_back: None,
            forced: true,
        };
    }

    write.sort_by_key(|&i| rows[i].id);
    Selection {
        write,
        held_back,
        forced: false,
    }
}

/// One batch for (destination, label).
pub fn run_once<S: ReadingStore>(
    store: &mut S,
    tz: &Tz,
    destination: Tier,
    label: &str,
    batch_size: NonZeroUsize,
) -> Result<RollupOutcome, RollupError> {
    let (Some(source), Some(granularity)) = (destination.source(), destination.granularity()) else {
        return Err(RollupError::NotADestination(destination));
    };

    let position = store.resume_position(destination, label)?;
    let rows = store.fetch_since(source, label, position.unwrap_or(0), batch_size.get())?;
    let previous_device = match position {
        Some(id) if !rows.is_empty() => store.device_at(source, label, id)?,
        _ => None,
    };
    let full_batch = rows.len() >= batch_size.get();
    debug!(
        "Rollup: {} -> {} label {} fetched {} row(s) after position {}",
        source.as_str(),
        destination.as_str(),
        label,
        rows.len(),
        position.unwrap_or(0)
    );

    let selection = select_readings(&rows, previous_device.as_deref(), granularity, tz, full_batch);
    if let Some(i) = selection.held_back {
        debug!(
            "Rollup: {} label {} holding back incomplete bucket (latest reading {})",
            destination.as_str(),
            label,
            rows[i].timestamp
        );
    } else if selection.forced {
        warn!(
            "Rollup: {} label {} batch of {} row(s) fits one incomplete bucket; writing its latest reading",
            destination.as_str(),
            label,
            rows.len()
        );
    }

    let mut outcome = RollupOutcome {
        fetched: rows.len(),
        written: 0,
        position,
        full_batch,
    };
    for i in selection.write {
        let reading = &rows[i];
        store.commit_rolled_up(destination, reading)?;
        outcome.written += 1;
        outcome.position = Some(outcome.position.map_or(reading.id, |p| p.max(reading.id)));
    }

    if outcome.written > 0 {
        info!(
            "Rollup: {} label {} wrote {} of {} row(s), position now {}",
            destination.as_str(),
            label,
            outcome.written,
            outcome.fetched,
            outcome.position.unwrap_or(0)
        );
    }
    Ok(outcome)
}

/// Batches into `destination` until a batch is short or writes nothing.
pub fn run_stage<S: ReadingStore>(
    store: &mut S,
    tz: &Tz,
    destination: Tier,
    label: &str,
    batch_size: NonZeroUsize,
) -> Result<usize, RollupError> {
    let mut written = 0;
    loop {
        let outcome = run_once(store, tz, destination, label, batch_size)?;
        written += outcome.written;
        if !outcome.full_batch || outcome.written == 0 {
            return Ok(written);
        }
    }
}

/// raw -> day -> month -> year for one label, stopping at the first stage that wrote nothing.
pub fn run_label<S: ReadingStore>(
    store: &mut S,
    tz: &Tz,
    label: &str,
    batch_size: NonZeroUsize,
) -> Result<BTreeMap<Tier, usize>, RollupError> {
    let mut written = BTreeMap::new();
    for destination in Tier::DESTINATIONS {
        let count = run_stage(store, tz, destination, label, batch_size)?;
        written.insert(destination, count);
        if count == 0 {
            break;
        }
    }
    Ok(written)
}

pub fn run_all<S: ReadingStore>(store: &mut S, tz: &Tz, batch_size: NonZeroUsize) -> Result<(), String> {
    let labels = store
        .labels(Tier::Raw)
        .map_err(|e| format!("listing labels failed: {}", e))?;
    info!("Rollup: {} label(s) to process", labels.len());

    for label in &labels {
        let written = run_label(store, tz, label, batch_size).map_err(|e| {
            let hint = if e.is_retryable() { " (will retry next run)" } else { "" };
            format!("rollup of {} failed: {}{}", label, e, hint)
        })?;
        let summary = written
            .iter()
            .map(|(tier, count)| format!("{}={}", tier.as_str(), count))
            .collect::<Vec<_>>()
            .join(", ");
        info!("Rollup: label {} done ({})", label, summary);
    }
    Ok(())
}
