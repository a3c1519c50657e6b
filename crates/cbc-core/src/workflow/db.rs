//! Persistent storage for runs using redb.
//!
//! # Table design
//!
//! `RUNS` maps the 16-byte run id to the JSON-encoded [`Run`].
//!
//! `TIMERS` holds one entry per `Pending` run under a 24-byte composite key:
//! ```text
//! [ next_tick_at_ms: u64 big-endian (8 bytes) | uuid: 16 bytes ]
//! ```
//! Because the timestamp occupies the high bytes in big-endian encoding,
//! byte ordering equals timestamp ordering, and a single range scan
//! `..=due_upper_bound(now)` returns every run due by `now`, oldest first.
//! The run record and its timer are always written in the same transaction.
//! Moving a due run to `Running` ([`RunDb::claim`]) is a single transaction
//! too, so two workers never execute the same step concurrently.

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::{DateTime, TimeZone, Utc};
use redb::{Database, DatabaseError, ReadableTable, TableDefinition, WriteTransaction};
use uuid::Uuid;

use crate::error::{CbcError, Result};

use super::run::{Run, RunStatus};

// ---------------------------------------------------------------------------
// Table definitions
// ---------------------------------------------------------------------------

const RUNS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("runs");

/// Value is always empty; the key carries everything.
const TIMERS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("timers");

fn db_err(e: impl std::fmt::Display) -> CbcError {
    CbcError::RunDb(e.to_string())
}

// ---------------------------------------------------------------------------
// Key helpers
// ---------------------------------------------------------------------------

fn timer_key(ts: DateTime<Utc>, id: Uuid) -> [u8; 24] {
    let mut key = [0u8; 24];
    let ms = ts.timestamp_millis().max(0) as u64;
    key[..8].copy_from_slice(&ms.to_be_bytes());
    key[8..].copy_from_slice(id.as_bytes());
    key
}

/// Upper bound for a range scan returning all timers due by `now`.
///
/// The UUID suffix is `0xff` × 16, which is greater than any valid UUID,
/// so every timer with `timestamp_ms <= now_ms` is included.
fn due_upper_bound(now: DateTime<Utc>) -> [u8; 24] {
    let mut key = [0u8; 24];
    let ms = now.timestamp_millis().max(0) as u64;
    key[..8].copy_from_slice(&ms.to_be_bytes());
    key[8..].fill(0xff);
    key
}

fn timer_ts(key: &[u8]) -> Option<DateTime<Utc>> {
    let ms: [u8; 8] = key.get(..8)?.try_into().ok()?;
    Utc.timestamp_millis_opt(u64::from_be_bytes(ms) as i64).single()
}

fn timer_id(key: &[u8]) -> Option<Uuid> {
    Uuid::from_slice(key.get(8..24)?).ok()
}

// ---------------------------------------------------------------------------
// RunDb
// ---------------------------------------------------------------------------

/// How long an operation waits for another process to release the file.
const OPEN_WAIT: Duration = Duration::from_secs(5);
const OPEN_BACKOFF: Duration = Duration::from_millis(20);

/// Persistent store for [`Run`] records and their wake-up timers.
///
/// redb holds an exclusive file lock while a [`Database`] is open, so the
/// file is opened for each operation and closed again afterwards. A worker,
/// a server and one-shot commands can then share the same file; an
/// operation that finds it held waits for up to [`OPEN_WAIT`].
pub struct RunDb {
    path: PathBuf,
    guard: Mutex<()>,
}

impl RunDb {
    /// Open or create the database at `path`, creating both tables.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            crate::io::ensure_dir(parent)?;
        }
        let db = Self {
            path: path.to_path_buf(),
            guard: Mutex::new(()),
        };
        db.with_db(|db| {
            let wt = db.begin_write().map_err(db_err)?;
            wt.open_table(RUNS).map_err(db_err)?;
            wt.open_table(TIMERS).map_err(db_err)?;
            wt.commit().map_err(db_err)
        })?;
        Ok(db)
    }

    fn with_db<T>(&self, f: impl FnOnce(&Database) -> Result<T>) -> Result<T> {
        let _guard = self
            .guard
            .lock()
            .map_err(|_| CbcError::RunDb("run database lock poisoned".into()))?;
        let deadline = Instant::now() + OPEN_WAIT;
        let db = loop {
            match Database::create(&self.path) {
                Ok(db) => break db,
                Err(DatabaseError::DatabaseAlreadyOpen) if Instant::now() < deadline => {
                    std::thread::sleep(OPEN_BACKOFF);
                }
                Err(e) => {
                    return Err(CbcError::RunDb(format!("{}: {e}", self.path.display())));
                }
            }
        };
        f(&db)
    }

    /// Write a run and keep its timer in step with its status: a `Pending`
    /// run has exactly one timer at `next_tick_at`, any other run has none.
    pub fn save(&self, run: &Run) -> Result<()> {
        self.with_db(|db| {
            let wt = db.begin_write().map_err(db_err)?;
            write_run(&wt, run)?;
            wt.commit().map_err(db_err)
        })
    }

    pub fn get(&self, id: Uuid) -> Result<Run> {
        self.with_db(|db| {
            let rt = db.begin_read().map_err(db_err)?;
            let runs = rt.open_table(RUNS).map_err(db_err)?;
            read_run(&runs, id)?.ok_or_else(|| CbcError::RunNotFound(id.to_string()))
        })
    }

    /// Resolve a full id or a unique prefix of its hyphenated form.
    pub fn find(&self, id_or_prefix: &str) -> Result<Run> {
        if let Ok(id) = Uuid::parse_str(id_or_prefix) {
            return self.get(id);
        }
        let mut matches = self
            .list_all()?
            .into_iter()
            .filter(|r| r.id.to_string().starts_with(id_or_prefix));
        match (matches.next(), matches.next()) {
            (Some(run), None) if !id_or_prefix.is_empty() => Ok(run),
            _ => Err(CbcError::RunNotFound(id_or_prefix.to_string())),
        }
    }

    /// All `Pending` runs whose timer is `<= now`, in timer order.
    pub fn range_due(&self, now: DateTime<Utc>) -> Result<Vec<Run>> {
        let upper = due_upper_bound(now);
        self.with_db(|db| {
            let rt = db.begin_read().map_err(db_err)?;
            let timers = rt.open_table(TIMERS).map_err(db_err)?;
            let runs = rt.open_table(RUNS).map_err(db_err)?;

            let mut result = Vec::new();
            for entry in timers.range(..=upper.as_slice()).map_err(db_err)? {
                let (k, _) = entry.map_err(db_err)?;
                let Some(id) = timer_id(k.value()) else {
                    continue;
                };
                if let Some(run) = read_run(&runs, id)? {
                    if run.status == RunStatus::Pending {
                        result.push(run);
                    }
                }
            }
            Ok(result)
        })
    }

    /// Take a due run for execution: if it is still `Pending` and due by
    /// `now`, mark it `Running` and drop its timer in one transaction.
    ///
    /// Returns `None` when the run is not due or another worker got to it
    /// first.
    pub fn claim(&self, id: Uuid, now: DateTime<Utc>) -> Result<Option<Run>> {
        self.with_db(|db| {
            let wt = db.begin_write().map_err(db_err)?;
            let current = {
                let runs = wt.open_table(RUNS).map_err(db_err)?;
                read_run(&runs, id)?
            };
            let due = |r: &Run| r.status == RunStatus::Pending && r.next_tick_at <= now;
            let Some(mut run) = current.filter(due) else {
                return Ok(None);
            };
            run.status = RunStatus::Running;
            run.updated_at = now;
            write_run(&wt, &run)?;
            wt.commit().map_err(db_err)?;
            Ok(Some(run))
        })
    }

    /// Earliest pending timer, if any.
    pub fn next_due_at(&self) -> Result<Option<DateTime<Utc>>> {
        self.with_db(|db| {
            let rt = db.begin_read().map_err(db_err)?;
            let timers = rt.open_table(TIMERS).map_err(db_err)?;
            let first = timers.first().map_err(db_err)?;
            Ok(first.and_then(|(k, _)| timer_ts(k.value())))
        })
    }

    /// Re-queue runs left in `Running` for longer than `max_age`.
    ///
    /// They become `Pending` at their current state and are due immediately,
    /// so the interrupted task is executed again. Returns the number of runs
    /// recovered.
    pub fn startup_recovery(&self, max_age: Duration, now: DateTime<Utc>) -> Result<u32> {
        let cutoff = now - chrono::Duration::from_std(max_age).map_err(db_err)?;
        self.with_db(|db| {
            let wt = db.begin_write().map_err(db_err)?;
            let stale: Vec<Run> = {
                let runs = wt.open_table(RUNS).map_err(db_err)?;
                all_runs(&runs)?
                    .into_iter()
                    .filter(|r| r.status == RunStatus::Running && r.updated_at < cutoff)
                    .collect()
            };
            for mut run in stale.iter().cloned() {
                run.status = RunStatus::Pending;
                run.next_tick_at = now;
                run.updated_at = now;
                write_run(&wt, &run)?;
            }
            wt.commit().map_err(db_err)?;
            Ok(stale.len() as u32)
        })
    }

    /// Delete finished runs last updated more than `older_than` ago.
    /// Returns the number of runs removed.
    pub fn prune_finished(&self, older_than: Duration, now: DateTime<Utc>) -> Result<u32> {
        let cutoff = now - chrono::Duration::from_std(older_than).map_err(db_err)?;
        self.with_db(|db| {
            let wt = db.begin_write().map_err(db_err)?;
            let mut removed = 0u32;
            {
                let mut runs = wt.open_table(RUNS).map_err(db_err)?;
                let expired: Vec<Uuid> = all_runs(&runs)?
                    .into_iter()
                    .filter(|r| r.is_terminal() && r.updated_at < cutoff)
                    .map(|r| r.id)
                    .collect();
                for id in expired {
                    runs.remove(id.as_bytes().as_slice()).map_err(db_err)?;
                    removed += 1;
                }
            }
            wt.commit().map_err(db_err)?;
            Ok(removed)
        })
    }

    /// All runs, newest first.
    pub fn list_all(&self) -> Result<Vec<Run>> {
        self.with_db(|db| {
            let rt = db.begin_read().map_err(db_err)?;
            let runs = rt.open_table(RUNS).map_err(db_err)?;
            let mut result = all_runs(&runs)?;
            result.sort_by(|a, b| b.created_at.cmp(&a.created_at));
            Ok(result)
        })
    }
}

fn read_run(runs: &impl ReadableTable<&'static [u8], &'static [u8]>, id: Uuid) -> Result<Option<Run>> {
    let value = runs.get(id.as_bytes().as_slice()).map_err(db_err)?;
    let run = match value {
        Some(v) => Some(serde_json::from_slice(v.value())?),
        None => None,
    };
    Ok(run)
}

fn all_runs(runs: &impl ReadableTable<&'static [u8], &'static [u8]>) -> Result<Vec<Run>> {
    let mut result = Vec::new();
    for entry in runs.iter().map_err(db_err)? {
        let (_, v) = entry.map_err(db_err)?;
        result.push(serde_json::from_slice(v.value())?);
    }
    Ok(result)
}

fn write_run(wt: &WriteTransaction, run: &Run) -> Result<()> {
    let value = serde_json::to_vec(run)?;
    let mut runs = wt.open_table(RUNS).map_err(db_err)?;
    let previous = read_run(&runs, run.id)?;

    let mut timers = wt.open_table(TIMERS).map_err(db_err)?;
    if let Some(prev) = previous.filter(|p| p.status == RunStatus::Pending) {
        timers
            .remove(timer_key(prev.next_tick_at, prev.id).as_slice())
            .map_err(db_err)?;
    }
    if run.status == RunStatus::Pending {
        let empty: &[u8] = &[];
        timers
            .insert(timer_key(run.next_tick_at, run.id).as_slice(), empty)
            .map_err(db_err)?;
    }
    runs.insert(run.id.as_bytes().as_slice(), value.as_slice())
        .map_err(db_err)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
