//! Monthly usage quotas for metered operations.
//!
//! A [`UsageQuotaTracker`] answers "may I spend N units now?" and records
//! what was actually spent. Its only state is a small JSON record:
//!
//! ```json
//! { "month": "2025-01", "used": 17 }
//! ```
//!
//! The record is re-read on every operation, so several trackers (or several
//! runs of the CLI) pointed at the same record agree on its contents. When
//! the UTC month changes, the first access resets the count and writes the
//! reset back immediately.

use std::{
    fmt,
    sync::{Arc, Mutex, MutexGuard},
};

use clap::ValueEnum;
use schemars::JsonSchema;

use crate::prelude::*;

pub use self::{
    clock::{Clock, FixedClock, SystemClock, period_key},
    error::QuotaError,
    metered::{Metered, MeteredOutput, run_metered},
    store::{FileStore, MemoryStore, StateStore, StoreLock},
};

mod clock;
mod error;
mod metered;
mod store;

/// The persisted usage record for one caller class.
#[derive(Clone, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
pub struct UsageState {
    /// The accounting period, as `YYYY-MM` in UTC. Only missing for a record
    /// we synthesized because nothing usable was stored.
    #[serde(rename = "month")]
    pub period_key: Option<String>,

    /// Units consumed so far in this period.
    #[serde(rename = "used")]
    pub used_units: u64,
}

impl UsageState {
    /// A zero record for `period_key`.
    pub fn fresh(period_key: impl Into<String>) -> Self {
        Self {
            period_key: Some(period_key.into()),
            used_units: 0,
        }
    }

    /// How many units are left under `limit`?
    pub fn remaining(&self, limit: u64) -> u64 {
        limit.saturating_sub(self.used_units)
    }

    /// Where is this record in its monthly lifecycle?
    pub fn phase(&self, limit: u64) -> QuotaPhase {
        if self.used_units == 0 {
            QuotaPhase::Fresh
        } else if self.used_units < limit {
            QuotaPhase::Accumulating
        } else {
            QuotaPhase::Exhausted
        }
    }
}

/// Lifecycle of a usage record within one period.
#[derive(Clone, Copy, Debug, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaPhase {
    /// Nothing used yet.
    Fresh,
    /// Some units used, some left.
    Accumulating,
    /// Nothing left until next month.
    Exhausted,
}

/// Which budget does a caller draw from?
///
/// Every class uses the same tracker; they differ only in where the record
/// lives and how many units it allows.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, JsonSchema, PartialEq, Serialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum QuotaClass {
    /// Regular users.
    #[default]
    Standard,
    /// Test and trial users, with a much smaller budget.
    Trial,
}

impl QuotaClass {
    /// All the classes we know about.
    pub const ALL: [QuotaClass; 2] = [QuotaClass::Standard, QuotaClass::Trial];

    /// Units allowed per month unless overridden.
    pub fn default_limit(self) -> u64 {
        match self {
            QuotaClass::Standard => 1000,
            QuotaClass::Trial => 50,
        }
    }

    /// File name of this class's record inside the usage directory.
    pub fn file_name(self) -> &'static str {
        match self {
            QuotaClass::Standard => "usage_standard.json",
            QuotaClass::Trial => "usage_trial.json",
        }
    }
}

impl fmt::Display for QuotaClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QuotaClass::Standard => write!(f, "standard"),
            QuotaClass::Trial => write!(f, "trial"),
        }
    }
}

/// Where a class's record lives, and how big its budget is.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QuotaConfig {
    /// The caller class.
    pub class: QuotaClass,
    /// Path of the JSON record.
    pub path: PathBuf,
    /// Units allowed per month.
    pub limit: u64,
}

impl QuotaConfig {
    /// The default configuration for `class`, with its record in `usage_dir`.
    pub fn for_class(class: QuotaClass, usage_dir: &Path) -> Self {
        Self {
            class,
            path: usage_dir.join(class.file_name()),
            limit: class.default_limit(),
        }
    }

    /// Override the limit.
    pub fn with_limit(mut self, limit: u64) -> Self {
        self.limit = limit;
        self
    }
}

/// The answer to an admission check.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Admission {
    /// May the caller go ahead?
    pub allowed: bool,
    /// Units left this period.
    pub remaining: u64,
    /// The record the decision was based on.
    pub state: UsageState,
}

/// A summary of a class's usage, as printed by `ocr-meter usage`.
#[derive(Clone, Debug, JsonSchema, Serialize)]
pub struct UsageReport {
    /// The caller class.
    pub class: QuotaClass,
    /// The current period, as `YYYY-MM`.
    pub month: Option<String>,
    /// Units used this period.
    pub used: u64,
    /// Units allowed per period.
    pub limit: u64,
    /// Units left this period.
    pub remaining: u64,
    /// Lifecycle phase of the record.
    pub phase: QuotaPhase,
}

impl UsageReport {
    /// Summarize `state` for `class`.
    pub fn new(class: QuotaClass, limit: u64, state: &UsageState) -> Self {
        Self {
            class,
            month: state.period_key.clone(),
            used: state.used_units,
            limit,
            remaining: state.remaining(limit),
            phase: state.phase(limit),
        }
    }
}

/// Tracks monthly consumption of a metered resource against a fixed limit.
///
/// Callers should:
///
/// 1. Call [`UsageQuotaTracker::can_consume`] before the metered operation,
///    and skip the operation if it is not allowed.
/// 2. Call [`UsageQuotaTracker::record_consumption`] once the operation has
///    succeeded, with the units it actually cost.
///
/// [`run_metered`] wraps up this sequence.
///
/// Updates are serialized within a process and, for [`FileStore`], between
/// processes on one host. Nothing protects against double-recording when a
/// caller retries after an ambiguous failure of the metered operation.
pub struct UsageQuotaTracker {
    /// Units allowed per period.
    limit: u64,

    /// Where our record lives.
    store: Box<dyn StateStore>,

    /// Used to compute the current period.
    clock: Arc<dyn Clock>,

    /// Serializes read-modify-write cycles within this process.
    write_lock: Mutex<()>,
}

/// Held for the duration of a read-modify-write.
struct WriteGuard<'a> {
    _store: StoreLock,
    _local: MutexGuard<'a, ()>,
}

impl UsageQuotaTracker {
    /// Create a tracker. `limit` must be positive.
    pub fn new(
        limit: u64,
        store: Box<dyn StateStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, QuotaError> {
        if limit == 0 {
            return Err(QuotaError::InvalidLimit);
        }
        Ok(Self {
            limit,
            store,
            clock,
            write_lock: Mutex::new(()),
        })
    }

    /// Create a file-backed tracker using the system clock.
    pub fn open(config: &QuotaConfig) -> Result<Self, QuotaError> {
        Self::new(
            config.limit,
            Box::new(FileStore::new(&config.path)),
            Arc::new(SystemClock),
        )
    }

    /// Units allowed per period.
    pub fn limit(&self) -> u64 {
        self.limit
    }

    /// Where our record lives.
    pub fn location(&self) -> &str {
        self.store.location()
    }

    /// The period key for right now.
    pub fn current_period_key(&self) -> String {
        period_key(self.clock.now_utc())
    }

    /// Load the current record, rolling it over if it belongs to an earlier
    /// period. A rollover is written back before we return.
    ///
    /// Missing or unreadable records count as empty. The only error is a
    /// failure to persist a rollover.
    #[instrument(level = "debug", skip_all, fields(location = %self.location()))]
    pub fn load_state(&self) -> Result<UsageState, QuotaError> {
        let current = self.current_period_key();
        let state = self.read_state();
        if state.period_key.as_deref() == Some(current.as_str()) {
            return Ok(state);
        }

        // Re-check under the lock, in case someone else rolled over first.
        let _guard = self.lock()?;
        self.load_state_locked(&current)
    }

    /// May we consume `units` right now?
    ///
    /// Running out of quota is reported as `allowed: false`, not as an error.
    #[instrument(level = "debug", skip_all, fields(location = %self.location(), units = units))]
    pub fn can_consume(&self, units: u64) -> Result<Admission, QuotaError> {
        if units == 0 {
            return Err(QuotaError::InvalidUnits);
        }
        let state = self.load_state()?;
        let remaining = state.remaining(self.limit);
        let allowed = units <= remaining;
        debug!(used = state.used_units, remaining, allowed, "Admission check");
        Ok(Admission {
            allowed,
            remaining,
            state,
        })
    }

    /// Record that `units` were consumed. Only call this after the metered
    /// operation has succeeded.
    #[instrument(level = "debug", skip_all, fields(location = %self.location(), units = units))]
    pub fn record_consumption(&self, units: u64) -> Result<UsageState, QuotaError> {
        if units == 0 {
            return Err(QuotaError::InvalidUnits);
        }
        let current = self.current_period_key();
        let _guard = self.lock()?;
        let mut state = self.load_state_locked(&current)?;
        state.used_units = state.used_units.saturating_add(units);
        self.write_state(&state)?;
        info!(
            month = %current,
            used = state.used_units,
            limit = self.limit,
            "Recorded usage"
        );
        Ok(state)
    }

    /// Like [`Self::load_state`], but the caller must hold our lock.
    fn load_state_locked(&self, current: &str) -> Result<UsageState, QuotaError> {
        let state = self.read_state();
        if state.period_key.as_deref() == Some(current) {
            return Ok(state);
        }
        match &state.period_key {
            Some(old) => info!(from = %old, to = %current, "Starting new usage period"),
            None => debug!(month = %current, "Creating usage record"),
        }
        let fresh = UsageState::fresh(current);
        self.write_state(&fresh)?;
        Ok(fresh)
    }

    /// Read our record, treating anything unusable as an empty record.
    fn read_state(&self) -> UsageState {
        match self.read_record() {
            Ok(Some(state)) => state,
            Ok(None) => UsageState::default(),
            Err(err) => {
                let cause = std::error::Error::source(&err)
                    .map(|cause| cause.to_string())
                    .unwrap_or_default();
                warn!(%cause, "{err}; treating as unused");
                UsageState::default()
            }
        }
    }

    /// Read and parse our record.
    fn read_record(&self) -> Result<Option<UsageState>, QuotaError> {
        let location = self.location();
        let Some(bytes) = self
            .store
            .read()
            .map_err(|source| QuotaError::StorageRead {
                location: location.to_owned(),
                source,
            })?
        else {
            return Ok(None);
        };
        let state = serde_json::from_slice::<UsageState>(&bytes).map_err(|source| {
            QuotaError::Corrupt {
                location: location.to_owned(),
                source,
            }
        })?;
        Ok(Some(state))
    }

    /// Atomically replace our record.
    fn write_state(&self, state: &UsageState) -> Result<(), QuotaError> {
        let mut bytes = serde_json::to_vec_pretty(state)?;
        bytes.push(b'\n');
        self.store.atomic_write(&bytes).map_err(|source| {
            error!(location = %self.location(), "Failed to write usage record: {source}");
            QuotaError::StorageWrite {
                location: self.location().to_owned(),
                source,
            }
        })
    }

    /// Take both our in-process lock and the store's lock.
    fn lock(&self) -> Result<WriteGuard<'_>, QuotaError> {
        let local = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let store = self.store.lock().map_err(|source| QuotaError::StorageLock {
            location: self.location().to_owned(),
            source,
        })?;
        Ok(WriteGuard {
            _store: store,
            _local: local,
        })
    }
}
