//! clock.rs
//! Shared logical time source for every worker thread.
//!
//! - `current_time()` = base_logical + (real_now - base_real) * scaling
//! - scaling changes rebase (base_logical, base_real) first, so the reading is continuous
//! - the (base_logical, base_real, scaling) triple lives in one `AtomicCell` and is
//!   always replaced as a unit; readers never see a torn snapshot
//! - every snapshot carries an epoch, and the high-water mark is tagged with the epoch
//!   it belongs to. A reader holding a replaced snapshot can no longer raise the mark,
//!   so a reset cannot be undone by a value computed from the old rate.

use crossbeam::atomic::AtomicCell;
use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::{Instant, SystemTime, UNIX_EPOCH},
};

use crate::core::error::{HubError, Result};

/// Nanoseconds since the unix epoch (logical or real, depending on context).
pub type Timestamp = i64;

#[derive(Debug, Clone, Copy, PartialEq)]
struct Snapshot {
    epoch: u64,
    /// Rebased from the previous epoch rather than reset; inherits its mark.
    continues: bool,
    base_real: Timestamp,
    base_logical: Timestamp,
    scaling: f64,
}

impl Snapshot {
    fn at(&self, real_now: Timestamp) -> Timestamp {
        let elapsed = (real_now - self.base_real) as f64;
        self.base_logical + (elapsed * self.scaling) as i64
    }
}

/// Largest reading handed out for one snapshot epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Mark {
    epoch: u64,
    value: Timestamp,
}

pub struct LogicalClock {
    anchor: Instant,
    anchor_wall: Timestamp,
    snapshot: AtomicCell<Snapshot>,
    high_water: AtomicCell<Mark>,
    epochs: AtomicU64,
}

impl LogicalClock {
    /// Starts at wall-clock time with scaling 1.0.
    pub fn new() -> Self {
        let anchor_wall = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos() as Timestamp;
        Self {
            anchor: Instant::now(),
            anchor_wall,
            snapshot: AtomicCell::new(Snapshot {
                epoch: 0,
                continues: false,
                base_real: anchor_wall,
                base_logical: anchor_wall,
                scaling: 1.0,
            }),
            high_water: AtomicCell::new(Mark {
                epoch: 0,
                value: anchor_wall,
            }),
            epochs: AtomicU64::new(0),
        }
    }

    /// Monotonic wall-clock reading (unaffected by scaling).
    #[inline]
    pub fn real_time(&self) -> Timestamp {
        self.anchor_wall + self.anchor.elapsed().as_nanos() as Timestamp
    }

    /// Current logical time. Never smaller than any value previously returned,
    /// except across a `reset`.
    pub fn current_time(&self) -> Timestamp {
        loop {
            let snapshot = self.snapshot.load();
            let computed = snapshot.at(self.real_time());
            if let Some(reading) = self.raise_mark(&snapshot, computed) {
                return reading;
            }
            // the snapshot was replaced while we computed; read the new one
        }
    }

    /// Folds `value` into the mark of the snapshot's epoch. Returns `None` when a
    /// newer epoch already owns the mark.
    fn raise_mark(&self, snapshot: &Snapshot, value: Timestamp) -> Option<Timestamp> {
        let epoch = snapshot.epoch;
        let mut current = self.high_water.load();
        loop {
            if current.epoch > epoch {
                return None;
            }
            let inherits = current.epoch == epoch || snapshot.continues;
            let next = Mark {
                epoch,
                value: if inherits { current.value.max(value) } else { value },
            };
            if next == current {
                return Some(next.value);
            }
            match self.high_water.compare_exchange(current, next) {
                Ok(_) => return Some(next.value),
                Err(actual) => current = actual,
            }
        }
    }

    /// Publishes a new snapshot under a fresh epoch, then hands it the mark.
    fn install(
        &self,
        continues: bool,
        base_real: Timestamp,
        base_logical: Timestamp,
        scaling: f64,
    ) {
        let snapshot = Snapshot {
            epoch: self.epochs.fetch_add(1, Ordering::AcqRel) + 1,
            continues,
            base_real,
            base_logical,
            scaling,
        };
        self.snapshot.store(snapshot);
        let _ = self.raise_mark(&snapshot, base_logical);
    }

    pub fn scaling(&self) -> f64 {
        self.snapshot.load().scaling
    }

    /// Changes the rate of logical time. The reading stays continuous across the change.
    pub fn set_scaling(&self, scaling: f64) -> Result<()> {
        if !scaling.is_finite() || scaling <= 0.0 {
            return Err(HubError::InvalidScaling(scaling));
        }
        let base_logical = self.current_time();
        let real_now = self.real_time();
        self.install(true, real_now, base_logical, scaling);
        log::debug!("[Clock] scaling set to {:.3}", scaling);
        Ok(())
    }

    /// Rebases logical time onto real time with scaling 1.0.
    ///
    /// This is the one deliberate discontinuity: a clock that ran fast will jump back.
    pub fn reset(&self) {
        let real_now = self.real_time();
        self.install(false, real_now, real_now, 1.0);
        log::debug!("[Clock] reset to real time");
    }
}

impl Default for LogicalClock {
    fn default() -> Self {
        Self::new()
    }
}
