//! Time-ordered 64-bit identifiers.
//!
//! Layout, most significant bit first:
//!
//! ```text
//! [41 bits ms since EPOCH_MS][8 bits datacenter][8 bits worker][7 bits sequence]
//! ```
//!
//! One [`IdGenerator`] per (datacenter, worker) pair yields strictly increasing
//! identifiers. Small backwards clock steps (up to [`ROLLBACK_TOLERANCE_MS`])
//! are absorbed by waiting; larger ones fail with [`IdError::ClockRollback`].

use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::errors::IdError;

/// Custom epoch, 2020-12-31T16:00:00Z.
pub const EPOCH_MS: i64 = 1_609_430_400_000;

const SEQUENCE_BITS: u32 = 7;
const WORKER_BITS: u32 = 8;
const DATACENTER_BITS: u32 = 8;

pub const MAX_SEQUENCE: i64 = (1 << SEQUENCE_BITS) - 1;
pub const MAX_WORKER_ID: i64 = (1 << WORKER_BITS) - 1;
pub const MAX_DATACENTER_ID: i64 = (1 << DATACENTER_BITS) - 1;

const WORKER_SHIFT: u32 = SEQUENCE_BITS;
const DATACENTER_SHIFT: u32 = SEQUENCE_BITS + WORKER_BITS;
const TIMESTAMP_SHIFT: u32 = SEQUENCE_BITS + WORKER_BITS + DATACENTER_BITS;
const MAX_TIMESTAMP_DELTA: u64 = (1 << (64 - TIMESTAMP_SHIFT)) - 1;

/// Backwards clock drift absorbed by waiting instead of failing.
pub const ROLLBACK_TOLERANCE_MS: i64 = 5;

/// Poll step while waiting for the next millisecond after sequence exhaustion.
const SPIN_STEP: Duration = Duration::from_micros(50);

/// A generated identifier.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identifier(u64);

impl Identifier {
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }

    pub fn parts(&self) -> IdParts {
        IdGenerator::parse(*self)
    }

    /// Sender label stamped onto broadcasts from this session.
    pub fn display_name(&self) -> String {
        format!("user{}", self.0)
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Decoded fields of an [`Identifier`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IdParts {
    /// Unix milliseconds (epoch offset re-applied).
    pub timestamp_ms: i64,
    pub datacenter_id: u8,
    pub worker_id: u8,
    pub sequence: u8,
}

/// Millisecond time source for the generator.
pub trait Clock: Send + Sync {
    fn now_millis(&self) -> i64;

    /// Block the calling thread. Only the generator's caller waits.
    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Wall clock.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as i64
    }
}

/// Settable clock. `sleep` advances the clock instead of blocking.
#[derive(Debug)]
pub struct ManualClock {
    micros: AtomicI64,
}

impl ManualClock {
    pub fn new(now_ms: i64) -> Self {
        Self {
            micros: AtomicI64::new(now_ms * 1000),
        }
    }

    pub fn set_millis(&self, now_ms: i64) {
        self.micros.store(now_ms * 1000, Ordering::SeqCst);
    }

    pub fn advance(&self, duration: Duration) {
        self.micros
            .fetch_add(duration.as_micros() as i64, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> i64 {
        self.micros.load(Ordering::SeqCst) / 1000
    }

    fn sleep(&self, duration: Duration) {
        self.advance(duration);
    }
}

struct GeneratorState {
    last_timestamp: i64,
    sequence: i64,
}

/// Snowflake-style generator for one (datacenter, worker) pair.
pub struct IdGenerator {
    datacenter_id: i64,
    worker_id: i64,
    clock: Arc<dyn Clock>,
    state: Mutex<GeneratorState>,
}

impl fmt::Debug for IdGenerator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdGenerator")
            .field("datacenter_id", &self.datacenter_id)
            .field("worker_id", &self.worker_id)
            .finish_non_exhaustive()
    }
}

impl IdGenerator {
    pub fn new(datacenter_id: i64, worker_id: i64) -> Result<Self, IdError> {
        Self::with_clock(datacenter_id, worker_id, Arc::new(SystemClock))
    }

    pub fn with_clock(
        datacenter_id: i64,
        worker_id: i64,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, IdError> {
        if !(0..=MAX_DATACENTER_ID).contains(&datacenter_id) {
            return Err(IdError::Configuration {
                field: "datacenter_id",
                value: datacenter_id,
                max: MAX_DATACENTER_ID,
            });
        }
        if !(0..=MAX_WORKER_ID).contains(&worker_id) {
            return Err(IdError::Configuration {
                field: "worker_id",
                value: worker_id,
                max: MAX_WORKER_ID,
            });
        }
        Ok(Self {
            datacenter_id,
            worker_id,
            clock,
            state: Mutex::new(GeneratorState {
                last_timestamp: -1,
                sequence: 0,
            }),
        })
    }

    pub fn datacenter_id(&self) -> i64 {
        self.datacenter_id
    }

    pub fn worker_id(&self) -> i64 {
        self.worker_id
    }

    /// Generate the next identifier.
    ///
    /// May block the caller for up to [`ROLLBACK_TOLERANCE_MS`] while the clock
    /// catches up, or for the rest of the current millisecond when the
    /// sequence is exhausted.
    pub fn next_id(&self) -> Result<Identifier, IdError> {
        let mut state = self.state.lock();
        let mut now = self.clock.now_millis();

        if now < state.last_timestamp {
            let drift_ms = state.last_timestamp - now;
            if drift_ms > ROLLBACK_TOLERANCE_MS {
                return Err(IdError::ClockRollback { drift_ms });
            }
            self.clock.sleep(Duration::from_millis(drift_ms as u64));
            now = self.clock.now_millis();
            if now < state.last_timestamp {
                return Err(IdError::ClockStillBehind {
                    drift_ms: state.last_timestamp - now,
                });
            }
        }

        let mut sequence = 0;
        if now == state.last_timestamp {
            sequence = (state.sequence + 1) & MAX_SEQUENCE;
            if sequence == 0 {
                now = self.wait_past(state.last_timestamp);
            }
        }

        let delta = u64::try_from(now - EPOCH_MS)
            .ok()
            .filter(|delta| *delta <= MAX_TIMESTAMP_DELTA)
            .ok_or(IdError::TimestampOutOfRange { now_ms: now })?;
        state.last_timestamp = now;
        state.sequence = sequence;

        let raw = (delta << TIMESTAMP_SHIFT)
            | ((self.datacenter_id as u64) << DATACENTER_SHIFT)
            | ((self.worker_id as u64) << WORKER_SHIFT)
            | sequence as u64;
        Ok(Identifier(raw))
    }

    fn wait_past(&self, last_timestamp: i64) -> i64 {
        loop {
            let now = self.clock.now_millis();
            if now > last_timestamp {
                return now;
            }
            self.clock.sleep(SPIN_STEP);
        }
    }

    /// Split an identifier back into its fields.
    pub fn parse(id: Identifier) -> IdParts {
        let raw = id.0;
        IdParts {
            timestamp_ms: (raw >> TIMESTAMP_SHIFT) as i64 + EPOCH_MS,
            datacenter_id: ((raw >> DATACENTER_SHIFT) & MAX_DATACENTER_ID as u64) as u8,
            worker_id: ((raw >> WORKER_SHIFT) & MAX_WORKER_ID as u64) as u8,
            sequence: (raw & MAX_SEQUENCE as u64) as u8,
        }
    }
}
