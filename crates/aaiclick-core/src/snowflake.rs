//! Snowflake ID generation.
//!
//! 63-bit time-ordered identifiers: bits 62-22 hold milliseconds since a
//! custom epoch, bits 21-12 a machine ID (0..=1023), bits 11-0 a
//! per-millisecond sequence (0..=4095). The sign bit is always zero so the
//! IDs fit signed 64-bit columns everywhere, including the state store's
//! BIGINT keys and ClickHouse's Int64 `aai_id` ordering column.

use std::sync::{Mutex, OnceLock};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::ClockMovedBackwards;

/// Custom epoch: 2024-01-01T00:00:00Z, in milliseconds since Unix epoch.
/// 41 timestamp bits on top of this cover roughly 69 years.
const EPOCH_MS: u64 = 1_704_067_200_000;

const MACHINE_BITS: u32 = 10;
const SEQUENCE_BITS: u32 = 12;

const MACHINE_MAX: u64 = (1 << MACHINE_BITS) - 1;
const SEQUENCE_MASK: u64 = (1 << SEQUENCE_BITS) - 1;

const TIMESTAMP_SHIFT: u32 = MACHINE_BITS + SEQUENCE_BITS;

/// Generator state: the last millisecond observed and the sequence within it.
#[derive(Debug)]
struct State {
    last_ms: u64,
    sequence: u64,
}

/// A snowflake ID generator bound to one machine ID.
///
/// Thread-safe; IDs produced by one generator strictly increase.
#[derive(Debug)]
pub struct SnowflakeGenerator {
    machine_id: u64,
    state: Mutex<State>,
}

impl SnowflakeGenerator {
    /// Create a generator for the given machine ID.
    ///
    /// Panics if `machine_id` exceeds the 10-bit range; machine IDs come
    /// from deployment configuration and a bad one is a programming error.
    pub fn new(machine_id: u16) -> Self {
        assert!(
            u64::from(machine_id) <= MACHINE_MAX,
            "machine id {machine_id} exceeds {MACHINE_MAX}"
        );
        Self {
            machine_id: u64::from(machine_id),
            state: Mutex::new(State {
                last_ms: 0,
                sequence: 0,
            }),
        }
    }

    /// Generate one ID.
    ///
    /// Blocks only within a single millisecond, when the 4096-wide sequence
    /// space is exhausted, by busy-waiting for the next millisecond. Fails
    /// with [`ClockMovedBackwards`] if the wall clock regressed below the
    /// last observed timestamp; the caller must refuse to proceed.
    pub fn next_id(&self) -> Result<i64, ClockMovedBackwards> {
        self.next_id_at(now_ms())
    }

    /// Generate `n` distinct IDs, spanning milliseconds if necessary.
    pub fn next_ids(&self, n: usize) -> Result<Vec<i64>, ClockMovedBackwards> {
        let mut ids = Vec::with_capacity(n);
        for _ in 0..n {
            ids.push(self.next_id()?);
        }
        Ok(ids)
    }

    /// Core step, taking the current wall time explicitly.
    ///
    /// Separated from [`next_id`] so the clock-regression and rollover paths
    /// are testable without a controllable system clock.
    fn next_id_at(&self, mut now: u64) -> Result<i64, ClockMovedBackwards> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());

        if now < state.last_ms {
            return Err(ClockMovedBackwards {
                last_ms: state.last_ms,
                now_ms: now,
            });
        }

        if now == state.last_ms {
            state.sequence = (state.sequence + 1) & SEQUENCE_MASK;
            if state.sequence == 0 {
                // Sequence space exhausted within this millisecond.
                now = spin_until_after(state.last_ms);
            }
        } else {
            state.sequence = 0;
        }

        state.last_ms = now;

        let timestamp = now - EPOCH_MS;
        let id = (timestamp << TIMESTAMP_SHIFT) | (self.machine_id << SEQUENCE_BITS) | state.sequence;

        // Bit 63 stays clear for any timestamp this epoch can produce.
        Ok(id as i64)
    }

    /// The machine ID this generator stamps into every ID.
    pub fn machine_id(&self) -> u16 {
        self.machine_id as u16
    }
}

/// Busy-wait until the wall clock passes `last_ms`.
fn spin_until_after(last_ms: u64) -> u64 {
    loop {
        let now = now_ms();
        if now > last_ms {
            return now;
        }
        std::hint::spin_loop();
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// The process-wide generator used by factories and `apply`.
///
/// The machine ID comes from `AAICLICK_MACHINE_ID` when set; otherwise a
/// random one is drawn once per process. Distinct machine IDs across the
/// fleet are the operator's responsibility.
pub fn generator() -> &'static SnowflakeGenerator {
    static GLOBAL: OnceLock<SnowflakeGenerator> = OnceLock::new();
    GLOBAL.get_or_init(|| {
        let machine_id = std::env::var("AAICLICK_MACHINE_ID")
            .ok()
            .and_then(|v| v.parse::<u16>().ok())
            .filter(|m| u64::from(*m) <= MACHINE_MAX)
            .unwrap_or_else(|| rand::random_range(0..=MACHINE_MAX as u16));
        SnowflakeGenerator::new(machine_id)
    })
}

/// Generate one ID from the process-wide generator.
pub fn get_snowflake_id() -> Result<i64, ClockMovedBackwards> {
    generator().next_id()
}

/// Generate `n` distinct IDs from the process-wide generator.
pub fn get_snowflake_ids(n: usize) -> Result<Vec<i64>, ClockMovedBackwards> {
    generator().next_ids(n)
}

/// Data-artifact table name for an ID: `"t" || id`.
pub fn table_name(id: i64) -> String {
    format!("t{id}")
}
