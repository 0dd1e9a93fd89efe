//! Jittered scheduling offsets
//!
//! Thousands of clients watching the same channel all reach a program
//! boundary at the same instant. Each tracker therefore spreads its backend
//! traffic over a window bounded by the fuzzy factor:
//!
//! - `fetch`: delay before asking the backend for the next program,
//! - `change`: delay between that fetch and the program-changed notification,
//! - `validate`: delay between the notification and the entitlement check.
//!
//! `fetch + change` always equals the remaining distance to the program end.

use crate::error::{Error, Result};
use crate::program::Timestamp;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Minimum (and default) fuzzy factor in milliseconds
pub const MIN_FUZZY_FACTOR_MS: i64 = 30_000;

/// Upper bound of the jitter window, in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub struct FuzzyFactor(i64);

impl FuzzyFactor {
    pub fn new(millis: i64) -> Result<Self> {
        if millis < MIN_FUZZY_FACTOR_MS {
            return Err(Error::InvalidFuzzyFactor(millis));
        }
        Ok(Self(millis))
    }

    pub fn as_millis(self) -> i64 {
        self.0
    }
}

impl Default for FuzzyFactor {
    fn default() -> Self {
        Self(MIN_FUZZY_FACTOR_MS)
    }
}

impl TryFrom<i64> for FuzzyFactor {
    type Error = Error;

    fn try_from(value: i64) -> Result<Self> {
        Self::new(value)
    }
}

impl From<FuzzyFactor> for i64 {
    fn from(value: FuzzyFactor) -> Self {
        value.0
    }
}

/// The three jittered delays of one validation cycle (milliseconds).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FuzzyOffsets {
    pub fetch: i64,
    pub change: i64,
    pub validate: i64,
}

impl FuzzyOffsets {
    pub fn fetch_delay(&self) -> Duration {
        to_duration(self.fetch)
    }

    pub fn change_delay(&self) -> Duration {
        to_duration(self.change)
    }

    pub fn validate_delay(&self) -> Duration {
        to_duration(self.validate)
    }
}

/// Convert a millisecond offset to a `Duration`, clamping negatives to zero
fn to_duration(millis: i64) -> Duration {
    Duration::from_millis(millis.max(0) as u64)
}

/// Split the time left until `end` into fetch/change/validate offsets.
///
/// A program that already ended yields zero fetch and change offsets, so the
/// next program is fetched immediately.
pub fn fuzzy_offsets<R: Rng + ?Sized>(
    timestamp: Timestamp,
    end: Timestamp,
    fuzzy_factor: FuzzyFactor,
    rng: &mut R,
) -> FuzzyOffsets {
    let factor = fuzzy_factor.as_millis();
    let program_distance = end.saturating_sub(timestamp).max(0);
    let available_budget = program_distance.min(factor);

    let change = rng.random_range(0..=available_budget);
    let fetch = program_distance - change;
    let validate = factor - rng.random_range(0..=factor);

    FuzzyOffsets {
        fetch,
        change,
        validate,
    }
}

/// Jittered delay in `[0, fuzzy_factor]`, used to retry after a failed resolution
pub fn recovery_delay<R: Rng + ?Sized>(fuzzy_factor: FuzzyFactor, rng: &mut R) -> Duration {
    to_duration(rng.random_range(0..=fuzzy_factor.as_millis()))
}
