//! Broadcast program model
//!
//! A [`Program`] identifies one slot of a channel's EPG. Programs are
//! immutable once fetched: when the backend reports a change (new slot,
//! extended end date) the tracker replaces its program instead of mutating it.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Unix epoch timestamp in milliseconds
pub type Timestamp = i64;

/// A broadcast slot on a channel
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Program {
    pub program_id: String,
    pub channel_id: String,
    pub asset_id: String,
    /// Start of the slot (inclusive)
    pub start_date: Timestamp,
    /// End of the slot (exclusive)
    pub end_date: Timestamp,
}

/// How a freshly fetched program relates to the one it should follow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Continuity {
    /// Same program, end date moved
    Extension,
    /// A different program starting exactly where the previous one ends
    Transition,
    /// Anything else: the EPG has a hole or did not advance
    Gap,
}

impl Program {
    pub fn new(
        program_id: impl Into<String>,
        channel_id: impl Into<String>,
        asset_id: impl Into<String>,
        start_date: Timestamp,
        end_date: Timestamp,
    ) -> Self {
        Self {
            program_id: program_id.into(),
            channel_id: channel_id.into(),
            asset_id: asset_id.into(),
            start_date,
            end_date,
        }
    }

    /// Whether `timestamp` falls inside `[start_date, end_date)`
    pub fn contains(&self, timestamp: Timestamp) -> bool {
        self.start_date <= timestamp && timestamp < self.end_date
    }

    /// Whether the program is airing at wall-clock time `now`
    pub fn is_live(&self, now: Timestamp) -> bool {
        self.contains(now)
    }

    /// Classify `next` as the successor of `self`.
    ///
    /// Identity wins over dates: a result carrying the same `program_id` is an
    /// extension only when its end date moved, otherwise the EPG did not
    /// advance and the result counts as a gap.
    pub fn continuity_to(&self, next: &Program) -> Continuity {
        if next.program_id == self.program_id {
            if next.end_date != self.end_date {
                Continuity::Extension
            } else {
                Continuity::Gap
            }
        } else if next.start_date == self.end_date {
            Continuity::Transition
        } else {
            Continuity::Gap
        }
    }

    pub fn start_datetime(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_millis_opt(self.start_date).single()
    }

    pub fn end_datetime(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_millis_opt(self.end_date).single()
    }
}

impl fmt::Display for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.start_datetime(), self.end_datetime()) {
            (Some(start), Some(end)) => write!(
                f,
                "{} [{} - {}]",
                self.program_id,
                start.format("%Y-%m-%d %H:%M:%S"),
                end.format("%H:%M:%S")
            ),
            _ => write!(
                f,
                "{} [{} - {}]",
                self.program_id, self.start_date, self.end_date
            ),
        }
    }
}
