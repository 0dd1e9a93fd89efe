//! Cancellable scheduled tasks owned by the tracker worker.
//!
//! A [`TimerSlot`] holds at most one pending timer. Arming a slot drops the
//! previous timer before scheduling the new one, so two timers of the same
//! kind can never be live at once. Every arm or cancel bumps the slot
//! generation: asynchronous work started by a timer carries the generation it
//! was started under and is discarded on completion if the slot moved on.

use std::fmt;
use std::future;
use std::pin::Pin;
use std::time::Duration;
use tokio::time::{sleep, Sleep};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    Fetch,
    ProgramChange,
    Validate,
}

impl fmt::Display for TimerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fetch => f.write_str("fetch"),
            Self::ProgramChange => f.write_str("program-change"),
            Self::Validate => f.write_str("validate"),
        }
    }
}

struct ScheduledTask<T> {
    sleep: Pin<Box<Sleep>>,
    payload: T,
}

pub struct TimerSlot<T> {
    kind: TimerKind,
    scheduled: Option<ScheduledTask<T>>,
    generation: u64,
}

impl<T> TimerSlot<T> {
    pub fn new(kind: TimerKind) -> Self {
        Self {
            kind,
            scheduled: None,
            generation: 0,
        }
    }

    /// Schedule `payload` to fire after `delay`, replacing any pending timer.
    ///
    /// Returns the generation of the new timer.
    pub fn arm(&mut self, delay: Duration, payload: T) -> u64 {
        self.generation += 1;
        if self.scheduled.is_some() {
            debug!(timer = %self.kind, "Replacing pending timer");
        }
        self.scheduled = Some(ScheduledTask {
            sleep: Box::pin(sleep(delay)),
            payload,
        });
        debug!(
            timer = %self.kind,
            generation = self.generation,
            delay_ms = delay.as_millis() as u64,
            "Timer armed"
        );
        self.generation
    }

    /// Drop the pending timer and invalidate work started by earlier ones.
    ///
    /// Returns `true` if a timer was pending.
    pub fn cancel(&mut self) -> bool {
        self.generation += 1;
        let was_armed = self.scheduled.take().is_some();
        if was_armed {
            debug!(timer = %self.kind, "Timer cancelled");
        }
        was_armed
    }

    pub fn is_armed(&self) -> bool {
        self.scheduled.is_some()
    }

    pub fn is_current(&self, generation: u64) -> bool {
        self.generation == generation
    }

    pub fn payload_mut(&mut self) -> Option<&mut T> {
        self.scheduled.as_mut().map(|task| &mut task.payload)
    }

    /// Wait for the pending timer to fire and take its payload.
    ///
    /// Pending forever while the slot is empty. Cancel safe: dropping the
    /// future before the deadline leaves the timer armed.
    pub async fn fired(&mut self) -> (u64, T) {
        loop {
            match self.scheduled.as_mut() {
                Some(task) => task.sleep.as_mut().await,
                None => future::pending::<()>().await,
            }
            if let Some(task) = self.scheduled.take() {
                debug!(timer = %self.kind, generation = self.generation, "Timer fired");
                return (self.generation, task.payload);
            }
        }
    }
}
