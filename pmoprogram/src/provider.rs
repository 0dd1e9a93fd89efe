//! EPG and entitlement backend interface
//!
//! [`ProgramProvider`] is the only way the engine talks to the backend. It
//! is pure request/response: implementations keep no tracking state and
//! every call may fail with a transport error, which is distinct from a
//! negative business answer (`Ok(None)` or [`ValidationOutcome::NotEntitled`]).

use crate::error::{Error, Result};
use crate::program::{Program, Timestamp};
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt::Debug;
use tokio::sync::RwLock;

/// Result of an entitlement check
#[derive(Debug)]
pub enum ValidationOutcome {
    Success,
    /// The backend denied the asset. Fatal for playback.
    NotEntitled { message: String },
    /// The validation channel itself failed. Treated as permissive.
    ValidationFailed(Error),
}

#[async_trait]
pub trait ProgramProvider: Debug + Send + Sync {
    /// Programs of `channel_id` airing at `timestamp`
    async fn fetch_programs(&self, channel_id: &str, timestamp: Timestamp)
        -> Result<Vec<Program>>;

    /// Program following `program` on its channel.
    ///
    /// When the backend extended `program`, the result carries the same
    /// `program_id` with the new end date.
    async fn fetch_next_program(&self, program: &Program) -> Result<Option<Program>>;

    /// Program preceding `program` on its channel
    async fn fetch_previous_program(&self, program: &Program) -> Result<Option<Program>>;

    /// Check that the current session may play `asset_id`.
    ///
    /// Transport failures must be reported as [`ValidationOutcome::ValidationFailed`].
    async fn validate_entitlement(&self, asset_id: &str) -> ValidationOutcome;

    /// Program covering `timestamp`, if any
    async fn fetch_program_at(
        &self,
        channel_id: &str,
        timestamp: Timestamp,
    ) -> Result<Option<Program>> {
        let programs = self.fetch_programs(channel_id, timestamp).await?;
        Ok(programs.into_iter().find(|p| p.contains(timestamp)))
    }
}

/// In-memory EPG and entitlement store.
///
/// Useful for offline simulations and as a reference implementation of the
/// next/previous semantics expected from a real backend.
#[derive(Debug, Default)]
pub struct MemoryProgramProvider {
    programs: RwLock<Vec<Program>>,
    denied: RwLock<HashMap<String, String>>,
}

impl MemoryProgramProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_programs(programs: impl IntoIterator<Item = Program>) -> Self {
        let mut list: Vec<Program> = programs.into_iter().collect();
        list.sort_by_key(|p| (p.channel_id.clone(), p.start_date));
        Self {
            programs: RwLock::new(list),
            denied: RwLock::new(HashMap::new()),
        }
    }

    /// Insert a program, replacing any program with the same id
    pub async fn upsert(&self, program: Program) {
        let mut programs = self.programs.write().await;
        programs.retain(|p| p.program_id != program.program_id);
        programs.push(program);
        programs.sort_by_key(|p| (p.channel_id.clone(), p.start_date));
    }

    /// Make entitlement checks for `asset_id` fail with `message`
    pub async fn deny(&self, asset_id: impl Into<String>, message: impl Into<String>) {
        self.denied
            .write()
            .await
            .insert(asset_id.into(), message.into());
    }

    pub async fn allow(&self, asset_id: &str) {
        self.denied.write().await.remove(asset_id);
    }
}

#[async_trait]
impl ProgramProvider for MemoryProgramProvider {
    async fn fetch_programs(
        &self,
        channel_id: &str,
        timestamp: Timestamp,
    ) -> Result<Vec<Program>> {
        let programs = self.programs.read().await;
        Ok(programs
            .iter()
            .filter(|p| p.channel_id == channel_id && p.contains(timestamp))
            .cloned()
            .collect())
    }

    async fn fetch_next_program(&self, program: &Program) -> Result<Option<Program>> {
        let programs = self.programs.read().await;

        if let Some(stored) = programs
            .iter()
            .find(|p| p.program_id == program.program_id && p.end_date != program.end_date)
        {
            return Ok(Some(stored.clone()));
        }

        Ok(programs
            .iter()
            .filter(|p| p.channel_id == program.channel_id && p.program_id != program.program_id)
            .filter(|p| p.start_date >= program.end_date)
            .min_by_key(|p| p.start_date)
            .cloned())
    }

    async fn fetch_previous_program(&self, program: &Program) -> Result<Option<Program>> {
        let programs = self.programs.read().await;
        Ok(programs
            .iter()
            .filter(|p| p.channel_id == program.channel_id && p.program_id != program.program_id)
            .filter(|p| p.end_date <= program.start_date)
            .max_by_key(|p| p.end_date)
            .cloned())
    }

    async fn validate_entitlement(&self, asset_id: &str) -> ValidationOutcome {
        match self.denied.read().await.get(asset_id) {
            Some(message) => ValidationOutcome::NotEntitled {
                message: message.clone(),
            },
            None => ValidationOutcome::Success,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schedule() -> MemoryProgramProvider {
        MemoryProgramProvider::with_programs([
            Program::new("p1", "ch", "a1", 0, 1_800_000),
            Program::new("p2", "ch", "a2", 1_800_000, 3_600_000),
            Program::new("p4", "ch", "a4", 4_000_000, 5_000_000),
            Program::new("x1", "other", "ax", 0, 5_000_000),
        ])
    }

    #[tokio::test]
    async fn test_fetch_program_at() {
        let provider = schedule();
        let found = provider.fetch_program_at("ch", 1_800_000).await.unwrap();
        assert_eq!(found.map(|p| p.program_id), Some("p2".to_string()));

        let hole = provider.fetch_program_at("ch", 3_700_000).await.unwrap();
        assert!(hole.is_none());
    }

    #[tokio::test]
    async fn test_next_and_previous() {
        let provider = schedule();
        let p1 = Program::new("p1", "ch", "a1", 0, 1_800_000);
        let p2 = provider.fetch_next_program(&p1).await.unwrap().unwrap();
        assert_eq!(p2.program_id, "p2");

        let p4 = provider.fetch_next_program(&p2).await.unwrap().unwrap();
        assert_eq!(p4.program_id, "p4");
        assert_ne!(p4.start_date, p2.end_date);

        let back = provider.fetch_previous_program(&p2).await.unwrap().unwrap();
        assert_eq!(back.program_id, "p1");
        assert!(provider.fetch_previous_program(&p1).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_next_reports_extension() {
        let provider = schedule();
        let p1 = Program::new("p1", "ch", "a1", 0, 1_800_000);
        provider
            .upsert(Program::new("p1", "ch", "a1", 0, 2_000_000))
            .await;

        let next = provider.fetch_next_program(&p1).await.unwrap().unwrap();
        assert_eq!(next.program_id, "p1");
        assert_eq!(next.end_date, 2_000_000);
    }

    #[tokio::test]
    async fn test_entitlement_denial() {
        let provider = schedule();
        assert!(matches!(
            provider.validate_entitlement("a1").await,
            ValidationOutcome::Success
        ));

        provider.deny("a1", "NOT_ENTITLED").await;
        match provider.validate_entitlement("a1").await {
            ValidationOutcome::NotEntitled { message } => assert_eq!(message, "NOT_ENTITLED"),
            other => panic!("unexpected outcome: {other:?}"),
        }

        provider.allow("a1").await;
        assert!(matches!(
            provider.validate_entitlement("a1").await,
            ValidationOutcome::Success
        ));
    }
}
