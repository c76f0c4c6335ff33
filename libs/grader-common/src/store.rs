//! Persistent store contract for submission records.
//!
//! Records are keyed by `(team, commit_hash)` with last-write-wins semantics.
//! `RedisSubmissionStore` is the production backend; `MemoryStore` satisfies
//! the same contract for tests and dry runs.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::types::SubmissionRecord;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("record serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[async_trait]
pub trait SubmissionStore: Send + Sync {
    /// Fetch the record stored under `(team, commit_hash)`
    async fn get_item(&self, team: &str, commit_hash: &str) -> StoreResult<Option<SubmissionRecord>>;

    /// Insert or overwrite the record under its `(team, commit_hash)` key
    async fn put_item(&self, record: &SubmissionRecord) -> StoreResult<()>;

    /// Most recently written record for a team
    async fn query_latest(&self, team: &str) -> StoreResult<Option<SubmissionRecord>>;

    /// All records for a team, oldest first
    async fn query_team(&self, team: &str) -> StoreResult<Vec<SubmissionRecord>>;

    /// Every record in the store
    async fn scan(&self) -> StoreResult<Vec<SubmissionRecord>>;
}

/// In-memory store backed by a map per team.
#[derive(Debug, Default)]
pub struct MemoryStore {
    teams: Mutex<BTreeMap<String, HashMap<String, SubmissionRecord>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> StoreResult<std::sync::MutexGuard<'_, BTreeMap<String, HashMap<String, SubmissionRecord>>>> {
        self.teams
            .lock()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".to_string()))
    }

    /// Number of stored records across all teams
    pub fn len(&self) -> usize {
        self.teams
            .lock()
            .map(|teams| teams.values().map(HashMap::len).sum())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn sorted_by_write_time(mut records: Vec<SubmissionRecord>) -> Vec<SubmissionRecord> {
    records.sort_by_key(|r| r.submitted_at);
    records
}

#[async_trait]
impl SubmissionStore for MemoryStore {
    async fn get_item(&self, team: &str, commit_hash: &str) -> StoreResult<Option<SubmissionRecord>> {
        let teams = self.lock()?;
        Ok(teams.get(team).and_then(|records| records.get(commit_hash)).cloned())
    }

    async fn put_item(&self, record: &SubmissionRecord) -> StoreResult<()> {
        let mut teams = self.lock()?;
        teams
            .entry(record.team.clone())
            .or_default()
            .insert(record.commit_hash.clone(), record.clone());
        Ok(())
    }

    async fn query_latest(&self, team: &str) -> StoreResult<Option<SubmissionRecord>> {
        Ok(self.query_team(team).await?.pop())
    }

    async fn query_team(&self, team: &str) -> StoreResult<Vec<SubmissionRecord>> {
        let teams = self.lock()?;
        let records = teams
            .get(team)
            .map(|records| records.values().cloned().collect())
            .unwrap_or_default();
        Ok(sorted_by_write_time(records))
    }

    async fn scan(&self) -> StoreResult<Vec<SubmissionRecord>> {
        let teams = self.lock()?;
        let mut all = Vec::new();
        for records in teams.values() {
            all.extend(sorted_by_write_time(records.values().cloned().collect()));
        }
        Ok(all)
    }
}
