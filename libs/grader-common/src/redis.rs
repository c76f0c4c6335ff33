use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::debug;

use crate::store::{StoreResult, SubmissionStore};
use crate::types::SubmissionRecord;

/// Redis key semantics for the submission store.
/// Keys are deterministic so the worker and the CLI always agree on layout:
/// - `grader:submission:{team}:{commit}` holds the record JSON
/// - `grader:team:{team}` is a sorted set of commits scored by write time
/// - `grader:teams` indexes every team that has a record

pub const SUBMISSION_PREFIX: &str = "grader:submission";
pub const TEAM_PREFIX: &str = "grader:team";
pub const TEAMS_KEY: &str = "grader:teams";

/// Record key for a `(team, commit)` pair
pub fn submission_key(team: &str, commit_hash: &str) -> String {
    format!("{}:{}:{}", SUBMISSION_PREFIX, team, commit_hash)
}

/// Per-team write-time index
pub fn team_index_key(team: &str) -> String {
    format!("{}:{}", TEAM_PREFIX, team)
}

/// Submission store on top of a shared Redis connection manager.
/// The manager is cheap to clone; each call works on its own handle.
#[derive(Clone)]
pub struct RedisSubmissionStore {
    conn: ConnectionManager,
}

impl RedisSubmissionStore {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    /// Open a client and connection manager for `redis_url`
    pub async fn connect(redis_url: &str) -> StoreResult<Self> {
        let client = redis::Client::open(redis_url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self::new(conn))
    }

    async fn load_commits(&self, team: &str, commits: Vec<String>) -> StoreResult<Vec<SubmissionRecord>> {
        if commits.is_empty() {
            return Ok(Vec::new());
        }
        let keys: Vec<String> = commits.iter().map(|c| submission_key(team, c)).collect();
        let mut conn = self.conn.clone();
        let payloads: Vec<Option<String>> = redis::cmd("MGET").arg(&keys).query_async(&mut conn).await?;

        let mut records = Vec::with_capacity(payloads.len());
        for payload in payloads.into_iter().flatten() {
            records.push(serde_json::from_str(&payload)?);
        }
        Ok(records)
    }
}

#[async_trait]
impl SubmissionStore for RedisSubmissionStore {
    async fn get_item(&self, team: &str, commit_hash: &str) -> StoreResult<Option<SubmissionRecord>> {
        let mut conn = self.conn.clone();
        let payload: Option<String> = conn.get(submission_key(team, commit_hash)).await?;

        match payload {
            Some(data) => Ok(Some(serde_json::from_str(&data)?)),
            None => Ok(None),
        }
    }

    /// Record, team index and team set are written in one MULTI block
    async fn put_item(&self, record: &SubmissionRecord) -> StoreResult<()> {
        let payload = serde_json::to_string(record)?;
        let mut conn = self.conn.clone();

        redis::pipe()
            .atomic()
            .set(submission_key(&record.team, &record.commit_hash), payload)
            .ignore()
            .zadd(
                team_index_key(&record.team),
                &record.commit_hash,
                record.submitted_at.timestamp_millis(),
            )
            .ignore()
            .sadd(TEAMS_KEY, &record.team)
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await?;

        debug!(team = %record.team, commit = %record.commit_hash, status = %record.status, "Record stored");
        Ok(())
    }

    async fn query_latest(&self, team: &str) -> StoreResult<Option<SubmissionRecord>> {
        let mut conn = self.conn.clone();
        let newest: Vec<String> = conn.zrevrange(team_index_key(team), 0, 0).await?;
        Ok(self.load_commits(team, newest).await?.pop())
    }

    async fn query_team(&self, team: &str) -> StoreResult<Vec<SubmissionRecord>> {
        let mut conn = self.conn.clone();
        let commits: Vec<String> = conn.zrange(team_index_key(team), 0, -1).await?;
        self.load_commits(team, commits).await
    }

    async fn scan(&self) -> StoreResult<Vec<SubmissionRecord>> {
        let mut conn = self.conn.clone();
        let mut teams: Vec<String> = conn.smembers(TEAMS_KEY).await?;
        teams.sort();

        let mut all = Vec::new();
        for team in teams {
            all.extend(self.query_team(&team).await?);
        }
        debug!(records = all.len(), "Store scanned");
        Ok(all)
    }
}
