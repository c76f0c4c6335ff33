// Tag discovery for tracked repositories

use async_trait::async_trait;
use grader_common::types::TagRef;
use reqwest::header::{ACCEPT, AUTHORIZATION, USER_AGENT};
use reqwest::StatusCode;
use serde::Deserialize;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info};

const PER_PAGE: usize = 100;

#[derive(Debug, thiserror::Error)]
pub enum PollError {
    #[error("authentication rejected for {repo} (HTTP {status})")]
    Auth { repo: String, status: u16 },

    #[error("network error while listing tags for {repo}: {source}")]
    Network {
        repo: String,
        source: reqwest::Error,
    },

    #[error("unexpected HTTP {status} while listing tags for {repo}")]
    UnexpectedStatus { repo: String, status: u16 },

    #[error("could not decode tag listing for {repo}: {reason}")]
    Decode { repo: String, reason: String },
}

/// Read-only tag listing of a repository host
#[async_trait]
pub trait TagSource: Send + Sync {
    /// Every tag of `repo`, across all pages
    async fn list_tags(&self, repo: &str) -> Result<Vec<TagRef>, PollError>;
}

#[derive(Debug, Deserialize)]
struct GithubTag {
    name: String,
    commit: GithubCommit,
}

#[derive(Debug, Deserialize)]
struct GithubCommit {
    sha: String,
}

/// GitHub REST tag listing
#[derive(Clone)]
pub struct GithubTagSource {
    client: reqwest::Client,
    api_base: String,
    token: Option<String>,
}

impl GithubTagSource {
    pub fn new(api_base: &str, token: Option<String>) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            api_base: api_base.trim_end_matches('/').to_string(),
            token,
        })
    }

    fn tags_url(&self, repo: &str, page: usize) -> String {
        format!(
            "{}/repos/{}/tags?per_page={}&page={}",
            self.api_base, repo, PER_PAGE, page
        )
    }

    async fn fetch_page(&self, repo: &str, page: usize) -> Result<Vec<GithubTag>, PollError> {
        let mut request = self
            .client
            .get(self.tags_url(repo, page))
            .header(USER_AGENT, "grader-worker")
            .header(ACCEPT, "application/vnd.github.v3+json");
        if let Some(token) = &self.token {
            request = request.header(AUTHORIZATION, format!("token {}", token));
        }

        let response = request.send().await.map_err(|source| PollError::Network {
            repo: repo.to_string(),
            source,
        })?;

        match response.status() {
            status if status.is_success() => {}
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                return Err(PollError::Auth {
                    repo: repo.to_string(),
                    status: response.status().as_u16(),
                })
            }
            status => {
                return Err(PollError::UnexpectedStatus {
                    repo: repo.to_string(),
                    status: status.as_u16(),
                })
            }
        }

        let body = response.text().await.map_err(|source| PollError::Network {
            repo: repo.to_string(),
            source,
        })?;
        serde_json::from_str(&body).map_err(|e| PollError::Decode {
            repo: repo.to_string(),
            reason: e.to_string(),
        })
    }
}

#[async_trait]
impl TagSource for GithubTagSource {
    async fn list_tags(&self, repo: &str) -> Result<Vec<TagRef>, PollError> {
        collect_pages(repo, |page| async move {
            let batch = self.fetch_page(repo, page).await?;
            let tags: Vec<TagRef> = batch.into_iter().map(|t| TagRef::new(t.name, t.commit.sha)).collect();
            Ok::<_, PollError>(tags)
        })
        .await
    }
}

/// Walk 1-based pages until one comes back short of `PER_PAGE`
async fn collect_pages<F, Fut>(repo: &str, mut fetch_page: F) -> Result<Vec<TagRef>, PollError>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<Vec<TagRef>, PollError>>,
{
    let mut tags = Vec::new();
    let mut page = 1;
    loop {
        let batch = fetch_page(page).await?;
        let last_page = batch.len() < PER_PAGE;
        debug!(repo = %repo, page = page, tags = batch.len(), "Fetched tag page");
        tags.extend(batch);
        if last_page {
            break;
        }
        page += 1;
    }
    Ok(tags)
}

/// Filters a repository's tags down to submissions
#[derive(Clone)]
pub struct TagPoller {
    source: Arc<dyn TagSource>,
    marker: String,
}

impl TagPoller {
    pub fn new(source: Arc<dyn TagSource>, marker: impl Into<String>) -> Self {
        Self {
            source,
            marker: marker.into(),
        }
    }

    #[tracing::instrument(skip(self))]
    pub async fn list_submission_tags(&self, repo: &str) -> Result<Vec<TagRef>, PollError> {
        let tags = self.source.list_tags(repo).await?;
        let total = tags.len();
        let submissions: Vec<TagRef> = tags
            .into_iter()
            .filter(|tag| tag.is_submission(&self.marker))
            .collect();

        info!(repo = %repo, total_tags = total, submission_tags = submissions.len(), "Polled tags");
        Ok(submissions)
    }
}
