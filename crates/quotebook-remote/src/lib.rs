use std::sync::Mutex;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use quotebook_core::{map_remote_posts, now_millis, OutboundPost, QuoteRecord};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const DEFAULT_REMOTE_URL: &str = "https://jsonplaceholder.typicode.com/posts";
pub const DEFAULT_FETCH_LIMIT: usize = 20;
pub const DEFAULT_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_USER_ID: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteConfig {
    pub base_url: String,
    pub limit: usize,
    pub timeout: Duration,
    pub user_id: u32,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_REMOTE_URL.to_string(),
            limit: DEFAULT_FETCH_LIMIT,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            user_id: DEFAULT_USER_ID,
        }
    }
}

/// Source of remote posts and sink for locally authored quotes.
pub trait RemoteSource: Send + Sync {
    /// # Errors
    /// Returns an error on transport, status, or body decoding failure.
    fn fetch_posts(&self) -> Result<Vec<Value>>;

    /// # Errors
    /// Returns an error when the post is not accepted.
    fn push_post(&self, post: &OutboundPost) -> Result<()>;

    fn user_id(&self) -> u32 {
        DEFAULT_USER_ID
    }
}

/// Blocking HTTP client for a JSON posts collection.
pub struct HttpRemote {
    config: RemoteConfig,
    agent: ureq::Agent,
}

impl HttpRemote {
    #[must_use]
    pub fn new(config: RemoteConfig) -> Self {
        let agent = ureq::AgentBuilder::new().timeout(config.timeout).build();
        Self { config, agent }
    }
}

impl RemoteSource for HttpRemote {
    fn fetch_posts(&self) -> Result<Vec<Value>> {
        let response = self
            .agent
            .get(&self.config.base_url)
            .query("_limit", &self.config.limit.to_string())
            .call()
            .with_context(|| format!("GET {} failed", self.config.base_url))?;
        let body: Value = response.into_json().context("remote posts body is not JSON")?;
        let Value::Array(posts) = body else {
            return Err(anyhow!("remote posts body is not a JSON array"));
        };
        tracing::debug!(count = posts.len(), url = %self.config.base_url, "fetched remote posts");
        Ok(posts)
    }

    fn push_post(&self, post: &OutboundPost) -> Result<()> {
        self.agent
            .post(&self.config.base_url)
            .send_json(post)
            .with_context(|| format!("POST {} failed", self.config.base_url))?;
        Ok(())
    }

    fn user_id(&self) -> u32 {
        self.config.user_id
    }
}

/// Fetch and map the remote snapshot, surfacing failures.
///
/// # Errors
/// Returns the transport error from [`RemoteSource::fetch_posts`].
pub fn try_fetch_remote(source: &dyn RemoteSource) -> Result<Vec<QuoteRecord>> {
    let posts = source.fetch_posts()?;
    Ok(map_remote_posts(&posts, now_millis()))
}

/// Fetch and map the remote snapshot; any failure yields an empty list.
#[must_use]
pub fn fetch_remote(source: &dyn RemoteSource) -> Vec<QuoteRecord> {
    match try_fetch_remote(source) {
        Ok(records) => records,
        Err(err) => {
            tracing::warn!(error = %format!("{err:#}"), "remote fetch failed; treating as empty");
            Vec::new()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PushStatus {
    Posted,
    /// Push disabled for this call.
    Skipped,
    Failed { reason: String },
}

/// Best-effort push of one local record. Never fails the caller.
#[must_use]
pub fn post_local(source: &dyn RemoteSource, record: &QuoteRecord) -> PushStatus {
    let post = OutboundPost::from_record(record, source.user_id());
    match source.push_post(&post) {
        Ok(()) => PushStatus::Posted,
        Err(err) => {
            let reason = format!("{err:#}");
            tracing::warn!(id = %record.id, error = %reason, "remote push failed");
            PushStatus::Failed { reason }
        }
    }
}

/// In-process remote with a fixed snapshot, recording every push.
#[derive(Debug, Default)]
pub struct ScriptedRemote {
    snapshot: Mutex<Option<Vec<Value>>>,
    pushed: Mutex<Vec<OutboundPost>>,
    reject_pushes: bool,
}

impl ScriptedRemote {
    /// Remote that serves `posts` on every fetch and accepts pushes.
    #[must_use]
    pub fn serving(posts: Vec<Value>) -> Self {
        Self { snapshot: Mutex::new(Some(posts)), ..Self::default() }
    }

    /// Remote whose fetches and pushes always fail.
    #[must_use]
    pub fn unreachable() -> Self {
        Self { snapshot: Mutex::new(None), pushed: Mutex::new(Vec::new()), reject_pushes: true }
    }

    /// # Errors
    /// Returns an error when the internal lock is poisoned.
    pub fn set_snapshot(&self, posts: Option<Vec<Value>>) -> Result<()> {
        let mut snapshot =
            self.snapshot.lock().map_err(|_| anyhow!("scripted remote lock poisoned"))?;
        *snapshot = posts;
        Ok(())
    }

    /// # Errors
    /// Returns an error when the internal lock is poisoned.
    pub fn pushed(&self) -> Result<Vec<OutboundPost>> {
        let pushed = self.pushed.lock().map_err(|_| anyhow!("scripted remote lock poisoned"))?;
        Ok(pushed.clone())
    }
}

impl RemoteSource for ScriptedRemote {
    fn fetch_posts(&self) -> Result<Vec<Value>> {
        let snapshot = self.snapshot.lock().map_err(|_| anyhow!("scripted remote lock poisoned"))?;
        snapshot.clone().ok_or_else(|| anyhow!("remote unreachable"))
    }

    fn push_post(&self, post: &OutboundPost) -> Result<()> {
        if self.reject_pushes {
            return Err(anyhow!("remote unreachable"));
        }
        let mut pushed = self.pushed.lock().map_err(|_| anyhow!("scripted remote lock poisoned"))?;
        pushed.push(post.clone());
        Ok(())
    }
}
