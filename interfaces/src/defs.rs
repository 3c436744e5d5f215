use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Label given to a post when no category clears any threshold.
pub const SENTINEL_CATEGORY: &str = "uncategorized";

/// Deterministic dedup key for a post's raw text (UUIDv5, DNS namespace).
pub fn content_fingerprint(text: &str) -> String {
    Uuid::new_v5(&Uuid::NAMESPACE_DNS, text.as_bytes()).to_string()
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum PostAction {
    New,
    Repost { by: String },
}

impl fmt::Display for PostAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PostAction::New => write!(f, "new"),
            PostAction::Repost { by } => write!(f, "repost:{}", by),
        }
    }
}

impl From<PostAction> for String {
    fn from(action: PostAction) -> Self {
        action.to_string()
    }
}

impl TryFrom<String> for PostAction {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        if value == "new" {
            return Ok(PostAction::New);
        }
        match value.strip_prefix("repost:") {
            Some(by) if !by.is_empty() => Ok(PostAction::Repost { by: by.to_string() }),
            _ => Err(format!("unknown post action: {}", value)),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FeedPost {
    pub author: String,
    pub handle: String,
    pub text: String,
    pub action: PostAction,
    pub timestamp: DateTime<Utc>,
    pub content_fingerprint: String,
    /// Ordered by confidence rank. `None` until classified.
    pub category: Option<Vec<String>>,
    pub confidence: Option<f64>,
}

impl FeedPost {
    pub fn new(author: String, handle: String, text: String, action: PostAction, timestamp: DateTime<Utc>) -> Self {
        let content_fingerprint = content_fingerprint(&text);
        Self {
            author,
            handle,
            text,
            action,
            timestamp,
            content_fingerprint,
            category: None,
            confidence: None,
        }
    }

    pub fn is_classified(&self) -> bool {
        self.category.is_some()
    }
}

/// Stored per-user state: encrypted upstream session and sync checkpoint.
#[derive(Clone, Debug, Default)]
pub struct UserSession {
    pub username: String,
    pub encrypted_session_token: Option<String>,
    pub sync_checkpoint: Option<DateTime<Utc>>,
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpstreamSession {
    pub did: String,
    pub handle: String,
    pub access_jwt: String,
    pub refresh_jwt: String,
}

impl fmt::Debug for UpstreamSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpstreamSession")
            .field("did", &self.did)
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}

#[derive(Clone)]
pub struct Credential {
    pub identifier: String,
    pub password: String,
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("identifier", &self.identifier)
            .field("password", &"***")
            .finish()
    }
}

/// One raw item of a timeline page, as the upstream returns it.
#[derive(Clone, Debug)]
pub struct TimelineItem {
    pub author_display_name: Option<String>,
    pub handle: String,
    pub text: String,
    /// Handle of the account that reposted this item, if any.
    pub reposted_by: Option<String>,
    /// ISO-8601 creation time. Items without one are skipped.
    pub created_at: Option<String>,
}

#[derive(Clone, Debug, Default)]
pub struct TimelinePage {
    pub items: Vec<TimelineItem>,
    pub cursor: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum FeedApiError {
    /// Expired, invalid or rejected credentials. Kept distinct from outages.
    #[error("upstream rejected authentication ({code}): {message}")]
    Unauthorized { code: String, message: String },

    #[error("upstream request failed: {0}")]
    Transient(String),
}

#[async_trait]
pub trait FeedApi: Send + Sync {
    async fn login(&self, credential: &Credential) -> Result<UpstreamSession, FeedApiError>;

    /// Check that a stored session is still accepted and return it hydrated.
    async fn resume(&self, session: &UpstreamSession) -> Result<UpstreamSession, FeedApiError>;

    async fn refresh(&self, session: &UpstreamSession) -> Result<UpstreamSession, FeedApiError>;

    /// Reverse-chronological timeline page. `None` cursor means most recent.
    async fn timeline(&self, session: &UpstreamSession, cursor: Option<&str>, limit: u32) -> Result<TimelinePage, FeedApiError>;
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PutOutcome {
    Inserted,
    /// A record with the same composite key already exists.
    Conflict,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClassifyWriteOutcome {
    Updated,
    AlreadyClassified,
    Missing,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PostAttribute {
    Author,
    Handle,
    Text,
    Action,
    Timestamp,
    Category,
    Confidence,
}

impl PostAttribute {
    pub const ALL: [PostAttribute; 7] = [
        PostAttribute::Author,
        PostAttribute::Handle,
        PostAttribute::Text,
        PostAttribute::Action,
        PostAttribute::Timestamp,
        PostAttribute::Category,
        PostAttribute::Confidence,
    ];

    /// What trend reporting needs from a stored post.
    pub const TREND: [PostAttribute; 3] = [PostAttribute::Timestamp, PostAttribute::Category, PostAttribute::Confidence];
}

/// A stored post restricted to a projection. Key attributes are always present.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ProjectedPost {
    pub username: String,
    pub content_fingerprint: String,
    pub author: Option<String>,
    pub handle: Option<String>,
    pub text: Option<String>,
    pub action: Option<PostAction>,
    pub timestamp: Option<DateTime<Utc>>,
    pub category: Option<Vec<String>>,
    pub confidence: Option<f64>,
}

impl ProjectedPost {
    pub fn project(username: &str, post: &FeedPost, attributes: &[PostAttribute]) -> Self {
        let mut projected = ProjectedPost {
            username: username.to_string(),
            content_fingerprint: post.content_fingerprint.clone(),
            ..Default::default()
        };
        for attribute in attributes {
            match attribute {
                PostAttribute::Author => projected.author = Some(post.author.clone()),
                PostAttribute::Handle => projected.handle = Some(post.handle.clone()),
                PostAttribute::Text => projected.text = Some(post.text.clone()),
                PostAttribute::Action => projected.action = Some(post.action.clone()),
                PostAttribute::Timestamp => projected.timestamp = Some(post.timestamp),
                PostAttribute::Category => projected.category = post.category.clone(),
                PostAttribute::Confidence => projected.confidence = post.confidence,
            }
        }
        projected
    }
}

/// Partitioned post storage keyed by (username, content fingerprint).
#[async_trait]
pub trait PostStore: Send + Sync {
    async fn put_if_absent(&self, username: &str, post: &FeedPost) -> Result<PutOutcome, StoreError>;

    async fn get(&self, username: &str, content_fingerprint: &str) -> Result<Option<FeedPost>, StoreError>;

    /// Posts of one user with `start <= timestamp <= end`, ordered by timestamp.
    async fn query_range(
        &self,
        username: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        projection: &[PostAttribute],
    ) -> Result<Vec<ProjectedPost>, StoreError>;

    /// Write category and confidence only when the record has none yet.
    async fn set_classification_if_absent(
        &self,
        username: &str,
        content_fingerprint: &str,
        category: &[String],
        confidence: f64,
    ) -> Result<ClassifyWriteOutcome, StoreError>;

    /// Stored posts of one user still lacking a classification, newest first.
    async fn unclassified(&self, username: &str, limit: usize) -> Result<Vec<FeedPost>, StoreError>;
}

#[async_trait]
pub trait UserStore: Send + Sync {
    async fn get_user(&self, username: &str) -> Result<Option<UserSession>, StoreError>;

    async fn store_session_token(&self, username: &str, encrypted_token: &str) -> Result<(), StoreError>;

    async fn remove_session_token(&self, username: &str) -> Result<(), StoreError>;

    /// Returns the checkpoint after the write, which never moves backwards.
    async fn advance_checkpoint(&self, username: &str, checkpoint: DateTime<Utc>) -> Result<DateTime<Utc>, StoreError>;

    async fn unlink(&self, username: &str) -> Result<bool, StoreError>;
}

#[derive(Clone, Debug, PartialEq)]
pub struct Classification {
    pub categories: Vec<String>,
    pub confidence: f64,
}

#[derive(Clone, Debug, PartialEq)]
pub enum TaskStatus {
    Pending,
    Success(Vec<Classification>),
    Failure(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ClassifierError {
    #[error("classification service rejected the batch: {0}")]
    Rejected(String),

    #[error("classification service unreachable: {0}")]
    Unavailable(String),

    #[error("unknown classification task: {0}")]
    UnknownTask(String),
}

/// Batched asynchronous classification. `submit` must not block on the work.
#[async_trait]
pub trait ClassificationService: Send + Sync {
    async fn submit(&self, texts: Vec<String>) -> Result<String, ClassifierError>;

    async fn status(&self, task_id: &str) -> Result<TaskStatus, ClassifierError>;
}

// Object style note:
// Implementations of these traits are shared across concurrent per-user
// workflows behind `Arc<dyn ...>`, so they take `&self` and keep any mutable
// state behind their own locks.
