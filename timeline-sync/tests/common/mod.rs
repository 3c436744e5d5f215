#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use timeline_sync::{
    ClassificationService, ClassifierError, ClassifyWriteOutcome, Credential, FeedApi, FeedApiError, FeedPost,
    MemoryPostStore, MemoryUserStore, PollPolicy, PostAction, PostAttribute, PostStore, ProjectedPost, PutOutcome,
    SessionCipher, SessionManager, StaticSecretProvider, StoreError, TaskStatus, TimelineItem, TimelinePage,
    UpstreamSession,
};
use tokio_util::sync::CancellationToken;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

pub fn ts(y: i32, m: u32, d: u32, h: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, m, d, h, 0, 0).unwrap()
}

pub fn credential() -> Credential {
    Credential {
        identifier: "alice.bsky.social".to_string(),
        password: "app-password".to_string(),
    }
}

pub fn upstream(tag: &str) -> UpstreamSession {
    UpstreamSession {
        did: "did:plc:alice".to_string(),
        handle: "alice.bsky.social".to_string(),
        access_jwt: format!("access-{}", tag),
        refresh_jwt: format!("refresh-{}", tag),
    }
}

pub fn cipher() -> SessionCipher {
    SessionCipher::from_provider(&StaticSecretProvider::generate()).unwrap()
}

pub fn fast_poll(max_attempts: u32) -> PollPolicy {
    PollPolicy {
        max_attempts,
        interval: Duration::from_millis(5),
    }
}

pub fn item(handle: &str, text: &str, created_at: Option<&str>) -> TimelineItem {
    TimelineItem {
        author_display_name: Some(handle.to_uppercase()),
        handle: handle.to_string(),
        text: text.to_string(),
        reposted_by: None,
        created_at: created_at.map(str::to_string),
    }
}

pub fn item_at(text: &str, at: DateTime<Utc>) -> TimelineItem {
    item("bob.bsky.social", text, Some(&at.to_rfc3339()))
}

pub fn page(items: Vec<TimelineItem>, cursor: Option<&str>) -> TimelinePage {
    TimelinePage {
        items,
        cursor: cursor.map(str::to_string),
    }
}

pub fn post(text: &str, at: DateTime<Utc>) -> FeedPost {
    FeedPost::new(
        "Bob".to_string(),
        "bob.bsky.social".to_string(),
        text.to_string(),
        PostAction::New,
        at,
    )
}

pub fn classified(text: &str, at: DateTime<Utc>, categories: &[&str], confidence: f64) -> FeedPost {
    let mut post = post(text, at);
    post.category = Some(categories.iter().map(|c| c.to_string()).collect());
    post.confidence = Some(confidence);
    post
}

pub fn unauthorized(code: &str) -> FeedApiError {
    FeedApiError::Unauthorized {
        code: code.to_string(),
        message: format!("{} from fake", code),
    }
}

/// Feed API answering from per-call scripts. Empty timeline script means an empty page.
#[derive(Default)]
pub struct ScriptedFeedApi {
    pub timeline_script: Mutex<VecDeque<Result<TimelinePage, FeedApiError>>>,
    pub login_script: Mutex<VecDeque<Result<UpstreamSession, FeedApiError>>>,
    pub refresh_script: Mutex<VecDeque<Result<UpstreamSession, FeedApiError>>>,
    pub resume_script: Mutex<VecDeque<Result<(), FeedApiError>>>,
    pub cursors: Mutex<Vec<Option<String>>>,
    pub access_tokens: Mutex<Vec<String>>,
    pub logins: AtomicUsize,
    pub refreshes: AtomicUsize,
    pub resumes: AtomicUsize,
}

impl ScriptedFeedApi {
    pub fn with_pages(pages: Vec<Result<TimelinePage, FeedApiError>>) -> Self {
        let api = Self::default();
        api.timeline_script.lock().unwrap().extend(pages);
        api
    }

    pub fn push_login(&self, outcome: Result<UpstreamSession, FeedApiError>) {
        self.login_script.lock().unwrap().push_back(outcome);
    }

    pub fn push_refresh(&self, outcome: Result<UpstreamSession, FeedApiError>) {
        self.refresh_script.lock().unwrap().push_back(outcome);
    }

    pub fn push_resume(&self, outcome: Result<(), FeedApiError>) {
        self.resume_script.lock().unwrap().push_back(outcome);
    }

    pub fn push_page(&self, outcome: Result<TimelinePage, FeedApiError>) {
        self.timeline_script.lock().unwrap().push_back(outcome);
    }

    pub fn requested_cursors(&self) -> Vec<Option<String>> {
        self.cursors.lock().unwrap().clone()
    }
}

#[async_trait]
impl FeedApi for ScriptedFeedApi {
    async fn login(&self, _credential: &Credential) -> Result<UpstreamSession, FeedApiError> {
        let n = self.logins.fetch_add(1, Ordering::SeqCst);
        self.login_script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(upstream(&format!("login{}", n + 1))))
    }

    async fn resume(&self, session: &UpstreamSession) -> Result<UpstreamSession, FeedApiError> {
        self.resumes.fetch_add(1, Ordering::SeqCst);
        match self.resume_script.lock().unwrap().pop_front() {
            Some(Err(e)) => Err(e),
            _ => Ok(session.clone()),
        }
    }

    async fn refresh(&self, _session: &UpstreamSession) -> Result<UpstreamSession, FeedApiError> {
        let n = self.refreshes.fetch_add(1, Ordering::SeqCst);
        self.refresh_script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(upstream(&format!("refresh{}", n + 1))))
    }

    async fn timeline(
        &self,
        session: &UpstreamSession,
        cursor: Option<&str>,
        _limit: u32,
    ) -> Result<TimelinePage, FeedApiError> {
        self.cursors.lock().unwrap().push(cursor.map(str::to_string));
        self.access_tokens.lock().unwrap().push(session.access_jwt.clone());
        self.timeline_script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(TimelinePage::default()))
    }
}

/// Memory store that fails writes of chosen texts.
#[derive(Clone, Default)]
pub struct FlakyPostStore {
    pub inner: MemoryPostStore,
    failing_texts: Arc<Mutex<HashSet<String>>>,
}

impl FlakyPostStore {
    pub fn failing_on(texts: &[&str]) -> Self {
        let store = Self::default();
        store
            .failing_texts
            .lock()
            .unwrap()
            .extend(texts.iter().map(|t| t.to_string()));
        store
    }

    pub fn heal(&self) {
        self.failing_texts.lock().unwrap().clear();
    }
}

#[async_trait]
impl PostStore for FlakyPostStore {
    async fn put_if_absent(&self, username: &str, post: &FeedPost) -> Result<PutOutcome, StoreError> {
        if self.failing_texts.lock().unwrap().contains(&post.text) {
            return Err(StoreError::Unavailable("injected write failure".to_string()));
        }
        self.inner.put_if_absent(username, post).await
    }

    async fn get(&self, username: &str, content_fingerprint: &str) -> Result<Option<FeedPost>, StoreError> {
        self.inner.get(username, content_fingerprint).await
    }

    async fn query_range(
        &self,
        username: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        projection: &[PostAttribute],
    ) -> Result<Vec<ProjectedPost>, StoreError> {
        self.inner.query_range(username, start, end, projection).await
    }

    async fn set_classification_if_absent(
        &self,
        username: &str,
        content_fingerprint: &str,
        category: &[String],
        confidence: f64,
    ) -> Result<ClassifyWriteOutcome, StoreError> {
        self.inner
            .set_classification_if_absent(username, content_fingerprint, category, confidence)
            .await
    }

    async fn unclassified(&self, username: &str, limit: usize) -> Result<Vec<FeedPost>, StoreError> {
        self.inner.unclassified(username, limit).await
    }
}

/// Classification service that replays a status script. An empty script stays pending.
#[derive(Default)]
pub struct ScriptedClassifier {
    pub statuses: Mutex<VecDeque<TaskStatus>>,
    pub submitted: Mutex<Vec<Vec<String>>>,
    pub status_calls: AtomicUsize,
    /// Cancelled as soon as the next batch is submitted.
    pub cancel_on_submit: Mutex<Option<CancellationToken>>,
}

impl ScriptedClassifier {
    pub fn pending_forever() -> Self {
        Self::default()
    }

    pub fn answering(statuses: Vec<TaskStatus>) -> Self {
        let classifier = Self::default();
        classifier.statuses.lock().unwrap().extend(statuses);
        classifier
    }

    pub fn push_status(&self, status: TaskStatus) {
        self.statuses.lock().unwrap().push_back(status);
    }

    pub fn calls(&self) -> usize {
        self.status_calls.load(Ordering::SeqCst)
    }

    pub fn cancel_on_submit(&self, token: &CancellationToken) {
        *self.cancel_on_submit.lock().unwrap() = Some(token.clone());
    }

    pub fn submitted_texts(&self) -> Vec<Vec<String>> {
        self.submitted.lock().unwrap().clone()
    }
}

#[async_trait]
impl ClassificationService for ScriptedClassifier {
    async fn submit(&self, texts: Vec<String>) -> Result<String, ClassifierError> {
        if let Some(token) = self.cancel_on_submit.lock().unwrap().take() {
            token.cancel();
        }
        let mut submitted = self.submitted.lock().unwrap();
        submitted.push(texts);
        Ok(format!("task-{}", submitted.len()))
    }

    async fn status(&self, _task_id: &str) -> Result<TaskStatus, ClassifierError> {
        self.status_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.statuses.lock().unwrap().pop_front().unwrap_or(TaskStatus::Pending))
    }
}

pub struct Harness {
    pub api: Arc<ScriptedFeedApi>,
    pub users: MemoryUserStore,
    pub sessions: SessionManager,
}

impl Harness {
    pub fn new(api: ScriptedFeedApi) -> Self {
        let api = Arc::new(api);
        let users = MemoryUserStore::new();
        let sessions = SessionManager::new(api.clone(), Arc::new(users.clone()), cipher());
        Self { api, users, sessions }
    }
}
