use crate::types::{
    ClassifyWriteOutcome, FeedPost, PostAttribute, PostStore, ProjectedPost, PutOutcome, StoreError, UserSession,
    UserStore,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

type PostKey = (String, String);

/// Process-local post storage for tests and dry runs.
#[derive(Clone, Default)]
pub struct MemoryPostStore {
    posts: Arc<RwLock<HashMap<PostKey, FeedPost>>>,
}

impl MemoryPostStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.posts.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.posts.read().await.is_empty()
    }

    pub async fn posts_for(&self, username: &str) -> Vec<FeedPost> {
        let posts = self.posts.read().await;
        let mut found: Vec<FeedPost> = posts
            .iter()
            .filter(|((owner, _), _)| owner == username)
            .map(|(_, post)| post.clone())
            .collect();
        found.sort_by_key(|post| post.timestamp);
        found
    }
}

#[async_trait]
impl PostStore for MemoryPostStore {
    async fn put_if_absent(&self, username: &str, post: &FeedPost) -> Result<PutOutcome, StoreError> {
        let mut posts = self.posts.write().await;
        let key = (username.to_string(), post.content_fingerprint.clone());
        if posts.contains_key(&key) {
            return Ok(PutOutcome::Conflict);
        }
        posts.insert(key, post.clone());
        Ok(PutOutcome::Inserted)
    }

    async fn get(&self, username: &str, content_fingerprint: &str) -> Result<Option<FeedPost>, StoreError> {
        let posts = self.posts.read().await;
        Ok(posts.get(&(username.to_string(), content_fingerprint.to_string())).cloned())
    }

    async fn query_range(
        &self,
        username: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        projection: &[PostAttribute],
    ) -> Result<Vec<ProjectedPost>, StoreError> {
        let in_range = self
            .posts_for(username)
            .await
            .into_iter()
            .filter(|post| post.timestamp >= start && post.timestamp <= end)
            .map(|post| ProjectedPost::project(username, &post, projection))
            .collect();
        Ok(in_range)
    }

    async fn set_classification_if_absent(
        &self,
        username: &str,
        content_fingerprint: &str,
        category: &[String],
        confidence: f64,
    ) -> Result<ClassifyWriteOutcome, StoreError> {
        let mut posts = self.posts.write().await;
        match posts.get_mut(&(username.to_string(), content_fingerprint.to_string())) {
            None => Ok(ClassifyWriteOutcome::Missing),
            Some(post) if post.category.is_some() => Ok(ClassifyWriteOutcome::AlreadyClassified),
            Some(post) => {
                post.category = Some(category.to_vec());
                post.confidence = Some(confidence);
                Ok(ClassifyWriteOutcome::Updated)
            }
        }
    }

    async fn unclassified(&self, username: &str, limit: usize) -> Result<Vec<FeedPost>, StoreError> {
        let mut waiting: Vec<FeedPost> = self
            .posts_for(username)
            .await
            .into_iter()
            .filter(|post| !post.is_classified())
            .collect();
        waiting.reverse();
        waiting.truncate(limit);
        Ok(waiting)
    }
}

#[derive(Clone, Default)]
pub struct MemoryUserStore {
    users: Arc<RwLock<HashMap<String, UserSession>>>,
}

impl MemoryUserStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a user record directly.
    pub async fn insert(&self, user: UserSession) {
        self.users.write().await.insert(user.username.clone(), user);
    }
}

#[async_trait]
impl UserStore for MemoryUserStore {
    async fn get_user(&self, username: &str) -> Result<Option<UserSession>, StoreError> {
        Ok(self.users.read().await.get(username).cloned())
    }

    async fn store_session_token(&self, username: &str, encrypted_token: &str) -> Result<(), StoreError> {
        let mut users = self.users.write().await;
        let user = users.entry(username.to_string()).or_insert_with(|| UserSession {
            username: username.to_string(),
            ..Default::default()
        });
        user.encrypted_session_token = Some(encrypted_token.to_string());
        Ok(())
    }

    async fn remove_session_token(&self, username: &str) -> Result<(), StoreError> {
        if let Some(user) = self.users.write().await.get_mut(username) {
            user.encrypted_session_token = None;
        }
        Ok(())
    }

    async fn advance_checkpoint(&self, username: &str, checkpoint: DateTime<Utc>) -> Result<DateTime<Utc>, StoreError> {
        let mut users = self.users.write().await;
        let user = users.entry(username.to_string()).or_insert_with(|| UserSession {
            username: username.to_string(),
            ..Default::default()
        });
        let advanced = user.sync_checkpoint.map_or(checkpoint, |current| current.max(checkpoint));
        user.sync_checkpoint = Some(advanced);
        Ok(advanced)
    }

    async fn unlink(&self, username: &str) -> Result<bool, StoreError> {
        Ok(self.users.write().await.remove(username).is_some())
    }
}
