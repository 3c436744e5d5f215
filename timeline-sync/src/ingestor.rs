use crate::types::{
    BatchReport, ClassifyWriteOutcome, FeedPost, IngestOutcome, MergeReport, PostStore, PutOutcome, Result, SyncError,
};
use interfaces::defs::content_fingerprint;
use std::borrow::Cow;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct PostIngestor {
    store: Arc<dyn PostStore>,
}

impl PostIngestor {
    pub fn new(store: Arc<dyn PostStore>) -> Self {
        Self { store }
    }

    pub async fn ingest_one(&self, post: &FeedPost, username: &str) -> Result<IngestOutcome> {
        let post = keyed(post);
        match self.store.put_if_absent(username, &post).await? {
            PutOutcome::Inserted => Ok(IngestOutcome::Inserted),
            PutOutcome::Conflict => {
                debug!("Post {} already stored for {}", post.content_fingerprint, username);
                Ok(IngestOutcome::Duplicate)
            }
        }
    }

    /// Ingest every post, collecting failures instead of stopping at the first.
    pub async fn ingest_batch(&self, posts: Vec<FeedPost>, username: &str) -> BatchReport {
        let mut report = BatchReport::default();

        for post in posts {
            match self.ingest_one(&post, username).await {
                Ok(IngestOutcome::Inserted) => {
                    report.inserted += 1;
                    report.inserted_posts.push(post);
                }
                Ok(IngestOutcome::Duplicate) => report.duplicates += 1,
                Err(e) => {
                    warn!("Failed to store post {} for {}: {}", post.content_fingerprint, username, e);
                    report.failures.push((post, e));
                }
            }
        }

        info!(
            "Ingested batch for {}: {} inserted, {} duplicates, {} failed",
            username,
            report.inserted,
            report.duplicates,
            report.failures.len()
        );
        report
    }

    /// Stored posts still waiting for a classification, newest first.
    pub async fn unclassified(&self, username: &str, limit: usize) -> Result<Vec<FeedPost>> {
        let waiting = self.store.unclassified(username, limit).await?;
        if !waiting.is_empty() {
            debug!("{} stored posts of {} await classification", waiting.len(), username);
        }
        Ok(waiting)
    }

    /// Write category and confidence onto stored posts that have none yet.
    pub async fn apply_classification(&self, posts: &[FeedPost], username: &str) -> MergeReport {
        let mut report = MergeReport::default();

        for post in posts {
            let (Some(category), Some(confidence)) = (&post.category, post.confidence) else {
                report.failures.push((
                    post.clone(),
                    SyncError::ClassificationFailure {
                        task_id: None,
                        detail: format!("post {} carries no classification", post.content_fingerprint),
                    },
                ));
                continue;
            };

            let post = keyed(post);
            let written = self
                .store
                .set_classification_if_absent(username, &post.content_fingerprint, category, confidence)
                .await;
            match written {
                Ok(ClassifyWriteOutcome::Updated) => report.updated += 1,
                Ok(ClassifyWriteOutcome::AlreadyClassified) => report.already_classified += 1,
                Ok(ClassifyWriteOutcome::Missing) => {
                    debug!("No stored post {} for {} to classify", post.content_fingerprint, username);
                    report.missing += 1;
                }
                Err(e) => report.failures.push((post.into_owned(), e.into())),
            }
        }

        info!(
            "Merged classifications for {}: {} updated, {} already classified, {} missing, {} failed",
            username,
            report.updated,
            report.already_classified,
            report.missing,
            report.failures.len()
        );
        report
    }
}

// The store key is always derived from the text.
fn keyed(post: &FeedPost) -> Cow<'_, FeedPost> {
    let fingerprint = content_fingerprint(&post.text);
    if post.content_fingerprint == fingerprint {
        Cow::Borrowed(post)
    } else {
        let mut owned = post.clone();
        owned.content_fingerprint = fingerprint;
        Cow::Owned(owned)
    }
}
