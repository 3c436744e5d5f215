use crate::types::{
    Classification, ClassificationService, FeedPost, PollPolicy, Result, SyncError, TaskStatus, SENTINEL_CATEGORY,
};
use backoff::backoff::{Backoff, Constant};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A submitted batch. Kept by callers to re-poll after a timeout or cancellation.
#[derive(Debug, Clone)]
pub struct PendingBatch {
    /// `None` when no post had text worth sending.
    pub task_id: Option<String>,
    pub posts: Vec<FeedPost>,
    /// Indices into `posts` that were sent, in submission order.
    submitted: Vec<usize>,
}

impl PendingBatch {
    pub fn submitted_count(&self) -> usize {
        self.submitted.len()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassificationTally {
    pub classified: usize,
    pub sentinel: usize,
    pub per_category: BTreeMap<String, usize>,
}

impl ClassificationTally {
    fn record(&mut self, categories: &[String]) {
        self.classified += 1;
        if categories.iter().all(|c| c == SENTINEL_CATEGORY) {
            self.sentinel += 1;
        }
        for category in categories {
            *self.per_category.entry(category.clone()).or_insert(0) += 1;
        }
    }

    pub fn absorb(&mut self, other: &ClassificationTally) {
        self.classified += other.classified;
        self.sentinel += other.sentinel;
        for (category, count) in &other.per_category {
            *self.per_category.entry(category.clone()).or_insert(0) += count;
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClassifiedBatch {
    pub task_id: Option<String>,
    pub posts: Vec<FeedPost>,
    pub tally: ClassificationTally,
}

pub struct ClassificationDispatcher {
    service: Arc<dyn ClassificationService>,
}

impl ClassificationDispatcher {
    pub fn new(service: Arc<dyn ClassificationService>) -> Self {
        Self { service }
    }

    /// Hand the non-blank texts to the service and return without waiting.
    pub async fn submit(&self, posts: Vec<FeedPost>) -> Result<PendingBatch> {
        let submitted: Vec<usize> = posts
            .iter()
            .enumerate()
            .filter(|(_, post)| !post.text.trim().is_empty())
            .map(|(i, _)| i)
            .collect();

        if submitted.is_empty() {
            debug!("Nothing to classify in a batch of {} posts", posts.len());
            return Ok(PendingBatch {
                task_id: None,
                posts,
                submitted,
            });
        }

        let texts = submitted.iter().map(|&i| posts[i].text.clone()).collect();
        let task_id = self.service.submit(texts).await?;
        info!(
            "Submitted classification task {} ({} of {} posts)",
            task_id,
            submitted.len(),
            posts.len()
        );

        Ok(PendingBatch {
            task_id: Some(task_id),
            posts,
            submitted,
        })
    }

    /// Poll at a fixed interval for at most `policy.max_attempts` status calls.
    pub async fn await_result(
        &self,
        batch: &PendingBatch,
        policy: PollPolicy,
        cancel: Option<&CancellationToken>,
    ) -> Result<ClassifiedBatch> {
        let Some(task_id) = batch.task_id.as_deref() else {
            return merge(batch, Vec::new());
        };

        let mut interval = Constant::new(policy.interval);

        for attempt in 1..=policy.max_attempts {
            if cancel.is_some_and(|token| token.is_cancelled()) {
                return Err(cancelled(task_id));
            }

            match self.service.status(task_id).await {
                Ok(TaskStatus::Success(results)) => {
                    debug!("Task {} finished on attempt {}", task_id, attempt);
                    return merge(batch, results);
                }
                Ok(TaskStatus::Failure(detail)) => {
                    return Err(SyncError::ClassificationFailure {
                        task_id: Some(task_id.to_string()),
                        detail,
                    })
                }
                Ok(TaskStatus::Pending) => debug!("Task {} pending (attempt {}/{})", task_id, attempt, policy.max_attempts),
                Err(e) => warn!("Status check {} for task {} failed: {}", attempt, task_id, e),
            }

            if attempt == policy.max_attempts {
                break;
            }

            let delay = interval.next_backoff().unwrap_or(policy.interval);
            match cancel {
                Some(token) => {
                    tokio::select! {
                        _ = token.cancelled() => return Err(cancelled(task_id)),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                None => tokio::time::sleep(delay).await,
            }
        }

        warn!("Task {} still not terminal after {} attempts", task_id, policy.max_attempts);
        Err(SyncError::ClassificationTimeout {
            task_id: task_id.to_string(),
            attempts: policy.max_attempts,
        })
    }
}

fn cancelled(task_id: &str) -> SyncError {
    info!("Stopped polling task {}", task_id);
    SyncError::ClassificationCancelled {
        task_id: task_id.to_string(),
    }
}

fn merge(batch: &PendingBatch, results: Vec<Classification>) -> Result<ClassifiedBatch> {
    if results.len() != batch.submitted.len() {
        return Err(SyncError::ClassificationFailure {
            task_id: batch.task_id.clone(),
            detail: format!("expected {} results, got {}", batch.submitted.len(), results.len()),
        });
    }

    let mut posts = batch.posts.clone();
    let mut tally = ClassificationTally::default();
    let mut results = results.into_iter();

    for (i, post) in posts.iter_mut().enumerate() {
        let (categories, confidence) = if batch.submitted.binary_search(&i).is_ok() {
            match results.next() {
                Some(result) if !result.categories.is_empty() => (result.categories, result.confidence),
                Some(result) => (vec![SENTINEL_CATEGORY.to_string()], result.confidence),
                None => (vec![SENTINEL_CATEGORY.to_string()], 0.0),
            }
        } else {
            (vec![SENTINEL_CATEGORY.to_string()], 0.0)
        };
        tally.record(&categories);
        post.category = Some(categories);
        post.confidence = Some(confidence);
    }

    Ok(ClassifiedBatch {
        task_id: batch.task_id.clone(),
        posts,
        tally,
    })
}
