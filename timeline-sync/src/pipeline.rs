use crate::crypto::SessionCipher;
use crate::dispatcher::{ClassificationDispatcher, ClassificationTally, PendingBatch};
use crate::ingestor::PostIngestor;
use crate::session::SessionManager;
use crate::types::{
    ClassificationService, Credential, FeedApi, MergeReport, PostStore, Result, SyncConfig, SyncError, UserStore,
    WalkTermination,
};
use crate::walker::FeedCursorWalker;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub username: String,
    pub termination: WalkTermination,
    pub pages_fetched: usize,
    pub refreshes: usize,
    pub fetched: usize,
    pub inserted: usize,
    pub duplicates: usize,
    pub ingest_failures: usize,
    pub previous_checkpoint: Option<DateTime<Utc>>,
    pub checkpoint: Option<DateTime<Utc>>,
    pub checkpoint_advanced: bool,
    /// Stored posts without a classification when this run started classifying.
    pub backlog: usize,
    pub classified: usize,
    /// Backlog posts left unsubmitted because the run was cancelled.
    pub deferred: usize,
    pub tally: ClassificationTally,
    /// Batches still running upstream; re-poll with `resume_classification`.
    #[serde(skip)]
    pub pending: Vec<PendingBatch>,
    pub pending_tasks: Vec<String>,
    pub classification_errors: Vec<String>,
}

#[derive(Debug)]
pub struct ClassificationRound {
    pub task_id: Option<String>,
    pub tally: ClassificationTally,
    pub merge: MergeReport,
}

/// One user's sync run: session, walk, ingest, checkpoint, classify.
pub struct SyncPipeline {
    sessions: SessionManager,
    walker: FeedCursorWalker,
    ingestor: PostIngestor,
    dispatcher: ClassificationDispatcher,
    config: SyncConfig,
}

impl SyncPipeline {
    pub fn new(
        api: Arc<dyn FeedApi>,
        users: Arc<dyn UserStore>,
        posts: Arc<dyn PostStore>,
        classifier: Arc<dyn ClassificationService>,
        cipher: SessionCipher,
        config: SyncConfig,
    ) -> Self {
        Self {
            sessions: SessionManager::new(api.clone(), users, cipher),
            walker: FeedCursorWalker::from_config(api, &config),
            ingestor: PostIngestor::new(posts),
            dispatcher: ClassificationDispatcher::new(classifier),
            config,
        }
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    pub async fn run(&self, username: &str, credential: &Credential, cancel: &CancellationToken) -> Result<SyncReport> {
        info!("Starting sync for {}", username);

        let mut session = self.sessions.open(username, credential).await?;
        let previous = self.sessions.checkpoint(username).await?;
        let walk = self.walker.walk(&self.sessions, &mut session, credential, previous).await;

        let aborted = walk.is_aborted();
        let fetched = walk.posts.len();
        let batch = self.ingestor.ingest_batch(walk.posts, username).await;

        if let WalkTermination::Aborted(reason) = &walk.termination {
            if let Some(err) = reason.auth_error(username) {
                warn!(
                    "Sync for {} stopped after storing {} of {} fetched posts: {}",
                    username, batch.inserted, fetched, err
                );
                return Err(err);
            }
        }

        let mut checkpoint = previous;
        let mut checkpoint_advanced = false;
        match walk.checkpoint {
            Some(candidate) if !aborted && batch.is_clean() && Some(candidate) > previous => {
                checkpoint = Some(self.sessions.advance_checkpoint(username, candidate).await?);
                checkpoint_advanced = true;
            }
            Some(_) if !batch.is_clean() => {
                warn!(
                    "Keeping checkpoint for {} after {} storage failures",
                    username,
                    batch.failures.len()
                );
            }
            _ => {}
        }

        let mut report = SyncReport {
            username: username.to_string(),
            termination: walk.termination,
            pages_fetched: walk.pages_fetched,
            refreshes: walk.refreshes,
            fetched,
            inserted: batch.inserted,
            duplicates: batch.duplicates,
            ingest_failures: batch.failures.len(),
            previous_checkpoint: previous,
            checkpoint,
            checkpoint_advanced,
            backlog: 0,
            classified: 0,
            deferred: 0,
            tally: ClassificationTally::default(),
            pending: Vec::new(),
            pending_tasks: Vec::new(),
            classification_errors: Vec::new(),
        };

        // Earlier runs may have left posts unclassified; they are drained with this run's inserts.
        let backlog = match self.ingestor.unclassified(username, self.config.classify_backlog).await {
            Ok(backlog) => backlog,
            Err(e) => {
                error!("Could not load unclassified posts of {}: {}", username, e);
                report.classification_errors.push(e.to_string());
                batch.inserted_posts
            }
        };
        report.backlog = backlog.len();

        let chunk_size = self.config.classify_batch_size.max(1);
        for (index, chunk) in backlog.chunks(chunk_size).enumerate() {
            if cancel.is_cancelled() {
                report.deferred = backlog.len() - index * chunk_size;
                warn!(
                    "Sync for {} cancelled, {} posts left for the next run",
                    username, report.deferred
                );
                break;
            }

            let pending = match self.dispatcher.submit(chunk.to_vec()).await {
                Ok(pending) => pending,
                Err(e) => {
                    error!("Could not submit {} posts of {} for classification: {}", chunk.len(), username, e);
                    report.classification_errors.push(e.to_string());
                    continue;
                }
            };

            match self.classify(username, &pending, cancel).await {
                Ok(round) => {
                    report.classified += round.merge.updated;
                    report.tally.absorb(&round.tally);
                    report
                        .classification_errors
                        .extend(round.merge.failures.iter().map(|(_, e)| e.to_string()));
                }
                Err(e @ (SyncError::ClassificationTimeout { .. } | SyncError::ClassificationCancelled { .. })) => {
                    warn!("{}", e);
                    if let Some(task_id) = &pending.task_id {
                        report.pending_tasks.push(task_id.clone());
                    }
                    report.pending.push(pending);
                }
                Err(e) => {
                    error!("Classification of {} posts for {} failed: {}", chunk.len(), username, e);
                    report.classification_errors.push(e.to_string());
                }
            }
        }

        info!(
            "Finished sync for {}: {} fetched, {} inserted, {} of {} classified, {} pending batches",
            username,
            report.fetched,
            report.inserted,
            report.classified,
            report.backlog,
            report.pending.len()
        );
        Ok(report)
    }

    /// Re-poll a batch left behind by a timeout or cancellation.
    pub async fn resume_classification(
        &self,
        username: &str,
        pending: &PendingBatch,
        cancel: &CancellationToken,
    ) -> Result<ClassificationRound> {
        self.classify(username, pending, cancel).await
    }

    /// Independent users run concurrently; each result is reported separately.
    pub async fn run_many(
        &self,
        users: &[(String, Credential)],
        cancel: &CancellationToken,
    ) -> Vec<(String, Result<SyncReport>)> {
        let runs = users.iter().map(|(username, credential)| async move {
            let outcome = self.run(username, credential, cancel).await;
            if let Err(e) = &outcome {
                error!("Sync for {} failed: {}", username, e);
            }
            (username.clone(), outcome)
        });
        join_all(runs).await
    }

    async fn classify(
        &self,
        username: &str,
        pending: &PendingBatch,
        cancel: &CancellationToken,
    ) -> Result<ClassificationRound> {
        let classified = self.dispatcher.await_result(pending, self.config.poll, Some(cancel)).await?;
        let merge = self.ingestor.apply_classification(&classified.posts, username).await;
        Ok(ClassificationRound {
            task_id: classified.task_id,
            tally: classified.tally,
            merge,
        })
    }
}
