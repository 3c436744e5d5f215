use crate::types::{Classification, ClassificationService, ClassifierError, FetchConfig, Result, TaskStatus};
use async_trait::async_trait;
use interfaces::KeywordClassifier;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{RwLock, Semaphore};
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

/// Client for the `/categorize/` + `/status/{id}` task API.
pub struct HttpClassificationService {
    client: Client,
    base: Url,
    requester: String,
}

#[derive(Serialize)]
struct CategorizeRequest<'a> {
    bsky_posts: Vec<TextPayload<'a>>,
    bsky_username: &'a str,
}

#[derive(Serialize)]
struct TextPayload<'a> {
    text: &'a str,
}

#[derive(Deserialize)]
struct CategorizeResponse {
    task_id: Option<String>,
    error: Option<String>,
}

#[derive(Deserialize)]
struct StatusResponse {
    status: String,
    #[serde(default)]
    result: Vec<ResultEntry>,
    error: Option<String>,
}

#[derive(Deserialize)]
struct ResultEntry {
    category: Option<CategoryField>,
    confidence: Option<f64>,
}

/// The service answers with either a single label or a ranked list.
#[derive(Deserialize)]
#[serde(untagged)]
enum CategoryField {
    One(String),
    Many(Vec<String>),
}

impl From<ResultEntry> for Classification {
    fn from(entry: ResultEntry) -> Self {
        let categories = match entry.category {
            Some(CategoryField::One(label)) => vec![label],
            Some(CategoryField::Many(labels)) => labels,
            None => Vec::new(),
        };
        Classification {
            categories,
            confidence: entry.confidence.unwrap_or(0.0),
        }
    }
}

impl HttpClassificationService {
    pub fn new(base_url: &str, config: &FetchConfig) -> Result<Self> {
        let client = Client::builder()
            .user_agent(&config.user_agent)
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()?;
        let mut base = Url::parse(base_url)?;
        if !base.path().ends_with('/') {
            base.set_path(&format!("{}/", base.path()));
        }

        Ok(Self {
            client,
            base,
            requester: "timeline-sync".to_string(),
        })
    }

    pub fn with_requester(mut self, requester: impl Into<String>) -> Self {
        self.requester = requester.into();
        self
    }

    fn url(&self, path: &str) -> std::result::Result<Url, ClassifierError> {
        self.base.join(path).map_err(|e| ClassifierError::Unavailable(e.to_string()))
    }
}

fn unavailable(err: reqwest::Error) -> ClassifierError {
    ClassifierError::Unavailable(err.to_string())
}

#[async_trait]
impl ClassificationService for HttpClassificationService {
    async fn submit(&self, texts: Vec<String>) -> std::result::Result<String, ClassifierError> {
        let request = CategorizeRequest {
            bsky_posts: texts.iter().map(|text| TextPayload { text }).collect(),
            bsky_username: &self.requester,
        };

        let response = self
            .client
            .post(self.url("categorize/")?)
            .json(&request)
            .send()
            .await
            .map_err(unavailable)?;
        if !response.status().is_success() {
            return Err(ClassifierError::Rejected(format!("HTTP {}", response.status())));
        }

        let body: CategorizeResponse = response.json().await.map_err(unavailable)?;
        match (body.task_id, body.error) {
            (Some(task_id), _) => Ok(task_id),
            (None, error) => Err(ClassifierError::Rejected(error.unwrap_or_else(|| "no task id returned".to_string()))),
        }
    }

    async fn status(&self, task_id: &str) -> std::result::Result<TaskStatus, ClassifierError> {
        let response = self
            .client
            .get(self.url(&format!("status/{}", task_id))?)
            .send()
            .await
            .map_err(unavailable)?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(ClassifierError::UnknownTask(task_id.to_string()));
        }
        if !response.status().is_success() {
            return Err(ClassifierError::Unavailable(format!("HTTP {}", response.status())));
        }

        let body: StatusResponse = response.json().await.map_err(unavailable)?;
        Ok(match body.status.to_ascii_lowercase().as_str() {
            "success" => TaskStatus::Success(body.result.into_iter().map(Classification::from).collect()),
            "failed" | "failure" => TaskStatus::Failure(body.error.unwrap_or_else(|| "task failed".to_string())),
            // pending, started, retry
            other => {
                debug!("Task {} reported state {}", task_id, other);
                TaskStatus::Pending
            }
        })
    }
}

/// In-process classification over the keyword baseline, bounded by a worker semaphore.
pub struct LocalClassificationService {
    classifier: Arc<KeywordClassifier>,
    workers: Arc<Semaphore>,
    tasks: Arc<RwLock<HashMap<String, TaskStatus>>>,
}

impl LocalClassificationService {
    pub fn new(classifier: KeywordClassifier, workers: usize) -> Self {
        Self {
            classifier: Arc::new(classifier),
            workers: Arc::new(Semaphore::new(workers.max(1))),
            tasks: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

#[async_trait]
impl ClassificationService for LocalClassificationService {
    async fn submit(&self, texts: Vec<String>) -> std::result::Result<String, ClassifierError> {
        if texts.iter().all(|t| t.trim().is_empty()) {
            return Err(ClassifierError::Rejected("No valid texts provided.".to_string()));
        }

        let task_id = Uuid::new_v4().to_string();
        self.tasks.write().await.insert(task_id.clone(), TaskStatus::Pending);

        let classifier = self.classifier.clone();
        let workers = self.workers.clone();
        let tasks = self.tasks.clone();
        let id = task_id.clone();

        tokio::spawn(async move {
            let outcome = match workers.acquire_owned().await {
                Ok(_permit) => {
                    let results: Vec<Classification> = texts.iter().map(|t| classifier.classify(t)).collect();
                    info!("Local task {} classified {} texts", id, results.len());
                    TaskStatus::Success(results)
                }
                Err(e) => {
                    warn!("Local task {} could not get a worker: {}", id, e);
                    TaskStatus::Failure(e.to_string())
                }
            };
            tasks.write().await.insert(id, outcome);
        });

        Ok(task_id)
    }

    async fn status(&self, task_id: &str) -> std::result::Result<TaskStatus, ClassifierError> {
        let mut tasks = self.tasks.write().await;
        // Terminal results are handed out once.
        match tasks.remove(task_id) {
            None => Err(ClassifierError::UnknownTask(task_id.to_string())),
            Some(TaskStatus::Pending) => {
                tasks.insert(task_id.to_string(), TaskStatus::Pending);
                Ok(TaskStatus::Pending)
            }
            Some(terminal) => Ok(terminal),
        }
    }
}
