use crate::types::{
    Credential, FeedApi, FeedApiError, FetchConfig, Result, TimelineItem, TimelinePage, UpstreamSession,
};
use async_trait::async_trait;
use backoff::{backoff::Backoff, exponential::ExponentialBackoff};
use reqwest::{Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tracing::{debug, error, warn};
use url::Url;

const AUTH_ERROR_CODES: &[&str] = &["ExpiredToken", "InvalidToken", "AuthenticationRequired", "AuthMissing"];

/// XRPC client for a Bluesky PDS or entryway.
pub struct BskyClient {
    client: Client,
    config: FetchConfig,
    service: Url,
}

enum Attempt {
    Retry(String),
    Fatal(FeedApiError),
}

#[derive(Deserialize)]
struct XrpcErrorBody {
    error: Option<String>,
    message: Option<String>,
}

#[derive(Deserialize)]
struct SessionInfo {
    did: String,
    handle: String,
}

#[derive(Deserialize)]
struct TimelineResponse {
    #[serde(default)]
    feed: Vec<FeedViewPost>,
    cursor: Option<String>,
}

#[derive(Deserialize)]
struct FeedViewPost {
    post: PostView,
    reason: Option<ReasonView>,
}

#[derive(Deserialize)]
struct PostView {
    author: ProfileView,
    record: PostRecord,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProfileView {
    handle: String,
    display_name: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PostRecord {
    #[serde(default)]
    text: String,
    created_at: Option<String>,
}

#[derive(Deserialize)]
struct ReasonView {
    by: Option<ProfileView>,
}

impl From<FeedViewPost> for TimelineItem {
    fn from(view: FeedViewPost) -> Self {
        TimelineItem {
            author_display_name: view.post.author.display_name,
            handle: view.post.author.handle,
            text: view.post.record.text,
            reposted_by: view.reason.and_then(|r| r.by).map(|by| by.handle),
            created_at: view.post.record.created_at,
        }
    }
}

impl BskyClient {
    pub fn new(service_url: &str, config: FetchConfig) -> Result<Self> {
        let client = Client::builder()
            .user_agent(&config.user_agent)
            .timeout(Duration::from_secs(config.timeout_seconds))
            .gzip(true)
            .deflate(true)
            .brotli(true)
            .build()?;
        let service = Url::parse(service_url)?;

        Ok(Self { client, config, service })
    }

    fn endpoint(&self, nsid: &str) -> std::result::Result<Url, FeedApiError> {
        self.service
            .join(&format!("xrpc/{}", nsid))
            .map_err(|e| FeedApiError::Transient(e.to_string()))
    }

    fn backoff(&self) -> ExponentialBackoff<backoff::SystemClock> {
        ExponentialBackoff {
            current_interval: Duration::from_secs(self.config.retry_delay_seconds),
            initial_interval: Duration::from_secs(self.config.retry_delay_seconds),
            max_interval: Duration::from_secs(self.config.retry_delay_seconds * 32),
            multiplier: 2.0,
            max_elapsed_time: Some(Duration::from_secs(self.config.retry_delay_seconds * 60)),
            ..Default::default()
        }
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: Method,
        url: Url,
        bearer: Option<&str>,
        body: Option<&serde_json::Value>,
    ) -> std::result::Result<T, FeedApiError> {
        let mut backoff = self.backoff();
        let mut last_error = None;

        for attempt in 0..=self.config.max_retries {
            match self.attempt(method.clone(), url.clone(), bearer, body).await {
                Ok(value) => return Ok(value),
                Err(Attempt::Fatal(e)) => return Err(e),
                Err(Attempt::Retry(msg)) => {
                    last_error = Some(msg);
                    if attempt < self.config.max_retries {
                        if let Some(delay) = backoff.next_backoff() {
                            warn!("Attempt {} failed for {}, retrying in {:?}", attempt + 1, url.path(), delay);
                            tokio::time::sleep(delay).await;
                            continue;
                        }
                    }
                    break;
                }
            }
        }

        let error_msg = last_error.unwrap_or_else(|| "Unknown error".to_string());
        error!("Request to {} failed after {} attempts: {}", url.path(), self.config.max_retries + 1, error_msg);
        Err(FeedApiError::Transient(error_msg))
    }

    async fn attempt<T: DeserializeOwned>(
        &self,
        method: Method,
        url: Url,
        bearer: Option<&str>,
        body: Option<&serde_json::Value>,
    ) -> std::result::Result<T, Attempt> {
        let mut request = self.client.request(method, url);
        if let Some(token) = bearer {
            request = request.bearer_auth(token);
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await.map_err(|e| Attempt::Retry(e.to_string()))?;
        let status = response.status();

        if status.is_success() {
            return response.json::<T>().await.map_err(|e| Attempt::Fatal(FeedApiError::Transient(e.to_string())));
        }

        let detail: XrpcErrorBody = response.json().await.unwrap_or(XrpcErrorBody {
            error: None,
            message: None,
        });
        let code = detail.error.unwrap_or_else(|| status.as_str().to_string());
        let message = detail
            .message
            .unwrap_or_else(|| status.canonical_reason().unwrap_or("Unknown").to_string());

        if status == StatusCode::UNAUTHORIZED || AUTH_ERROR_CODES.contains(&code.as_str()) {
            return Err(Attempt::Fatal(FeedApiError::Unauthorized { code, message }));
        }
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            return Err(Attempt::Retry(format!("HTTP {}: {}", status, message)));
        }
        Err(Attempt::Fatal(FeedApiError::Transient(format!("HTTP {} ({}): {}", status, code, message))))
    }
}

#[async_trait]
impl FeedApi for BskyClient {
    async fn login(&self, credential: &Credential) -> std::result::Result<UpstreamSession, FeedApiError> {
        let url = self.endpoint("com.atproto.server.createSession")?;
        let body = json!({
            "identifier": credential.identifier,
            "password": credential.password,
        });
        debug!("Creating session for {}", credential.identifier);
        self.call(Method::POST, url, None, Some(&body)).await
    }

    async fn resume(&self, session: &UpstreamSession) -> std::result::Result<UpstreamSession, FeedApiError> {
        let url = self.endpoint("com.atproto.server.getSession")?;
        let info: SessionInfo = self.call(Method::GET, url, Some(&session.access_jwt), None).await?;
        Ok(UpstreamSession {
            did: info.did,
            handle: info.handle,
            access_jwt: session.access_jwt.clone(),
            refresh_jwt: session.refresh_jwt.clone(),
        })
    }

    async fn refresh(&self, session: &UpstreamSession) -> std::result::Result<UpstreamSession, FeedApiError> {
        let url = self.endpoint("com.atproto.server.refreshSession")?;
        self.call(Method::POST, url, Some(&session.refresh_jwt), None).await
    }

    async fn timeline(
        &self,
        session: &UpstreamSession,
        cursor: Option<&str>,
        limit: u32,
    ) -> std::result::Result<TimelinePage, FeedApiError> {
        let mut url = self.endpoint("app.bsky.feed.getTimeline")?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("algorithm", "reverse-chronological");
            query.append_pair("limit", &limit.clamp(1, 100).to_string());
            if let Some(cursor) = cursor {
                query.append_pair("cursor", cursor);
            }
        }

        let response: TimelineResponse = self.call(Method::GET, url, Some(&session.access_jwt), None).await?;
        Ok(TimelinePage {
            items: response.feed.into_iter().map(TimelineItem::from).collect(),
            cursor: response.cursor.filter(|c| !c.is_empty()),
        })
    }
}
