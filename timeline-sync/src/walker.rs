use crate::session::{Session, SessionManager};
use crate::types::{
    AbortReason, Credential, FeedApi, FeedApiError, FeedPost, PostAction, SyncConfig, TimelineItem, WalkOutcome,
    WalkTermination,
};
use chrono::{DateTime, NaiveDateTime, Utc};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Pages the reverse-chronological timeline back to the last checkpoint.
pub struct FeedCursorWalker {
    api: Arc<dyn FeedApi>,
    page_size: u32,
    max_pages: usize,
    max_posts: usize,
}

impl FeedCursorWalker {
    pub fn new(api: Arc<dyn FeedApi>, page_size: u32, max_pages: usize, max_posts: usize) -> Self {
        Self {
            api,
            page_size,
            max_pages,
            max_posts,
        }
    }

    pub fn from_config(api: Arc<dyn FeedApi>, config: &SyncConfig) -> Self {
        Self::new(api, config.page_size, config.max_pages, config.max_posts)
    }

    pub async fn walk(
        &self,
        sessions: &SessionManager,
        session: &mut Session,
        credential: &Credential,
        checkpoint: Option<DateTime<Utc>>,
    ) -> WalkOutcome {
        let mut posts = Vec::new();
        let mut newest: Option<DateTime<Utc>> = None;
        let mut cursor: Option<String> = None;
        let mut pages_fetched = 0;
        let mut refreshes = 0;
        let mut refreshed_for_page = false;

        let termination = loop {
            if pages_fetched >= self.max_pages {
                break WalkTermination::CapReached;
            }

            let fetched = self.api.timeline(&session.upstream, cursor.as_deref(), self.page_size).await;
            let page = match fetched {
                Ok(page) => page,
                Err(FeedApiError::Unauthorized { code, .. }) if !refreshed_for_page => {
                    warn!("Timeline for {} rejected ({}), refreshing session", session.username, code);
                    refreshed_for_page = true;
                    if let Err(e) = session.expire() {
                        break WalkTermination::Aborted(AbortReason::from(&e));
                    }
                    match sessions.refresh(session, credential).await {
                        Ok(()) => {
                            refreshes += 1;
                            continue;
                        }
                        Err(e) => break WalkTermination::Aborted(AbortReason::from(&e)),
                    }
                }
                Err(FeedApiError::Unauthorized { code, .. }) => {
                    warn!("Timeline for {} rejected again ({}) after a refresh", session.username, code);
                    if let Err(e) = session.expire() {
                        break WalkTermination::Aborted(AbortReason::from(&e));
                    }
                    break WalkTermination::Aborted(AbortReason::SessionExpired);
                }
                Err(FeedApiError::Transient(msg)) => break WalkTermination::Aborted(AbortReason::Transient(msg)),
            };
            refreshed_for_page = false;
            pages_fetched += 1;
            debug!("Fetched page {} for {} with {} items", pages_fetched, session.username, page.items.len());

            if page.items.is_empty() {
                break WalkTermination::Exhausted;
            }

            let mut stop = None;
            for item in &page.items {
                let Some(timestamp) = item.created_at.as_deref().and_then(parse_timestamp) else {
                    debug!("Skipping item by {} without a usable timestamp", item.handle);
                    continue;
                };
                if checkpoint.is_some_and(|cp| timestamp <= cp) {
                    stop = Some(WalkTermination::CaughtUp);
                    break;
                }
                newest = newest.max(Some(timestamp));
                posts.push(to_post(item, timestamp));
                if posts.len() >= self.max_posts {
                    stop = Some(WalkTermination::CapReached);
                    break;
                }
            }
            if let Some(reason) = stop {
                break reason;
            }

            match page.cursor {
                Some(next) => cursor = Some(next),
                None => break WalkTermination::Exhausted,
            }
        };

        let new_checkpoint = match termination {
            WalkTermination::Aborted(ref reason) => {
                warn!("Walk for {} aborted after {} pages: {}", session.username, pages_fetched, reason);
                checkpoint
            }
            _ => checkpoint.max(newest),
        };

        info!(
            "Walk for {} finished ({:?}): {} posts over {} pages",
            session.username,
            termination,
            posts.len(),
            pages_fetched
        );

        WalkOutcome {
            posts,
            previous_checkpoint: checkpoint,
            checkpoint: new_checkpoint,
            pages_fetched,
            refreshes,
            termination,
        }
    }
}

/// ISO-8601 with offset, or a naive timestamp read as UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

fn to_post(item: &TimelineItem, timestamp: DateTime<Utc>) -> FeedPost {
    let author = item
        .author_display_name
        .as_deref()
        .filter(|name| !name.trim().is_empty())
        .unwrap_or(&item.handle)
        .to_string();
    let action = match &item.reposted_by {
        Some(by) => PostAction::Repost { by: by.clone() },
        None => PostAction::New,
    };
    FeedPost::new(author, item.handle.clone(), item.text.clone(), action, timestamp)
}
