use crate::aggregators::{ConfidenceDrift, ConfidenceSummary, TrendAggregator, TrendSummary};
use crate::types::{PeriodGranularity, PostAttribute, PostStore, Result, SyncError};
use chrono::NaiveDate;
use serde::Serialize;
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrendReport {
    pub username: String,
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub granularity: PeriodGranularity,
    pub posts: usize,
    #[serde(flatten)]
    pub summary: TrendSummary,
    pub confidence: Option<ConfidenceSummary>,
    pub confidence_drift: ConfidenceDrift,
}

/// Trend reports over stored posts for an inclusive date range.
pub struct TrendReporter {
    store: Arc<dyn PostStore>,
}

impl TrendReporter {
    pub fn new(store: Arc<dyn PostStore>) -> Self {
        Self { store }
    }

    pub async fn report(
        &self,
        username: &str,
        start: NaiveDate,
        end: NaiveDate,
        granularity: PeriodGranularity,
    ) -> Result<TrendReport> {
        if end < start {
            return Err(SyncError::Config(format!("report range ends ({}) before it starts ({})", end, start)));
        }

        let from = start
            .and_hms_opt(0, 0, 0)
            .ok_or_else(|| SyncError::Config(format!("invalid start date {}", start)))?
            .and_utc();
        let until = end
            .and_hms_opt(23, 59, 59)
            .ok_or_else(|| SyncError::Config(format!("invalid end date {}", end)))?
            .and_utc();

        let posts = self.store.query_range(username, from, until, &PostAttribute::TREND).await?;
        info!("Building {:?} trend report for {} over {} posts", granularity, username, posts.len());

        let buckets = TrendAggregator::bucket_by_period(&posts, granularity);
        Ok(TrendReport {
            username: username.to_string(),
            start,
            end,
            granularity,
            posts: posts.len(),
            summary: TrendAggregator::summarize(&buckets),
            confidence: TrendAggregator::confidence_summary(&posts),
            confidence_drift: TrendAggregator::confidence_drift(&posts, granularity),
        })
    }
}
