use crate::types::{FeedPost, PeriodGranularity, ProjectedPost};
use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::debug;

/// Period start date -> category -> count. Ordered by period.
pub type PeriodBuckets = BTreeMap<NaiveDate, BTreeMap<String, usize>>;

/// Period start date -> category -> mean confidence.
pub type ConfidenceDrift = BTreeMap<NaiveDate, BTreeMap<String, f64>>;

/// Anything with a timestamp and a classification that can be bucketed.
pub trait Categorized {
    fn timestamp(&self) -> Option<DateTime<Utc>>;

    /// Empty when the post has not been classified.
    fn categories(&self) -> &[String];

    fn confidence(&self) -> Option<f64>;
}

impl Categorized for FeedPost {
    fn timestamp(&self) -> Option<DateTime<Utc>> {
        Some(self.timestamp)
    }

    fn categories(&self) -> &[String] {
        self.category.as_deref().unwrap_or(&[])
    }

    fn confidence(&self) -> Option<f64> {
        self.confidence
    }
}

impl Categorized for ProjectedPost {
    fn timestamp(&self) -> Option<DateTime<Utc>> {
        self.timestamp
    }

    fn categories(&self) -> &[String] {
        self.category.as_deref().unwrap_or(&[])
    }

    fn confidence(&self) -> Option<f64> {
        self.confidence
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeriodTop {
    pub period: NaiveDate,
    pub category: String,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CategoryCount {
    pub category: String,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrendSummary {
    pub weekly_counts: PeriodBuckets,
    pub top_category_per_week: Vec<PeriodTop>,
    pub top_overall_category: Option<CategoryCount>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConfidenceSummary {
    pub count: usize,
    pub mean: f64,
    /// Sample standard deviation; absent below two values.
    pub std: Option<f64>,
    pub min: f64,
    pub p25: f64,
    pub median: f64,
    pub p75: f64,
    pub max: f64,
}

/// Stateless rollups over classified posts.
pub struct TrendAggregator;

impl TrendAggregator {
    pub fn bucket_by_period<T: Categorized>(posts: &[T], granularity: PeriodGranularity) -> PeriodBuckets {
        let mut buckets = PeriodBuckets::new();
        let mut skipped = 0;

        for post in posts {
            let (Some(timestamp), categories) = (post.timestamp(), post.categories()) else {
                skipped += 1;
                continue;
            };
            if categories.is_empty() {
                skipped += 1;
                continue;
            }
            let counts = buckets.entry(period_key(timestamp, granularity)).or_default();
            for category in categories {
                *counts.entry(category.clone()).or_insert(0) += 1;
            }
        }

        if skipped > 0 {
            debug!("Skipped {} posts without a timestamp or classification", skipped);
        }
        buckets
    }

    pub fn summarize(buckets: &PeriodBuckets) -> TrendSummary {
        let mut overall: BTreeMap<String, usize> = BTreeMap::new();
        let mut top_category_per_week = Vec::with_capacity(buckets.len());

        for (period, counts) in buckets {
            if let Some((category, count)) = top_of(counts) {
                top_category_per_week.push(PeriodTop {
                    period: *period,
                    category,
                    count,
                });
            }
            for (category, count) in counts {
                *overall.entry(category.clone()).or_insert(0) += count;
            }
        }

        TrendSummary {
            weekly_counts: buckets.clone(),
            top_category_per_week,
            top_overall_category: top_of(&overall).map(|(category, count)| CategoryCount { category, count }),
        }
    }

    pub fn confidence_summary<T: Categorized>(posts: &[T]) -> Option<ConfidenceSummary> {
        let mut values: Vec<f64> = posts.iter().filter_map(|p| p.confidence()).filter(|c| c.is_finite()).collect();
        if values.is_empty() {
            return None;
        }
        values.sort_by(f64::total_cmp);

        let count = values.len();
        let mean = values.iter().sum::<f64>() / count as f64;
        let std = (count > 1).then(|| {
            let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (count - 1) as f64;
            variance.sqrt()
        });

        Some(ConfidenceSummary {
            count,
            mean,
            std,
            min: values[0],
            p25: percentile(&values, 0.25),
            median: percentile(&values, 0.5),
            p75: percentile(&values, 0.75),
            max: values[count - 1],
        })
    }

    /// Mean confidence per category per period. Multi-label posts count for each label.
    pub fn confidence_drift<T: Categorized>(posts: &[T], granularity: PeriodGranularity) -> ConfidenceDrift {
        let mut sums: BTreeMap<NaiveDate, BTreeMap<String, (f64, usize)>> = BTreeMap::new();

        for post in posts {
            let (Some(timestamp), Some(confidence)) = (post.timestamp(), post.confidence()) else {
                continue;
            };
            let period = sums.entry(period_key(timestamp, granularity)).or_default();
            for category in post.categories() {
                let entry = period.entry(category.clone()).or_insert((0.0, 0));
                entry.0 += confidence;
                entry.1 += 1;
            }
        }

        sums.into_iter()
            .filter(|(_, categories)| !categories.is_empty())
            .map(|(period, categories)| {
                let means: BTreeMap<String, f64> = categories
                    .into_iter()
                    .map(|(category, (sum, n))| (category, sum / n as f64))
                    .collect();
                (period, means)
            })
            .collect()
    }
}

/// Start date of the period enclosing `timestamp`. Weeks start on Monday.
pub fn period_key(timestamp: DateTime<Utc>, granularity: PeriodGranularity) -> NaiveDate {
    let date = timestamp.date_naive();
    match granularity {
        PeriodGranularity::Day => date,
        PeriodGranularity::Week => date - Duration::days(date.weekday().num_days_from_monday() as i64),
        PeriodGranularity::Month => date.with_day(1).unwrap_or(date),
    }
}

// Highest count wins; ties go to the lexicographically smallest name.
fn top_of(counts: &BTreeMap<String, usize>) -> Option<(String, usize)> {
    let mut best: Option<(&String, usize)> = None;
    for (category, &count) in counts {
        if best.map_or(true, |(_, top)| count > top) {
            best = Some((category, count));
        }
    }
    best.map(|(category, count)| (category.clone(), count))
}

fn percentile(sorted: &[f64], q: f64) -> f64 {
    let position = q * (sorted.len() - 1) as f64;
    let lower = position.floor() as usize;
    let upper = position.ceil() as usize;
    sorted[lower] + (sorted[upper] - sorted[lower]) * (position - lower as f64)
}
