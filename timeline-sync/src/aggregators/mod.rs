pub mod time_bucket;

pub use time_bucket::{
    period_key, Categorized, CategoryCount, ConfidenceDrift, ConfidenceSummary, PeriodBuckets, PeriodTop,
    TrendAggregator, TrendSummary,
};
