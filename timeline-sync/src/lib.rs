pub mod types;
pub mod crypto;
pub mod session;
pub mod walker;
pub mod ingestor;
pub mod dispatcher;
pub mod aggregators;
pub mod store;
pub mod bsky_client;
pub mod classifier_client;
pub mod report;
pub mod pipeline;

pub use types::*;
pub use crypto::{EnvSecretProvider, SecretProvider, SessionCipher, StaticSecretProvider};
pub use session::{Session, SessionManager, SessionState};
pub use walker::FeedCursorWalker;
pub use ingestor::PostIngestor;
pub use dispatcher::{ClassificationDispatcher, ClassificationTally, ClassifiedBatch, PendingBatch};
pub use aggregators::{TrendAggregator, TrendSummary};
pub use store::{MemoryPostStore, MemoryUserStore, PgPostStore, PgUserStore};
pub use bsky_client::BskyClient;
pub use classifier_client::{HttpClassificationService, LocalClassificationService};
pub use report::{TrendReport, TrendReporter};
pub use pipeline::{SyncPipeline, SyncReport};
