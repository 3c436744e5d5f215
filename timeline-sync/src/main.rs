use anyhow::Context;
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use sqlx::PgPool;
use std::sync::Arc;
use timeline_sync::{
    BskyClient, ClassificationService, Credential, EnvSecretProvider, FetchConfig, HttpClassificationService,
    LocalClassificationService, PeriodGranularity, PgPostStore, PgUserStore, ServiceConfig, SessionCipher,
    SessionManager, SyncConfig, SyncPipeline, TrendReporter,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "timeline-sync", about = "Sync, classify and report on Bluesky timelines")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Pull new timeline posts, store and classify them.
    Sync {
        /// Local account name.
        username: String,
        /// Bluesky handle or email used to log in.
        #[arg(long, env = "BSKY_IDENTIFIER")]
        identifier: String,
        /// App password.
        #[arg(long, env = "BSKY_APP_PASSWORD", hide_env_values = true)]
        password: String,
        #[arg(long)]
        max_pages: Option<usize>,
        #[arg(long)]
        max_posts: Option<usize>,
        #[arg(long)]
        poll_attempts: Option<u32>,
        /// Classify in-process with the keyword baseline instead of calling CLASSIFIER_URL.
        #[arg(long)]
        local_classifier: bool,
    },
    /// Print a trend report for a date range.
    Report {
        username: String,
        #[arg(long)]
        start: NaiveDate,
        #[arg(long)]
        end: NaiveDate,
        #[arg(long, default_value = "week")]
        granularity: PeriodGranularity,
    },
    /// Forget a linked account.
    Unlink { username: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let services = ServiceConfig::from_env();

    let pool = PgPool::connect(&services.database_url)
        .await
        .context("failed to connect to the database; check DATABASE_URL")?;
    let users = Arc::new(PgUserStore::new(pool.clone()));
    let posts = Arc::new(PgPostStore::new(pool));

    match cli.command {
        Command::Sync {
            username,
            identifier,
            password,
            max_pages,
            max_posts,
            poll_attempts,
            local_classifier,
        } => {
            let mut config = SyncConfig::default();
            if let Some(max_pages) = max_pages {
                config.max_pages = max_pages;
            }
            if let Some(max_posts) = max_posts {
                config.max_posts = max_posts;
            }
            if let Some(attempts) = poll_attempts {
                config.poll.max_attempts = attempts;
            }

            let fetch_config = FetchConfig::default();
            let api = Arc::new(BskyClient::new(&services.bsky_service_url, fetch_config.clone())?);
            let classifier: Arc<dyn ClassificationService> = match (&services.classifier_url, local_classifier) {
                (Some(url), false) => Arc::new(HttpClassificationService::new(url, &fetch_config)?.with_requester(&username)),
                (None, false) => {
                    warn!("CLASSIFIER_URL is not set, classifying in-process");
                    Arc::new(LocalClassificationService::new(Default::default(), config.classifier_workers))
                }
                (_, true) => Arc::new(LocalClassificationService::new(Default::default(), config.classifier_workers)),
            };
            let cipher = SessionCipher::from_provider(&EnvSecretProvider::default())?;

            let pipeline = SyncPipeline::new(api, users, posts, classifier, cipher, config);
            let credential = Credential { identifier, password };

            let cancel = CancellationToken::new();
            let on_signal = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("Interrupted, finishing the current step");
                    on_signal.cancel();
                }
            });

            match pipeline.run(&username, &credential, &cancel).await {
                Ok(report) => println!("{}", serde_json::to_string_pretty(&report)?),
                Err(e) => {
                    error!("Sync for {} failed: {}", username, e);
                    return Err(e.into());
                }
            }
        }
        Command::Report {
            username,
            start,
            end,
            granularity,
        } => {
            let report = TrendReporter::new(posts).report(&username, start, end, granularity).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Unlink { username } => {
            let api = Arc::new(BskyClient::new(&services.bsky_service_url, FetchConfig::default())?);
            let cipher = SessionCipher::from_provider(&EnvSecretProvider::default())?;
            let sessions = SessionManager::new(api, users, cipher);
            if !sessions.unlink(&username).await? {
                info!("No linked account named {}", username);
            }
        }
    }

    Ok(())
}
