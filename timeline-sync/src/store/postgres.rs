use crate::types::{
    ClassifyWriteOutcome, FeedPost, PostAction, PostAttribute, PostStore, ProjectedPost, PutOutcome, StoreError,
    UserSession, UserStore,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::debug;

fn unavailable(err: sqlx::Error) -> StoreError {
    StoreError::Unavailable(err.to_string())
}

/// `bsky_posts`, keyed by (username, post_hash).
#[derive(Clone)]
pub struct PgPostStore {
    pool: PgPool,
}

impl PgPostStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PostStore for PgPostStore {
    async fn put_if_absent(&self, username: &str, post: &FeedPost) -> Result<PutOutcome, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO bsky_posts (username, post_hash, author, handle, text, action, post_timestamp, category, confidence)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (username, post_hash) DO NOTHING
            "#,
        )
        .bind(username)
        .bind(&post.content_fingerprint)
        .bind(&post.author)
        .bind(&post.handle)
        .bind(&post.text)
        .bind(post.action.to_string())
        .bind(post.timestamp)
        .bind(post.category.clone())
        .bind(post.confidence)
        .execute(&self.pool)
        .await
        .map_err(unavailable)?;

        if result.rows_affected() > 0 {
            Ok(PutOutcome::Inserted)
        } else {
            Ok(PutOutcome::Conflict)
        }
    }

    async fn get(&self, username: &str, content_fingerprint: &str) -> Result<Option<FeedPost>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT author, handle, text, action, post_timestamp, post_hash, category, confidence
            FROM bsky_posts WHERE username = $1 AND post_hash = $2
            "#,
        )
        .bind(username)
        .bind(content_fingerprint)
        .fetch_optional(&self.pool)
        .await
        .map_err(unavailable)?;

        row.map(|r| post_from_row(&r)).transpose()
    }

    async fn query_range(
        &self,
        username: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        projection: &[PostAttribute],
    ) -> Result<Vec<ProjectedPost>, StoreError> {
        let columns = select_list(projection);
        let sql = format!(
            "SELECT {} FROM bsky_posts WHERE username = $1 AND post_timestamp BETWEEN $2 AND $3 ORDER BY post_timestamp",
            columns
        );
        let rows = sqlx::query(&sql)
            .bind(username)
            .bind(start)
            .bind(end)
            .fetch_all(&self.pool)
            .await
            .map_err(unavailable)?;

        debug!("Range query for {} returned {} rows", username, rows.len());
        rows.iter().map(|r| projected_from_row(username, r, projection)).collect()
    }

    async fn set_classification_if_absent(
        &self,
        username: &str,
        content_fingerprint: &str,
        category: &[String],
        confidence: f64,
    ) -> Result<ClassifyWriteOutcome, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE bsky_posts SET category = $3, confidence = $4
            WHERE username = $1 AND post_hash = $2 AND category IS NULL
            "#,
        )
        .bind(username)
        .bind(content_fingerprint)
        .bind(category.to_vec())
        .bind(confidence)
        .execute(&self.pool)
        .await
        .map_err(unavailable)?;

        if result.rows_affected() > 0 {
            return Ok(ClassifyWriteOutcome::Updated);
        }

        let exists = sqlx::query("SELECT 1 FROM bsky_posts WHERE username = $1 AND post_hash = $2")
            .bind(username)
            .bind(content_fingerprint)
            .fetch_optional(&self.pool)
            .await
            .map_err(unavailable)?;

        Ok(match exists {
            Some(_) => ClassifyWriteOutcome::AlreadyClassified,
            None => ClassifyWriteOutcome::Missing,
        })
    }

    async fn unclassified(&self, username: &str, limit: usize) -> Result<Vec<FeedPost>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT author, handle, text, action, post_timestamp, post_hash, category, confidence
            FROM bsky_posts WHERE username = $1 AND category IS NULL
            ORDER BY post_timestamp DESC
            LIMIT $2
            "#,
        )
        .bind(username)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(unavailable)?;

        debug!("{} unclassified posts waiting for {}", rows.len(), username);
        rows.iter().map(post_from_row).collect()
    }
}

fn column(attribute: PostAttribute) -> &'static str {
    match attribute {
        PostAttribute::Author => "author",
        PostAttribute::Handle => "handle",
        PostAttribute::Text => "text",
        PostAttribute::Action => "action",
        PostAttribute::Timestamp => "post_timestamp",
        PostAttribute::Category => "category",
        PostAttribute::Confidence => "confidence",
    }
}

fn select_list(projection: &[PostAttribute]) -> String {
    let mut columns = vec!["post_hash"];
    for attribute in projection {
        let name = column(*attribute);
        if !columns.contains(&name) {
            columns.push(name);
        }
    }
    columns.join(", ")
}

fn parse_action(raw: String) -> Result<PostAction, StoreError> {
    PostAction::try_from(raw).map_err(StoreError::Unavailable)
}

fn post_from_row(row: &PgRow) -> Result<FeedPost, StoreError> {
    Ok(FeedPost {
        author: row.try_get("author").map_err(unavailable)?,
        handle: row.try_get("handle").map_err(unavailable)?,
        text: row.try_get("text").map_err(unavailable)?,
        action: parse_action(row.try_get("action").map_err(unavailable)?)?,
        timestamp: row.try_get("post_timestamp").map_err(unavailable)?,
        content_fingerprint: row.try_get("post_hash").map_err(unavailable)?,
        category: row.try_get("category").map_err(unavailable)?,
        confidence: row.try_get("confidence").map_err(unavailable)?,
    })
}

fn projected_from_row(username: &str, row: &PgRow, projection: &[PostAttribute]) -> Result<ProjectedPost, StoreError> {
    let mut post = ProjectedPost {
        username: username.to_string(),
        content_fingerprint: row.try_get("post_hash").map_err(unavailable)?,
        ..Default::default()
    };
    for attribute in projection {
        match attribute {
            PostAttribute::Author => post.author = Some(row.try_get("author").map_err(unavailable)?),
            PostAttribute::Handle => post.handle = Some(row.try_get("handle").map_err(unavailable)?),
            PostAttribute::Text => post.text = Some(row.try_get("text").map_err(unavailable)?),
            PostAttribute::Action => post.action = Some(parse_action(row.try_get("action").map_err(unavailable)?)?),
            PostAttribute::Timestamp => post.timestamp = Some(row.try_get("post_timestamp").map_err(unavailable)?),
            PostAttribute::Category => post.category = row.try_get("category").map_err(unavailable)?,
            PostAttribute::Confidence => post.confidence = row.try_get("confidence").map_err(unavailable)?,
        }
    }
    Ok(post)
}

/// `bsky_users`: one row per linked account.
#[derive(Clone)]
pub struct PgUserStore {
    pool: PgPool,
}

impl PgUserStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl UserStore for PgUserStore {
    async fn get_user(&self, username: &str) -> Result<Option<UserSession>, StoreError> {
        let row = sqlx::query("SELECT username, session_token, checkpoint FROM bsky_users WHERE username = $1")
            .bind(username)
            .fetch_optional(&self.pool)
            .await
            .map_err(unavailable)?;

        match row {
            Some(r) => Ok(Some(UserSession {
                username: r.try_get("username").map_err(unavailable)?,
                encrypted_session_token: r.try_get("session_token").map_err(unavailable)?,
                sync_checkpoint: r.try_get("checkpoint").map_err(unavailable)?,
            })),
            None => Ok(None),
        }
    }

    async fn store_session_token(&self, username: &str, encrypted_token: &str) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO bsky_users (username, session_token)
            VALUES ($1, $2)
            ON CONFLICT (username)
            DO UPDATE SET session_token = EXCLUDED.session_token
            "#,
        )
        .bind(username)
        .bind(encrypted_token)
        .execute(&self.pool)
        .await
        .map_err(unavailable)?;
        Ok(())
    }

    async fn remove_session_token(&self, username: &str) -> Result<(), StoreError> {
        sqlx::query("UPDATE bsky_users SET session_token = NULL WHERE username = $1")
            .bind(username)
            .execute(&self.pool)
            .await
            .map_err(unavailable)?;
        Ok(())
    }

    async fn advance_checkpoint(&self, username: &str, checkpoint: DateTime<Utc>) -> Result<DateTime<Utc>, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO bsky_users (username, checkpoint)
            VALUES ($1, $2)
            ON CONFLICT (username)
            DO UPDATE SET checkpoint = GREATEST(bsky_users.checkpoint, EXCLUDED.checkpoint)
            RETURNING checkpoint
            "#,
        )
        .bind(username)
        .bind(checkpoint)
        .fetch_one(&self.pool)
        .await
        .map_err(unavailable)?;

        row.try_get("checkpoint").map_err(unavailable)
    }

    async fn unlink(&self, username: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM bsky_users WHERE username = $1")
            .bind(username)
            .execute(&self.pool)
            .await
            .map_err(unavailable)?;
        Ok(result.rows_affected() > 0)
    }
}
