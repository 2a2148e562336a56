use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{info, instrument};

use crate::config::DatabaseSettings;
use crate::database_ops::models::{InsertOutcome, NewPost, PostPage, PostWithImages};
use crate::database_ops::postgres::PgStore;
use crate::database_ops::sqlite::SqliteStore;
use crate::util::env as env_util;

pub const MAX_PAGE_SIZE: i64 = 100;

/// Storage collaborator for the sync pipeline and the read API.
///
/// Every operation borrows the store explicitly; there is no session or cursor
/// state hidden on the handle beyond the connection pool.
#[async_trait]
pub trait PostStore: Send + Sync {
    /// Idempotently create `posts`, then `images`, then their indexes.
    async fn ensure_schema(&self) -> Result<()>;

    /// Which of `ids` already have a post row. Postgres answers in one query;
    /// SQLite splits long lists to stay under its bind-parameter limit.
    async fn existing_post_ids(&self, ids: &[String]) -> Result<HashSet<String>>;

    /// Insert the post row and one image row per URL as a single transaction.
    async fn insert_post(&self, post: &NewPost) -> Result<InsertOutcome>;

    /// Newest posts first, 1-based `page`.
    async fn list_posts(&self, page: i64, page_size: i64) -> Result<PostPage>;

    async fn get_post(&self, post_id: &str) -> Result<Option<PostWithImages>>;

    async fn count_images(&self, post_id: &str) -> Result<i64>;

    /// True when a pooled connection can be acquired and answers a trivial query.
    async fn ping(&self) -> bool;

    /// Release pool resources. Safe to call more than once.
    async fn close(&self);

    fn backend(&self) -> &'static str;
}

/// Open the store described by `settings`, picking the backend from the DSN scheme.
#[instrument(skip(settings), fields(pool_size = settings.pool_size))]
pub async fn connect(settings: &DatabaseSettings) -> Result<Arc<dyn PostStore>> {
    info!(url = %env_util::redact_dsn(&settings.url), "connecting to database");
    if settings.is_sqlite() {
        let store = SqliteStore::connect(&settings.url, settings.pool_size).await?;
        return Ok(Arc::new(store));
    }
    let database = settings
        .database
        .as_deref()
        .ok_or_else(|| anyhow!("postgres settings carry no database name"))?;
    let store = PgStore::connect(&settings.url, database, settings.pool_size).await?;
    Ok(Arc::new(store))
}

/// Clamp user-supplied paging to sane bounds and return `(page, page_size, offset)`.
pub fn page_window(page: i64, page_size: i64) -> (i64, i64, i64) {
    let page = page.max(1);
    let page_size = page_size.clamp(1, MAX_PAGE_SIZE);
    (page, page_size, (page - 1) * page_size)
}
