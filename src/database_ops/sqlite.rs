use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::NaiveDateTime;
use sqlx::{
    pool::PoolConnection,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
    QueryBuilder, Row, Sqlite, SqlitePool,
};
use std::collections::HashSet;
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, instrument};

use crate::database_ops::db::{page_window, PostStore};
use crate::database_ops::models::{
    InsertOutcome, NewPost, PostPage, PostSummary, PostWithImages,
};

const SCHEMA: [&str; 4] = [
    "CREATE TABLE IF NOT EXISTS posts (
        post_id TEXT PRIMARY KEY,
        title TEXT,
        description TEXT,
        user_nick TEXT,
        signature TEXT,
        created_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP
    )",
    "CREATE TABLE IF NOT EXISTS images (
        image_id INTEGER PRIMARY KEY AUTOINCREMENT,
        post_id TEXT NOT NULL REFERENCES posts(post_id),
        url TEXT NOT NULL,
        created_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP
    )",
    "CREATE INDEX IF NOT EXISTS idx_images_post_id ON images(post_id)",
    "CREATE INDEX IF NOT EXISTS idx_posts_created_at ON posts(created_at)",
];

/// IDs per `IN (...)` list; keeps each statement under SQLite's bind limit.
const ID_CHUNK: usize = 500;

/// SQLite-backed store for local runs and tests.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    #[instrument]
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        let in_memory = url.contains(":memory:") || url.contains("mode=memory");
        let mut opts = SqliteConnectOptions::from_str(url)
            .with_context(|| format!("invalid sqlite url {url}"))?
            .create_if_missing(true)
            .foreign_keys(true);
        if !in_memory {
            opts = opts.journal_mode(SqliteJournalMode::Wal);
        }

        // Each in-memory connection is its own database: pin the pool to one
        // connection that is never recycled.
        let pool_opts = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(max_connections.max(1))
        };
        let pool = pool_opts
            .acquire_timeout(Duration::from_secs(10))
            .connect_with(opts)
            .await
            .context("failed to open sqlite database")?;
        info!(url, "sqlite database opened");
        Ok(Self { pool })
    }

    /// Fresh in-memory store; handy for tests and dry runs.
    pub async fn in_memory() -> Result<Self> {
        Self::connect("sqlite::memory:", 1).await
    }

    pub async fn acquire(&self) -> Result<PoolConnection<Sqlite>> {
        self.pool
            .acquire()
            .await
            .context("failed to acquire sqlite connection")
    }
}

#[async_trait]
impl PostStore for SqliteStore {
    async fn ensure_schema(&self) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for stmt in SCHEMA {
            sqlx::query(stmt).execute(&mut *tx).await?;
        }
        tx.commit().await?;
        info!("posts/images tables ready");
        Ok(())
    }

    async fn existing_post_ids(&self, ids: &[String]) -> Result<HashSet<String>> {
        let mut found = HashSet::new();
        for chunk in ids.chunks(ID_CHUNK) {
            let mut qb: QueryBuilder<'_, Sqlite> =
                QueryBuilder::new("SELECT post_id FROM posts WHERE post_id IN (");
            {
                let mut sep = qb.separated(", ");
                for id in chunk {
                    sep.push_bind(id);
                }
                sep.push_unseparated(")");
            }
            let rows: Vec<String> = qb
                .build_query_scalar()
                .fetch_all(&self.pool)
                .await?;
            found.extend(rows);
        }
        Ok(found)
    }

    #[instrument(skip(self, post), fields(post_id = %post.post_id))]
    async fn insert_post(&self, post: &NewPost) -> Result<InsertOutcome> {
        let mut tx = self.pool.begin().await?;
        let inserted = sqlx::query(
            "INSERT INTO posts (post_id, title, description, user_nick, signature)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT (post_id) DO NOTHING",
        )
        .bind(&post.post_id)
        .bind(&post.title)
        .bind(&post.description)
        .bind(&post.user_nick)
        .bind(&post.signature)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        if inserted == 0 {
            tx.rollback().await?;
            return Ok(InsertOutcome::AlreadyExists);
        }

        for url in &post.images {
            sqlx::query("INSERT INTO images (post_id, url) VALUES (?1, ?2)")
                .bind(&post.post_id)
                .bind(url)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(InsertOutcome::Inserted {
            images: post.images.len(),
        })
    }

    async fn list_posts(&self, page: i64, page_size: i64) -> Result<PostPage> {
        let (page, page_size, offset) = page_window(page, page_size);
        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM posts")
            .fetch_one(&self.pool)
            .await?;
        let rows = sqlx::query(
            "SELECT p.post_id, p.title, p.description, p.user_nick, p.signature,
                    COUNT(i.image_id) AS image_count, p.created_at
             FROM posts p
             LEFT JOIN images i ON i.post_id = p.post_id
             GROUP BY p.post_id
             ORDER BY p.created_at DESC, p.post_id DESC
             LIMIT ?1 OFFSET ?2",
        )
        .bind(page_size)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        let mut posts = Vec::with_capacity(rows.len());
        for r in rows {
            posts.push(PostSummary {
                post_id: r.try_get("post_id")?,
                title: r.try_get("title")?,
                description: r.try_get("description")?,
                user_nick: r.try_get("user_nick")?,
                signature: r.try_get("signature")?,
                image_count: r.try_get("image_count")?,
                created_at: r.try_get::<NaiveDateTime, _>("created_at")?.and_utc(),
            });
        }
        Ok(PostPage {
            posts,
            total,
            page,
            page_size,
        })
    }

    async fn get_post(&self, post_id: &str) -> Result<Option<PostWithImages>> {
        let Some(r) = sqlx::query(
            "SELECT post_id, title, description, user_nick, signature, created_at
             FROM posts WHERE post_id = ?1",
        )
        .bind(post_id)
        .fetch_optional(&self.pool)
        .await?
        else {
            return Ok(None);
        };

        let images: Vec<String> =
            sqlx::query_scalar("SELECT url FROM images WHERE post_id = ?1 ORDER BY image_id")
                .bind(post_id)
                .fetch_all(&self.pool)
                .await?;

        Ok(Some(PostWithImages {
            post_id: r.try_get("post_id")?,
            title: r.try_get("title")?,
            description: r.try_get("description")?,
            user_nick: r.try_get("user_nick")?,
            signature: r.try_get("signature")?,
            created_at: r.try_get::<NaiveDateTime, _>("created_at")?.and_utc(),
            images,
        }))
    }

    async fn count_images(&self, post_id: &str) -> Result<i64> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM images WHERE post_id = ?1")
            .bind(post_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(n)
    }

    async fn ping(&self) -> bool {
        let Ok(mut conn) = self.acquire().await else {
            return false;
        };
        sqlx::query_scalar::<_, i64>("SELECT 1")
            .fetch_one(&mut *conn)
            .await
            .is_ok()
    }

    async fn close(&self) {
        if !self.pool.is_closed() {
            self.pool.close().await;
            info!("sqlite pool closed");
        }
    }

    fn backend(&self) -> &'static str {
        "sqlite"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database_ops::gallery::testing::{detail_body, ScriptedApi};
    use crate::database_ops::gallery::{ingest, IngestOutcome};

    fn post(id: &str, images: &[&str]) -> NewPost {
        NewPost {
            post_id: id.to_string(),
            title: Some(format!("title {id}")),
            description: None,
            user_nick: Some("nick".into()),
            signature: None,
            images: images.iter().map(|s| s.to_string()).collect(),
        }
    }

    async fn store() -> SqliteStore {
        let store = SqliteStore::in_memory().await.unwrap();
        store.ensure_schema().await.unwrap();
        store
    }

    #[tokio::test]
    async fn schema_is_idempotent() {
        let store = store().await;
        store.ensure_schema().await.unwrap();
        store.ensure_schema().await.unwrap();
        assert!(store.ping().await);
    }

    #[tokio::test]
    async fn insert_writes_post_then_images() {
        let store = store().await;
        let outcome = store
            .insert_post(&post("p1", &["a.jpg", "b.jpg", "c.jpg"]))
            .await
            .unwrap();
        assert_eq!(outcome, InsertOutcome::Inserted { images: 3 });

        let stored = store.get_post("p1").await.unwrap().unwrap();
        assert_eq!(stored.images, vec!["a.jpg", "b.jpg", "c.jpg"]);
        assert_eq!(stored.description, None);
        assert_eq!(store.count_images("p1").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn duplicate_insert_writes_nothing() {
        let store = store().await;
        store.insert_post(&post("p1", &["a.jpg"])).await.unwrap();
        let again = store
            .insert_post(&post("p1", &["x.jpg", "y.jpg"]))
            .await
            .unwrap();
        assert_eq!(again, InsertOutcome::AlreadyExists);
        assert_eq!(store.count_images("p1").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn images_require_existing_post() {
        let store = store().await;
        let orphan = sqlx::query("INSERT INTO images (post_id, url) VALUES ('ghost', 'u')")
            .execute(&store.pool)
            .await;
        assert!(orphan.is_err(), "foreign key must reject orphan images");
    }

    #[tokio::test]
    async fn existing_ids_single_query() {
        let store = store().await;
        store.insert_post(&post("A", &[])).await.unwrap();
        store.insert_post(&post("B", &[])).await.unwrap();
        let ids: Vec<String> = ["A", "B", "C"].iter().map(|s| s.to_string()).collect();
        let found = store.existing_post_ids(&ids).await.unwrap();
        assert_eq!(found.len(), 2);
        assert!(found.contains("A") && found.contains("B"));
    }

    #[tokio::test]
    async fn existing_ids_span_several_chunks() {
        let store = store().await;
        for id in ["id-3", "id-750", "id-1499"] {
            store.insert_post(&post(id, &[])).await.unwrap();
        }
        let ids: Vec<String> = (0..1500).map(|i| format!("id-{i}")).collect();
        let found = store.existing_post_ids(&ids).await.unwrap();
        assert_eq!(found.len(), 3);
        assert!(found.contains("id-750") && found.contains("id-1499"));
    }

    #[tokio::test]
    async fn image_failure_rolls_back_whole_post() {
        let store = store().await;
        sqlx::query(
            "CREATE TRIGGER reject_second_image BEFORE INSERT ON images
             WHEN NEW.url = 'b.jpg'
             BEGIN SELECT RAISE(ABORT, 'boom'); END",
        )
        .execute(&store.pool)
        .await
        .unwrap();

        let err = store
            .insert_post(&post("p1", &["a.jpg", "b.jpg", "c.jpg"]))
            .await
            .unwrap_err();
        assert!(format!("{err:#}").contains("boom"));
        assert!(store.get_post("p1").await.unwrap().is_none());
        assert_eq!(store.count_images("p1").await.unwrap(), 0);

        let api = ScriptedApi::new(vec![]).detail("p2", detail_body("p2", &["a.jpg", "b.jpg"]));
        match ingest(&store, &api, "p2").await {
            IngestOutcome::Failed { reason } => assert!(reason.contains("boom")),
            other => panic!("expected failure, got {other:?}"),
        }
        assert!(store.get_post("p2").await.unwrap().is_none());
        assert_eq!(store.count_images("p2").await.unwrap(), 0);
        assert!(store.existing_post_ids(&["p2".to_string()]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn listing_pages_and_counts_images() {
        let store = store().await;
        store.insert_post(&post("p1", &["a", "b"])).await.unwrap();
        store.insert_post(&post("p2", &[])).await.unwrap();
        store.insert_post(&post("p3", &["c"])).await.unwrap();

        let first = store.list_posts(1, 2).await.unwrap();
        assert_eq!(first.total, 3);
        assert_eq!(first.posts.len(), 2);
        let second = store.list_posts(2, 2).await.unwrap();
        assert_eq!(second.posts.len(), 1);

        let all = store.list_posts(1, 10).await.unwrap();
        let p1 = all.posts.iter().find(|p| p.post_id == "p1").unwrap();
        assert_eq!(p1.image_count, 2);
        let p2 = all.posts.iter().find(|p| p.post_id == "p2").unwrap();
        assert_eq!(p2.image_count, 0);
    }

    #[tokio::test]
    async fn unknown_post_is_none_and_close_is_idempotent() {
        let store = store().await;
        assert!(store.get_post("missing").await.unwrap().is_none());
        store.close().await;
        store.close().await;
        assert!(!store.ping().await);
    }
}
