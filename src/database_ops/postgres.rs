use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{
    pool::PoolConnection,
    postgres::{PgConnectOptions, PgPoolOptions},
    PgPool, Postgres, Row,
};
use std::collections::HashSet;
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, instrument, warn};

use crate::database_ops::db::{page_window, PostStore};
use crate::database_ops::models::{
    InsertOutcome, NewPost, PostPage, PostSummary, PostWithImages,
};

const SCHEMA: [&str; 4] = [
    "CREATE TABLE IF NOT EXISTS posts (
        post_id VARCHAR(32) PRIMARY KEY,
        title TEXT,
        description TEXT,
        user_nick TEXT,
        signature TEXT,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )",
    "CREATE TABLE IF NOT EXISTS images (
        image_id BIGSERIAL PRIMARY KEY,
        post_id VARCHAR(32) NOT NULL REFERENCES posts(post_id),
        url TEXT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )",
    "CREATE INDEX IF NOT EXISTS idx_images_post_id ON images(post_id)",
    "CREATE INDEX IF NOT EXISTS idx_posts_created_at ON posts(created_at)",
];

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    // SECURITY: never include raw DSNs in tracing spans (they may contain credentials).
    #[instrument(skip(database_url))]
    pub async fn connect(database_url: &str, database: &str, max_connections: u32) -> Result<Self> {
        let connect_options = PgConnectOptions::from_str(database_url)
            .context("invalid postgres connection string")?;

        if let Err(err) = create_database_if_missing(&connect_options, database).await {
            // The role may lack access to the maintenance db while the target already exists.
            warn!(error = %err, database, "could not verify/create database; connecting anyway");
        }

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .idle_timeout(Duration::from_secs(600))
            .connect_with(connect_options)
            .await
            .with_context(|| format!("failed to connect to database {database}"))?;
        info!(database, "connected to postgres");
        Ok(Self { pool })
    }

    /// One pooled connection; errors when the pool is exhausted or closed.
    pub async fn acquire(&self) -> Result<PoolConnection<Postgres>> {
        self.pool
            .acquire()
            .await
            .context("failed to acquire postgres connection")
    }
}

async fn create_database_if_missing(options: &PgConnectOptions, database: &str) -> Result<()> {
    let admin = PgPoolOptions::new()
        .max_connections(1)
        .acquire_timeout(Duration::from_secs(10))
        .connect_with(options.clone().database("postgres"))
        .await
        .context("connect to maintenance database")?;

    let exists: bool =
        sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM pg_database WHERE datname = $1)")
            .bind(database)
            .fetch_one(&admin)
            .await?;
    if !exists {
        // CREATE DATABASE cannot take bind parameters or run inside a transaction.
        let stmt = format!("CREATE DATABASE {}", quote_ident(database)?);
        sqlx::raw_sql(&stmt).execute(&admin).await?;
        info!(database, "database created");
    } else {
        info!(database, "database already exists");
    }
    admin.close().await;
    Ok(())
}

fn quote_ident(name: &str) -> Result<String> {
    if name.is_empty() || name.contains('\0') {
        return Err(anyhow!("invalid database name {name:?}"));
    }
    Ok(format!("\"{}\"", name.replace('"', "\"\"")))
}

#[async_trait]
impl PostStore for PgStore {
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
        let rows: Vec<String> =
            sqlx::query_scalar("SELECT post_id FROM posts WHERE post_id = ANY($1)")
                .bind(ids)
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().collect())
    }

    #[instrument(skip(self, post), fields(post_id = %post.post_id))]
    async fn insert_post(&self, post: &NewPost) -> Result<InsertOutcome> {
        let mut tx = self.pool.begin().await?;
        let inserted = sqlx::query(
            "INSERT INTO posts (post_id, title, description, user_nick, signature)
             VALUES ($1, $2, $3, $4, $5)
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
            sqlx::query("INSERT INTO images (post_id, url) VALUES ($1, $2)")
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
             LIMIT $1 OFFSET $2",
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
                created_at: r.try_get::<DateTime<Utc>, _>("created_at")?,
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
             FROM posts WHERE post_id = $1",
        )
        .bind(post_id)
        .fetch_optional(&self.pool)
        .await?
        else {
            return Ok(None);
        };

        let images: Vec<String> =
            sqlx::query_scalar("SELECT url FROM images WHERE post_id = $1 ORDER BY image_id")
                .bind(post_id)
                .fetch_all(&self.pool)
                .await?;

        Ok(Some(PostWithImages {
            post_id: r.try_get("post_id")?,
            title: r.try_get("title")?,
            description: r.try_get("description")?,
            user_nick: r.try_get("user_nick")?,
            signature: r.try_get("signature")?,
            created_at: r.try_get::<DateTime<Utc>, _>("created_at")?,
            images,
        }))
    }

    async fn count_images(&self, post_id: &str) -> Result<i64> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM images WHERE post_id = $1")
            .bind(post_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(n)
    }

    async fn ping(&self) -> bool {
        let Ok(mut conn) = self.acquire().await else {
            return false;
        };
        sqlx::query_scalar::<_, i32>("SELECT 1")
            .fetch_one(&mut *conn)
            .await
            .is_ok()
    }

    async fn close(&self) {
        if !self.pool.is_closed() {
            self.pool.close().await;
            info!("postgres pool closed");
        }
    }

    fn backend(&self) -> &'static str {
        "postgres"
    }
}
