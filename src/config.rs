//! Runtime settings resolved from the environment.

use anyhow::{anyhow, Context, Result};
use std::fmt;

use crate::database_ops::gallery::PaginationPolicy;
use crate::util::env as env_util;

pub const DEFAULT_BASE_URL: &str = "https://gallery.vivo.com.cn";
const DEFAULT_POOL_SIZE: u32 = 5;

/// Keys that must be present when no `DATABASE_URL` override is given.
pub const REQUIRED_DB_KEYS: [&str; 6] = [
    "DB_HOST",
    "DB_PORT",
    "DB_NAME",
    "DB_USER",
    "DB_PASSWORD",
    "DB_POOL_SIZE",
];

#[derive(Clone)]
pub struct DatabaseSettings {
    pub url: String,
    /// Target database; `None` for SQLite.
    pub database: Option<String>,
    pub pool_size: u32,
}

impl fmt::Debug for DatabaseSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseSettings")
            .field("url", &env_util::redact_dsn(&self.url))
            .field("database", &self.database)
            .field("pool_size", &self.pool_size)
            .finish()
    }
}

impl DatabaseSettings {
    /// Database settings alone, for commands that only read the store.
    pub fn from_env() -> Result<Self> {
        env_util::init_env();
        Self::from_lookup(env_util::env_opt)
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let missing = missing_db_keys(&get);
        if !missing.is_empty() {
            return Err(anyhow!("missing required env: {:?}", missing));
        }
        Self::resolve(&get)
    }

    fn resolve<G>(get: &G) -> Result<Self>
    where
        G: Fn(&str) -> Option<String>,
    {
        if let Some(url) = get("DATABASE_URL") {
            let url = url.trim().to_string();
            let pool_size = match get("DB_POOL_SIZE") {
                Some(raw) => parse_pool_size(&raw)?,
                None => DEFAULT_POOL_SIZE,
            };
            let database = if url.starts_with("sqlite:") {
                None
            } else if url.starts_with("postgres://") || url.starts_with("postgresql://") {
                Some(
                    env_util::database_name(&url)
                        .ok_or_else(|| anyhow!("DATABASE_URL has no database name"))?,
                )
            } else {
                return Err(anyhow!(
                    "DATABASE_URL must use a postgres:// or sqlite: scheme"
                ));
            };
            return Ok(Self {
                url,
                database,
                pool_size,
            });
        }

        let req = |key: &str| get(key).unwrap_or_default();
        let port: u16 = req("DB_PORT")
            .trim()
            .parse()
            .with_context(|| format!("invalid DB_PORT {:?}", req("DB_PORT")))?;
        let name = req("DB_NAME").trim().to_string();
        let ssl_mode = get("DB_SSLMODE").unwrap_or_else(|| "prefer".into());
        let url = env_util::build_pg_dsn(
            &req("DB_HOST"),
            port,
            &name,
            req("DB_USER").trim(),
            Some(&req("DB_PASSWORD")),
            Some(ssl_mode.trim()),
        )?;
        Ok(Self {
            url,
            database: Some(name),
            pool_size: parse_pool_size(&req("DB_POOL_SIZE"))?,
        })
    }

    pub fn is_sqlite(&self) -> bool {
        self.url.starts_with("sqlite:")
    }
}

/// Component keys still unset; empty when `DATABASE_URL` overrides them.
fn missing_db_keys<G>(get: &G) -> Vec<&'static str>
where
    G: Fn(&str) -> Option<String>,
{
    if get("DATABASE_URL").is_some() {
        return Vec::new();
    }
    REQUIRED_DB_KEYS
        .into_iter()
        .filter(|key| get(*key).is_none())
        .collect()
}

#[derive(Debug, Clone)]
pub struct HttpSettings {
    pub base_url: String,
    pub timeout_secs: u64,
    pub request_delay_ms: u64,
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub user_id: String,
    pub database: DatabaseSettings,
    pub http: HttpSettings,
    pub pagination: PaginationPolicy,
}

impl Settings {
    /// Resolve settings from the process environment (after dotenv).
    pub fn from_env() -> Result<Self> {
        env_util::init_env();
        Self::from_lookup(env_util::env_opt)
    }

    /// Resolve settings through an arbitrary key lookup; empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let mut missing: Vec<&str> = Vec::new();
        let user_id = get("GALLERY_USER_ID");
        if user_id.is_none() {
            missing.push("GALLERY_USER_ID");
        }
        missing.extend(missing_db_keys(&get));
        if !missing.is_empty() {
            return Err(anyhow!("missing required env: {:?}", missing));
        }

        let database = DatabaseSettings::resolve(&get)?;

        let base_url = get("GALLERY_BASE_URL")
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
            .trim()
            .trim_end_matches('/')
            .to_string();
        let timeout_secs = parse_or(
            "GALLERY_HTTP_TIMEOUT_SECS",
            get("GALLERY_HTTP_TIMEOUT_SECS"),
            30,
        )?;
        let request_delay_ms = parse_or(
            "GALLERY_REQUEST_DELAY_MS",
            get("GALLERY_REQUEST_DELAY_MS"),
            0,
        )?;
        let pagination = match get("GALLERY_STRICT_PAGINATION") {
            Some(raw) if env_util::parse_flag(&raw) => PaginationPolicy::Strict,
            _ => PaginationPolicy::Lenient,
        };

        Ok(Self {
            user_id: user_id.unwrap_or_default().trim().to_string(),
            database,
            http: HttpSettings {
                base_url,
                timeout_secs,
                request_delay_ms,
            },
            pagination,
        })
    }
}

fn parse_pool_size(raw: &str) -> Result<u32> {
    let size: u32 = raw
        .trim()
        .parse()
        .with_context(|| format!("invalid DB_POOL_SIZE {raw:?}"))?;
    if size == 0 {
        return Err(anyhow!("DB_POOL_SIZE must be at least 1"));
    }
    Ok(size)
}

fn parse_or(key: &str, raw: Option<String>, default: u64) -> Result<u64> {
    match raw {
        Some(v) => v
            .trim()
            .parse()
            .with_context(|| format!("invalid {key} {v:?}")),
        None => Ok(default),
    }
}
