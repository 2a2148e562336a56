pub mod provider;

pub use provider::{
    parse_detail, parse_listing, Clock, FetchError, FixedClock, GalleryApi, GalleryProvider,
    SystemClock,
};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashSet;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::database_ops::db::PostStore;
use crate::database_ops::models::InsertOutcome;

/// What a failed listing request does to the walk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PaginationPolicy {
    /// Stop the walk and keep the IDs gathered so far.
    #[default]
    Lenient,
    /// Fail the whole run.
    Strict,
}

#[derive(Debug, Clone, Default)]
pub struct SyncOptions {
    pub pagination: PaginationPolicy,
    /// Pause between consecutive upstream requests.
    pub request_delay: Duration,
}

/// IDs collected by one pagination walk.
#[derive(Debug, Clone, Default)]
pub struct PageWalk {
    pub ids: Vec<String>,
    /// Listing requests issued, including the terminal one.
    pub requests: u32,
    /// Set when a lenient walk stopped on a failed page.
    pub truncated: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum IngestOutcome {
    Inserted { images: usize },
    SkippedDuplicate,
    Failed { reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    /// The listing produced no candidates; nothing else ran.
    NoPosts,
    Completed,
}

#[derive(Debug, Clone)]
pub struct SyncReport {
    pub status: SyncStatus,
    pub candidates: usize,
    pub new_candidates: usize,
    pub outcomes: Vec<(String, IngestOutcome)>,
    pub truncated: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FailedPost {
    pub post_id: String,
    pub reason: String,
}

/// Serializable digest of a run for logs and the status endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct SyncSummary {
    pub status: SyncStatus,
    pub candidates: usize,
    pub new_candidates: usize,
    pub inserted: usize,
    pub skipped: usize,
    pub failed: usize,
    pub images: usize,
    pub truncated: Option<String>,
    pub failures: Vec<FailedPost>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl SyncReport {
    pub fn inserted(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|(_, o)| matches!(o, IngestOutcome::Inserted { .. }))
            .count()
    }

    pub fn skipped(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|(_, o)| matches!(o, IngestOutcome::SkippedDuplicate))
            .count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|(_, o)| matches!(o, IngestOutcome::Failed { .. }))
            .count()
    }

    pub fn images(&self) -> usize {
        self.outcomes
            .iter()
            .map(|(_, o)| match o {
                IngestOutcome::Inserted { images } => *images,
                _ => 0,
            })
            .sum()
    }

    pub fn summary(&self) -> SyncSummary {
        SyncSummary {
            status: self.status,
            candidates: self.candidates,
            new_candidates: self.new_candidates,
            inserted: self.inserted(),
            skipped: self.skipped(),
            failed: self.failed(),
            images: self.images(),
            truncated: self.truncated.clone(),
            failures: self
                .outcomes
                .iter()
                .filter_map(|(id, o)| match o {
                    IngestOutcome::Failed { reason } => Some(FailedPost {
                        post_id: id.clone(),
                        reason: reason.clone(),
                    }),
                    _ => None,
                })
                .collect(),
            started_at: self.started_at,
            finished_at: self.finished_at,
        }
    }
}

async fn pace(delay: Duration) {
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
}

/// Walk the listing from page 1 until a page has no `data.posts` or an empty batch.
pub async fn list_all_posts(
    api: &dyn GalleryApi,
    user_id: &str,
    options: &SyncOptions,
) -> Result<PageWalk> {
    let mut walk = PageWalk::default();
    let mut page_no: u32 = 1;
    loop {
        if page_no > 1 {
            pace(options.request_delay).await;
        }
        walk.requests += 1;
        match api.fetch_page(user_id, page_no).await {
            Ok(Some(batch)) if !batch.is_empty() => {
                debug!(page_no, batch = batch.len(), "listing page");
                walk.ids.extend(batch);
                page_no += 1;
            }
            Ok(_) => {
                debug!(page_no, "listing exhausted");
                break;
            }
            Err(err) => match options.pagination {
                PaginationPolicy::Lenient => {
                    warn!(
                        page_no,
                        error = %err,
                        kept = walk.ids.len(),
                        "listing page failed; keeping posts gathered so far"
                    );
                    walk.truncated = Some(format!("page {page_no}: {err}"));
                    break;
                }
                PaginationPolicy::Strict => {
                    return Err(anyhow::Error::new(err)
                        .context(format!("listing page {page_no} failed")));
                }
            },
        }
    }
    info!(
        user_id,
        posts = walk.ids.len(),
        requests = walk.requests,
        "listing walk finished"
    );
    Ok(walk)
}

/// Drop candidates that already have a post row, preserving order.
pub async fn filter_new(store: &dyn PostStore, ids: &[String]) -> Result<Vec<String>> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }
    let existing: HashSet<String> = store
        .existing_post_ids(ids)
        .await
        .context("query existing post ids")?;
    Ok(ids
        .iter()
        .filter(|id| !existing.contains(id.as_str()))
        .cloned()
        .collect())
}

/// Fetch one post's detail and persist it with its images.
///
/// Failures are contained to this post and reported in the outcome.
pub async fn ingest(store: &dyn PostStore, api: &dyn GalleryApi, post_id: &str) -> IngestOutcome {
    let post = match api.fetch_detail(post_id).await {
        Ok(p) => p,
        Err(err) => {
            warn!(post_id, error = %err, "detail fetch failed; skipping post");
            return IngestOutcome::Failed {
                reason: err.to_string(),
            };
        }
    };

    match store.insert_post(&post).await {
        Ok(InsertOutcome::Inserted { images }) => {
            info!(
                post_id,
                title = post.title.as_deref().unwrap_or(""),
                images,
                "new post stored"
            );
            IngestOutcome::Inserted { images }
        }
        Ok(InsertOutcome::AlreadyExists) => {
            info!(post_id, "post already stored; skipping");
            IngestOutcome::SkippedDuplicate
        }
        Err(err) => {
            warn!(post_id, error = %format!("{err:#}"), "storing post failed; skipping");
            IngestOutcome::Failed {
                reason: format!("{err:#}"),
            }
        }
    }
}

/// One full pass: schema, listing walk, dedup, per-post ingest.
pub async fn sync(
    store: &dyn PostStore,
    api: &dyn GalleryApi,
    user_id: &str,
    options: &SyncOptions,
) -> Result<SyncReport> {
    let started_at = Utc::now();
    store.ensure_schema().await.context("ensure schema")?;

    let walk = list_all_posts(api, user_id, options).await?;
    let mut report = SyncReport {
        status: SyncStatus::Completed,
        candidates: walk.ids.len(),
        new_candidates: 0,
        outcomes: Vec::new(),
        truncated: walk.truncated,
        started_at,
        finished_at: started_at,
    };

    if walk.ids.is_empty() {
        info!(user_id, "no posts found");
        report.status = SyncStatus::NoPosts;
        report.finished_at = Utc::now();
        return Ok(report);
    }

    let fresh = filter_new(store, &walk.ids).await?;
    report.new_candidates = fresh.len();
    info!(
        found = walk.ids.len(),
        new = fresh.len(),
        "candidate posts filtered"
    );

    let total = fresh.len();
    for (i, post_id) in fresh.iter().enumerate() {
        if i > 0 {
            pace(options.request_delay).await;
        }
        let outcome = ingest(store, api, post_id).await;
        report.outcomes.push((post_id.clone(), outcome));
        if (i + 1) % 10 == 0 {
            info!(done = i + 1, total, "ingest progress");
        }
    }

    report.finished_at = Utc::now();
    info!(
        inserted = report.inserted(),
        skipped = report.skipped(),
        failed = report.failed(),
        images = report.images(),
        truncated = report.truncated.is_some(),
        elapsed_ms = (report.finished_at - report.started_at).num_milliseconds(),
        "sync finished"
    );
    Ok(report)
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::database_ops::models::NewPost;
    use serde_json::Value;
    use std::collections::HashMap;
    use std::sync::Mutex;

    pub enum Page {
        Posts(Vec<&'static str>),
        Absent,
        Fail,
    }

    /// Scripted upstream: pages by number, detail bodies by post ID.
    #[derive(Default)]
    pub struct ScriptedApi {
        pages: Vec<Page>,
        details: HashMap<String, Value>,
        pub page_calls: Mutex<Vec<u32>>,
        pub detail_calls: Mutex<Vec<String>>,
    }

    impl ScriptedApi {
        pub fn new(pages: Vec<Page>) -> Self {
            Self {
                pages,
                ..Default::default()
            }
        }

        pub fn detail(mut self, id: &str, body: Value) -> Self {
            self.details.insert(id.to_string(), body);
            self
        }

        pub fn page_call_count(&self) -> usize {
            self.page_calls.lock().unwrap().len()
        }

        pub fn detail_call_count(&self) -> usize {
            self.detail_calls.lock().unwrap().len()
        }
    }

    #[async_trait::async_trait]
    impl GalleryApi for ScriptedApi {
        async fn fetch_page(
            &self,
            _user_id: &str,
            page_no: u32,
        ) -> Result<Option<Vec<String>>, FetchError> {
            self.page_calls.lock().unwrap().push(page_no);
            match self.pages.get(page_no as usize - 1) {
                Some(Page::Posts(ids)) => Ok(Some(ids.iter().map(|s| s.to_string()).collect())),
                Some(Page::Absent) | None => Ok(None),
                Some(Page::Fail) => Err(FetchError::Status {
                    status: 503,
                    url: format!("listing page {page_no}"),
                    body: String::new(),
                }),
            }
        }

        async fn fetch_detail(&self, post_id: &str) -> Result<NewPost, FetchError> {
            self.detail_calls.lock().unwrap().push(post_id.to_string());
            match self.details.get(post_id) {
                Some(body) => parse_detail(post_id, body),
                None => Err(FetchError::Status {
                    status: 502,
                    url: format!("detail {post_id}"),
                    body: String::new(),
                }),
            }
        }
    }

    pub fn detail_body(id: &str, images: &[&str]) -> Value {
        serde_json::json!({"data": {"post": {
            "postId": id,
            "postTitle": format!("album {id}"),
            "postDesc": "desc",
            "userNick": "nick",
            "signature": "sig",
            "images": images,
        }}})
    }
}
