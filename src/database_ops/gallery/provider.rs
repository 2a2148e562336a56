use anyhow::Result;
use async_trait::async_trait;
use reqwest::{header, Client};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::DEFAULT_BASE_URL;
use crate::database_ops::models::NewPost;

fn truncate_for_log(mut s: String, max_len: usize) -> String {
    if s.len() > max_len {
        let mut cut = max_len;
        while !s.is_char_boundary(cut) {
            cut -= 1;
        }
        s.truncate(cut);
        s.push('…');
    }
    s
}

/// Source of the millisecond timestamps stamped onto listing requests.
pub trait Clock: Send + Sync {
    fn now_millis(&self) -> i64;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

/// Always reports the same instant.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub i64);

impl Clock for FixedClock {
    fn now_millis(&self) -> i64 {
        self.0
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected status {status} from {url}: {body}")]
    Status {
        status: u16,
        url: String,
        body: String,
    },
    #[error("malformed response: {0}")]
    Malformed(String),
}

/// Upstream gallery endpoints as seen by the sync pipeline.
#[async_trait]
pub trait GalleryApi: Send + Sync {
    /// One listing page. `Ok(None)` when the body carries no `data.posts`.
    async fn fetch_page(&self, user_id: &str, page_no: u32)
        -> Result<Option<Vec<String>>, FetchError>;

    /// Full detail of one post, fields already extracted.
    async fn fetch_detail(&self, post_id: &str) -> Result<NewPost, FetchError>;
}

/// HTTP client for the gallery H5 endpoints.
///
/// - GET  /gallery/wap/share/user/post/list/{user}.do  (paged listing)
/// - POST /gallery/wap/H5/post/getPostDetailById.do   (detail, `postId` in query)
#[derive(Clone)]
pub struct GalleryProvider {
    base_url: String,
    http: Client,
    clock: Arc<dyn Clock>,
}

impl GalleryProvider {
    pub fn new(base_url: Option<&str>, timeout_secs: Option<u64>) -> Result<Self> {
        let base_url = base_url
            .unwrap_or(DEFAULT_BASE_URL)
            .trim_end_matches('/')
            .to_string();
        let timeout_secs = timeout_secs.unwrap_or(30);
        let http = Client::builder()
            .user_agent(concat!("gallery-sync/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(timeout_secs))
            .build()?;

        Ok(Self {
            base_url,
            http,
            clock: Arc::new(SystemClock),
        })
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn listing_url(&self, user_id: &str) -> String {
        format!(
            "{}/gallery/wap/share/user/post/list/{}.do",
            self.base_url, user_id
        )
    }

    pub fn detail_url(&self) -> String {
        format!("{}/gallery/wap/H5/post/getPostDetailById.do", self.base_url)
    }

    /// Query parameters for one listing request; both timestamps share `now_ms`.
    pub fn listing_query(page_no: u32, now_ms: i64) -> Vec<(&'static str, String)> {
        vec![
            ("dataFrom", "1".to_string()),
            ("pageNo", page_no.to_string()),
            ("requestTime", now_ms.to_string()),
            ("searchType", "4".to_string()),
            ("t", now_ms.to_string()),
        ]
    }

    async fn read_json(resp: reqwest::Response, url: &str) -> Result<Value, FetchError> {
        let status = resp.status();
        if !status.is_success() {
            let body = truncate_for_log(resp.text().await.unwrap_or_default(), 500);
            return Err(FetchError::Status {
                status: status.as_u16(),
                url: url.to_string(),
                body,
            });
        }
        let text = resp.text().await?;
        serde_json::from_str(&text).map_err(|e| {
            FetchError::Malformed(format!(
                "invalid JSON from {url}: {e}; body={}",
                truncate_for_log(text, 200)
            ))
        })
    }
}

#[async_trait]
impl GalleryApi for GalleryProvider {
    async fn fetch_page(
        &self,
        user_id: &str,
        page_no: u32,
    ) -> Result<Option<Vec<String>>, FetchError> {
        let url = self.listing_url(user_id);
        let query = Self::listing_query(page_no, self.clock.now_millis());
        let resp = self
            .http
            .get(&url)
            .header(header::ACCEPT, "application/json")
            .query(&query)
            .send()
            .await?;
        let body = Self::read_json(resp, &url).await?;
        parse_listing(&body)
    }

    async fn fetch_detail(&self, post_id: &str) -> Result<NewPost, FetchError> {
        let url = self.detail_url();
        let resp = self
            .http
            .post(&url)
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .header(header::ACCEPT, "application/json")
            .query(&[("postId", post_id)])
            .send()
            .await?;
        let body = Self::read_json(resp, &url).await?;
        parse_detail(post_id, &body)
    }
}

/// Upstream IDs arrive as strings or bare numbers.
fn id_string(v: &Value) -> Option<String> {
    match v {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn opt_text(obj: &Value, key: &str) -> Option<String> {
    match obj.get(key)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn image_urls(obj: &Value) -> Vec<String> {
    let Some(arr) = obj.get("images").and_then(|v| v.as_array()) else {
        return Vec::new();
    };
    arr.iter()
        .filter_map(|item| {
            item.as_str()
                .or_else(|| item.get("url").and_then(|v| v.as_str()))
        })
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Extract post IDs from a listing body.
///
/// `Ok(None)` when `data` or `data.posts` is absent (or null): the end-of-list
/// signal. Entries without a usable `postId` are dropped.
pub fn parse_listing(body: &Value) -> Result<Option<Vec<String>>, FetchError> {
    let posts = match body.get("data").and_then(|d| d.get("posts")) {
        None | Some(Value::Null) => return Ok(None),
        Some(p) => p,
    };
    let Some(items) = posts.as_array() else {
        return Err(FetchError::Malformed("data.posts is not an array".into()));
    };
    let mut ids = Vec::with_capacity(items.len());
    for item in items {
        match item.get("postId").and_then(id_string) {
            Some(id) => ids.push(id),
            None => debug!(entry = %item, "listing entry without postId; skipping"),
        }
    }
    Ok(Some(ids))
}

/// Extract a post from a detail body. The requested ID is the row key; a body
/// without any usable `postId` is malformed.
pub fn parse_detail(requested_id: &str, body: &Value) -> Result<NewPost, FetchError> {
    let Some(post) = body
        .get("data")
        .and_then(|d| d.get("post"))
        .filter(|p| p.is_object())
    else {
        return Err(FetchError::Malformed(format!(
            "detail for post {requested_id} lacks data.post"
        )));
    };

    let Some(reported) = post.get("postId").and_then(id_string) else {
        return Err(FetchError::Malformed(format!(
            "detail for post {requested_id} lacks postId"
        )));
    };
    if reported != requested_id {
        warn!(requested_id, reported, "detail reports a different postId");
    }

    Ok(NewPost {
        post_id: requested_id.to_string(),
        title: opt_text(post, "postTitle"),
        description: opt_text(post, "postDesc"),
        user_nick: opt_text(post, "userNick"),
        signature: opt_text(post, "signature"),
        images: image_urls(post),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn listing_query_uses_one_timestamp() {
        let q = GalleryProvider::listing_query(3, 1_700_000_000_123);
        assert_eq!(
            q,
            vec![
                ("dataFrom", "1".to_string()),
                ("pageNo", "3".to_string()),
                ("requestTime", "1700000000123".to_string()),
                ("searchType", "4".to_string()),
                ("t", "1700000000123".to_string()),
            ]
        );
    }

    #[test]
    fn urls_follow_base() {
        let p = GalleryProvider::new(Some("http://127.0.0.1:8080/"), Some(5)).unwrap();
        assert_eq!(
            p.listing_url("42"),
            "http://127.0.0.1:8080/gallery/wap/share/user/post/list/42.do"
        );
        assert_eq!(
            p.detail_url(),
            "http://127.0.0.1:8080/gallery/wap/H5/post/getPostDetailById.do"
        );
    }

    #[test]
    fn clocks() {
        assert_eq!(FixedClock(42).now_millis(), 42);
        assert!(SystemClock.now_millis() > 1_600_000_000_000);

        let p = GalleryProvider::new(None, None)
            .unwrap()
            .with_clock(Arc::new(FixedClock(7)));
        assert_eq!(p.clock.now_millis(), 7);
        assert_eq!(p.base_url, DEFAULT_BASE_URL);
    }

    #[test]
    fn listing_accepts_string_and_numeric_ids() {
        let body = json!({"data": {"posts": [
            {"postId": "1001"},
            {"postId": 1002},
            {"title": "no id"},
            {"postId": ""}
        ]}});
        assert_eq!(
            parse_listing(&body).unwrap(),
            Some(vec!["1001".to_string(), "1002".to_string()])
        );
    }

    #[test]
    fn listing_end_signals() {
        assert_eq!(parse_listing(&json!({"code": 0})).unwrap(), None);
        assert_eq!(parse_listing(&json!({"data": {}})).unwrap(), None);
        assert_eq!(parse_listing(&json!({"data": {"posts": null}})).unwrap(), None);
        assert_eq!(
            parse_listing(&json!({"data": {"posts": []}})).unwrap(),
            Some(vec![])
        );
        assert!(parse_listing(&json!({"data": {"posts": "oops"}})).is_err());
    }

    #[test]
    fn detail_extracts_fields_and_images() {
        let body = json!({"data": {"post": {
            "postId": 77,
            "postTitle": "Sunset",
            "postDesc": "by the sea",
            "userNick": "lens",
            "signature": "hi",
            "images": ["https://img/1.jpg", {"url": "https://img/2.jpg"}, " ", null]
        }}});
        let post = parse_detail("77", &body).unwrap();
        assert_eq!(post.post_id, "77");
        assert_eq!(post.title.as_deref(), Some("Sunset"));
        assert_eq!(post.description.as_deref(), Some("by the sea"));
        assert_eq!(post.user_nick.as_deref(), Some("lens"));
        assert_eq!(post.signature.as_deref(), Some("hi"));
        assert_eq!(post.images, vec!["https://img/1.jpg", "https://img/2.jpg"]);
    }

    #[test]
    fn detail_missing_optionals_are_none() {
        let body = json!({"data": {"post": {"postId": "9", "postTitle": null}}});
        let post = parse_detail("9", &body).unwrap();
        assert_eq!(post.title, None);
        assert_eq!(post.description, None);
        assert_eq!(post.signature, None);
        assert!(post.images.is_empty());
    }

    #[test]
    fn detail_without_post_is_malformed() {
        let err = parse_detail("9", &json!({"data": {}})).unwrap_err();
        assert!(matches!(err, FetchError::Malformed(_)));
        assert!(parse_detail("9", &json!({"data": {"post": []}})).is_err());
    }

    #[test]
    fn detail_without_post_id_is_malformed() {
        let err = parse_detail("p1", &json!({"data": {"post": {}}})).unwrap_err();
        assert!(matches!(err, FetchError::Malformed(_)));
        let blank = json!({"data": {"post": {"postId": " ", "postTitle": "t"}}});
        assert!(matches!(
            parse_detail("p1", &blank),
            Err(FetchError::Malformed(_))
        ));
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let s = truncate_for_log("相册相册".to_string(), 4);
        assert_eq!(s, "相…");
    }
}
