use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A post as extracted from the upstream detail endpoint, ready to insert.
///
/// Optional text fields stay `None` when the upstream omits them so they land
/// as SQL `NULL` rather than empty strings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewPost {
    pub post_id: String,
    pub title: Option<String>,
    pub description: Option<String>,
    pub user_nick: Option<String>,
    pub signature: Option<String>,
    pub images: Vec<String>,
}

/// Row shape returned by post listings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostSummary {
    pub post_id: String,
    pub title: Option<String>,
    pub description: Option<String>,
    pub user_nick: Option<String>,
    pub signature: Option<String>,
    pub image_count: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostWithImages {
    pub post_id: String,
    pub title: Option<String>,
    pub description: Option<String>,
    pub user_nick: Option<String>,
    pub signature: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Image URLs in insertion order.
    pub images: Vec<String>,
}

/// One page of stored posts plus the total row count.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostPage {
    pub posts: Vec<PostSummary>,
    pub total: i64,
    pub page: i64,
    pub page_size: i64,
}

/// Result of the two-table insert for one post.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted { images: usize },
    /// The post row was already present; nothing was written.
    AlreadyExists,
}
