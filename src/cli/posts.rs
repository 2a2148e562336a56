use anyhow::Result;
use std::fmt::Write as _;

use crate::config::DatabaseSettings;
use crate::database_ops::db::{self, PostStore};

#[derive(Debug, Clone)]
pub struct PostsConfig {
    pub page: i64,
    pub page_size: i64,
}

impl Default for PostsConfig {
    fn default() -> Self {
        Self {
            page: 1,
            page_size: 20,
        }
    }
}

fn or_dash(v: &Option<String>) -> &str {
    v.as_deref().unwrap_or("-")
}

/// Text table of one listing page.
pub async fn render_page(store: &dyn PostStore, cfg: &PostsConfig) -> Result<String> {
    let page = store.list_posts(cfg.page, cfg.page_size).await?;
    let mut out = String::new();
    writeln!(
        out,
        "posts: {} total (page {}, {} per page)",
        page.total, page.page, page.page_size
    )?;
    for p in &page.posts {
        writeln!(
            out,
            "{:<20} {:>4} img  {}  {}",
            p.post_id,
            p.image_count,
            p.created_at.format("%Y-%m-%d %H:%M"),
            or_dash(&p.title)
        )?;
    }
    Ok(out)
}

/// Full record of one post, `None` when it is not stored.
pub async fn render_post(store: &dyn PostStore, post_id: &str) -> Result<Option<String>> {
    let Some(post) = store.get_post(post_id).await? else {
        return Ok(None);
    };
    let mut out = String::new();
    writeln!(out, "post_id:     {}", post.post_id)?;
    writeln!(out, "title:       {}", or_dash(&post.title))?;
    writeln!(out, "description: {}", or_dash(&post.description))?;
    writeln!(out, "user_nick:   {}", or_dash(&post.user_nick))?;
    writeln!(out, "signature:   {}", or_dash(&post.signature))?;
    writeln!(out, "created_at:  {}", post.created_at.to_rfc3339())?;
    writeln!(out, "images ({}):", post.images.len())?;
    for url in &post.images {
        writeln!(out, "  {url}")?;
    }
    Ok(Some(out))
}

pub async fn run_list(settings: &DatabaseSettings, cfg: PostsConfig) -> Result<()> {
    let store = db::connect(settings).await?;
    let rendered = render_page(store.as_ref(), &cfg).await;
    store.close().await;
    print!("{}", rendered?);
    Ok(())
}

pub async fn run_show(settings: &DatabaseSettings, post_id: &str) -> Result<()> {
    let store = db::connect(settings).await?;
    let rendered = render_post(store.as_ref(), post_id).await;
    store.close().await;
    match rendered? {
        Some(text) => {
            print!("{text}");
            Ok(())
        }
        None => anyhow::bail!("post {post_id} not found"),
    }
}
