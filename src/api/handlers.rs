// HTTP request handlers for API endpoints

use crate::api::models::*;
use crate::api::server::AppState;
use actix_web::{web, HttpResponse, Result};

/// Health check endpoint
pub async fn health_check(state: web::Data<AppState>) -> Result<HttpResponse> {
    let store = state.syncer.store();
    let connected = store.ping().await;

    let response = ApiResponse::success(HealthResponse {
        status: if connected { "healthy" } else { "degraded" }.to_string(),
        database: if connected { "connected" } else { "disconnected" }.to_string(),
        backend: store.backend().to_string(),
        uptime_seconds: state.started_at.elapsed().as_secs(),
    });

    if connected {
        Ok(HttpResponse::Ok().json(response))
    } else {
        Ok(HttpResponse::ServiceUnavailable().json(response))
    }
}

/// Stored posts, newest first
pub async fn list_posts(
    query: web::Query<PageQuery>,
    state: web::Data<AppState>,
) -> Result<HttpResponse> {
    match state
        .syncer
        .store()
        .list_posts(query.page, query.page_size)
        .await
    {
        Ok(page) => Ok(HttpResponse::Ok().json(ApiResponse::success(page))),
        Err(err) => {
            tracing::error!(error = %format!("{err:#}"), "listing posts failed");
            Ok(HttpResponse::InternalServerError()
                .json(ApiResponse::<()>::error("failed to list posts")))
        }
    }
}

/// One post with its image URLs in insertion order
pub async fn get_post(path: web::Path<String>, state: web::Data<AppState>) -> Result<HttpResponse> {
    let post_id = path.into_inner();
    match state.syncer.store().get_post(&post_id).await {
        Ok(Some(post)) => Ok(HttpResponse::Ok().json(ApiResponse::success(post))),
        Ok(None) => Ok(HttpResponse::NotFound()
            .json(ApiResponse::<()>::error(format!("post {post_id} not found")))),
        Err(err) => {
            tracing::error!(post_id, error = %format!("{err:#}"), "loading post failed");
            Ok(HttpResponse::InternalServerError()
                .json(ApiResponse::<()>::error("failed to load post")))
        }
    }
}

/// Kick off a background sync unless one is already running
pub async fn trigger_sync(state: web::Data<AppState>) -> Result<HttpResponse> {
    if state.syncer.try_start() {
        tracing::info!("manual sync triggered");
        Ok(HttpResponse::Accepted().json(ApiResponse::success(SyncTriggerResponse {
            started: true,
            message: "sync started".to_string(),
        })))
    } else {
        Ok(HttpResponse::Conflict().json(ApiResponse::success(SyncTriggerResponse {
            started: false,
            message: "sync already running".to_string(),
        })))
    }
}

pub async fn sync_status(state: web::Data<AppState>) -> Result<HttpResponse> {
    let sync_state = state.syncer.state().await;
    Ok(HttpResponse::Ok().json(ApiResponse::success(sync_state)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::routes;
    use crate::database_ops::db::PostStore;
    use crate::database_ops::gallery::testing::{detail_body, Page, ScriptedApi};
    use crate::database_ops::gallery::{parse_detail, SyncOptions};
    use crate::database_ops::sqlite::SqliteStore;
    use crate::orchestrator::Syncer;
    use actix_web::{test, App};
    use serde_json::Value;
    use std::sync::Arc;
    use std::time::Instant;

    async fn state_with(ids: &[&str], api: ScriptedApi) -> web::Data<AppState> {
        let store = SqliteStore::in_memory().await.unwrap();
        store.ensure_schema().await.unwrap();
        for id in ids {
            let post = parse_detail(id, &detail_body(id, &["one.jpg", "two.jpg"])).unwrap();
            store.insert_post(&post).await.unwrap();
        }
        let syncer = Syncer::new(Arc::new(store), Arc::new(api), "u", SyncOptions::default());
        web::Data::new(AppState {
            syncer: Arc::new(syncer),
            started_at: Instant::now(),
        })
    }

    #[actix_web::test]
    async fn health_reports_connected_store() {
        let state = state_with(&[], ScriptedApi::default()).await;
        let app = test::init_service(
            App::new()
                .app_data(state.clone())
                .configure(routes::configure_routes),
        )
        .await;

        let req = test::TestRequest::get().uri("/health").to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["success"], true);
        assert_eq!(body["data"]["database"], "connected");
        assert_eq!(body["data"]["backend"], "sqlite");
        assert!(body["meta"]["request_id"].is_string());
    }

    #[actix_web::test]
    async fn lists_posts_with_image_counts() {
        let state = state_with(&["p1", "p2", "p3"], ScriptedApi::default()).await;
        let app = test::init_service(
            App::new()
                .app_data(state.clone())
                .configure(routes::configure_routes),
        )
        .await;

        let req = test::TestRequest::get()
            .uri("/api/v1/posts?page=1&page_size=2")
            .to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["data"]["total"], 3);
        assert_eq!(body["data"]["page_size"], 2);
        let posts = body["data"]["posts"].as_array().unwrap();
        assert_eq!(posts.len(), 2);
        assert_eq!(posts[0]["image_count"], 2);
    }

    #[actix_web::test]
    async fn post_detail_and_not_found() {
        let state = state_with(&["p1"], ScriptedApi::default()).await;
        let app = test::init_service(
            App::new()
                .app_data(state.clone())
                .configure(routes::configure_routes),
        )
        .await;

        let req = test::TestRequest::get().uri("/api/v1/posts/p1").to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["data"]["post_id"], "p1");
        assert_eq!(
            body["data"]["images"],
            serde_json::json!(["one.jpg", "two.jpg"])
        );

        let req = test::TestRequest::get()
            .uri("/api/v1/posts/missing")
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), 404);
    }

    #[actix_web::test]
    async fn sync_trigger_conflicts_while_running() {
        let api =
            ScriptedApi::new(vec![Page::Posts(vec!["n1"])]).detail("n1", detail_body("n1", &[]));
        let state = state_with(&[], api).await;
        let app = test::init_service(
            App::new()
                .app_data(state.clone())
                .configure(routes::configure_routes),
        )
        .await;

        let held = state.syncer.hold_gate().await;
        let req = test::TestRequest::post().uri("/api/v1/sync").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), 409);
        drop(held);

        let req = test::TestRequest::post().uri("/api/v1/sync").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), 202);

        // Queue behind the background run so its summary is in place.
        state.syncer.run().await.unwrap();
        let req = test::TestRequest::get().uri("/api/v1/sync/status").to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["data"]["running"], false);
        assert_eq!(body["data"]["last"]["status"], "completed");
        assert!(state.syncer.store().get_post("n1").await.unwrap().is_some());
    }
}
