// API route configuration

use crate::api::handlers;
use actix_web::web;

pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg.route("/health", web::get().to(handlers::health_check))
        .route("/", web::get().to(handlers::health_check))
        .service(
            web::scope("/api/v1")
                .route("/posts", web::get().to(handlers::list_posts))
                .route("/posts/{id}", web::get().to(handlers::get_post))
                .route("/sync", web::post().to(handlers::trigger_sync))
                .route("/sync/status", web::get().to(handlers::sync_status)),
        );
}
