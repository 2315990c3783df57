use axum::{routing::delete, routing::get, routing::post, Router};

use crate::http::handlers;
use crate::AppState;

pub fn root() -> Router<AppState> {
    Router::new().route("/", get(handlers::index))
}

pub fn auth() -> Router<AppState> {
    Router::new()
        .route("/register", post(handlers::register))
        .route("/login", get(handlers::login))
}

pub fn media() -> Router<AppState> {
    Router::new()
        .route("/media", get(handlers::list_media))
        .route("/media", post(handlers::upload_media))
        .route("/media/:id", get(handlers::get_media))
        .route("/media/:id", delete(handlers::delete_media))
        .route("/media/:id/thumbnail", get(handlers::get_thumbnail))
}
