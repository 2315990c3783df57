use axum::Router;

use crate::AppState;

mod auth;
mod error;
mod handlers;
mod range;
mod routes;

pub use auth::{Session, SESSION_COOKIE};
pub use error::AppError;

pub fn router(state: AppState) -> Router {
    Router::new()
        .merge(routes::root())
        .merge(routes::auth())
        .merge(routes::media())
        .with_state(state)
}
