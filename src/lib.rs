use axum::{
    middleware,
    routing::{get, post},
    Router,
};

pub mod config;
pub mod errors;
pub mod http;
pub mod logging;
pub mod mcp;
pub mod proxy;
pub mod transport;

use http::SessionManager;

pub fn build_app(manager: SessionManager) -> Router {
    let endpoint = manager.options().endpoint.clone();
    let messages_path = manager.options().messages_path.clone();

    Router::new()
        .route(&endpoint, get(http::handlers::open_session))
        .route(&messages_path, post(http::handlers::post_message))
        .route("/ping", get(http::handlers::ping))
        .route("/health", get(http::handlers::health))
        .layer(middleware::from_fn(logging::request_logging_middleware))
        .with_state(manager)
}
