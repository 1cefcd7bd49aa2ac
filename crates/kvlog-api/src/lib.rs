//! kvlog-api — HTTP surface for kvlog.
//!
//! Writes go to the log through the [`Publisher`]; reads are answered from
//! the local [`StateStore`]. Either side can be disabled, in which case its
//! routes are not mounted.
//!
//! # Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | POST | `/store` | Publish an upsert, UTF-8 key and value |
//! | POST | `/store/b64` | Publish an upsert, base64 key, value and header values |
//! | POST | `/remove` | Publish a tombstone |
//! | POST | `/retrieve` | Read a value as UTF-8 |
//! | POST | `/retrieve/b64` | Read a value as base64 |
//! | GET | `/healthz` | Process started |
//! | GET | `/healthz/live` | Liveness |
//! | GET | `/healthz/ready` | Local state has caught up with the log |

pub mod handlers;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use kvlog_publisher::Publisher;
use kvlog_state::StateStore;

/// Request header carrying the caller's correlation id, echoed on replies.
pub const X_CORRELATION_ID: &str = "x-correlation-id";

/// Shared state for API handlers. `None` disables that side.
#[derive(Clone, Default)]
pub struct ApiState {
    pub store: Option<Arc<dyn StateStore>>,
    pub publisher: Option<Arc<Publisher>>,
}

/// Build the router, mounting only the routes of enabled subsystems.
pub fn build_router(state: ApiState) -> Router {
    let mut router = Router::new()
        .route("/healthz", get(handlers::healthz))
        .route("/healthz/live", get(handlers::live))
        .route("/healthz/ready", get(handlers::ready));

    if state.publisher.is_some() {
        router = router
            .route("/store", post(handlers::store))
            .route("/store/b64", post(handlers::store_b64))
            .route("/remove", post(handlers::remove));
    }
    if state.store.is_some() {
        router = router
            .route("/retrieve", post(handlers::retrieve))
            .route("/retrieve/b64", post(handlers::retrieve_b64));
    }
    router.with_state(state)
}
