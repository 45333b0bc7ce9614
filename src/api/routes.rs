use axum::{
    routing::{delete, get, patch, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};

use crate::api::{handlers, state::AppState, websocket::websocket_handler};

pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // Account endpoints
        .route("/api/accounts", get(handlers::list_accounts))
        .route("/api/accounts", post(handlers::create_account))
        .route("/api/accounts/:id", delete(handlers::delete_account))
        .route(
            "/api/accounts/:id/configuration",
            get(handlers::get_account_configuration),
        )
        .route(
            "/api/accounts/:id/configuration",
            patch(handlers::patch_account_configuration),
        )
        // Connection endpoints
        .route("/api/connections", get(handlers::list_connections))
        .route("/api/connections/test", post(handlers::test_connection))
        .route(
            "/api/connections/reconnect",
            post(handlers::reconnect_connection),
        )
        // Feature configuration
        .route("/api/configuration", get(handlers::get_configuration))
        .route("/api/configuration", post(handlers::update_configuration))
        // Trade log
        .route("/api/trades", get(handlers::list_trades))
        .route("/api/trades", delete(handlers::clear_trades))
        // Stats
        .route("/api/stats/today", get(handlers::get_today_stats))
        // Replication lifecycle
        .route("/api/replication/start", post(handlers::start_replication))
        .route("/api/replication/stop", post(handlers::stop_replication))
        // WebSocket push channel
        .route("/ws", get(websocket_handler))
        .with_state(state)
        .layer(cors)
}
