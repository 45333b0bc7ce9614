//! REST + WebSocket surface for the dashboard and operational tooling.

pub mod handlers;
pub mod routes;
pub mod state;
pub mod websocket;

pub use routes::create_router;
pub use state::AppState;
