use std::sync::Arc;

use crate::engine::Engine;

/// Shared application state for API handlers. Everything hangs off the
/// engine; handlers never hold component references of their own.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
}

impl AppState {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }
}
