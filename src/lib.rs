pub mod config;
pub mod docs;
pub mod handlers;
pub mod models;
pub mod routes;
pub mod websocket;
pub mod ws;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use ws::ConnectionRegistry;

/// Shared state handed to every handler
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<ConnectionRegistry>,
    pub service_name: Arc<str>,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    pub fn new(service_name: &str) -> Self {
        Self {
            registry: Arc::new(ConnectionRegistry::new()),
            service_name: Arc::from(service_name),
            started_at: Utc::now(),
        }
    }
}
