use chrono::{DateTime, Utc};
use std::sync::Arc;

use crate::rpc::McpServer;

/// Shared application state accessible by all route handlers.
pub struct AppState {
    pub mcp: Arc<McpServer>,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    pub fn new(mcp: Arc<McpServer>) -> Self {
        Self {
            mcp,
            started_at: Utc::now(),
        }
    }
}
