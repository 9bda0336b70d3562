use std::sync::Arc;
use tracing::info;

use crate::error::ToolError;
use crate::session::{BrokerSessionHandle, SessionStatus, SessionUpdate};

/// Runtime access to the connection settings of the process-wide session.
///
/// Reads and writes go through the session lock, so a reader sees either the
/// settings before an update or after it.
#[derive(Clone)]
pub struct ConfigurationGateway {
    session: Arc<BrokerSessionHandle>,
}

impl ConfigurationGateway {
    pub fn new(session: Arc<BrokerSessionHandle>) -> Self {
        Self { session }
    }

    pub async fn get(&self) -> SessionStatus {
        self.session.status().await
    }

    pub async fn set(&self, update: SessionUpdate) -> Result<SessionStatus, ToolError> {
        info!(host = %update.host, port = update.port, "Applying new client configuration");
        self.session.reconfigure(update).await
    }
}
