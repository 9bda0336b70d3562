use crate::models::*;
use crate::table::Table;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Connection parameters
// ---------------------------------------------------------------------------

/// Address of the local gateway process.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// A secret string that never shows up in `Debug` output or logs.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[REDACTED]")
    }
}

/// Details reported by the gateway after a successful handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub server_version: String,
    pub connection_id: Option<String>,
}

// ---------------------------------------------------------------------------
// Broker client trait
// ---------------------------------------------------------------------------

/// Errors that can occur while talking to the gateway.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GatewayError {
    #[error("gateway unreachable at {endpoint}: {reason}")]
    Unreachable { endpoint: String, reason: String },
    #[error("gateway did not answer within {0:?}")]
    Timeout(Duration),
    #[error("gateway connection lost: {0}")]
    Disconnected(String),
    #[error("gateway protocol error: {0}")]
    Protocol(String),
    /// The gateway answered but refused the request.
    #[error("{0}")]
    Rejected(String),
}

impl GatewayError {
    /// True when the failure says nothing about the request itself and the
    /// connection should be considered stale.
    pub fn is_transport(&self) -> bool {
        !matches!(self, GatewayError::Rejected(_))
    }
}

/// The narrow interface to the broker gateway.
///
/// Every query returns a raw [`Table`]; turning it into records is the
/// caller's job. Implementations must allow concurrent queries on one
/// established connection.
#[async_trait]
pub trait BrokerClient: Send + Sync {
    /// Open (or replace) the connection to the gateway.
    async fn connect(&self, endpoint: &Endpoint) -> Result<ServerInfo, GatewayError>;

    /// Real-time quotes for qualified codes.
    async fn query_quote(&self, codes: &[String]) -> Result<Table, GatewayError>;

    /// Historical candlesticks, at most `max_count` of them.
    async fn query_history(
        &self,
        code: &str,
        period: KlinePeriod,
        max_count: u32,
    ) -> Result<Table, GatewayError>;

    /// Securities in a watchlist group.
    async fn query_watchlist(&self, group_name: &str) -> Result<Table, GatewayError>;

    /// Watchlist groups of the logged-in user.
    async fn query_watchlist_groups(
        &self,
        group_type: WatchlistGroupType,
    ) -> Result<Table, GatewayError>;

    /// Basic info of all listed stocks in the given markets.
    async fn query_stock_list(&self, markets: &[Market]) -> Result<Table, GatewayError>;

    /// Open positions of the account in `mode`.
    async fn query_positions(&self, mode: AccountMode) -> Result<Table, GatewayError>;

    /// Funds of the accounts in `mode`.
    async fn query_account(&self, mode: AccountMode) -> Result<Table, GatewayError>;

    /// Unlock trading-level queries for this connection.
    async fn unlock_trade(&self, password: &str) -> Result<(), GatewayError>;

    /// Close the connection. Best effort, never fails.
    async fn close(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_secret_is_redacted() {
        let secret = Secret::new("123456");
        assert_eq!(format!("{:?}", secret), "[REDACTED]");
        assert_eq!(secret.expose(), "123456");
    }

    #[test]
    fn test_transport_classification() {
        assert!(GatewayError::Timeout(Duration::from_secs(1)).is_transport());
        assert!(GatewayError::Disconnected("eof".into()).is_transport());
        assert!(!GatewayError::Rejected("unknown stock".into()).is_transport());
    }

    #[test]
    fn test_endpoint_display() {
        assert_eq!(Endpoint::new("127.0.0.1", 11111).to_string(), "127.0.0.1:11111");
    }
}
