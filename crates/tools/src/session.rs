use futumcp_core::{AccountMode, BrokerClient, Endpoint, GatewayError, Secret};
use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::ToolError;

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 11111;
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

const PASSWORD_SET: &str = "******";
const PASSWORD_UNSET: &str = "not set";

/// Connection parameters of the session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSettings {
    pub host: String,
    pub port: u16,
    pub unlock_password: Option<Secret>,
    pub account_mode: AccountMode,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            unlock_password: None,
            account_mode: AccountMode::default(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

impl SessionSettings {
    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new(self.host.clone(), self.port)
    }
}

fn validate_endpoint(host: &str, port: u16) -> Result<(), ToolError> {
    if host.trim().is_empty() {
        return Err(ToolError::validation("host", "must not be empty"));
    }
    if port == 0 {
        return Err(ToolError::validation("port", "must be between 1 and 65535"));
    }
    Ok(())
}

/// Replacement connection parameters.
///
/// `unlock_password: None` clears the stored password. `account_mode: None`
/// keeps the current mode.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionUpdate {
    pub host: String,
    pub port: u16,
    pub unlock_password: Option<Secret>,
    pub account_mode: Option<AccountMode>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Disconnected => "DISCONNECTED",
            SessionState::Connecting => "CONNECTING",
            SessionState::Connected => "CONNECTED",
            SessionState::Closed => "CLOSED",
        };
        f.write_str(s)
    }
}

/// Point-in-time view of the session. The password is masked.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionStatus {
    pub state: SessionState,
    pub connected: bool,
    pub unlocked: bool,
    pub host: String,
    pub port: u16,
    pub unlock_password: &'static str,
    pub account_mode: AccountMode,
    pub last_error: Option<String>,
    pub connected_endpoint: Option<String>,
    pub server_version: Option<String>,
    pub connect_count: u64,
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Futu client status: {}", self.state)?;
        writeln!(f, "  host: {}", self.host)?;
        writeln!(f, "  port: {}", self.port)?;
        writeln!(f, "  unlock password: {}", self.unlock_password)?;
        writeln!(f, "  account mode: {}", self.account_mode)?;
        writeln!(f, "  trading unlocked: {}", if self.unlocked { "yes" } else { "no" })?;
        if let Some(version) = &self.server_version {
            writeln!(f, "  gateway version: {}", version)?;
        }
        write!(f, "  last error: {}", self.last_error.as_deref().unwrap_or("none"))
    }
}

/// A handle on the connection that was live when it was issued.
///
/// Carries the settings snapshot the query must use, so a concurrent
/// reconfigure can never mix old and new values into one result.
#[derive(Clone)]
pub struct GatewayLease {
    client: Arc<dyn BrokerClient>,
    generation: u64,
    account_mode: AccountMode,
    request_timeout: Duration,
}

impl GatewayLease {
    pub fn client(&self) -> &dyn BrokerClient {
        self.client.as_ref()
    }

    pub fn account_mode(&self) -> AccountMode {
        self.account_mode
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

struct SessionInner {
    settings: SessionSettings,
    state: SessionState,
    unlocked: bool,
    last_error: Option<String>,
    generation: u64,
    connected_endpoint: Option<Endpoint>,
    server_version: Option<String>,
    connect_count: u64,
}

impl SessionInner {
    fn lease(&self, client: &Arc<dyn BrokerClient>) -> GatewayLease {
        GatewayLease {
            client: Arc::clone(client),
            generation: self.generation,
            account_mode: self.settings.account_mode,
            request_timeout: self.settings.request_timeout,
        }
    }

    fn disconnect(&mut self) {
        if self.state != SessionState::Closed {
            self.state = SessionState::Disconnected;
        }
        self.unlocked = false;
        self.connected_endpoint = None;
    }

    fn status(&self) -> SessionStatus {
        SessionStatus {
            state: self.state,
            connected: self.state == SessionState::Connected,
            unlocked: self.unlocked,
            host: self.settings.host.clone(),
            port: self.settings.port,
            unlock_password: if self.settings.unlock_password.is_some() {
                PASSWORD_SET
            } else {
                PASSWORD_UNSET
            },
            account_mode: self.settings.account_mode,
            last_error: self.last_error.clone(),
            connected_endpoint: self.connected_endpoint.as_ref().map(ToString::to_string),
            server_version: self.server_version.clone(),
            connect_count: self.connect_count,
        }
    }
}

/// Owns the lifecycle of the gateway connection.
///
/// Connect, reconfigure and unlock are serialized by one async mutex. Queries
/// only take the lock briefly to obtain a [`GatewayLease`] and then run
/// concurrently over the shared client.
pub struct BrokerSessionHandle {
    client: Arc<dyn BrokerClient>,
    inner: Mutex<SessionInner>,
}

impl BrokerSessionHandle {
    pub fn new(client: Arc<dyn BrokerClient>, settings: SessionSettings) -> Self {
        Self {
            client,
            inner: Mutex::new(SessionInner {
                settings,
                state: SessionState::Disconnected,
                unlocked: false,
                last_error: None,
                generation: 0,
                connected_endpoint: None,
                server_version: None,
                connect_count: 0,
            }),
        }
    }

    pub async fn settings(&self) -> SessionSettings {
        self.inner.lock().await.settings.clone()
    }

    pub async fn status(&self) -> SessionStatus {
        self.inner.lock().await.status()
    }

    /// Return a lease on a live connection, connecting first if needed.
    pub async fn ensure_connected(&self) -> Result<GatewayLease, ToolError> {
        let mut inner = self.inner.lock().await;
        self.connect_locked(&mut inner).await
    }

    async fn connect_locked(&self, inner: &mut SessionInner) -> Result<GatewayLease, ToolError> {
        let endpoint = inner.settings.endpoint();
        match inner.state {
            SessionState::Closed => {
                return Err(ToolError::Connection("session has been shut down".to_string()))
            }
            SessionState::Connected if inner.connected_endpoint.as_ref() == Some(&endpoint) => {
                return Ok(inner.lease(&self.client));
            }
            _ => {}
        }

        inner.state = SessionState::Connecting;
        info!(%endpoint, "Connecting to OpenD gateway");
        let timeout = inner.settings.connect_timeout;
        let result = match tokio::time::timeout(timeout, self.client.connect(&endpoint)).await {
            Ok(result) => result,
            Err(_) => Err(GatewayError::Timeout(timeout)),
        };

        match result {
            Ok(server) => {
                inner.state = SessionState::Connected;
                inner.unlocked = false;
                inner.generation += 1;
                inner.connect_count += 1;
                inner.connected_endpoint = Some(endpoint.clone());
                info!(
                    %endpoint,
                    server_version = %server.server_version,
                    generation = inner.generation,
                    "Connected to OpenD gateway"
                );
                inner.server_version = Some(server.server_version);
                Ok(inner.lease(&self.client))
            }
            Err(e) => {
                warn!(%endpoint, error = %e, "Failed to connect to OpenD gateway");
                inner.disconnect();
                inner.last_error = Some(e.to_string());
                Err(ToolError::Connection(e.to_string()))
            }
        }
    }

    /// Replace the connection parameters. The next query reconnects.
    pub async fn reconfigure(&self, update: SessionUpdate) -> Result<SessionStatus, ToolError> {
        validate_endpoint(&update.host, update.port)?;

        let mut inner = self.inner.lock().await;
        if inner.state == SessionState::Closed {
            return Err(ToolError::Connection("session has been shut down".to_string()));
        }
        inner.settings.host = update.host.trim().to_string();
        inner.settings.port = update.port;
        inner.settings.unlock_password = update.unlock_password;
        if let Some(mode) = update.account_mode {
            inner.settings.account_mode = mode;
        }
        inner.disconnect();
        info!(
            host = %inner.settings.host,
            port = inner.settings.port,
            account_mode = %inner.settings.account_mode,
            password_set = inner.settings.unlock_password.is_some(),
            "Session reconfigured"
        );
        Ok(inner.status())
    }

    /// Connect if needed and make sure trading queries are unlocked.
    ///
    /// Fails with `TradingLocked` before touching the gateway when no
    /// password is configured.
    pub async fn unlock_if_needed(&self) -> Result<GatewayLease, ToolError> {
        let mut inner = self.inner.lock().await;
        let Some(password) = inner.settings.unlock_password.clone() else {
            return Err(ToolError::TradingLocked(
                "trading is locked and no unlock password is configured; \
                 set unlock_pwd with configure_futu_client"
                    .to_string(),
            ));
        };

        let lease = self.connect_locked(&mut inner).await?;
        if inner.unlocked {
            return Ok(lease);
        }

        let timeout = inner.settings.connect_timeout;
        let result = match tokio::time::timeout(timeout, self.client.unlock_trade(password.expose())).await {
            Ok(result) => result,
            Err(_) => Err(GatewayError::Timeout(timeout)),
        };
        match result {
            Ok(()) => {
                inner.unlocked = true;
                info!(generation = inner.generation, "Trading unlocked");
                Ok(lease)
            }
            Err(GatewayError::Rejected(reason)) => {
                warn!(reason = %reason, "Trade unlock rejected");
                inner.last_error = Some(format!("unlock rejected: {}", reason));
                Err(ToolError::TradingLocked(format!(
                    "unlock rejected by the gateway: {}",
                    reason
                )))
            }
            Err(e) => {
                warn!(error = %e, "Trade unlock failed");
                inner.disconnect();
                inner.last_error = Some(e.to_string());
                Err(ToolError::Connection(e.to_string()))
            }
        }
    }

    /// Run one broker call under the request timeout and book-keep failures.
    ///
    /// The query is refused when the lease no longer names the live
    /// connection.
    pub async fn run_query<T, F>(&self, lease: &GatewayLease, query: F) -> Result<T, ToolError>
    where
        F: Future<Output = Result<T, GatewayError>>,
    {
        {
            let inner = self.inner.lock().await;
            if inner.generation != lease.generation || inner.state != SessionState::Connected {
                debug!(
                    generation = lease.generation,
                    current = inner.generation,
                    state = %inner.state,
                    "Refusing query on an outdated lease"
                );
                return Err(ToolError::Connection("connection was reconfigured".to_string()));
            }
        }

        let result = match tokio::time::timeout(lease.request_timeout, query).await {
            Ok(result) => result,
            Err(_) => Err(GatewayError::Timeout(lease.request_timeout)),
        };
        match result {
            Ok(value) => Ok(value),
            Err(e) => {
                if e.is_transport() {
                    self.mark_stale(lease, &e).await;
                } else {
                    self.record_error(e.to_string()).await;
                }
                Err(e.into())
            }
        }
    }

    /// Drop the connection after a transport failure seen through `lease`.
    ///
    /// A lease from an older connection only records the error.
    pub async fn mark_stale(&self, lease: &GatewayLease, error: &GatewayError) {
        let mut inner = self.inner.lock().await;
        inner.last_error = Some(error.to_string());
        if inner.generation == lease.generation && inner.state == SessionState::Connected {
            warn!(error = %error, generation = lease.generation, "Gateway connection marked stale");
            inner.disconnect();
        } else {
            debug!(
                generation = lease.generation,
                current = inner.generation,
                "Ignoring failure from an older connection"
            );
        }
    }

    pub async fn record_error(&self, message: impl Into<String>) {
        self.inner.lock().await.last_error = Some(message.into());
    }

    /// Close the client and refuse further work. Idempotent.
    pub async fn shutdown(&self) {
        let mut inner = self.inner.lock().await;
        if inner.state == SessionState::Closed {
            return;
        }
        inner.state = SessionState::Closed;
        inner.unlocked = false;
        inner.connected_endpoint = None;
        self.client.close().await;
        info!("Session closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use futumcp_core::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    /// Scriptable client: counts calls, optionally hangs on connect.
    #[derive(Default)]
    struct FakeClient {
        connects: StdMutex<Vec<Endpoint>>,
        unlocks: AtomicUsize,
        hang_on_connect: bool,
        refuse: bool,
        password: Option<&'static str>,
        closed: AtomicUsize,
    }

    #[async_trait]
    impl BrokerClient for FakeClient {
        async fn connect(&self, endpoint: &Endpoint) -> Result<ServerInfo, GatewayError> {
            self.connects.lock().unwrap().push(endpoint.clone());
            if self.hang_on_connect {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            if self.refuse {
                return Err(GatewayError::Unreachable {
                    endpoint: endpoint.to_string(),
                    reason: "connection refused".into(),
                });
            }
            Ok(ServerInfo {
                server_version: "9.0".into(),
                connection_id: None,
            })
        }
        async fn query_quote(&self, _: &[String]) -> Result<Table, GatewayError> {
            Ok(Table::default())
        }
        async fn query_history(&self, _: &str, _: KlinePeriod, _: u32) -> Result<Table, GatewayError> {
            Ok(Table::default())
        }
        async fn query_watchlist(&self, _: &str) -> Result<Table, GatewayError> {
            Ok(Table::default())
        }
        async fn query_watchlist_groups(&self, _: WatchlistGroupType) -> Result<Table, GatewayError> {
            Ok(Table::default())
        }
        async fn query_stock_list(&self, _: &[Market]) -> Result<Table, GatewayError> {
            Ok(Table::default())
        }
        async fn query_positions(&self, _: AccountMode) -> Result<Table, GatewayError> {
            Ok(Table::default())
        }
        async fn query_account(&self, _: AccountMode) -> Result<Table, GatewayError> {
            Ok(Table::default())
        }
        async fn unlock_trade(&self, password: &str) -> Result<(), GatewayError> {
            self.unlocks.fetch_add(1, Ordering::SeqCst);
            if Some(password) == self.password {
                Ok(())
            } else {
                Err(GatewayError::Rejected("wrong password".into()))
            }
        }
        async fn close(&self) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn session_with(client: FakeClient) -> (Arc<FakeClient>, BrokerSessionHandle) {
        let client = Arc::new(client);
        let session = BrokerSessionHandle::new(client.clone(), SessionSettings::default());
        (client, session)
    }

    fn update(host: &str, port: u16, password: Option<&str>) -> SessionUpdate {
        SessionUpdate {
            host: host.to_string(),
            port,
            unlock_password: password.map(Secret::new),
            account_mode: None,
        }
    }

    #[tokio::test]
    async fn test_connects_lazily_and_once() {
        let (client, session) = session_with(FakeClient::default());
        assert_eq!(session.status().await.state, SessionState::Disconnected);

        session.ensure_connected().await.unwrap();
        session.ensure_connected().await.unwrap();

        assert_eq!(client.connects.lock().unwrap().len(), 1);
        let status = session.status().await;
        assert!(status.connected);
        assert_eq!(status.server_version.as_deref(), Some("9.0"));
    }

    #[tokio::test]
    async fn test_unreachable_records_last_error() {
        let (_, session) = session_with(FakeClient {
            refuse: true,
            ..Default::default()
        });
        let err = session.ensure_connected().await.err().unwrap();
        assert_eq!(err.classification(), "ConnectionError");
        let status = session.status().await;
        assert!(!status.connected);
        assert!(status.last_error.unwrap().contains("connection refused"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout() {
        let (_, session) = session_with(FakeClient {
            hang_on_connect: true,
            ..Default::default()
        });
        let err = session.ensure_connected().await.err().unwrap();
        assert!(matches!(err, ToolError::Connection(_)));
        assert_eq!(session.status().await.state, SessionState::Disconnected);
    }

    #[tokio::test]
    async fn test_reconfigure_forces_reconnect() {
        let (client, session) = session_with(FakeClient::default());
        session.ensure_connected().await.unwrap();

        let status = session
            .reconfigure(update("192.168.1.20", 11112, None))
            .await
            .unwrap();
        assert!(!status.connected);

        session.ensure_connected().await.unwrap();
        let connects = client.connects.lock().unwrap().clone();
        assert_eq!(connects.len(), 2);
        assert_eq!(connects[1], Endpoint::new("192.168.1.20", 11112));
    }

    #[tokio::test]
    async fn test_reconfigure_validates() {
        let (_, session) = session_with(FakeClient::default());
        let err = session.reconfigure(update("  ", 11111, None)).await.unwrap_err();
        assert_eq!(err, ToolError::validation("host", "must not be empty"));
        let err = session.reconfigure(update("localhost", 0, None)).await.unwrap_err();
        assert!(matches!(err, ToolError::Validation { ref field, .. } if field == "port"));
        // Nothing changed
        assert_eq!(session.status().await.host, DEFAULT_HOST);
    }

    #[tokio::test]
    async fn test_status_masks_password() {
        let (_, session) = session_with(FakeClient::default());
        let status = session
            .reconfigure(update("127.0.0.1", 11111, Some("s3cr3t-pw")))
            .await
            .unwrap();
        assert_eq!(status.unlock_password, "******");
        assert!(!status.to_string().contains("s3cr3t-pw"));
        assert!(!serde_json::to_string(&status).unwrap().contains("s3cr3t-pw"));
    }

    #[tokio::test]
    async fn test_unlock_without_password_does_not_connect() {
        let (client, session) = session_with(FakeClient::default());
        let err = session.unlock_if_needed().await.err().unwrap();
        assert_eq!(err.classification(), "TradingLockedError");
        assert!(client.connects.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unlock_once_per_connection() {
        let (client, session) = session_with(FakeClient {
            password: Some("123456"),
            ..Default::default()
        });
        session
            .reconfigure(update("127.0.0.1", 11111, Some("123456")))
            .await
            .unwrap();

        session.unlock_if_needed().await.unwrap();
        session.unlock_if_needed().await.unwrap();
        assert_eq!(client.unlocks.load(Ordering::SeqCst), 1);
        assert!(session.status().await.unlocked);
    }

    #[tokio::test]
    async fn test_unlock_rejection_keeps_connection() {
        let (_, session) = session_with(FakeClient {
            password: Some("123456"),
            ..Default::default()
        });
        session
            .reconfigure(update("127.0.0.1", 11111, Some("wrong")))
            .await
            .unwrap();

        let err = session.unlock_if_needed().await.err().unwrap();
        assert!(matches!(err, ToolError::TradingLocked(_)));
        let status = session.status().await;
        assert!(status.connected);
        assert!(!status.unlocked);
    }

    #[tokio::test]
    async fn test_transport_failure_marks_stale() {
        let (_, session) = session_with(FakeClient::default());
        let lease = session.ensure_connected().await.unwrap();

        let err = session
            .run_query(&lease, async {
                Err::<(), _>(GatewayError::Disconnected("eof".into()))
            })
            .await
            .unwrap_err();
        assert_eq!(err.classification(), "ConnectionError");
        assert_eq!(session.status().await.state, SessionState::Disconnected);
    }

    #[tokio::test]
    async fn test_rejection_keeps_connection() {
        let (_, session) = session_with(FakeClient::default());
        let lease = session.ensure_connected().await.unwrap();

        let err = session
            .run_query(&lease, async {
                Err::<(), _>(GatewayError::Rejected("unknown stock".into()))
            })
            .await
            .unwrap_err();
        assert_eq!(err, ToolError::BrokerQuery("unknown stock".into()));
        let status = session.status().await;
        assert!(status.connected);
        assert_eq!(status.last_error.as_deref(), Some("unknown stock"));
    }

    #[tokio::test]
    async fn test_stale_lease_cannot_drop_new_connection() {
        let (_, session) = session_with(FakeClient::default());
        let old = session.ensure_connected().await.unwrap();
        session
            .reconfigure(update("127.0.0.1", 11112, None))
            .await
            .unwrap();
        let new = session.ensure_connected().await.unwrap();
        assert!(new.generation() > old.generation());

        session
            .mark_stale(&old, &GatewayError::Disconnected("old socket closed".into()))
            .await;
        assert!(session.status().await.connected);
    }

    #[tokio::test]
    async fn test_outdated_lease_cannot_query_new_connection() {
        let (client, session) = session_with(FakeClient::default());
        let old = session.ensure_connected().await.unwrap();
        assert_eq!(old.account_mode(), AccountMode::Simulate);

        session
            .reconfigure(SessionUpdate {
                account_mode: Some(AccountMode::Real),
                ..update("10.9.9.9", 22222, None)
            })
            .await
            .unwrap();
        let err = session
            .run_query(&old, async { Ok::<_, GatewayError>(()) })
            .await
            .unwrap_err();
        assert_eq!(err, ToolError::Connection("connection was reconfigured".into()));

        session.ensure_connected().await.unwrap();
        let ran = AtomicUsize::new(0);
        let err = session
            .run_query(&old, async {
                ran.fetch_add(1, Ordering::SeqCst);
                client.query_positions(old.account_mode()).await
            })
            .await
            .unwrap_err();
        assert_eq!(err.classification(), "ConnectionError");
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert!(session.status().await.connected);
        assert_eq!(session.status().await.last_error, None);
    }

    #[tokio::test]
    async fn test_shutdown_is_final() {
        let (client, session) = session_with(FakeClient::default());
        session.ensure_connected().await.unwrap();
        session.shutdown().await;
        session.shutdown().await;

        assert_eq!(client.closed.load(Ordering::SeqCst), 1);
        assert_eq!(session.status().await.state, SessionState::Closed);
        assert!(session.ensure_connected().await.is_err());
        assert!(session.reconfigure(update("localhost", 1, None)).await.is_err());
    }
}
