use async_trait::async_trait;
use chrono::Utc;
use futumcp_core::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::protocol::*;

/// Configuration for the OpenD socket bridge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Keepalive interval in seconds, 0 disables keepalives.
    pub keepalive_interval_secs: u64,
    /// Version string announced in the handshake.
    pub client_ver: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            keepalive_interval_secs: 10,
            client_ver: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

type Pending = Arc<StdMutex<HashMap<u64, oneshot::Sender<InboundMessage>>>>;

fn lock_pending(pending: &Pending) -> MutexGuard<'_, HashMap<u64, oneshot::Sender<InboundMessage>>> {
    pending.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Removes a request's reply slot when the caller stops waiting (reply
/// delivered, timeout, or cancellation).
struct PendingSlot<'a> {
    pending: &'a Pending,
    id: u64,
}

impl Drop for PendingSlot<'_> {
    fn drop(&mut self) {
        lock_pending(self.pending).remove(&self.id);
    }
}

/// One TCP connection to the gateway.
///
/// Requests are multiplexed: each carries a fresh id, and a background reader
/// task routes replies back to the waiting caller by id.
struct Connection {
    endpoint: Endpoint,
    writer: Mutex<OwnedWriteHalf>,
    pending: Pending,
    next_id: AtomicU64,
    alive: Arc<AtomicBool>,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

impl Connection {
    fn new(endpoint: Endpoint, reader: OwnedReadHalf, writer: OwnedWriteHalf) -> Arc<Self> {
        let pending: Pending = Arc::new(StdMutex::new(HashMap::new()));
        let alive = Arc::new(AtomicBool::new(true));

        let reader_task = tokio::spawn(read_loop(
            reader,
            pending.clone(),
            alive.clone(),
            endpoint.to_string(),
        ));

        Arc::new(Self {
            endpoint,
            writer: Mutex::new(writer),
            pending,
            next_id: AtomicU64::new(1),
            alive,
            tasks: StdMutex::new(vec![reader_task]),
        })
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    fn track(&self, task: JoinHandle<()>) {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(task);
    }

    /// Send a request and wait for the reply with the same id.
    async fn request<F>(&self, build: F) -> Result<InboundMessage, GatewayError>
    where
        F: FnOnce(u64) -> OutboundMessage,
    {
        if !self.is_alive() {
            return Err(GatewayError::Disconnected(format!(
                "connection to {} is closed",
                self.endpoint
            )));
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let msg = build(id);
        let framed = encode(&msg)?;

        let (tx, rx) = oneshot::channel();
        lock_pending(&self.pending).insert(id, tx);
        let _slot = PendingSlot {
            pending: &self.pending,
            id,
        };

        debug!(id, op = msg.op(), "Sending gateway request");
        {
            let mut writer = self.writer.lock().await;
            if let Err(e) = writer.write_all(&framed).await {
                self.alive.store(false, Ordering::Release);
                return Err(GatewayError::Disconnected(format!("write error: {}", e)));
            }
        }

        rx.await.map_err(|_| {
            GatewayError::Disconnected("connection closed before the reply arrived".to_string())
        })
    }

    async fn shutdown(&self) {
        self.alive.store(false, Ordering::Release);
        for task in self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
        {
            task.abort();
        }
        lock_pending(&self.pending).clear();
        let _ = self.writer.lock().await.shutdown().await;
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        for task in self
            .tasks
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
        {
            task.abort();
        }
    }
}

/// Route inbound frames to their waiting requests until the stream ends.
async fn read_loop(mut reader: OwnedReadHalf, pending: Pending, alive: Arc<AtomicBool>, peer: String) {
    loop {
        match read_frame::<_, InboundMessage>(&mut reader).await {
            Ok(InboundMessage::Notice { message }) => {
                info!(peer = %peer, %message, "Gateway notice");
            }
            Ok(msg) => {
                let Some(id) = msg.request_id() else { continue };
                match lock_pending(&pending).remove(&id) {
                    Some(tx) => {
                        let _ = tx.send(msg);
                    }
                    None => debug!(id, kind = msg.kind(), "Dropping reply for abandoned request"),
                }
            }
            Err(GatewayError::Protocol(e)) => {
                warn!(peer = %peer, error = %e, "Malformed frame from gateway, closing connection");
                break;
            }
            Err(e) => {
                if alive.load(Ordering::Acquire) {
                    warn!(peer = %peer, error = %e, "Gateway connection closed");
                }
                break;
            }
        }
    }

    alive.store(false, Ordering::Release);
    // Dropping the senders wakes every waiter with a disconnect error
    lock_pending(&pending).clear();
}

async fn keepalive_loop(conn: Weak<Connection>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let Some(conn) = conn.upgrade() else { break };
        if !conn.is_alive() {
            break;
        }
        let sent = tokio::time::timeout(
            interval,
            conn.request(|id| OutboundMessage::KeepAlive { id, time: Utc::now() }),
        )
        .await;
        match sent {
            Ok(Ok(_)) => debug!(endpoint = %conn.endpoint, "Keepalive acknowledged"),
            Ok(Err(e)) => warn!(endpoint = %conn.endpoint, error = %e, "Keepalive failed"),
            Err(_) => warn!(endpoint = %conn.endpoint, "Keepalive timed out"),
        }
    }
}

/// Broker client for a local Futu OpenD gateway.
///
/// Talks to the gateway's socket bridge using length-prefixed JSON messages.
/// One TCP connection is shared by all callers; `connect` replaces it.
pub struct FutuGateway {
    config: GatewayConfig,
    client_id: String,
    conn: RwLock<Option<Arc<Connection>>>,
}

impl FutuGateway {
    pub fn new(config: GatewayConfig) -> Self {
        Self {
            config,
            client_id: Uuid::new_v4().to_string(),
            conn: RwLock::new(None),
        }
    }

    async fn current(&self) -> Result<Arc<Connection>, GatewayError> {
        match self.conn.read().await.as_ref() {
            Some(conn) if conn.is_alive() => Ok(conn.clone()),
            Some(conn) => Err(GatewayError::Disconnected(format!(
                "connection to {} is closed",
                conn.endpoint
            ))),
            None => Err(GatewayError::Disconnected("not connected".to_string())),
        }
    }

    async fn request<F>(&self, build: F) -> Result<InboundMessage, GatewayError>
    where
        F: FnOnce(u64) -> OutboundMessage,
    {
        self.current().await?.request(build).await
    }

    async fn table<F>(&self, build: F) -> Result<Table, GatewayError>
    where
        F: FnOnce(u64) -> OutboundMessage,
    {
        self.request(build).await?.into_table()
    }
}

#[async_trait]
impl BrokerClient for FutuGateway {
    async fn connect(&self, endpoint: &Endpoint) -> Result<ServerInfo, GatewayError> {
        info!("Connecting to Futu gateway at {}", endpoint);

        let stream = TcpStream::connect((endpoint.host.as_str(), endpoint.port))
            .await
            .map_err(|e| GatewayError::Unreachable {
                endpoint: endpoint.to_string(),
                reason: e.to_string(),
            })?;
        let _ = stream.set_nodelay(true);
        let (reader, writer) = stream.into_split();
        let conn = Connection::new(endpoint.clone(), reader, writer);

        let reply = conn
            .request(|id| OutboundMessage::InitConnect {
                id,
                client_id: self.client_id.clone(),
                client_ver: self.config.client_ver.clone(),
            })
            .await;

        let info = match reply {
            Ok(InboundMessage::Connected {
                server_ver,
                conn_id,
                ..
            }) => ServerInfo {
                server_version: server_ver,
                connection_id: conn_id,
            },
            Ok(InboundMessage::Error { message, .. }) => {
                conn.shutdown().await;
                return Err(GatewayError::Unreachable {
                    endpoint: endpoint.to_string(),
                    reason: format!("handshake refused: {}", message),
                });
            }
            Ok(other) => {
                conn.shutdown().await;
                return Err(GatewayError::Protocol(format!(
                    "unexpected handshake reply '{}'",
                    other.kind()
                )));
            }
            Err(e) => {
                conn.shutdown().await;
                return Err(e);
            }
        };

        if self.config.keepalive_interval_secs > 0 {
            let interval = Duration::from_secs(self.config.keepalive_interval_secs);
            conn.track(tokio::spawn(keepalive_loop(Arc::downgrade(&conn), interval)));
        }

        let previous = self.conn.write().await.replace(conn);
        if let Some(previous) = previous {
            previous.shutdown().await;
        }

        info!(
            server_version = %info.server_version,
            "Connected to Futu gateway at {}", endpoint
        );
        Ok(info)
    }

    async fn query_quote(&self, codes: &[String]) -> Result<Table, GatewayError> {
        self.table(|id| OutboundMessage::Quote {
            id,
            codes: codes.to_vec(),
        })
        .await
    }

    async fn query_history(
        &self,
        code: &str,
        period: KlinePeriod,
        max_count: u32,
    ) -> Result<Table, GatewayError> {
        self.table(|id| OutboundMessage::HistoryKline {
            id,
            code: code.to_string(),
            ktype: period.ktype().to_string(),
            max_count,
        })
        .await
    }

    async fn query_watchlist(&self, group_name: &str) -> Result<Table, GatewayError> {
        self.table(|id| OutboundMessage::UserSecurity {
            id,
            group_name: group_name.to_string(),
        })
        .await
    }

    async fn query_watchlist_groups(
        &self,
        group_type: WatchlistGroupType,
    ) -> Result<Table, GatewayError> {
        self.table(|id| OutboundMessage::UserSecurityGroup {
            id,
            group_type: group_type.as_str().to_string(),
        })
        .await
    }

    async fn query_stock_list(&self, markets: &[Market]) -> Result<Table, GatewayError> {
        self.table(|id| OutboundMessage::StockBasicInfo {
            id,
            markets: markets.to_vec(),
        })
        .await
    }

    async fn query_positions(&self, mode: AccountMode) -> Result<Table, GatewayError> {
        self.table(|id| OutboundMessage::PositionList { id, trd_env: mode })
            .await
    }

    async fn query_account(&self, mode: AccountMode) -> Result<Table, GatewayError> {
        self.table(|id| OutboundMessage::AccountFunds { id, trd_env: mode })
            .await
    }

    async fn unlock_trade(&self, password: &str) -> Result<(), GatewayError> {
        self.request(|id| OutboundMessage::UnlockTrade {
            id,
            password: Secret::new(password),
        })
        .await?
        .into_ack()
    }

    async fn close(&self) {
        if let Some(conn) = self.conn.write().await.take() {
            conn.shutdown().await;
            info!("Disconnected from Futu gateway at {}", conn.endpoint);
        }
    }
}
