use chrono::{DateTime, Utc};
use futumcp_core::{AccountMode, GatewayError, Market, Secret, Table};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Upper bound on a single frame body. Stock lists for all markets are the
/// largest replies the gateway sends.
pub const MAX_FRAME_LEN: usize = 32 * 1024 * 1024;

/// Messages sent from the Rust client TO the gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op")]
pub enum OutboundMessage {
    /// Handshake, must be the first request on a connection.
    #[serde(rename = "init_connect")]
    InitConnect {
        id: u64,
        client_id: String,
        client_ver: String,
    },
    /// Keeps the gateway from dropping an idle connection.
    #[serde(rename = "keep_alive")]
    KeepAlive { id: u64, time: DateTime<Utc> },
    /// Real-time quotes.
    #[serde(rename = "quote")]
    Quote { id: u64, codes: Vec<String> },
    /// Historical candlesticks.
    #[serde(rename = "history_kline")]
    HistoryKline {
        id: u64,
        code: String,
        ktype: String,
        max_count: u32,
    },
    /// Securities in a watchlist group.
    #[serde(rename = "user_security")]
    UserSecurity { id: u64, group_name: String },
    /// Watchlist groups.
    #[serde(rename = "user_security_group")]
    UserSecurityGroup { id: u64, group_type: String },
    /// Listed stocks of one or more markets.
    #[serde(rename = "stock_basicinfo")]
    StockBasicInfo { id: u64, markets: Vec<Market> },
    /// Trade unlock.
    #[serde(rename = "unlock_trade")]
    UnlockTrade { id: u64, password: Secret },
    /// Open positions.
    #[serde(rename = "position_list")]
    PositionList { id: u64, trd_env: AccountMode },
    /// Account funds.
    #[serde(rename = "account_funds")]
    AccountFunds { id: u64, trd_env: AccountMode },
}

impl OutboundMessage {
    pub fn id(&self) -> u64 {
        match self {
            OutboundMessage::InitConnect { id, .. }
            | OutboundMessage::KeepAlive { id, .. }
            | OutboundMessage::Quote { id, .. }
            | OutboundMessage::HistoryKline { id, .. }
            | OutboundMessage::UserSecurity { id, .. }
            | OutboundMessage::UserSecurityGroup { id, .. }
            | OutboundMessage::StockBasicInfo { id, .. }
            | OutboundMessage::UnlockTrade { id, .. }
            | OutboundMessage::PositionList { id, .. }
            | OutboundMessage::AccountFunds { id, .. } => *id,
        }
    }

    /// Operation name, safe to log.
    pub fn op(&self) -> &'static str {
        match self {
            OutboundMessage::InitConnect { .. } => "init_connect",
            OutboundMessage::KeepAlive { .. } => "keep_alive",
            OutboundMessage::Quote { .. } => "quote",
            OutboundMessage::HistoryKline { .. } => "history_kline",
            OutboundMessage::UserSecurity { .. } => "user_security",
            OutboundMessage::UserSecurityGroup { .. } => "user_security_group",
            OutboundMessage::StockBasicInfo { .. } => "stock_basicinfo",
            OutboundMessage::UnlockTrade { .. } => "unlock_trade",
            OutboundMessage::PositionList { .. } => "position_list",
            OutboundMessage::AccountFunds { .. } => "account_funds",
        }
    }
}

/// Messages received FROM the gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum InboundMessage {
    /// Handshake accepted.
    #[serde(rename = "connected")]
    Connected {
        id: u64,
        server_ver: String,
        conn_id: Option<String>,
    },
    /// Tabular reply to a query.
    #[serde(rename = "reply")]
    Reply { id: u64, data: Table },
    /// Reply without payload (unlock, keepalive).
    #[serde(rename = "ack")]
    Ack { id: u64 },
    /// The request was refused.
    #[serde(rename = "error")]
    Error { id: u64, message: String },
    /// Unsolicited notice from the gateway.
    #[serde(rename = "notice")]
    Notice { message: String },
}

impl InboundMessage {
    /// Id of the request this message answers, if any.
    pub fn request_id(&self) -> Option<u64> {
        match self {
            InboundMessage::Connected { id, .. }
            | InboundMessage::Reply { id, .. }
            | InboundMessage::Ack { id }
            | InboundMessage::Error { id, .. } => Some(*id),
            InboundMessage::Notice { .. } => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            InboundMessage::Connected { .. } => "connected",
            InboundMessage::Reply { .. } => "reply",
            InboundMessage::Ack { .. } => "ack",
            InboundMessage::Error { .. } => "error",
            InboundMessage::Notice { .. } => "notice",
        }
    }

    /// Unwrap a tabular reply.
    pub fn into_table(self) -> Result<Table, GatewayError> {
        match self {
            InboundMessage::Reply { data, .. } => Ok(data),
            InboundMessage::Error { message, .. } => Err(GatewayError::Rejected(message)),
            other => Err(GatewayError::Protocol(format!(
                "expected a reply, got '{}'",
                other.kind()
            ))),
        }
    }

    /// Unwrap an acknowledgement. A tabular reply also counts.
    pub fn into_ack(self) -> Result<(), GatewayError> {
        match self {
            InboundMessage::Ack { .. } | InboundMessage::Reply { .. } => Ok(()),
            InboundMessage::Error { message, .. } => Err(GatewayError::Rejected(message)),
            other => Err(GatewayError::Protocol(format!(
                "expected an ack, got '{}'",
                other.kind()
            ))),
        }
    }
}

/// Frame a message with a 4-byte length prefix (big-endian).
pub fn frame_message(msg: &[u8]) -> Vec<u8> {
    let len = msg.len() as u32;
    let mut framed = Vec::with_capacity(4 + msg.len());
    framed.extend_from_slice(&len.to_be_bytes());
    framed.extend_from_slice(msg);
    framed
}

/// Serialize and frame an outbound message.
pub fn encode<T: Serialize>(msg: &T) -> Result<Vec<u8>, GatewayError> {
    let json = serde_json::to_vec(msg)
        .map_err(|e| GatewayError::Protocol(format!("serialization error: {}", e)))?;
    Ok(frame_message(&json))
}

/// Read one length-prefixed JSON frame.
pub async fn read_frame<R, T>(reader: &mut R) -> Result<T, GatewayError>
where
    R: AsyncRead + Unpin,
    T: for<'de> Deserialize<'de>,
{
    let mut len_buf = [0u8; 4];
    reader
        .read_exact(&mut len_buf)
        .await
        .map_err(|e| GatewayError::Disconnected(format!("read error: {}", e)))?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(GatewayError::Protocol(format!(
            "frame of {} bytes exceeds the {} byte limit",
            len, MAX_FRAME_LEN
        )));
    }

    let mut body = vec![0u8; len];
    reader
        .read_exact(&mut body)
        .await
        .map_err(|e| GatewayError::Disconnected(format!("read error: {}", e)))?;

    serde_json::from_slice(&body)
        .map_err(|e| GatewayError::Protocol(format!("deserialization error: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_frame_prefix() {
        let framed = frame_message(b"{}");
        assert_eq!(&framed[..4], &[0, 0, 0, 2]);
        assert_eq!(&framed[4..], b"{}");
    }

    #[test]
    fn test_outbound_wire_shape() {
        let msg = OutboundMessage::HistoryKline {
            id: 7,
            code: "US.AAPL".to_string(),
            ktype: "K_DAY".to_string(),
            max_count: 30,
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            value,
            json!({"op": "history_kline", "id": 7, "code": "US.AAPL", "ktype": "K_DAY", "max_count": 30})
        );
        assert_eq!(msg.id(), 7);
    }

    #[test]
    fn test_unlock_password_not_in_debug() {
        let msg = OutboundMessage::UnlockTrade {
            id: 1,
            password: Secret::new("hunter2"),
        };
        assert!(!format!("{:?}", msg).contains("hunter2"));
        // ...but it is on the wire
        assert_eq!(serde_json::to_value(&msg).unwrap()["password"], json!("hunter2"));
    }

    #[test]
    fn test_inbound_error_maps_to_rejected() {
        let msg: InboundMessage =
            serde_json::from_value(json!({"type": "error", "id": 3, "message": "unknown stock"}))
                .unwrap();
        assert_eq!(msg.request_id(), Some(3));
        assert_eq!(
            msg.into_table(),
            Err(GatewayError::Rejected("unknown stock".to_string()))
        );
    }

    #[tokio::test]
    async fn test_read_frame_rejects_oversized() {
        let mut bytes: &[u8] = &[0xff, 0xff, 0xff, 0xff];
        let result: Result<InboundMessage, _> = read_frame(&mut bytes).await;
        assert!(matches!(result, Err(GatewayError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_read_frame_round_trip() {
        let framed = encode(&json!({"type": "ack", "id": 9})).unwrap();
        let mut reader: &[u8] = &framed;
        let msg: InboundMessage = read_frame(&mut reader).await.unwrap();
        assert_eq!(msg, InboundMessage::Ack { id: 9 });
    }
}
