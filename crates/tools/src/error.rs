use futumcp_core::GatewayError;

use crate::translate::TranslateError;

/// Everything that can go wrong while serving a tool call.
///
/// The dispatcher turns each variant into a single error block of the form
/// `[<classification>] <message>`.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ToolError {
    #[error("unknown tool '{0}'")]
    UnknownTool(String),

    #[error("invalid argument '{field}': {reason}")]
    Validation { field: String, reason: String },

    #[error("{0}. Make sure the OpenD gateway is running and the host/port are correct (see configure_futu_client)")]
    Connection(String),

    #[error("{0}")]
    TradingLocked(String),

    #[error("broker rejected the query: {0}")]
    BrokerQuery(String),

    #[error("{0}")]
    Internal(String),
}

impl ToolError {
    pub fn validation(field: impl Into<String>, reason: impl Into<String>) -> Self {
        ToolError::Validation {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Stable label shown in front of the message.
    pub fn classification(&self) -> &'static str {
        match self {
            ToolError::UnknownTool(_) => "UnknownToolError",
            ToolError::Validation { .. } => "ValidationError",
            ToolError::Connection(_) => "ConnectionError",
            ToolError::TradingLocked(_) => "TradingLockedError",
            ToolError::BrokerQuery(_) => "BrokerQueryError",
            ToolError::Internal(_) => "InternalError",
        }
    }
}

impl From<GatewayError> for ToolError {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::Rejected(reason) => ToolError::BrokerQuery(reason),
            other => ToolError::Connection(other.to_string()),
        }
    }
}

impl From<TranslateError> for ToolError {
    fn from(err: TranslateError) -> Self {
        ToolError::Internal(format!("could not translate broker response: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_gateway_error_mapping() {
        let err: ToolError = GatewayError::Rejected("unknown stock US.XXXX".into()).into();
        assert_eq!(err, ToolError::BrokerQuery("unknown stock US.XXXX".into()));

        let err: ToolError = GatewayError::Timeout(Duration::from_secs(15)).into();
        assert_eq!(err.classification(), "ConnectionError");
        assert!(err.to_string().contains("OpenD"));
    }

    #[test]
    fn test_validation_message_names_field() {
        let err = ToolError::validation("count", "must be between 1 and 1000");
        assert_eq!(
            err.to_string(),
            "invalid argument 'count': must be between 1 and 1000"
        );
    }
}
