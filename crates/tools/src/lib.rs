//! Session management and tool dispatch between the protocol server and the
//! broker gateway.

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod handlers;
pub mod registry;
pub mod result;
pub mod session;
pub mod translate;

pub use config::ConfigurationGateway;
pub use dispatcher::Dispatcher;
pub use error::ToolError;
pub use registry::{ToolCall, ToolDefinition, ToolId, ToolRegistry};
pub use result::{ContentBlock, ToolResult};
pub use session::{
    BrokerSessionHandle, GatewayLease, SessionSettings, SessionState, SessionStatus, SessionUpdate,
};
