//! # mcplink-client
//!
//! Client library for MCP (Model Context Protocol) tool servers.
//!
//! This crate provides:
//! - Transports: spawned stdio processes, TCP streams, anything that can
//!   split into a frame sink and a frame source
//! - Newline-delimited JSON-RPC 2.0 framing and decoding
//! - Request correlation with per-call timeouts and cancellation
//! - Capability negotiation and the session state machine
//! - A tool invocation API with local schema validation
//!
//! ```no_run
//! use mcplink_client::{Connection, ServerConfig};
//! use serde_json::json;
//!
//! # async fn run() -> mcplink_client::Result<()> {
//! let config = ServerConfig::new("weather", "python3").with_arg("weather.py");
//! let connection = Connection::spawn(config).await?;
//!
//! for tool in connection.list_tools().await? {
//!     println!("{}", tool.name);
//! }
//!
//! let result = connection
//!     .call_tool("get_weather", Some(json!({"city": "Boston"})))
//!     .await?;
//! println!("{}", result.text());
//!
//! connection.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod codec;
pub mod correlator;
pub mod error;
pub mod protocol;
pub mod session;
pub mod transport;
pub mod validate;

pub use client::{ConnectOptions, Connection, ServerConfig, DEFAULT_REQUEST_TIMEOUT};
pub use codec::Message;
pub use error::{ClientError, DecodeError, NegotiationError, Result, ToolError, TransportError};
pub use protocol::{CallToolResult, ToolContent, ToolDescriptor};
pub use session::{CapabilitySet, SessionState};
pub use transport::{connect_tcp, StdioTransport, StreamTransport, Transport};
