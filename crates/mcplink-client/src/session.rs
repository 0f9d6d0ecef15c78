//! Session lifecycle and the negotiated capability set.
//!
//! The state machine is `Connecting → Handshaking → Ready → Closing →
//! Closed`, with `Handshaking → Closed` on negotiation failure and any
//! state → `Closed` on transport loss. State is published through a
//! `tokio::sync::watch` channel owned by the dispatcher.

use std::sync::Arc;

use crate::error::NegotiationError;
use crate::protocol::{
    InitializeResult, ServerCapabilities, ServerInfo, ToolDescriptor, SUPPORTED_PROTOCOL_VERSIONS,
};

/// Lifecycle state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Transport being set up.
    Connecting,
    /// Initialize exchange in progress.
    Handshaking,
    /// Handshake acknowledged; tool invocations accepted.
    Ready,
    /// Shutdown in progress.
    Closing,
    /// Connection is gone; every operation fails.
    Closed,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connecting => write!(f, "connecting"),
            Self::Handshaking => write!(f, "handshaking"),
            Self::Ready => write!(f, "ready"),
            Self::Closing => write!(f, "closing"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

/// Immutable snapshot of what the server offered during the handshake:
/// protocol version, server identity, declared capabilities and the tool
/// list. A refresh replaces the whole snapshot atomically; individual
/// descriptors never mutate.
#[derive(Debug, Clone)]
pub struct CapabilitySet {
    /// Protocol version both sides agreed on.
    pub protocol_version: String,
    /// Server identity.
    pub server_info: ServerInfo,
    /// Capability flags the server declared.
    pub server_capabilities: ServerCapabilities,
    /// Tools available on this connection.
    pub tools: Arc<[ToolDescriptor]>,
}

impl CapabilitySet {
    /// Build the snapshot from the handshake response and the initial tool
    /// listing.
    pub fn new(init: InitializeResult, tools: Vec<ToolDescriptor>) -> Self {
        Self {
            protocol_version: init.protocol_version,
            server_info: init.server_info,
            server_capabilities: init.capabilities,
            tools: tools.into(),
        }
    }

    /// Look up a tool descriptor by name.
    pub fn tool(&self, name: &str) -> Option<&ToolDescriptor> {
        self.tools.iter().find(|t| t.name == name)
    }

    /// Same snapshot with the tool list swapped out.
    pub fn with_tools(&self, tools: Vec<ToolDescriptor>) -> Self {
        Self {
            protocol_version: self.protocol_version.clone(),
            server_info: self.server_info.clone(),
            server_capabilities: self.server_capabilities.clone(),
            tools: tools.into(),
        }
    }
}

/// Check the server's declared protocol version against what this client
/// can speak. A mismatch is fatal; there is no downgrade path below the
/// supported list.
pub fn check_protocol_version(server: &str) -> Result<(), NegotiationError> {
    if SUPPORTED_PROTOCOL_VERSIONS.contains(&server) {
        Ok(())
    } else {
        Err(NegotiationError::VersionMismatch {
            server: server.to_string(),
            supported: SUPPORTED_PROTOCOL_VERSIONS.join(", "),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::MCP_PROTOCOL_VERSION;
    use serde_json::json;

    #[test]
    fn test_state_display() {
        assert_eq!(SessionState::Connecting.to_string(), "connecting");
        assert_eq!(SessionState::Handshaking.to_string(), "handshaking");
        assert_eq!(SessionState::Ready.to_string(), "ready");
        assert_eq!(SessionState::Closing.to_string(), "closing");
        assert_eq!(SessionState::Closed.to_string(), "closed");
    }

    #[test]
    fn test_version_check() {
        assert!(check_protocol_version(MCP_PROTOCOL_VERSION).is_ok());
        assert!(matches!(
            check_protocol_version("1999-01-01"),
            Err(NegotiationError::VersionMismatch { .. })
        ));
    }

    fn sample_set() -> CapabilitySet {
        let init: InitializeResult = serde_json::from_value(json!({
            "protocolVersion": "2024-11-05",
            "capabilities": {},
            "serverInfo": {"name": "weather"}
        }))
        .unwrap();

        let tools = vec![ToolDescriptor {
            name: "get_weather".to_string(),
            description: None,
            input_schema: json!({"type": "object"}),
        }];

        CapabilitySet::new(init, tools)
    }

    #[test]
    fn test_tool_lookup() {
        let caps = sample_set();
        assert!(caps.tool("get_weather").is_some());
        assert!(caps.tool("get_forecast").is_none());
    }

    #[test]
    fn test_with_tools_replaces_whole_list() {
        let caps = sample_set();
        let replaced = caps.with_tools(vec![]);
        assert_eq!(replaced.tools.len(), 0);
        // Original snapshot untouched.
        assert_eq!(caps.tools.len(), 1);
        assert_eq!(replaced.server_info.name, "weather");
    }
}
