//! Protocol message types

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Control channel message
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum ControlMessage {
    // Session setup
    /// Agent introduces itself on a new control connection
    Hello {
        agent_id: String,
        app_key: String,
        protocol_version: u32,
        metadata: AgentMetadata,
    },
    /// Server accepted the agent
    Welcome {
        session_id: String,
        /// Server-preferred heartbeat interval (0 = use the agent's own)
        heartbeat_interval_ms: u64,
    },
    /// Server refused the agent (unknown app key, banned, etc.)
    Rejected {
        reason: String,
    },

    // Liveness
    Ping {
        timestamp: u64,
    },
    Pong {
        timestamp: u64,
    },

    // Relay control
    /// Server asks the agent to relay between a peer and a target
    Assign(RelayAssignment),
    /// Server withdraws a running assignment
    Revoke {
        assignment_id: String,
        reason: String,
    },
    AssignmentAccepted {
        assignment_id: String,
    },
    AssignmentRejected {
        assignment_id: String,
        reason: String,
    },
    AssignmentFinished {
        assignment_id: String,
        bytes_up: u64,
        bytes_down: u64,
        reason: FinishReason,
    },

    // Teardown
    Disconnect {
        reason: String,
    },
    DisconnectAck,
}

/// Instruction binding a peer connection to an upstream target
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RelayAssignment {
    pub assignment_id: String,
    /// Peer relay endpoint the agent dials (host:port)
    pub peer_endpoint: String,
    /// Upstream target the agent dials (host:port)
    pub target: String,
    pub quota: Quota,
}

/// Resource limit bounding a relay assignment
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Quota {
    /// Bytes forwarded in both directions combined
    pub max_bytes: Option<u64>,
    pub max_duration_ms: Option<u64>,
}

impl Quota {
    pub fn unlimited() -> Self {
        Self::default()
    }

    pub fn bytes(max_bytes: u64) -> Self {
        Self {
            max_bytes: Some(max_bytes),
            max_duration_ms: None,
        }
    }

    pub fn duration(max_duration: Duration) -> Self {
        Self {
            max_bytes: None,
            max_duration_ms: Some(max_duration.as_millis() as u64),
        }
    }

    pub fn max_duration(&self) -> Option<Duration> {
        self.max_duration_ms.map(Duration::from_millis)
    }
}

/// Why a relay ended
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum FinishReason {
    /// Both sides closed cleanly
    Completed,
    /// Byte or duration quota reached
    QuotaExceeded,
    /// Revoked by the server
    Revoked,
    /// Agent session ended (stop or reconnect)
    Cancelled,
    /// Peer or target failure
    Failed(String),
}

/// First frame on a peer relay connection, before raw bytes flow
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RelayBind {
    pub assignment_id: String,
    pub session_id: String,
}

/// Agent metadata reported in Hello
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AgentMetadata {
    pub hostname: String,
    pub platform: String, // e.g., "linux", "android", "windows"
    pub version: String,  // Agent software version
}

impl Default for AgentMetadata {
    fn default() -> Self {
        Self {
            hostname: hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
                .unwrap_or_else(|| "unknown".to_string()),
            platform: std::env::consts::OS.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}
