//! Packet Agent - embeddable proxy participation agent
//!
//! The agent keeps an authenticated control connection to the relay network
//! and, when the server assigns work, relays bytes between a peer relay
//! endpoint and an upstream target on behalf of the network.
//!
//! # Features
//!
//! - **Lifecycle**: an explicit state machine (Uninitialized, Initialized,
//!   Starting, Running, Stopping, Stopped, Failed) gates every operation
//! - **Reconnection**: exponential backoff with jitter, bounded retries,
//!   heartbeat-based loss detection
//! - **Relays**: independent per-assignment relays with byte and duration
//!   quotas and bounded buffering
//! - **Status events**: a single host listener fed from a bounded queue that
//!   never blocks the agent
//!
//! # Example Usage
//!
//! ```no_run
//! use packet_agent::{Agent, AgentOptions};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let agent = Agent::new();
//!     agent.set_status_listener(|code: i32, message: &str| {
//!         println!("[{}] {}", code, message);
//!     });
//!
//!     agent.initialize("your-app-key", AgentOptions::default())?;
//!     agent.start()?;
//!
//!     tokio::signal::ctrl_c().await?;
//!     agent.stop().await?;
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! 1. **Initialize**: validate the app key and options, build the TLS client
//! 2. **Start**: a supervisor task dials the control server and says Hello
//! 3. **Run**: heartbeats keep the session alive; `Assign` frames start relays
//! 4. **Relay**: dial the peer, send the bind preamble, dial the target, pump
//! 5. **Reconnect**: on loss, relays are cancelled and the supervisor retries
//! 6. **Stop**: relays cease, the server is told, every connection is closed

mod agent;
mod config;
mod connection;
mod control;
mod error;
mod events;
mod reconnect;
mod relay;
mod state;

// Re-export public API
pub use agent::{Agent, AgentStats};
pub use config::{
    AgentConfig, AgentOptions, AgentOptionsBuilder, ControlEndpoint, HeartbeatConfig,
    ReconnectConfig, RelayLimits, DEFAULT_CONTROL_ENDPOINT,
};
pub use connection::{
    build_tls_connector, Connection, ConnectionId, ConnectionKind, ConnectionManager,
    ConnectionSnapshot, Endpoint,
};
pub use control::{ControlSession, SessionEnd};
pub use error::{ConfigError, InitError, InvalidStateError, NetworkError, RelayError};
pub use events::{
    EventBus, StatusCode, StatusEvent, StatusListener, DEFAULT_EVENT_QUEUE_CAPACITY,
};
pub use reconnect::{ReconnectError, ReconnectManager};
pub use relay::{RelayEngine, RelayOutcome};
pub use state::{SessionState, SessionStateMachine};

pub use packet_proto::{FinishReason, Quota, RelayAssignment};
