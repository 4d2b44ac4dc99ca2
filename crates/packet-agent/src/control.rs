//! Control channel session
//!
//! One [`ControlSession`] is one authenticated control connection: the Hello
//! handshake, the heartbeat, and dispatch of assignments to the relay engine.
//! Reconnection across sessions is the supervisor's job.

use crate::config::{AgentConfig, ControlEndpoint, HeartbeatConfig};
use crate::connection::{Connection, ConnectionKind, ConnectionManager, Endpoint};
use crate::error::{NetworkError, RelayError};
use crate::events::{EventBus, StatusCode};
use crate::relay::{RelayEngine, RelayOutcome};
use futures::stream::FuturesUnordered;
use futures::{SinkExt, StreamExt};
use packet_proto::{AgentMetadata, ControlCodec, ControlMessage, PROTOCOL_VERSION};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// How long to wait for the server to acknowledge a graceful disconnect
const DISCONNECT_ACK_TIMEOUT: Duration = Duration::from_secs(3);

/// Why a session ended
#[derive(Debug)]
pub enum SessionEnd {
    /// Local shutdown requested
    Shutdown,
    /// Server closed the session deliberately
    ServerDisconnect(String),
    /// Connection lost: heartbeat timeout, IO error or protocol error
    Lost(NetworkError),
}

/// An established control connection
pub struct ControlSession {
    framed: Framed<Connection, ControlCodec>,
    session_id: String,
    endpoint: String,
    heartbeat: HeartbeatConfig,
}

impl ControlSession {
    /// Connect to `endpoint` and complete the Hello/Welcome handshake
    pub async fn establish(
        connections: &ConnectionManager,
        endpoint: &ControlEndpoint,
        config: &AgentConfig,
        agent_id: &str,
    ) -> Result<Self, NetworkError> {
        let options = config.options();
        let connection = connections
            .connect(&Endpoint::from(endpoint), ConnectionKind::Control)
            .await?;
        let mut framed = Framed::new(connection, ControlCodec::new());

        let hello = ControlMessage::Hello {
            agent_id: agent_id.to_string(),
            app_key: config.app_key().to_string(),
            protocol_version: PROTOCOL_VERSION,
            metadata: AgentMetadata::default(),
        };

        let (session_id, heartbeat_interval_ms) =
            match tokio::time::timeout(
                options.handshake_timeout,
                Self::handshake(&mut framed, hello, &endpoint.address),
            )
            .await
            {
                Ok(result) => result?,
                Err(_) => return Err(NetworkError::Timeout(endpoint.address.clone())),
            };

        let mut heartbeat = options.heartbeat.clone();
        if heartbeat_interval_ms > 0 {
            heartbeat.interval = Duration::from_millis(heartbeat_interval_ms);
        }

        info!(
            endpoint = %endpoint.address,
            session_id = %session_id,
            heartbeat_ms = heartbeat.interval.as_millis() as u64,
            "Control session established"
        );

        Ok(Self {
            framed,
            session_id,
            endpoint: endpoint.address.clone(),
            heartbeat,
        })
    }

    async fn handshake(
        framed: &mut Framed<Connection, ControlCodec>,
        hello: ControlMessage,
        endpoint: &str,
    ) -> Result<(String, u64), NetworkError> {
        framed.send(hello).await?;
        debug!(endpoint = %endpoint, "Sent Hello");

        match framed.next().await {
            Some(Ok(ControlMessage::Welcome {
                session_id,
                heartbeat_interval_ms,
            })) => Ok((session_id, heartbeat_interval_ms)),
            Some(Ok(ControlMessage::Rejected { reason })) => {
                error!(endpoint = %endpoint, reason = %reason, "Agent rejected");
                Err(NetworkError::Rejected(reason))
            }
            Some(Ok(other)) => Err(NetworkError::Protocol(format!(
                "unexpected handshake reply: {:?}",
                other
            ))),
            Some(Err(e)) => Err(e.into()),
            None => Err(NetworkError::Protocol(
                "connection closed during handshake".to_string(),
            )),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Serve the session until it ends
    pub async fn run(
        mut self,
        relays: &RelayEngine,
        bus: &EventBus,
        cancel: &CancellationToken,
    ) -> SessionEnd {
        bus.emit(
            StatusCode::ControlConnected,
            format!("connected to {} (session {})", self.endpoint, self.session_id),
        );

        let end = self.serve(relays, bus, cancel).await;

        let detail = match &end {
            SessionEnd::Shutdown => "shutdown".to_string(),
            SessionEnd::ServerDisconnect(reason) => format!("server disconnect: {}", reason),
            SessionEnd::Lost(e) => e.to_string(),
        };
        info!(endpoint = %self.endpoint, reason = %detail, "Control session ended");
        bus.emit(
            StatusCode::ControlDisconnected,
            format!("disconnected from {}: {}", self.endpoint, detail),
        );

        end
    }

    async fn serve(
        &mut self,
        relays: &RelayEngine,
        bus: &EventBus,
        cancel: &CancellationToken,
    ) -> SessionEnd {
        let mut ticker = tokio::time::interval_at(
            tokio::time::Instant::now() + self.heartbeat.interval,
            self.heartbeat.interval,
        );
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let mut awaiting_pong = false;
        let mut missed = 0u32;
        let mut outcomes: FuturesUnordered<oneshot::Receiver<RelayOutcome>> =
            FuturesUnordered::new();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    self.disconnect_gracefully().await;
                    return SessionEnd::Shutdown;
                }

                _ = ticker.tick() => {
                    if awaiting_pong {
                        missed += 1;
                        warn!(missed, threshold = self.heartbeat.miss_threshold, "Heartbeat missed");
                        bus.emit(
                            StatusCode::HeartbeatMissed,
                            format!("heartbeat missed ({}/{})", missed, self.heartbeat.miss_threshold),
                        );
                        if missed >= self.heartbeat.miss_threshold {
                            return SessionEnd::Lost(NetworkError::Timeout(format!(
                                "{} (no heartbeat reply after {} intervals)",
                                self.endpoint, missed
                            )));
                        }
                    }

                    let timestamp = chrono::Utc::now().timestamp_millis() as u64;
                    if let Err(e) = self.framed.send(ControlMessage::Ping { timestamp }).await {
                        return SessionEnd::Lost(e.into());
                    }
                    awaiting_pong = true;
                }

                Some(outcome) = outcomes.next(), if !outcomes.is_empty() => {
                    // A dropped sender means the relay task was aborted; the
                    // server learns about it when the session ends
                    if let Ok(outcome) = outcome {
                        let report = ControlMessage::AssignmentFinished {
                            assignment_id: outcome.assignment_id,
                            bytes_up: outcome.bytes_up,
                            bytes_down: outcome.bytes_down,
                            reason: outcome.reason,
                        };
                        if let Err(e) = self.framed.send(report).await {
                            return SessionEnd::Lost(e.into());
                        }
                    }
                }

                frame = self.framed.next() => {
                    let message = match frame {
                        Some(Ok(message)) => message,
                        Some(Err(e)) => return SessionEnd::Lost(e.into()),
                        None => {
                            return SessionEnd::Lost(NetworkError::Io {
                                endpoint: self.endpoint.clone(),
                                source: std::io::ErrorKind::UnexpectedEof.into(),
                            })
                        }
                    };

                    // Any frame proves the server is alive
                    awaiting_pong = false;
                    missed = 0;

                    match message {
                        ControlMessage::Ping { timestamp } => {
                            if let Err(e) = self.framed.send(ControlMessage::Pong { timestamp }).await {
                                return SessionEnd::Lost(e.into());
                            }
                        }
                        ControlMessage::Pong { .. } => {}
                        ControlMessage::Assign(assignment) => {
                            let assignment_id = assignment.assignment_id.clone();
                            let reply = match relays.apply_assignment(assignment, self.session_id.clone()) {
                                Ok(outcome) => {
                                    outcomes.push(outcome);
                                    ControlMessage::AssignmentAccepted { assignment_id }
                                }
                                Err(e) => {
                                    Self::report_rejection(bus, &assignment_id, &e);
                                    ControlMessage::AssignmentRejected {
                                        assignment_id,
                                        reason: e.to_string(),
                                    }
                                }
                            };
                            if let Err(e) = self.framed.send(reply).await {
                                return SessionEnd::Lost(e.into());
                            }
                        }
                        ControlMessage::Revoke { assignment_id, reason } => {
                            if !relays.revoke(&assignment_id, &reason) {
                                debug!(assignment_id = %assignment_id, "Revoke for unknown assignment");
                            }
                        }
                        ControlMessage::Disconnect { reason } => {
                            info!(reason = %reason, "Server requested disconnect");
                            let _ = self.framed.send(ControlMessage::DisconnectAck).await;
                            return SessionEnd::ServerDisconnect(reason);
                        }
                        other => {
                            warn!("Unexpected message on control channel: {:?}", other);
                        }
                    }
                }
            }
        }
    }

    fn report_rejection(bus: &EventBus, assignment_id: &str, err: &RelayError) {
        warn!(assignment_id = %assignment_id, error = %err, "Assignment rejected");
        bus.emit(
            StatusCode::AssignmentRejected,
            format!("assignment {} rejected: {}", assignment_id, err),
        );
    }

    async fn disconnect_gracefully(&mut self) {
        info!("Shutdown requested, sending disconnect");
        if let Err(e) = self
            .framed
            .send(ControlMessage::Disconnect {
                reason: "agent shutdown".to_string(),
            })
            .await
        {
            warn!("Failed to send disconnect: {}", e);
            return;
        }

        let deadline = tokio::time::Instant::now() + DISCONNECT_ACK_TIMEOUT;
        loop {
            match tokio::time::timeout_at(deadline, self.framed.next()).await {
                Ok(Some(Ok(ControlMessage::DisconnectAck))) => {
                    info!("Disconnect acknowledged by server");
                    return;
                }
                Ok(Some(Ok(other))) => {
                    debug!("Ignoring message while waiting for disconnect ack: {:?}", other);
                }
                Ok(Some(Err(e))) => {
                    warn!("Error waiting for disconnect ack: {}", e);
                    return;
                }
                Ok(None) => {
                    info!("Control connection closed before ack");
                    return;
                }
                Err(_) => {
                    warn!("Disconnect ack timeout");
                    return;
                }
            }
        }
    }
}
