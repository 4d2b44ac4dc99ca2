//! Agent facade and connection supervisor

use crate::config::{AgentConfig, AgentOptions};
use crate::connection::{build_tls_connector, ConnectionManager, ConnectionSnapshot};
use crate::control::{ControlSession, SessionEnd};
use crate::error::{InitError, InvalidStateError};
use crate::events::{EventBus, StatusCode, StatusListener, DEFAULT_EVENT_QUEUE_CAPACITY};
use crate::reconnect::{ReconnectError, ReconnectManager};
use crate::relay::RelayEngine;
use crate::state::{SessionState, SessionStateMachine};
use std::sync::{Arc, Mutex, OnceLock};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Point-in-time view of an agent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentStats {
    pub state: SessionState,
    pub live_connections: usize,
    pub active_relays: usize,
    pub dropped_events: u64,
}

/// Components built once the app key and options are known
struct Runtime {
    config: AgentConfig,
    connections: ConnectionManager,
    relays: RelayEngine,
}

struct Supervisor {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

struct AgentInner {
    agent_id: String,
    bus: EventBus,
    state: Arc<SessionStateMachine>,
    runtime: OnceLock<Arc<Runtime>>,
    init_lock: Mutex<()>,
    supervisor: Mutex<Option<Supervisor>>,
}

impl AgentInner {
    fn supervisor(&self) -> std::sync::MutexGuard<'_, Option<Supervisor>> {
        self.supervisor
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for AgentInner {
    fn drop(&mut self) {
        if let Some(supervisor) = self.supervisor().take() {
            supervisor.cancel.cancel();
            supervisor.task.abort();
        }
        if let Some(runtime) = self.runtime.get() {
            for handle in runtime.relays.cancel_all() {
                handle.abort();
            }
            runtime.connections.force_close_all();
        }
        self.bus.shutdown();
    }
}

/// Proxy participation agent
///
/// Must be created inside a Tokio runtime. Clones share the same agent.
///
/// # Example
///
/// ```no_run
/// use packet_agent::{Agent, AgentOptions};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let agent = Agent::new();
/// agent.set_status_listener(|code: i32, message: &str| {
///     println!("[{}] {}", code, message);
/// });
/// agent.initialize("my-app-key", AgentOptions::default())?;
/// agent.start()?;
/// // ...
/// agent.stop().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Agent {
    inner: Arc<AgentInner>,
}

impl Default for Agent {
    fn default() -> Self {
        Self::new()
    }
}

impl Agent {
    pub fn new() -> Self {
        Self::with_event_queue(DEFAULT_EVENT_QUEUE_CAPACITY)
    }

    /// Create an agent whose event queue holds `capacity` undelivered events
    pub fn with_event_queue(capacity: usize) -> Self {
        let bus = EventBus::new(capacity);
        let state = Arc::new(SessionStateMachine::new(bus.clone()));

        Self {
            inner: Arc::new(AgentInner {
                agent_id: uuid::Uuid::new_v4().to_string(),
                bus,
                state,
                runtime: OnceLock::new(),
                init_lock: Mutex::new(()),
                supervisor: Mutex::new(None),
            }),
        }
    }

    /// Validate the app key and options and prepare the agent; allowed once
    pub fn initialize(
        &self,
        app_key: impl Into<String>,
        options: AgentOptions,
    ) -> Result<(), InitError> {
        let _guard = self
            .inner
            .init_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if self.inner.runtime.get().is_some() || self.state() != SessionState::Uninitialized {
            return Err(InitError::AlreadyInitialized);
        }

        let config = AgentConfig::new(app_key, options)?;
        let options = config.options();

        let tls = build_tls_connector(options.tls_root_cert.as_deref())
            .map_err(InitError::InvalidOptions)?;
        let connections = ConnectionManager::new(options.connect_timeout, tls);
        let relays = RelayEngine::new(
            connections.clone(),
            self.inner.bus.clone(),
            self.inner.state.clone(),
            options.relay.clone(),
        );

        if options.enable_logging {
            self.inner.bus.set_logging(true);
        }

        let endpoints: Vec<&str> = config
            .control_endpoints()
            .iter()
            .map(|e| e.address.as_str())
            .collect();
        info!(
            agent_id = %self.inner.agent_id,
            endpoints = ?endpoints,
            "Agent initialized"
        );

        self.inner
            .runtime
            .set(Arc::new(Runtime {
                config,
                connections,
                relays,
            }))
            .map_err(|_| InitError::AlreadyInitialized)?;

        self.inner
            .state
            .transition("initialize", &[SessionState::Uninitialized], SessionState::Initialized, "")
            .map_err(|_| InitError::AlreadyInitialized)?;

        Ok(())
    }

    /// Toggle publication of diagnostic (code 900) events
    pub fn set_enable_logging(&self, enabled: bool) {
        self.inner.bus.set_logging(enabled);
    }

    /// Register the status listener, replacing any previous one
    pub fn set_status_listener<L: StatusListener>(&self, listener: L) {
        self.inner.bus.set_listener(Arc::new(listener));
    }

    pub fn clear_status_listener(&self) {
        self.inner.bus.clear_listener();
    }

    /// Begin connecting in the background
    ///
    /// Returns once the agent is Starting; whether it reaches Running or
    /// Failed is reported through the status listener.
    pub fn start(&self) -> Result<(), InvalidStateError> {
        let mut supervisor = self.inner.supervisor();

        let Some(runtime) = self.inner.runtime.get().cloned() else {
            return Err(InvalidStateError {
                operation: "start",
                state: self.state(),
            });
        };

        self.inner.state.transition(
            "start",
            &[
                SessionState::Initialized,
                SessionState::Stopped,
                SessionState::Failed,
            ],
            SessionState::Starting,
            "",
        )?;

        // A supervisor left over from a failed run has already exited
        if let Some(previous) = supervisor.take() {
            previous.cancel.cancel();
        }

        let cancel = CancellationToken::new();
        let task = tokio::spawn(supervise(
            runtime,
            self.inner.bus.clone(),
            self.inner.state.clone(),
            self.inner.agent_id.clone(),
            cancel.clone(),
        ));

        *supervisor = Some(Supervisor { cancel, task });
        Ok(())
    }

    /// Stop relaying, disconnect and release every connection
    ///
    /// Calling it while already Stopping or Stopped is a no-op.
    pub async fn stop(&self) -> Result<(), InvalidStateError> {
        match self.inner.state.transition(
            "stop",
            &[
                SessionState::Starting,
                SessionState::Running,
                SessionState::Failed,
            ],
            SessionState::Stopping,
            "",
        ) {
            Ok(_) => {}
            Err(e) if matches!(e.state, SessionState::Stopping | SessionState::Stopped) => {
                return Ok(())
            }
            Err(e) => return Err(e),
        }

        if let Some(runtime) = self.inner.runtime.get() {
            let grace = runtime.config.options().shutdown_grace;
            let deadline = tokio::time::Instant::now() + grace;

            // Relays stop forwarding before anything is awaited
            let relays = runtime.relays.cancel_all();

            let supervisor = self.inner.supervisor().take();
            if let Some(supervisor) = supervisor {
                supervisor.cancel.cancel();
                let mut task = supervisor.task;
                if tokio::time::timeout_at(deadline, &mut task).await.is_err() {
                    warn!("Supervisor did not stop within grace period, aborting");
                    task.abort();
                    let _ = task.await;
                }
            }

            RelayEngine::shutdown(relays, deadline).await;

            let closed = runtime.connections.force_close_all();
            if closed > 0 {
                debug!(closed, "Force-closed remaining connections");
            }
        }

        self.inner.state.transition(
            "stop",
            &[SessionState::Stopping],
            SessionState::Stopped,
            "",
        )?;

        info!(agent_id = %self.inner.agent_id, "Agent stopped");
        Ok(())
    }

    pub fn state(&self) -> SessionState {
        self.inner.state.current()
    }

    /// Watch lifecycle transitions
    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.inner.state.subscribe()
    }

    pub fn stats(&self) -> AgentStats {
        let runtime = self.inner.runtime.get();
        AgentStats {
            state: self.state(),
            live_connections: runtime.map_or(0, |r| r.connections.count()),
            active_relays: runtime.map_or(0, |r| r.relays.active_count()),
            dropped_events: self.inner.bus.dropped(),
        }
    }

    /// Snapshots of every live connection
    pub fn connections(&self) -> Vec<ConnectionSnapshot> {
        self.inner
            .runtime
            .get()
            .map(|r| r.connections.snapshot())
            .unwrap_or_default()
    }

    pub fn agent_id(&self) -> &str {
        &self.inner.agent_id
    }

    /// Options in effect, once initialized
    pub fn options(&self) -> Option<&AgentOptions> {
        self.inner.runtime.get().map(|r| r.config.options())
    }
}

/// Connect, serve and reconnect until cancelled, rejected or out of retries
async fn supervise(
    runtime: Arc<Runtime>,
    bus: EventBus,
    state: Arc<SessionStateMachine>,
    agent_id: String,
    cancel: CancellationToken,
) {
    let options = runtime.config.options();
    let endpoints = runtime.config.control_endpoints();
    let mut backoff = ReconnectManager::new(options.reconnect.clone());
    let mut next_endpoint = 0usize;

    loop {
        let endpoint = &endpoints[next_endpoint % endpoints.len()];

        info!(agent_id = %agent_id, endpoint = %endpoint.address, "Connecting to control server");
        bus.log(format!("connecting to {}", endpoint.address));

        let attempt = tokio::select! {
            _ = cancel.cancelled() => return,
            result = ControlSession::establish(&runtime.connections, endpoint, &runtime.config, &agent_id) => result,
        };

        match attempt {
            Ok(session) => {
                backoff.reset();

                let detail = format!("session {} via {}", session.session_id(), endpoint.address);
                if state
                    .transition("connect", &[SessionState::Starting], SessionState::Running, detail)
                    .is_err()
                {
                    // stop() got there first
                    return;
                }

                match session.run(&runtime.relays, &bus, &cancel).await {
                    SessionEnd::Shutdown => return,
                    SessionEnd::ServerDisconnect(reason) => {
                        if !leave_running(&state, &runtime, format!("server disconnect: {}", reason)) {
                            return;
                        }
                    }
                    SessionEnd::Lost(e) => {
                        if !leave_running(&state, &runtime, format!("connection lost: {}", e)) {
                            return;
                        }
                    }
                }
            }
            Err(e) if e.is_fatal() => {
                error!(endpoint = %endpoint.address, error = %e, "Control server refused agent");
                let _ = state.transition(
                    "connect",
                    &[SessionState::Starting],
                    SessionState::Failed,
                    e.to_string(),
                );
                return;
            }
            Err(e) => {
                warn!(endpoint = %endpoint.address, error = %e, "Failed to connect to control server");
                bus.log(format!("connect to {} failed: {}", endpoint.address, e));
                next_endpoint += 1;
            }
        }

        if backoff.is_exhausted() {
            error!(max_retries = backoff.max_retries(), "Giving up on control server");
            let _ = state.transition(
                "connect",
                &[SessionState::Starting],
                SessionState::Failed,
                format!("no connection after {} retries", backoff.max_retries()),
            );
            return;
        }

        // Emitted under the state lock so it cannot follow stop()'s Stopping event
        let retrying = state.with_state(|current| {
            if current != SessionState::Starting || cancel.is_cancelled() {
                return false;
            }
            bus.emit(
                StatusCode::Reconnecting,
                format!(
                    "reconnecting (attempt {}/{})",
                    backoff.attempt() + 1,
                    backoff.max_retries()
                ),
            );
            true
        });
        if !retrying {
            return;
        }

        match backoff.wait(&cancel).await {
            Ok(delay) => bus.log(format!("retrying after {} ms", delay.as_millis())),
            Err(ReconnectError::Cancelled) => return,
            Err(ReconnectError::MaxAttemptsReached) => {
                let _ = state.transition(
                    "connect",
                    &[SessionState::Starting],
                    SessionState::Failed,
                    "reconnection attempts exhausted",
                );
                return;
            }
        }
    }
}

/// Running -> Starting after a lost session; false if the state moved on
fn leave_running(state: &SessionStateMachine, runtime: &Runtime, reason: String) -> bool {
    let left = state
        .transition("reconnect", &[SessionState::Running], SessionState::Starting, reason)
        .is_ok();

    // Relays belong to the session that just ended
    runtime.relays.cancel_all();
    left
}
