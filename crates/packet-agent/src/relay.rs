//! Traffic relay engine
//!
//! Each assignment runs in its own task: dial the peer, send the bind
//! preamble, dial the target, then copy bytes both ways until both sides
//! close, the quota is used up, the server revokes it, or the session leaves
//! Running.
//!
//! Each direction owns a single buffer of `buffer_size` bytes and does not
//! read again until the previous chunk has been written, so a slow receiver
//! pauses the opposite reader instead of growing memory.

use crate::config::RelayLimits;
use crate::connection::{Connection, ConnectionKind, ConnectionManager, Endpoint};
use crate::error::{InvalidStateError, RelayError};
use crate::events::{EventBus, StatusCode};
use crate::state::{SessionState, SessionStateMachine};
use packet_proto::{codec, FinishReason, RelayAssignment, RelayBind};
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Final report of one relay
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayOutcome {
    pub assignment_id: String,
    pub reason: FinishReason,
    /// Peer -> target
    pub bytes_up: u64,
    /// Target -> peer
    pub bytes_down: u64,
}

/// Why a relay was told to stop from outside
#[derive(Debug, Clone)]
enum StopCause {
    Revoked(String),
    Shutdown,
}

struct ActiveRelay {
    seq: u64,
    cancel: CancellationToken,
    cause: Arc<OnceLock<StopCause>>,
    handle: JoinHandle<()>,
}

struct EngineInner {
    connections: ConnectionManager,
    bus: EventBus,
    state: Arc<SessionStateMachine>,
    limits: RelayLimits,
    active: Mutex<HashMap<String, ActiveRelay>>,
    next_seq: AtomicU64,
}

impl EngineInner {
    fn active(&self) -> std::sync::MutexGuard<'_, HashMap<String, ActiveRelay>> {
        self.active
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Runs relay assignments while the session is Running
#[derive(Clone)]
pub struct RelayEngine {
    inner: Arc<EngineInner>,
}

impl RelayEngine {
    pub fn new(
        connections: ConnectionManager,
        bus: EventBus,
        state: Arc<SessionStateMachine>,
        limits: RelayLimits,
    ) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                connections,
                bus,
                state,
                limits,
                active: Mutex::new(HashMap::new()),
                next_seq: AtomicU64::new(1),
            }),
        }
    }

    /// Start forwarding for an assignment
    ///
    /// The returned receiver resolves with the outcome once the relay ends.
    pub fn apply_assignment(
        &self,
        assignment: RelayAssignment,
        session_id: impl Into<String>,
    ) -> Result<oneshot::Receiver<RelayOutcome>, RelayError> {
        let session_id = session_id.into();
        let inner = self.inner.clone();

        // Holding the state lock orders this against the transition out of
        // Running, which is always followed by cancel_all
        self.inner.state.with_state(|state| {
            if state != SessionState::Running {
                return Err(RelayError::InvalidState(InvalidStateError {
                    operation: "apply assignment",
                    state,
                }));
            }

            let mut active = inner.active();
            if active.contains_key(&assignment.assignment_id) {
                return Err(RelayError::Duplicate(assignment.assignment_id.clone()));
            }
            if active.len() >= inner.limits.max_concurrent_relays {
                return Err(RelayError::CapacityExceeded(active.len()));
            }

            let seq = inner.next_seq.fetch_add(1, Ordering::Relaxed);
            let cancel = CancellationToken::new();
            let cause = Arc::new(OnceLock::new());
            let (outcome_tx, outcome_rx) = oneshot::channel();

            let handle = tokio::spawn(Self::run(
                inner.clone(),
                seq,
                assignment.clone(),
                session_id,
                cancel.clone(),
                cause.clone(),
                outcome_tx,
            ));

            active.insert(
                assignment.assignment_id.clone(),
                ActiveRelay {
                    seq,
                    cancel,
                    cause,
                    handle,
                },
            );

            Ok(outcome_rx)
        })
    }

    /// End a relay at the server's request; false if it is not active
    pub fn revoke(&self, assignment_id: &str, reason: &str) -> bool {
        let active = self.inner.active();
        match active.get(assignment_id) {
            Some(relay) => {
                let _ = relay.cause.set(StopCause::Revoked(reason.to_string()));
                relay.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel every relay immediately
    ///
    /// Returns the task handles so the caller can wait for them.
    pub fn cancel_all(&self) -> Vec<JoinHandle<()>> {
        let drained: Vec<ActiveRelay> = self.inner.active().drain().map(|(_, r)| r).collect();

        if !drained.is_empty() {
            tracing::info!(relays = drained.len(), "Cancelling active relays");
        }

        drained
            .into_iter()
            .map(|relay| {
                let _ = relay.cause.set(StopCause::Shutdown);
                relay.cancel.cancel();
                relay.handle
            })
            .collect()
    }

    /// Wait until `deadline` for relays returned by `cancel_all` to finish;
    /// stragglers are aborted
    pub async fn shutdown(handles: Vec<JoinHandle<()>>, deadline: tokio::time::Instant) {
        for mut handle in handles {
            if tokio::time::timeout_at(deadline, &mut handle).await.is_err() {
                tracing::warn!("Relay did not stop within grace period, aborting");
                handle.abort();
                let _ = handle.await;
            }
        }
    }

    pub fn active_count(&self) -> usize {
        self.inner.active().len()
    }

    async fn run(
        inner: Arc<EngineInner>,
        seq: u64,
        assignment: RelayAssignment,
        session_id: String,
        cancel: CancellationToken,
        cause: Arc<OnceLock<StopCause>>,
        outcome_tx: oneshot::Sender<RelayOutcome>,
    ) {
        let id = assignment.assignment_id.clone();
        let started = Instant::now();

        tracing::info!(
            assignment_id = %id,
            peer = %assignment.peer_endpoint,
            target = %assignment.target,
            max_bytes = ?assignment.quota.max_bytes,
            max_duration_ms = ?assignment.quota.max_duration_ms,
            "Starting relay"
        );
        inner.bus.emit(
            StatusCode::RelayStarted,
            format!("relay {} started: {} -> {}", id, assignment.peer_endpoint, assignment.target),
        );

        let counters = Counters::default();
        let result = Self::establish_and_pump(&inner, &assignment, &session_id, &cancel, &counters).await;

        let (up, down) = counters.get();
        let reason = match result {
            Ok(PumpEnd::QuotaReached) => FinishReason::QuotaExceeded,
            Ok(PumpEnd::Completed) => FinishReason::Completed,
            Ok(PumpEnd::Cancelled) => match cause.get() {
                Some(StopCause::Revoked(_)) => FinishReason::Revoked,
                _ => FinishReason::Cancelled,
            },
            Err(e) => FinishReason::Failed(e.to_string()),
        };

        let summary = format!("relay {} ended after {} bytes up, {} bytes down", id, up, down);
        match &reason {
            FinishReason::Completed => inner.bus.emit(StatusCode::RelayCompleted, summary),
            FinishReason::QuotaExceeded => inner.bus.emit(
                StatusCode::QuotaExceeded,
                format!("relay {} reached its quota after {} bytes", id, up + down),
            ),
            FinishReason::Revoked => {
                let why = match cause.get() {
                    Some(StopCause::Revoked(why)) => why.as_str(),
                    _ => "",
                };
                inner
                    .bus
                    .emit(StatusCode::RelayRevoked, format!("{} (revoked: {})", summary, why));
            }
            FinishReason::Cancelled => inner.bus.log(format!("{} (session ended)", summary)),
            FinishReason::Failed(error) => inner
                .bus
                .emit(StatusCode::RelayFailed, format!("{}: {}", summary, error)),
        }

        tracing::info!(
            assignment_id = %id,
            reason = ?reason,
            bytes_up = up,
            bytes_down = down,
            duration_ms = started.elapsed().as_millis() as u64,
            "Relay finished"
        );

        {
            let mut active = inner.active();
            if active.get(&id).map(|r| r.seq) == Some(seq) {
                active.remove(&id);
            }
        }

        let _ = outcome_tx.send(RelayOutcome {
            assignment_id: id,
            reason,
            bytes_up: up,
            bytes_down: down,
        });
    }

    async fn establish_and_pump(
        inner: &EngineInner,
        assignment: &RelayAssignment,
        session_id: &str,
        cancel: &CancellationToken,
        counters: &Counters,
    ) -> Result<PumpEnd, RelayError> {
        let connect = async {
            let mut peer = inner
                .connections
                .connect(&Endpoint::plain(assignment.peer_endpoint.clone()), ConnectionKind::Peer)
                .await?;

            let bind = codec::encode_frame(&RelayBind {
                assignment_id: assignment.assignment_id.clone(),
                session_id: session_id.to_string(),
            })
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            peer.write_all(&bind).await?;
            peer.flush().await?;

            let target = inner
                .connections
                .connect(&Endpoint::plain(assignment.target.clone()), ConnectionKind::Target)
                .await?;

            Ok::<(Connection, Connection), RelayError>((peer, target))
        };

        let (peer, target) = tokio::select! {
            _ = cancel.cancelled() => return Ok(PumpEnd::Cancelled),
            result = connect => result?,
        };

        let limiter = inner.limits.max_bytes_per_sec.map(RateLimiter::new);
        let pump = Pump {
            meter: QuotaMeter::new(assignment.quota.max_bytes),
            limiter,
            buffer_size: inner.limits.buffer_size,
        };

        pump.run(peer, target, assignment.quota.max_duration(), cancel, counters)
            .await
    }
}

/// How the pump as a whole ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PumpEnd {
    Completed,
    QuotaReached,
    Cancelled,
}

/// How one direction ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DirectionEnd {
    Eof,
    QuotaReached,
    Stopped,
}

#[derive(Default)]
struct Counters {
    up: AtomicU64,
    down: AtomicU64,
}

impl Counters {
    fn get(&self) -> (u64, u64) {
        (self.up.load(Ordering::SeqCst), self.down.load(Ordering::SeqCst))
    }
}

/// Remaining byte allowance shared by both directions
struct QuotaMeter {
    remaining: Option<AtomicU64>,
}

impl QuotaMeter {
    fn new(max_bytes: Option<u64>) -> Self {
        Self {
            remaining: max_bytes.map(AtomicU64::new),
        }
    }

    /// Take up to `wanted` bytes of allowance; returns what was granted
    fn consume(&self, wanted: u64) -> u64 {
        let Some(remaining) = &self.remaining else {
            return wanted;
        };

        let mut granted = 0;
        let _ = remaining.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
            granted = current.min(wanted);
            Some(current - granted)
        });
        granted
    }

    fn exhausted(&self) -> bool {
        self.remaining
            .as_ref()
            .map_or(false, |remaining| remaining.load(Ordering::SeqCst) == 0)
    }
}

/// Token bucket with one second of burst; delays, never drops
struct RateLimiter {
    rate: f64,
    bucket: Mutex<(f64, Instant)>,
}

impl RateLimiter {
    fn new(bytes_per_sec: u64) -> Self {
        Self {
            rate: bytes_per_sec as f64,
            bucket: Mutex::new((bytes_per_sec as f64, Instant::now())),
        }
    }

    fn reserve(&self, bytes: usize) -> Duration {
        let mut bucket = self
            .bucket
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let (tokens, last) = &mut *bucket;

        let now = Instant::now();
        *tokens = (*tokens + now.duration_since(*last).as_secs_f64() * self.rate).min(self.rate);
        *last = now;
        *tokens -= bytes as f64;

        if *tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-*tokens / self.rate)
        }
    }

    async fn acquire(&self, bytes: usize) {
        let wait = self.reserve(bytes);
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
    }
}

struct Pump {
    meter: QuotaMeter,
    limiter: Option<RateLimiter>,
    buffer_size: usize,
}

impl Pump {
    async fn run(
        &self,
        peer: Connection,
        target: Connection,
        max_duration: Option<Duration>,
        cancel: &CancellationToken,
        counters: &Counters,
    ) -> Result<PumpEnd, RelayError> {
        // Also fires when the connection manager force-closes either side
        let local = cancel.child_token();
        // Quota exhaustion only stops reading; granted bytes still get written
        let reads = local.child_token();
        let peer_closed = peer.close_token();
        let target_closed = target.close_token();

        let (peer_read, peer_write) = tokio::io::split(peer);
        let (target_read, target_write) = tokio::io::split(target);

        let up = self.direction(peer_read, target_write, &local, &reads, &counters.up);
        let down = self.direction(target_read, peer_write, &local, &reads, &counters.down);

        let watch_closed = async {
            tokio::select! {
                _ = peer_closed.cancelled() => local.cancel(),
                _ = target_closed.cancelled() => local.cancel(),
                _ = local.cancelled() => {}
            }
        };
        let both = async {
            let result = tokio::join!(up, down);
            local.cancel();
            result
        };

        let pumps = async { tokio::join!(watch_closed, both).1 };
        tokio::pin!(pumps);

        let mut expired = false;
        let (up, down) = match max_duration {
            None => pumps.await,
            Some(limit) => tokio::select! {
                result = &mut pumps => result,
                _ = tokio::time::sleep(limit) => {
                    expired = true;
                    local.cancel();
                    (&mut pumps).await
                }
            },
        };

        let up = up?;
        let down = down?;

        if up == DirectionEnd::QuotaReached || down == DirectionEnd::QuotaReached || expired {
            return Ok(PumpEnd::QuotaReached);
        }
        if cancel.is_cancelled() {
            return Ok(PumpEnd::Cancelled);
        }
        if up == DirectionEnd::Stopped || down == DirectionEnd::Stopped {
            // Connection closed by the manager without a session-level cancel
            return Err(RelayError::Io(io::Error::new(
                io::ErrorKind::ConnectionAborted,
                "relay connection closed",
            )));
        }
        Ok(PumpEnd::Completed)
    }

    async fn direction<R, W>(
        &self,
        mut reader: R,
        mut writer: W,
        stop: &CancellationToken,
        reads: &CancellationToken,
        forwarded: &AtomicU64,
    ) -> Result<DirectionEnd, RelayError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let result = self
            .copy(&mut reader, &mut writer, stop, reads, forwarded)
            .await;
        match &result {
            Ok(DirectionEnd::Eof) => {}
            // The other direction may still be writing bytes it was granted
            Ok(DirectionEnd::QuotaReached) => reads.cancel(),
            // Errors and stops end the other direction too
            _ => stop.cancel(),
        }
        result
    }

    async fn copy<R, W>(
        &self,
        reader: &mut R,
        writer: &mut W,
        stop: &CancellationToken,
        reads: &CancellationToken,
        forwarded: &AtomicU64,
    ) -> Result<DirectionEnd, RelayError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut buffer = vec![0u8; self.buffer_size];

        loop {
            let n = tokio::select! {
                _ = reads.cancelled() => {
                    return Ok(if self.meter.exhausted() {
                        DirectionEnd::QuotaReached
                    } else {
                        DirectionEnd::Stopped
                    });
                }
                result = reader.read(&mut buffer) => result?,
            };

            if n == 0 {
                let _ = writer.shutdown().await;
                return Ok(DirectionEnd::Eof);
            }

            let granted = self.meter.consume(n as u64) as usize;
            if granted > 0 {
                if let Some(limiter) = &self.limiter {
                    tokio::select! {
                        _ = stop.cancelled() => return Ok(DirectionEnd::Stopped),
                        _ = limiter.acquire(granted) => {}
                    }
                }

                tokio::select! {
                    _ = stop.cancelled() => return Ok(DirectionEnd::Stopped),
                    result = async {
                        writer.write_all(&buffer[..granted]).await?;
                        writer.flush().await
                    } => result?,
                }
                forwarded.fetch_add(granted as u64, Ordering::SeqCst);
            }

            if granted < n || self.meter.exhausted() {
                return Ok(DirectionEnd::QuotaReached);
            }
        }
    }
}
