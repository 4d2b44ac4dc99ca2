//! Status/event bus
//!
//! Publishers never wait on the host's listener: events go into a bounded
//! queue and a dedicated delivery task hands them to the listener one at a
//! time on the blocking pool. When the queue is full the oldest event is
//! discarded and counted.

use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// Default capacity of the event queue
pub const DEFAULT_EVENT_QUEUE_CAPACITY: usize = 256;

/// Stable status codes reported to the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusCode {
    Initialized,
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
    Reconnecting,
    ControlConnected,
    ControlDisconnected,
    HeartbeatMissed,
    RelayStarted,
    RelayCompleted,
    QuotaExceeded,
    RelayFailed,
    RelayRevoked,
    AssignmentRejected,
    ListenerOverflow,
    Log,
}

impl StatusCode {
    pub const ALL: [StatusCode; 18] = [
        StatusCode::Initialized,
        StatusCode::Starting,
        StatusCode::Running,
        StatusCode::Stopping,
        StatusCode::Stopped,
        StatusCode::Failed,
        StatusCode::Reconnecting,
        StatusCode::ControlConnected,
        StatusCode::ControlDisconnected,
        StatusCode::HeartbeatMissed,
        StatusCode::RelayStarted,
        StatusCode::RelayCompleted,
        StatusCode::QuotaExceeded,
        StatusCode::RelayFailed,
        StatusCode::RelayRevoked,
        StatusCode::AssignmentRejected,
        StatusCode::ListenerOverflow,
        StatusCode::Log,
    ];

    /// Numeric code delivered to the listener
    pub fn code(self) -> i32 {
        match self {
            StatusCode::Initialized => 100,
            StatusCode::Starting => 110,
            StatusCode::Running => 120,
            StatusCode::Stopping => 130,
            StatusCode::Stopped => 140,
            StatusCode::Failed => 150,
            StatusCode::Reconnecting => 160,
            StatusCode::ControlConnected => 200,
            StatusCode::ControlDisconnected => 201,
            StatusCode::HeartbeatMissed => 202,
            StatusCode::RelayStarted => 300,
            StatusCode::RelayCompleted => 301,
            StatusCode::QuotaExceeded => 302,
            StatusCode::RelayFailed => 303,
            StatusCode::RelayRevoked => 304,
            StatusCode::AssignmentRejected => 305,
            StatusCode::ListenerOverflow => 400,
            StatusCode::Log => 900,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        Self::ALL.iter().copied().find(|c| c.code() == code)
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}({})", self, self.code())
    }
}

/// Immutable status notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEvent {
    pub code: i32,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl StatusEvent {
    pub fn new(code: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code: code.code(),
            message: message.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn status(&self) -> Option<StatusCode> {
        StatusCode::from_code(self.code)
    }
}

/// Receiver of status events
///
/// Any `Fn(i32, &str)` closure is a listener, matching the host-facing
/// `(code, message)` callback shape.
pub trait StatusListener: Send + Sync + 'static {
    fn on_status(&self, event: &StatusEvent);
}

impl<F> StatusListener for F
where
    F: Fn(i32, &str) + Send + Sync + 'static,
{
    fn on_status(&self, event: &StatusEvent) {
        self(event.code, &event.message)
    }
}

struct BusInner {
    queue: Mutex<VecDeque<StatusEvent>>,
    capacity: usize,
    notify: Notify,
    listener: RwLock<Option<Arc<dyn StatusListener>>>,
    dropped: AtomicU64,
    logging: AtomicBool,
}

impl BusInner {
    fn listener(&self) -> Option<Arc<dyn StatusListener>> {
        self.listener
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn pop(&self) -> Option<StatusEvent> {
        self.queue
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .pop_front()
    }
}

/// Bounded, non-blocking event bus with a single listener
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
    cancel: CancellationToken,
}

impl EventBus {
    /// Create a bus and spawn its delivery task on the current Tokio runtime
    pub fn new(capacity: usize) -> Self {
        let inner = Arc::new(BusInner {
            queue: Mutex::new(VecDeque::with_capacity(capacity.max(1))),
            capacity: capacity.max(1),
            notify: Notify::new(),
            listener: RwLock::new(None),
            dropped: AtomicU64::new(0),
            logging: AtomicBool::new(false),
        });
        let cancel = CancellationToken::new();

        tokio::spawn(Self::deliver(inner.clone(), cancel.clone()));

        Self { inner, cancel }
    }

    /// Replace the current listener
    pub fn set_listener(&self, listener: Arc<dyn StatusListener>) {
        *self
            .inner
            .listener
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(listener);
    }

    pub fn clear_listener(&self) {
        *self
            .inner
            .listener
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = None;
    }

    /// Queue an event for delivery, dropping the oldest queued event on overflow
    pub fn publish(&self, event: StatusEvent) {
        let overflowed = {
            let mut queue = self
                .inner
                .queue
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let overflowed = if queue.len() >= self.inner.capacity {
                queue.pop_front();
                self.inner.dropped.fetch_add(1, Ordering::SeqCst);
                true
            } else {
                false
            };
            queue.push_back(event);
            overflowed
        };

        if overflowed {
            tracing::trace!(
                dropped = self.inner.dropped.load(Ordering::Relaxed),
                "Event queue full, dropped oldest event"
            );
        }

        self.inner.notify.notify_one();
    }

    pub fn emit(&self, code: StatusCode, message: impl Into<String>) {
        self.publish(StatusEvent::new(code, message));
    }

    /// Publish a diagnostic line if logging is enabled
    pub fn log(&self, message: impl Into<String>) {
        if self.logging_enabled() {
            self.publish(StatusEvent::new(StatusCode::Log, message));
        }
    }

    pub fn set_logging(&self, enabled: bool) {
        self.inner.logging.store(enabled, Ordering::SeqCst);
    }

    pub fn logging_enabled(&self) -> bool {
        self.inner.logging.load(Ordering::SeqCst)
    }

    /// Total events discarded because the queue was full
    pub fn dropped(&self) -> u64 {
        self.inner.dropped.load(Ordering::SeqCst)
    }

    /// Events waiting for delivery
    pub fn pending(&self) -> usize {
        self.inner
            .queue
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    /// Stop the delivery task; queued events are discarded
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    async fn deliver(inner: Arc<BusInner>, cancel: CancellationToken) {
        let mut reported_drops = 0u64;

        loop {
            if cancel.is_cancelled() {
                break;
            }

            match inner.pop() {
                Some(event) => Self::dispatch(&inner, event).await,
                None => {
                    let dropped = inner.dropped.load(Ordering::SeqCst);
                    if dropped > reported_drops {
                        reported_drops = dropped;
                        let notice = StatusEvent::new(
                            StatusCode::ListenerOverflow,
                            format!("listener fell behind, {} events dropped", dropped),
                        );
                        Self::dispatch(&inner, notice).await;
                        continue;
                    }

                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = inner.notify.notified() => {}
                    }
                }
            }
        }

        tracing::debug!("Event delivery task exiting");
    }

    async fn dispatch(inner: &BusInner, event: StatusEvent) {
        let Some(listener) = inner.listener() else {
            return;
        };

        let code = event.code;
        let result = tokio::task::spawn_blocking(move || {
            catch_unwind(AssertUnwindSafe(|| listener.on_status(&event)))
        })
        .await;

        match result {
            Ok(Ok(())) => {}
            Ok(Err(_)) => tracing::warn!(code = code, "Status listener panicked"),
            Err(e) => tracing::warn!(code = code, error = %e, "Status listener task failed"),
        }
    }
}
