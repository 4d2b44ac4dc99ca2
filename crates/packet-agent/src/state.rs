//! Session state machine
//!
//! The single authoritative lifecycle state of an agent. Every transition is
//! a compare-and-set under one lock and publishes its status event while the
//! lock is held, so listeners see transitions in the order they happened.

use crate::error::InvalidStateError;
use crate::events::{EventBus, StatusCode, StatusEvent};
use std::fmt;
use std::sync::Mutex;
use tokio::sync::watch;

/// Agent lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Uninitialized,
    Initialized,
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
}

impl SessionState {
    pub const ALL: [SessionState; 7] = [
        SessionState::Uninitialized,
        SessionState::Initialized,
        SessionState::Starting,
        SessionState::Running,
        SessionState::Stopping,
        SessionState::Stopped,
        SessionState::Failed,
    ];

    /// Whether `self -> next` is a legal transition
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;

        matches!(
            (self, next),
            (Uninitialized, Initialized)
                | (Initialized, Starting)
                | (Starting, Running)
                | (Starting, Stopping)
                | (Starting, Failed)
                | (Running, Starting)
                | (Running, Stopping)
                | (Running, Failed)
                | (Stopping, Stopped)
                | (Stopped, Starting)
                | (Failed, Starting)
                | (Failed, Stopping)
        )
    }

    /// Status code announcing entry into this state
    pub fn status_code(self) -> Option<StatusCode> {
        match self {
            SessionState::Uninitialized => None,
            SessionState::Initialized => Some(StatusCode::Initialized),
            SessionState::Starting => Some(StatusCode::Starting),
            SessionState::Running => Some(StatusCode::Running),
            SessionState::Stopping => Some(StatusCode::Stopping),
            SessionState::Stopped => Some(StatusCode::Stopped),
            SessionState::Failed => Some(StatusCode::Failed),
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Lock-protected lifecycle state with transition events
pub struct SessionStateMachine {
    state: Mutex<SessionState>,
    watch_tx: watch::Sender<SessionState>,
    bus: EventBus,
}

impl SessionStateMachine {
    pub fn new(bus: EventBus) -> Self {
        let (watch_tx, _) = watch::channel(SessionState::Uninitialized);
        Self {
            state: Mutex::new(SessionState::Uninitialized),
            watch_tx,
            bus,
        }
    }

    /// Point-in-time snapshot
    pub fn current(&self) -> SessionState {
        *self.lock()
    }

    /// Observe state changes
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.watch_tx.subscribe()
    }

    /// Move to `next` if the current state is one of `expected` and the
    /// table allows it. Returns the state that was left.
    pub fn transition(
        &self,
        operation: &'static str,
        expected: &[SessionState],
        next: SessionState,
        detail: impl Into<String>,
    ) -> Result<SessionState, InvalidStateError> {
        let mut state = self.lock();
        let current = *state;

        if !expected.contains(&current) || !current.can_transition_to(next) {
            return Err(InvalidStateError {
                operation,
                state: current,
            });
        }

        *state = next;
        self.watch_tx.send_replace(next);

        let detail = detail.into();
        tracing::info!(from = %current, to = %next, detail = %detail, "Session state changed");

        if let Some(code) = next.status_code() {
            let message = if detail.is_empty() {
                format!("{} -> {}", current, next)
            } else {
                format!("{} -> {}: {}", current, next, detail)
            };
            self.bus.publish(StatusEvent::new(code, message));
        }

        Ok(current)
    }

    /// Transition from whatever the current state is, if the table allows it
    pub fn transition_any(
        &self,
        operation: &'static str,
        next: SessionState,
        detail: impl Into<String>,
    ) -> Result<SessionState, InvalidStateError> {
        self.transition(operation, &SessionState::ALL, next, detail)
    }

    /// Run `f` while holding the state lock, so the state cannot change
    /// underneath a check-then-act sequence
    pub fn with_state<R>(&self, f: impl FnOnce(SessionState) -> R) -> R {
        let state = self.lock();
        f(*state)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SessionState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use SessionState::*;

    #[test]
    fn test_transition_table() {
        let allowed = [
            (Uninitialized, Initialized),
            (Initialized, Starting),
            (Starting, Running),
            (Starting, Stopping),
            (Starting, Failed),
            (Running, Starting),
            (Running, Stopping),
            (Running, Failed),
            (Stopping, Stopped),
            (Stopped, Starting),
            (Failed, Starting),
            (Failed, Stopping),
        ];

        for from in SessionState::ALL {
            for to in SessionState::ALL {
                assert_eq!(
                    from.can_transition_to(to),
                    allowed.contains(&(from, to)),
                    "{} -> {}",
                    from,
                    to
                );
            }
        }
    }

    #[test]
    fn test_nothing_returns_to_uninitialized() {
        for from in SessionState::ALL {
            assert!(!from.can_transition_to(Uninitialized));
        }
    }

    #[tokio::test]
    async fn test_rejected_transition_leaves_state_unchanged() {
        let bus = EventBus::new(16);
        let machine = SessionStateMachine::new(bus.clone());

        let err = machine
            .transition("start", &[Initialized, Stopped], Starting, "")
            .unwrap_err();
        assert_eq!(err.state, Uninitialized);
        assert_eq!(err.operation, "start");
        assert_eq!(machine.current(), Uninitialized);
        assert_eq!(bus.pending(), 0);

        bus.shutdown();
    }

    #[tokio::test]
    async fn test_transition_publishes_event_and_notifies_watchers() {
        let bus = EventBus::new(16);
        let machine = SessionStateMachine::new(bus.clone());
        let mut watcher = machine.subscribe();

        let previous = machine
            .transition("initialize", &[Uninitialized], Initialized, "key accepted")
            .unwrap();
        assert_eq!(previous, Uninitialized);
        assert_eq!(machine.current(), Initialized);

        watcher.changed().await.unwrap();
        assert_eq!(*watcher.borrow(), Initialized);

        bus.shutdown();
    }

    #[tokio::test]
    async fn test_expected_set_narrows_table() {
        let bus = EventBus::new(16);
        let machine = SessionStateMachine::new(bus.clone());
        machine
            .transition_any("initialize", Initialized, "")
            .unwrap();
        machine.transition_any("start", Starting, "").unwrap();
        machine.transition_any("connect", Running, "").unwrap();

        // Running -> Starting is legal in the table but not for a caller
        // that only accepts Initialized/Stopped
        let err = machine
            .transition("start", &[Initialized, Stopped, Failed], Starting, "")
            .unwrap_err();
        assert_eq!(err.state, Running);
        assert_eq!(machine.current(), Running);

        bus.shutdown();
    }

    #[tokio::test]
    async fn test_exhaustive_operation_sequences_stay_in_table() {
        // Drive every sequence of up to six operations and check each step
        // against the table
        let ops: [SessionState; 6] = [Initialized, Starting, Running, Stopping, Stopped, Failed];
        let bus = EventBus::new(8);

        let mut sequences: Vec<Vec<SessionState>> = vec![vec![]];
        for _ in 0..6 {
            let mut next = Vec::new();
            for seq in &sequences {
                for op in ops {
                    let mut extended = seq.clone();
                    extended.push(op);
                    next.push(extended);
                }
            }
            sequences = next;
        }

        for seq in sequences {
            let machine = SessionStateMachine::new(bus.clone());
            for target in seq {
                let before = machine.current();
                let result = machine.transition_any("test", target, "");
                let after = machine.current();
                if before.can_transition_to(target) {
                    assert!(result.is_ok());
                    assert_eq!(after, target);
                } else {
                    assert!(result.is_err());
                    assert_eq!(after, before);
                }
            }
        }

        bus.shutdown();
    }
}
