//! Engine lifecycle state.
//!
//! ```text
//!   Stopped ──▶ Starting ──▶ Running ──▶ Stopping ──▶ Stopped
//!                  │                                    ▲
//!                  └──────────── (start failed) ────────┘
//! ```
//!
//! [`Lifecycle`] is the single writer and is owned by the engine. Everything
//! else observes through a read-only [`LifecycleHandle`].

use std::fmt;

use serde::Serialize;
use tokio::sync::watch;
use tracing::info;

use crate::errors::EngineError;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LifecycleState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl LifecycleState {
    /// Whether moving from `self` to `next` is allowed.
    pub fn can_transition_to(self, next: LifecycleState) -> bool {
        use LifecycleState::*;
        matches!(
            (self, next),
            (Stopped, Starting)
                | (Starting, Running)
                | (Starting, Stopped)
                | (Running, Stopping)
                | (Stopping, Stopped)
        )
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stopped => write!(f, "STOPPED"),
            Self::Starting => write!(f, "STARTING"),
            Self::Running => write!(f, "RUNNING"),
            Self::Stopping => write!(f, "STOPPING"),
        }
    }
}

/// Owner of the lifecycle state.
#[derive(Debug)]
pub struct Lifecycle {
    tx: watch::Sender<LifecycleState>,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(LifecycleState::Stopped);
        Self { tx }
    }

    pub fn state(&self) -> LifecycleState {
        *self.tx.borrow()
    }

    /// Move to `next`, failing on a transition the state machine does not allow.
    pub fn transition(&self, next: LifecycleState) -> Result<(), EngineError> {
        let mut result = Ok(());
        self.tx.send_if_modified(|current| {
            if current.can_transition_to(next) {
                info!(from = %current, to = %next, "Lifecycle transition");
                *current = next;
                true
            } else {
                result = Err(EngineError::Lifecycle {
                    from: current.to_string(),
                    to: next.to_string(),
                });
                false
            }
        });
        result
    }

    pub fn handle(&self) -> LifecycleHandle {
        LifecycleHandle {
            rx: self.tx.subscribe(),
        }
    }
}

/// Read-only view of the lifecycle.
#[derive(Clone, Debug)]
pub struct LifecycleHandle {
    rx: watch::Receiver<LifecycleState>,
}

impl LifecycleHandle {
    pub fn state(&self) -> LifecycleState {
        *self.rx.borrow()
    }

    pub fn is_running(&self) -> bool {
        self.state() == LifecycleState::Running
    }

    /// Resolves once the state is `Stopping` or `Stopped`, or the owner is
    /// dropped.
    pub async fn stopping(&mut self) {
        let _ = self
            .rx
            .wait_for(|state| matches!(state, LifecycleState::Stopping | LifecycleState::Stopped))
            .await;
    }

    /// Resolves on the next state change. Returns `false` if the owner is gone.
    pub async fn changed(&mut self) -> bool {
        self.rx.changed().await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_full_cycle() {
        let lifecycle = Lifecycle::new();
        assert_eq!(lifecycle.state(), LifecycleState::Stopped);

        lifecycle.transition(LifecycleState::Starting).unwrap();
        lifecycle.transition(LifecycleState::Running).unwrap();
        lifecycle.transition(LifecycleState::Stopping).unwrap();
        lifecycle.transition(LifecycleState::Stopped).unwrap();
        assert_eq!(lifecycle.state(), LifecycleState::Stopped);
    }

    #[test]
    fn test_invalid_transitions_rejected() {
        let lifecycle = Lifecycle::new();
        let err = lifecycle.transition(LifecycleState::Running).unwrap_err();
        assert!(matches!(err, EngineError::Lifecycle { .. }));
        assert!(err.to_string().contains("STOPPED"));
        assert_eq!(lifecycle.state(), LifecycleState::Stopped);

        lifecycle.transition(LifecycleState::Starting).unwrap();
        assert!(lifecycle.transition(LifecycleState::Starting).is_err());
        assert!(lifecycle.transition(LifecycleState::Stopping).is_err());
    }

    #[test]
    fn test_failed_start_returns_to_stopped() {
        let lifecycle = Lifecycle::new();
        lifecycle.transition(LifecycleState::Starting).unwrap();
        lifecycle.transition(LifecycleState::Stopped).unwrap();
        assert_eq!(lifecycle.state(), LifecycleState::Stopped);
    }

    #[test]
    fn test_handle_observes_owner() {
        let lifecycle = Lifecycle::new();
        let handle = lifecycle.handle();
        assert!(!handle.is_running());

        lifecycle.transition(LifecycleState::Starting).unwrap();
        lifecycle.transition(LifecycleState::Running).unwrap();
        assert!(handle.is_running());
        assert_eq!(handle.state(), LifecycleState::Running);
    }

    #[tokio::test]
    async fn test_stopping_resolves_on_shutdown() {
        let lifecycle = Lifecycle::new();
        lifecycle.transition(LifecycleState::Starting).unwrap();
        lifecycle.transition(LifecycleState::Running).unwrap();

        let mut handle = lifecycle.handle();
        let waiter = tokio::spawn(async move { handle.stopping().await });

        lifecycle.transition(LifecycleState::Stopping).unwrap();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }
}
