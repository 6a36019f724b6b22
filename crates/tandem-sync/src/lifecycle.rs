//! Sync driver lifecycle
//!
//! ```text
//!   Stopped ──begin_start──→ Starting ──end_start──→ Running
//!      ↑                                                │
//!      └────end_stop──── Stopping ←──begin_stop─────────┘
//! ```
//!
//! Independently of the state, the driver can be blocked by one or more
//! error codes. [`Lifecycle::ready`] waits until nothing blocks it.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Mutex;

use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::errors::SyncErrorCode;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LifecycleState::Stopped => "stopped",
            LifecycleState::Starting => "starting",
            LifecycleState::Running => "running",
            LifecycleState::Stopping => "stopping",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LifecycleError {
    #[error("Cannot {action} while {state}")]
    IllegalTransition {
        action: &'static str,
        state: LifecycleState,
    },
}

/// State machine shared by the sync driver and its retry tasks
pub struct Lifecycle {
    state: watch::Sender<LifecycleState>,
    blocked: watch::Sender<BTreeSet<SyncErrorCode>>,
    cancel: Mutex<CancellationToken>,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    pub fn new() -> Self {
        let (state, _) = watch::channel(LifecycleState::Stopped);
        let (blocked, _) = watch::channel(BTreeSet::new());
        Self {
            state,
            blocked,
            cancel: Mutex::new(CancellationToken::new()),
        }
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.borrow()
    }

    /// Stopping or stopped
    pub fn will_stop(&self) -> bool {
        matches!(
            self.state(),
            LifecycleState::Stopping | LifecycleState::Stopped
        )
    }

    /// Starting or running
    pub fn will_start(&self) -> bool {
        matches!(
            self.state(),
            LifecycleState::Starting | LifecycleState::Running
        )
    }

    fn transition(
        &self,
        action: &'static str,
        from: &[LifecycleState],
        to: LifecycleState,
    ) -> Result<(), LifecycleError> {
        let mut result = Ok(());
        self.state.send_if_modified(|state| {
            if from.contains(state) {
                debug!(from = %state, to = %to, "Lifecycle transition");
                *state = to;
                true
            } else {
                result = Err(LifecycleError::IllegalTransition {
                    action,
                    state: *state,
                });
                false
            }
        });
        result
    }

    pub fn begin_start(&self) -> Result<(), LifecycleError> {
        self.transition("start", &[LifecycleState::Stopped], LifecycleState::Starting)
    }

    pub fn end_start(&self) -> Result<(), LifecycleError> {
        self.transition("finish starting", &[LifecycleState::Starting], LifecycleState::Running)
    }

    /// Enters `Stopping` and cancels every wait bound to the current token
    pub fn begin_stop(&self) -> Result<(), LifecycleError> {
        self.transition(
            "stop",
            &[LifecycleState::Starting, LifecycleState::Running],
            LifecycleState::Stopping,
        )?;
        self.cancellation_token().cancel();
        Ok(())
    }

    /// Enters `Stopped` and arms a fresh token for the next run
    pub fn end_stop(&self) -> Result<(), LifecycleError> {
        self.transition("finish stopping", &[LifecycleState::Stopping], LifecycleState::Stopped)?;
        if let Ok(mut cancel) = self.cancel.lock() {
            *cancel = CancellationToken::new();
        }
        Ok(())
    }

    /// Token cancelled when the current run begins stopping
    pub fn cancellation_token(&self) -> CancellationToken {
        match self.cancel.lock() {
            Ok(cancel) => cancel.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    // ========================================================================
    // Blocking
    // ========================================================================

    pub fn block_for(&self, code: SyncErrorCode) {
        debug!(%code, "Blocking sync");
        self.blocked.send_modify(|blocked| {
            blocked.insert(code);
        });
    }

    pub fn unblock_for(&self, code: SyncErrorCode) {
        debug!(%code, "Unblocking sync");
        self.blocked.send_if_modified(|blocked| blocked.remove(&code));
    }

    pub fn unblock_all(&self) {
        self.blocked.send_if_modified(|blocked| {
            let changed = !blocked.is_empty();
            blocked.clear();
            changed
        });
    }

    pub fn is_blocked(&self) -> bool {
        !self.blocked.borrow().is_empty()
    }

    pub fn is_blocked_for(&self, code: SyncErrorCode) -> bool {
        self.blocked.borrow().contains(&code)
    }

    // ========================================================================
    // Waiting
    // ========================================================================

    /// Waits until nothing blocks the sync or stopping begins
    pub async fn ready(&self) {
        let mut blocked = self.blocked.subscribe();
        let mut state = self.state.subscribe();
        loop {
            if self.will_stop() || blocked.borrow_and_update().is_empty() {
                return;
            }
            tokio::select! {
                changed = blocked.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
                changed = state.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
            }
        }
    }

    /// Waits until the lifecycle reaches `target`
    pub async fn wait_for(&self, target: LifecycleState) {
        let mut state = self.state.subscribe();
        // The sender lives as long as `self`
        let _ = state.wait_for(|s| *s == target).await;
    }

    pub async fn started(&self) {
        self.wait_for(LifecycleState::Running).await;
    }

    pub async fn stopped(&self) {
        self.wait_for(LifecycleState::Stopped).await;
    }
}
