//! Resettable completion signal used to sequence connection phases.
//!
//! A gate guards exactly one phase (accept, connect, send, receive). The
//! controller resets it, issues the operation, then waits; the task driving
//! the operation signals it when the operation finishes. Waiting does not
//! consume the signal, so a wait after a signal with no reset in between
//! returns immediately.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time;

use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct CompletionGate {
    phase: &'static str,
    state: Arc<watch::Sender<bool>>,
}

impl CompletionGate {
    pub fn new(phase: &'static str) -> Self {
        let (tx, _) = watch::channel(false);
        Self {
            phase,
            state: Arc::new(tx),
        }
    }

    pub fn phase(&self) -> &'static str {
        self.phase
    }

    /// Clears the signaled state. Must run before the operation that will
    /// signal this gate is issued.
    pub fn reset(&self) {
        self.state.send_replace(false);
    }

    pub fn signal(&self) {
        self.state.send_replace(true);
    }

    pub fn is_signaled(&self) -> bool {
        *self.state.borrow()
    }

    pub async fn wait(&self) {
        let mut rx = self.state.subscribe();
        // The sender lives in `self`, so this only returns once signaled.
        let _ = rx.wait_for(|signaled| *signaled).await;
    }

    /// Waits with an optional deadline; `None` waits forever.
    pub async fn wait_timeout(&self, deadline: Option<Duration>) -> Result<()> {
        let Some(deadline) = deadline else {
            self.wait().await;
            return Ok(());
        };

        time::timeout(deadline, self.wait())
            .await
            .map_err(|_| Error::Timeout {
                phase: self.phase,
                elapsed: deadline,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SHORT: Duration = Duration::from_millis(50);

    #[tokio::test]
    async fn wait_after_signal_returns_immediately() {
        let gate = CompletionGate::new("receive");
        gate.signal();

        gate.wait_timeout(Some(SHORT)).await.unwrap();
        // not consumed by the first wait
        gate.wait_timeout(Some(SHORT)).await.unwrap();
        assert!(gate.is_signaled());
    }

    #[tokio::test]
    async fn unsignaled_gate_times_out() {
        let gate = CompletionGate::new("connect");

        let err = gate.wait_timeout(Some(SHORT)).await.unwrap_err();
        assert!(matches!(err, Error::Timeout { phase: "connect", .. }));
    }

    #[tokio::test]
    async fn reset_blocks_the_next_wait() {
        let gate = CompletionGate::new("accept");
        gate.signal();
        gate.reset();
        gate.reset();

        assert!(!gate.is_signaled());
        assert!(gate.wait_timeout(Some(SHORT)).await.is_err());
    }

    #[tokio::test]
    async fn signal_from_another_task_wakes_waiter() {
        let gate = CompletionGate::new("send");
        let completer = gate.clone();

        let waiter =
            tokio::spawn(async move { gate.wait_timeout(Some(Duration::from_secs(5))).await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        completer.signal();
        completer.signal();

        waiter.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn no_deadline_waits_until_signaled() {
        let gate = CompletionGate::new("accept");
        let completer = gate.clone();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            completer.signal();
        });

        gate.wait_timeout(None).await.unwrap();
    }
}
