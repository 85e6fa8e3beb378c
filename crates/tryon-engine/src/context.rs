//! Deadline and cancellation threaded through every provider call.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::error::ProviderError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Interrupt {
    #[error("deadline exceeded")]
    DeadlineExceeded,
    #[error("cancelled")]
    Cancelled,
}

/// One-shot, cloneable cancellation flag. Once cancelled it stays cancelled.
#[derive(Clone)]
pub struct CancelSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl std::fmt::Debug for CancelSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelSignal")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

impl CancelSignal {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once `cancel` has been called on any clone.
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives as long as `self`, so the wait only ends on cancel.
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

impl Default for CancelSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Deadline + cancel signal for one provider attempt (or a whole request).
///
/// Children share the parent's cancel signal and can only tighten the
/// deadline. The "response started" flag is per context: adapters raise it
/// once the provider has accepted the job, which turns a later timeout into a
/// failure instead of a skip.
#[derive(Debug, Clone)]
pub struct CallContext {
    deadline: Option<Instant>,
    cancel: CancelSignal,
    response_started: Arc<AtomicBool>,
}

impl CallContext {
    pub fn new(cancel: CancelSignal) -> Self {
        Self {
            deadline: None,
            cancel,
            response_started: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(match self.deadline {
            Some(existing) => existing.min(deadline),
            None => deadline,
        });
        self
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn child(&self, timeout: Option<Duration>) -> Self {
        let child = Self {
            deadline: self.deadline,
            cancel: self.cancel.clone(),
            response_started: Arc::new(AtomicBool::new(false)),
        };
        match timeout {
            Some(timeout) => child.with_timeout(timeout),
            None => child,
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    pub fn cancel_signal(&self) -> &CancelSignal {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn is_expired(&self) -> bool {
        self.deadline
            .map(|deadline| Instant::now() >= deadline)
            .unwrap_or(false)
    }

    pub fn mark_response_started(&self) {
        self.response_started.store(true, Ordering::SeqCst);
    }

    pub fn response_started(&self) -> bool {
        self.response_started.load(Ordering::SeqCst)
    }

    /// Runs `fut` until it completes, the deadline passes or the signal fires.
    pub async fn guard<F: Future>(&self, fut: F) -> Result<F::Output, Interrupt> {
        if self.cancel.is_cancelled() {
            return Err(Interrupt::Cancelled);
        }
        let deadline = async {
            match self.deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Interrupt::Cancelled),
            _ = deadline => Err(Interrupt::DeadlineExceeded),
            output = fut => Ok(output),
        }
    }

    /// `guard` for fallible provider futures, folding the interrupt into the
    /// provider error taxonomy.
    pub async fn call<T, F>(&self, fut: F) -> Result<T, ProviderError>
    where
        F: Future<Output = Result<T, ProviderError>>,
    {
        match self.guard(fut).await {
            Ok(result) => result,
            Err(interrupt) => Err(self.interrupted(interrupt)),
        }
    }

    pub async fn sleep(&self, duration: Duration) -> Result<(), ProviderError> {
        self.guard(tokio::time::sleep(duration))
            .await
            .map_err(|interrupt| self.interrupted(interrupt))
    }

    pub fn interrupted(&self, interrupt: Interrupt) -> ProviderError {
        match interrupt {
            Interrupt::DeadlineExceeded => ProviderError::Timeout {
                responding: self.response_started(),
            },
            Interrupt::Cancelled => ProviderError::Cancelled,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::Instant;

    use super::{CallContext, CancelSignal, Interrupt};
    use crate::error::ProviderError;

    #[tokio::test(start_paused = true)]
    async fn guard_reports_deadline() {
        let ctx = CallContext::new(CancelSignal::new()).with_timeout(Duration::from_secs(5));
        let result = ctx
            .guard(tokio::time::sleep(Duration::from_secs(60)))
            .await;
        assert_eq!(result, Err(Interrupt::DeadlineExceeded));
    }

    #[tokio::test(start_paused = true)]
    async fn guard_reports_cancellation_from_any_clone() {
        let signal = CancelSignal::new();
        let ctx = CallContext::new(signal.clone());
        let canceller = signal.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            canceller.cancel();
        });
        let result = ctx
            .guard(tokio::time::sleep(Duration::from_secs(60)))
            .await;
        assert_eq!(result, Err(Interrupt::Cancelled));
        assert!(signal.is_cancelled());
    }

    #[tokio::test]
    async fn already_cancelled_context_never_polls_future() {
        let signal = CancelSignal::new();
        signal.cancel();
        let ctx = CallContext::new(signal);
        let result = ctx.guard(async { 42 }).await;
        assert_eq!(result, Err(Interrupt::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn child_can_only_tighten_deadline() {
        let parent = CallContext::new(CancelSignal::new()).with_timeout(Duration::from_secs(10));
        let loose = parent.child(Some(Duration::from_secs(60)));
        let tight = parent.child(Some(Duration::from_secs(2)));
        assert_eq!(loose.deadline(), parent.deadline());
        assert!(tight.deadline() < parent.deadline());
        assert!(tight.deadline() > Some(Instant::now()));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_after_response_started_is_failure_shaped() {
        let ctx = CallContext::new(CancelSignal::new()).with_timeout(Duration::from_secs(1));
        let quiet = ctx
            .call(async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<_, ProviderError>(())
            })
            .await;
        assert!(matches!(quiet, Err(ProviderError::Timeout { responding: false })));

        let ctx = CallContext::new(CancelSignal::new()).with_timeout(Duration::from_secs(1));
        ctx.mark_response_started();
        let busy = ctx.sleep(Duration::from_secs(5)).await;
        assert!(matches!(busy, Err(ProviderError::Timeout { responding: true })));
    }
}
