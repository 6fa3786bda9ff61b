//! Request contexts carrying a deadline and a cancellation signal.
//!
//! Every database operation takes a [`Context`]. A context may have a
//! deadline, a cancellation token, both, or neither (`Context::background()`).
//! Derived contexts inherit the parent's signals: a child deadline can only
//! be earlier than the parent's, and cancelling a parent token cancels the
//! tokens handed out by `with_cancel` on its children.

use std::time::Duration;

use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;

/// Why a context ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ContextError {
    #[error("context canceled")]
    Cancelled,
    #[error("context deadline exceeded")]
    DeadlineExceeded,
}

/// Deadline and cancellation scope for a single operation.
#[derive(Debug, Clone, Default)]
pub struct Context {
    deadline: Option<Instant>,
    token: Option<CancellationToken>,
}

impl Context {
    /// A context that never ends.
    pub fn background() -> Self {
        Self::default()
    }

    /// A context that ends when `token` is cancelled.
    pub fn from_token(token: CancellationToken) -> Self {
        Self {
            deadline: None,
            token: Some(token),
        }
    }

    /// Derive a context that also ends after `timeout`.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Derive a context that also ends at `deadline`.
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let deadline = match self.deadline {
            Some(parent) if parent < deadline => parent,
            _ => deadline,
        };
        Self {
            deadline: Some(deadline),
            token: self.token.clone(),
        }
    }

    /// Derive a cancellable context. Cancelling the returned token ends the
    /// new context without affecting the parent.
    pub fn with_cancel(&self) -> (Self, CancellationToken) {
        let token = match &self.token {
            Some(parent) => parent.child_token(),
            None => CancellationToken::new(),
        };
        let ctx = Self {
            deadline: self.deadline,
            token: Some(token.clone()),
        };
        (ctx, token)
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left until the deadline, if there is one.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Returns why the context has ended, or `None` while it is still live.
    pub fn err(&self) -> Option<ContextError> {
        if self.token.as_ref().is_some_and(|t| t.is_cancelled()) {
            return Some(ContextError::Cancelled);
        }
        match self.deadline {
            Some(d) if d <= Instant::now() => Some(ContextError::DeadlineExceeded),
            _ => None,
        }
    }

    /// Resolves when the context ends. Never resolves for a background context.
    pub async fn done(&self) -> ContextError {
        match (&self.token, self.deadline) {
            (Some(token), Some(deadline)) => {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => ContextError::Cancelled,
                    _ = sleep_until(deadline) => ContextError::DeadlineExceeded,
                }
            }
            (Some(token), None) => {
                token.cancelled().await;
                ContextError::Cancelled
            }
            (None, Some(deadline)) => {
                sleep_until(deadline).await;
                ContextError::DeadlineExceeded
            }
            (None, None) => std::future::pending().await,
        }
    }
}
