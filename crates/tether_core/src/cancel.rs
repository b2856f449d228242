//! Cooperative cancellation token
//!
//! Cloned handles share one state. The first `cancel` wins and records its
//! cause; waiters blocked in [`CancelToken::cancelled`] are woken.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelCause {
    Cancelled,
    Reason(String),
}

impl fmt::Display for CancelCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CancelCause::Cancelled => f.write_str("cancelled"),
            CancelCause::Reason(reason) => f.write_str(reason),
        }
    }
}

#[derive(Debug, Default)]
struct State {
    flag: AtomicBool,
    cause: Mutex<Option<CancelCause>>,
    notify: Notify,
}

#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    state: Arc<State>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancel_with(CancelCause::Cancelled);
    }

    pub fn cancel_with(&self, cause: CancelCause) {
        {
            let mut slot = self.state.cause.lock().unwrap_or_else(|p| p.into_inner());
            if slot.is_some() {
                return;
            }
            *slot = Some(cause);
        }
        self.state.flag.store(true, Ordering::Release);
        self.state.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.flag.load(Ordering::Acquire)
    }

    pub fn cause(&self) -> Option<CancelCause> {
        self.state
            .cause
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    /// Resolves once the token is cancelled, returning the cause.
    pub async fn cancelled(&self) -> CancelCause {
        loop {
            let notified = self.state.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(cause) = self.cause() {
                return cause;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn first_cause_wins() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        token.cancel_with(CancelCause::Reason("deadline".into()));
        token.cancel();
        assert!(token.is_cancelled());
        assert_eq!(token.cause(), Some(CancelCause::Reason("deadline".into())));
    }

    #[tokio::test]
    async fn wakes_waiters_from_another_thread() {
        let token = CancelToken::new();
        let remote = token.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            remote.cancel();
        });
        let cause = tokio::time::timeout(Duration::from_secs(5), token.cancelled())
            .await
            .unwrap();
        assert_eq!(cause, CancelCause::Cancelled);
    }
}
