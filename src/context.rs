//! Request Context
//!
//! Carries a caller deadline and cancellation signal into storage-touching
//! operations. Work driven through [`Context::run`] is abandoned at the next
//! suspension point once the deadline passes or the handle fires.
//!
//! The deadline is also visible to blocking storage calls made inside `run`
//! through [`current_deadline`], so they can bound their own waits.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

use crate::error::{AccountError, Result};

tokio::task_local! {
    static DEADLINE: Option<Instant>;
}

/// Deadline of the innermost [`Context::run`] driving the current task
pub fn current_deadline() -> Option<Instant> {
    DEADLINE.try_with(|deadline| *deadline).ok().flatten()
}

#[derive(Debug, Default)]
struct CancelState {
    canceled: AtomicBool,
    notify: Notify,
}

impl CancelState {
    async fn wait(&self) {
        loop {
            // registered before the flag check so a concurrent cancel is not missed
            let notified = self.notify.notified();
            if self.canceled.load(Ordering::SeqCst) {
                return;
            }
            notified.await;
        }
    }
}

/// Fires cancellation for every clone of the paired [`Context`]
#[derive(Debug, Clone)]
pub struct CancelHandle {
    state: Arc<CancelState>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.state.canceled.store(true, Ordering::SeqCst);
        self.state.notify.notify_waiters();
    }

    pub fn is_canceled(&self) -> bool {
        self.state.canceled.load(Ordering::SeqCst)
    }
}

/// Deadline and cancellation for a single request
#[derive(Debug, Clone, Default)]
pub struct Context {
    deadline: Option<Instant>,
    cancel: Option<Arc<CancelState>>,
}

impl Context {
    /// No deadline, never canceled
    pub fn background() -> Self {
        Self::default()
    }

    /// Deadline `timeout` from now
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            deadline: Some(Instant::now() + timeout),
            cancel: None,
        }
    }

    /// Context paired with a handle that cancels it
    pub fn cancellable() -> (Self, CancelHandle) {
        let state = Arc::new(CancelState::default());
        let ctx = Self {
            deadline: None,
            cancel: Some(state.clone()),
        };
        (ctx, CancelHandle { state })
    }

    /// Fail fast if the context is already done
    pub fn check(&self) -> Result<()> {
        if self
            .cancel
            .as_ref()
            .is_some_and(|state| state.canceled.load(Ordering::SeqCst))
        {
            return Err(AccountError::Canceled);
        }
        if self.deadline.is_some_and(|d| Instant::now() >= d) {
            return Err(AccountError::Timeout);
        }
        Ok(())
    }

    /// Drive `fut` until it completes or the context is done.
    ///
    /// A done context drops `fut` and returns `Canceled` or `Timeout`.
    pub async fn run<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        self.check()?;

        let canceled = async {
            match &self.cancel {
                Some(state) => state.wait().await,
                None => std::future::pending::<()>().await,
            }
        };
        let expired = async {
            match self.deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };

        let work = DEADLINE.scope(self.deadline, fut);

        tokio::select! {
            biased;
            _ = canceled => Err(AccountError::Canceled),
            _ = expired => Err(AccountError::Timeout),
            result = work => result,
        }
    }
}
