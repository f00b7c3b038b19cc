//! Cancellation tokens and the watcher binding them to blocking I/O.
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Why a [`CancelToken`] fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelCause {
    /// The token was canceled explicitly.
    Canceled,
    /// The token's deadline elapsed.
    DeadlineExceeded,
}

impl std::fmt::Display for CancelCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Canceled => f.write_str("operation canceled"),
            Self::DeadlineExceeded => f.write_str("deadline exceeded"),
        }
    }
}

/// An external cancellation signal for a single in-flight operation.
///
/// A token fires at most once. Cloned tokens share the same signal.
/// [`CancelToken::none`] has no cancellation capability at all and is
/// the cheapest way to run an operation uncancellable.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    shared: Option<Arc<Shared>>,
}

#[derive(Debug)]
struct Shared {
    tx: watch::Sender<Option<CancelCause>>,
}

impl CancelToken {
    /// A token that can be [`cancel`][CancelToken::cancel]ed.
    pub fn new() -> CancelToken {
        let (tx, _) = watch::channel(None);
        CancelToken {
            shared: Some(Arc::new(Shared { tx })),
        }
    }

    /// A token with no cancellation capability.
    pub fn none() -> CancelToken {
        CancelToken { shared: None }
    }

    /// A token that fires with [`CancelCause::DeadlineExceeded`] after `timeout`.
    ///
    /// Must be called within a tokio runtime.
    pub fn with_timeout(timeout: Duration) -> CancelToken {
        let token = CancelToken::new();
        let timer = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            timer.cancel_with(CancelCause::DeadlineExceeded);
        });
        token
    }

    /// Fire the token with [`CancelCause::Canceled`].
    ///
    /// Firing a token twice, or one with a deadline already elapsed, is a no-op.
    pub fn cancel(&self) {
        self.cancel_with(CancelCause::Canceled);
    }

    fn cancel_with(&self, cause: CancelCause) {
        if let Some(shared) = &self.shared {
            shared.tx.send_if_modified(|state| {
                if state.is_none() {
                    *state = Some(cause);
                    true
                } else {
                    false
                }
            });
        }
    }

    /// The cause this token fired with, if it has fired.
    pub fn fired(&self) -> Option<CancelCause> {
        self.shared.as_ref().and_then(|s| *s.tx.borrow())
    }

    /// Whether this token can fire at all.
    pub fn can_cancel(&self) -> bool {
        self.shared.is_some()
    }

    /// Wait for the token to fire. Pending forever for incapable tokens.
    pub async fn cancelled(&self) -> CancelCause {
        let Some(shared) = &self.shared else {
            return std::future::pending().await;
        };
        let mut rx = shared.tx.subscribe();
        loop {
            if let Some(cause) = *rx.borrow_and_update() {
                return cause;
            }
            if rx.changed().await.is_err() {
                // all senders dropped without firing; we hold one, unreachable
                return std::future::pending().await;
            }
        }
    }
}

/// Watches a [`CancelToken`] and performs an action when it fires.
/// It can watch one token at a time.
///
/// `on_cancel` is called exactly once if the watched token fires before
/// [`unwatch`][CancelWatcher::unwatch]. `on_unwatch_after_cancel` is called
/// from `unwatch` iff `on_cancel` already ran. The watcher is reusable
/// after `unwatch`.
pub(crate) struct CancelWatcher {
    on_cancel: Arc<dyn Fn(CancelCause) + Send + Sync>,
    on_unwatch_after_cancel: Arc<dyn Fn() + Send + Sync>,
    fired: Arc<AtomicBool>,
    watching: bool,
    task: Option<JoinHandle<()>>,
}

impl CancelWatcher {
    pub fn new(
        on_cancel: impl Fn(CancelCause) + Send + Sync + 'static,
        on_unwatch_after_cancel: impl Fn() + Send + Sync + 'static,
    ) -> CancelWatcher {
        CancelWatcher {
            on_cancel: Arc::new(on_cancel),
            on_unwatch_after_cancel: Arc::new(on_unwatch_after_cancel),
            fired: Arc::new(AtomicBool::new(false)),
            watching: false,
            task: None,
        }
    }

    /// Start watching `token`. A token without cancellation capability is a
    /// no-op watch.
    ///
    /// # Panics
    ///
    /// Panics if a watch is already in progress; that is a programmer error.
    pub fn watch(&mut self, token: &CancelToken) {
        assert!(!self.watching, "watch already in progress");
        self.watching = true;

        if !token.can_cancel() {
            return;
        }

        let token = token.clone();
        let fired = self.fired.clone();
        let on_cancel = self.on_cancel.clone();
        self.task = Some(tokio::spawn(async move {
            let cause = token.cancelled().await;
            fired.store(true, Ordering::Release);
            on_cancel(cause);
        }));
    }

    /// Stop watching the previously watched token.
    ///
    /// Waits out a concurrently firing `on_cancel` so that
    /// `on_unwatch_after_cancel` never overlaps it. No-op when not watching.
    pub async fn unwatch(&mut self) {
        if !self.watching {
            return;
        }
        self.watching = false;

        if let Some(task) = self.task.take() {
            task.abort();
            let _ = task.await;
        }

        if self.fired.swap(false, Ordering::AcqRel) {
            (self.on_unwatch_after_cancel)();
        }
    }
}

impl Drop for CancelWatcher {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl std::fmt::Debug for CancelWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelWatcher")
            .field("watching", &self.watching)
            .field("fired", &self.fired.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn rt() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap()
    }

    #[test]
    fn cancel_fires_once() {
        let token = CancelToken::new();
        assert!(token.fired().is_none());
        token.cancel();
        assert_eq!(token.fired(), Some(CancelCause::Canceled));
        // a second cancel does not change the cause
        token.cancel();
        assert_eq!(token.fired(), Some(CancelCause::Canceled));
    }

    #[test]
    fn none_token_never_fires() {
        let token = CancelToken::none();
        token.cancel();
        assert!(token.fired().is_none());
        assert!(!token.can_cancel());
    }

    #[test]
    fn deadline_fires_with_cause() {
        rt().block_on(async {
            let token = CancelToken::with_timeout(Duration::from_millis(5));
            let cause = token.cancelled().await;
            assert_eq!(cause, CancelCause::DeadlineExceeded);
        });
    }

    #[test]
    fn watcher_runs_callbacks_exactly_once() {
        rt().block_on(async {
            let cancels = Arc::new(AtomicUsize::new(0));
            let unwatches = Arc::new(AtomicUsize::new(0));

            let c = cancels.clone();
            let u = unwatches.clone();
            let mut watcher = CancelWatcher::new(
                move |_| {
                    c.fetch_add(1, Ordering::SeqCst);
                },
                move || {
                    u.fetch_add(1, Ordering::SeqCst);
                },
            );

            let token = CancelToken::new();
            watcher.watch(&token);
            token.cancel();
            // give the watch task a chance to observe the fire
            tokio::task::yield_now().await;
            watcher.unwatch().await;

            assert_eq!(cancels.load(Ordering::SeqCst), 1);
            assert_eq!(unwatches.load(Ordering::SeqCst), 1);

            // reusable, and a clean unwatch runs neither callback
            let token = CancelToken::new();
            watcher.watch(&token);
            watcher.unwatch().await;
            assert_eq!(cancels.load(Ordering::SeqCst), 1);
            assert_eq!(unwatches.load(Ordering::SeqCst), 1);
        });
    }

    #[test]
    #[should_panic(expected = "watch already in progress")]
    fn overlapping_watch_panics() {
        rt().block_on(async {
            let mut watcher = CancelWatcher::new(|_| {}, || {});
            watcher.watch(&CancelToken::none());
            watcher.watch(&CancelToken::none());
        });
    }
}
