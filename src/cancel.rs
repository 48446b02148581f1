//! Cooperative cancellation shared by the daemon, engine, and delegation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

type Hook = Box<dyn Fn() + Send>;

/// Cloneable cancellation flag. Hooks registered with [`on_cancel`] run once
/// when the token is cancelled, so blocked waiters can be woken instead of
/// polling.
///
/// [`on_cancel`]: CancelToken::on_cancel
#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    cancelled: AtomicBool,
    hooks: Mutex<Vec<(u64, Hook)>>,
    next_hook: Mutex<u64>,
}

/// Removes its hook when dropped.
pub struct HookGuard {
    token: CancelToken,
    id: u64,
}

impl Drop for HookGuard {
    fn drop(&mut self) {
        let mut hooks = self
            .token
            .inner
            .hooks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        hooks.retain(|(id, _)| *id != self.id);
    }
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Cancel and run every registered hook. Later calls do nothing.
    pub fn cancel(&self) {
        if self.inner.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        let hooks = std::mem::take(
            &mut *self
                .inner
                .hooks
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for (_, hook) in hooks {
            hook();
        }
    }

    /// Run `hook` on cancellation, or immediately if already cancelled. The
    /// hook is unregistered when the guard drops.
    pub fn on_cancel(&self, hook: impl Fn() + Send + 'static) -> HookGuard {
        let id = {
            let mut next = self
                .inner
                .next_hook
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            *next += 1;
            *next
        };
        {
            let mut hooks = self
                .inner
                .hooks
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if !self.is_cancelled() {
                hooks.push((id, Box::new(hook)));
                return HookGuard {
                    token: self.clone(),
                    id,
                };
            }
        }
        hook();
        HookGuard {
            token: self.clone(),
            id,
        }
    }
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish_non_exhaustive()
    }
}
