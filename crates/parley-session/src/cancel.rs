//! One-shot cancellation signal shared by a turn's pipeline and its controller.

use std::sync::{Arc, Mutex, MutexGuard};

use tokio_util::sync::CancellationToken;

/// Cancellation signal for a single turn.
///
/// The pipeline arms the token once the turn's transcript is accepted; only
/// an armed turn can be barged in on. Once signaled it stays signaled. The flag lives behind a mutex so that
/// [`CancelToken::emit_if_live`] can check it and perform an outbound send as
/// one step: after `signal()` returns, no gated send can start or be in flight.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    flags: Mutex<Flags>,
    notify: CancellationToken,
}

#[derive(Debug, Default)]
struct Flags {
    cancelled: bool,
    armed: bool,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    fn flags(&self) -> MutexGuard<'_, Flags> {
        // Plain flags, so a poisoned lock is still usable.
        self.inner.flags.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Request cancellation. Returns `true` only for the call that flipped it.
    pub fn signal(&self) -> bool {
        let mut flags = self.flags();
        if flags.cancelled {
            return false;
        }
        flags.cancelled = true;
        drop(flags);
        self.inner.notify.cancel();
        true
    }

    pub fn is_cancelled(&self) -> bool {
        self.flags().cancelled
    }

    /// Mark the turn as committed to a response. Returns `false`, leaving the
    /// token unarmed, when it was already signaled.
    pub fn arm(&self) -> bool {
        let mut flags = self.flags();
        if flags.cancelled {
            return false;
        }
        flags.armed = true;
        true
    }

    pub fn is_armed(&self) -> bool {
        self.flags().armed
    }

    /// Resolves once the token is signaled. Cancel-safe.
    pub async fn cancelled(&self) {
        self.inner.notify.cancelled().await
    }

    /// Run `emit` only if the token is not signaled, holding the flag while it
    /// runs. Returns `None` without calling `emit` when cancelled.
    ///
    /// `emit` must not block.
    pub fn emit_if_live<T>(&self, emit: impl FnOnce() -> T) -> Option<T> {
        let flags = self.flags();
        if flags.cancelled {
            return None;
        }
        Some(emit())
    }
}
