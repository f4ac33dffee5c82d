// ai
//! ✋ Abort signals — one shared flag, threaded through every stage of a run.
//!
//! 🎬 *[a pipeline of five stages hums along. stage three throws. somewhere, a controller
//! flips a switch. four other stages look up from their work at the exact same time.]*
//!
//! 🧠 Knowledge graph:
//! - `AbortController` owns the switch; `AbortSignal` is the cloneable read side.
//! - Built on `tokio::sync::watch`, so `cancelled().await` never misses a flip, even one
//!   that happened before anybody started listening.
//! - The first `abort()` wins. The reason it carries is the reason everybody sees.
//! - `AbortSignal::any` links several signals into one (external signal + the run's own).
//! - [`destroy_on_abort`] is how an endpoint built with `StreamOptions::signal` listens.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::debug;

use crate::error::StreamError;

type Reason = Option<StreamError>;

/// 🎛️ The hand on the switch.
#[derive(Debug, Clone)]
pub struct AbortController {
    signal: AbortSignal,
}

/// 👂 The ear on the wall. Clone it into every stage.
#[derive(Debug, Clone)]
pub struct AbortSignal {
    // -- 📡 None = still running, Some(reason) = aborted
    tx: Arc<watch::Sender<Option<Reason>>>,
}

impl Default for AbortController {
    fn default() -> Self {
        Self::new()
    }
}

impl AbortController {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self {
            signal: AbortSignal { tx: Arc::new(tx) },
        }
    }

    pub fn signal(&self) -> AbortSignal {
        self.signal.clone()
    }

    /// ✋ Flip the switch. Returns `false` if somebody already beat us to it.
    pub fn abort(&self, reason: Option<StreamError>) -> bool {
        self.signal.trigger(reason)
    }
}

impl AbortSignal {
    /// 🧊 A signal that already went off. Useful for tests and for "never mind".
    pub fn aborted_with(reason: Option<StreamError>) -> Self {
        let controller = AbortController::new();
        controller.abort(reason);
        controller.signal()
    }

    fn trigger(&self, reason: Option<StreamError>) -> bool {
        self.tx.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(reason);
            true
        })
    }

    pub fn is_aborted(&self) -> bool {
        self.tx.borrow().is_some()
    }

    /// 🔍 Why we stopped, if we stopped and somebody bothered to say.
    pub fn reason(&self) -> Option<StreamError> {
        self.tx.borrow().clone().flatten()
    }

    /// 🏷️ The error an operation should fail with after observing this signal.
    pub fn abort_error(&self) -> StreamError {
        match self.reason() {
            Some(reason) if reason.is_abort() => reason,
            Some(reason) => StreamError::aborted_because(reason),
            None => StreamError::aborted(),
        }
    }

    /// ⏳ Resolves once the signal goes off. Resolves immediately if it already did.
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        // -- 🛡️ the sender lives in our own Arc, so wait_for can only fail if that Arc died,
        // -- which it can't while `self` is alive
        let _ = rx.wait_for(|slot| slot.is_some()).await;
    }

    /// 🔗 One signal that fires when any of the inputs fires, carrying that input's reason.
    pub fn any(signals: &[AbortSignal]) -> AbortSignal {
        let controller = AbortController::new();
        if let Some(already) = signals.iter().find(|s| s.is_aborted()) {
            controller.abort(already.reason());
            return controller.signal();
        }
        for signal in signals {
            let signal = signal.clone();
            let linked = controller.clone();
            let watcher = linked.signal();
            tokio::spawn(async move {
                tokio::select! {
                    _ = signal.cancelled() => { linked.abort(signal.reason()); }
                    _ = watcher.cancelled() => {}
                }
            });
        }
        controller.signal()
    }
}

/// 🔌 Call `destroy` with the signal's abort error when it fires, unless `closed` resolves
/// first. An already-aborted signal destroys right away, before this returns.
pub(crate) fn destroy_on_abort(
    signal: AbortSignal,
    closed: impl Future<Output = ()> + Send + 'static,
    destroy: impl FnOnce(StreamError) + Send + 'static,
) {
    if signal.is_aborted() {
        destroy(signal.abort_error());
        return;
    }
    tokio::spawn(async move {
        tokio::select! {
            _ = signal.cancelled() => {
                debug!("✋ endpoint signal fired, tearing down");
                destroy(signal.abort_error());
            }
            _ = closed => {}
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn the_one_where_the_first_abort_wins() {
        let controller = AbortController::new();
        let signal = controller.signal();
        assert!(!signal.is_aborted());
        assert!(controller.abort(Some(StreamError::PrematureClose)));
        assert!(!controller.abort(Some(StreamError::WriteAfterEnd)));
        signal.cancelled().await;
        assert!(matches!(signal.reason(), Some(StreamError::PrematureClose)));
        assert!(signal.abort_error().is_abort());
    }

    #[tokio::test]
    async fn the_one_where_late_listeners_still_hear_the_bang() {
        let signal = AbortSignal::aborted_with(None);
        // ✅ already fired before we subscribed; must not hang
        signal.cancelled().await;
        assert!(signal.reason().is_none());
        assert_eq!(signal.abort_error().code(), "ABORT_ERR");
    }

    #[tokio::test]
    async fn the_one_where_any_of_them_will_do() {
        let a = AbortController::new();
        let b = AbortController::new();
        let linked = AbortSignal::any(&[a.signal(), b.signal()]);
        assert!(!linked.is_aborted());
        b.abort(Some(StreamError::WriteAfterEnd));
        linked.cancelled().await;
        assert!(matches!(linked.reason(), Some(StreamError::WriteAfterEnd)));
    }
}
