// Cooperative cancellation: one signal per run/build, observed by executors
// at step boundaries and inside long I/O waits.

use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::watch;
use uuid::Uuid;

/// Read side of a cancellation signal. Cheap to clone; safe to poll from
/// blocking threads via `is_cancelled`.
#[derive(Debug, Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    /// A token that can never fire, for callers outside any run
    pub fn never() -> Self {
        // One process-wide sender keeps every never-token open
        static NEVER: std::sync::OnceLock<watch::Sender<bool>> = std::sync::OnceLock::new();
        let tx = NEVER.get_or_init(|| watch::channel(false).0);
        Self { rx: tx.subscribe() }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once the signal fires. Used inside `tokio::select!`.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                // Sender gone without firing; treat as never-cancelled
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Standalone fire switch for scoped signals (e.g. per-step timeouts)
#[derive(Debug)]
pub struct CancelSwitch {
    tx: watch::Sender<bool>,
}

impl CancelSwitch {
    pub fn cancel(&self) {
        let _ = self.tx.send_replace(true);
    }
}

/// A free-standing switch/token pair outside the registry
pub fn cancel_pair() -> (CancelSwitch, CancelToken) {
    let (tx, rx) = watch::channel(false);
    (CancelSwitch { tx }, CancelToken { rx })
}

#[derive(Debug)]
struct CancelHandle {
    tx: watch::Sender<bool>,
}

/// Registry of live cancellation signals keyed by run/build id
#[derive(Debug, Default)]
pub struct CancelRegistry {
    inner: Mutex<HashMap<Uuid, CancelHandle>>,
}

impl CancelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create and register the signal for a new run/build
    pub fn register(&self, id: Uuid) -> CancelToken {
        let (tx, rx) = watch::channel(false);
        self.lock().insert(id, CancelHandle { tx });
        CancelToken { rx }
    }

    /// Fire the signal. Idempotent; returns false when the id is unknown
    /// (already finished and deregistered, or never existed).
    pub fn cancel(&self, id: Uuid) -> bool {
        match self.lock().get(&id) {
            Some(handle) => {
                handle.tx.send_replace(true);
                true
            }
            None => false,
        }
    }

    /// Drop the signal once its run/build reached a terminal state
    pub fn deregister(&self, id: Uuid) {
        self.lock().remove(&id);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, CancelHandle>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_register_cancel_observe() {
        let registry = CancelRegistry::new();
        let id = Uuid::new_v4();
        let token = registry.register(id);
        assert!(!token.is_cancelled());
        assert!(registry.cancel(id));
        assert!(token.is_cancelled());
        token.cancelled().await;
    }

    #[tokio::test]
    async fn test_cancel_is_idempotent() {
        let registry = CancelRegistry::new();
        let id = Uuid::new_v4();
        let token = registry.register(id);
        assert!(registry.cancel(id));
        assert!(registry.cancel(id));
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn test_cancel_unknown_returns_false() {
        let registry = CancelRegistry::new();
        assert!(!registry.cancel(Uuid::new_v4()));
    }

    #[tokio::test]
    async fn test_deregister_forgets_signal() {
        let registry = CancelRegistry::new();
        let id = Uuid::new_v4();
        let _token = registry.register(id);
        registry.deregister(id);
        assert!(!registry.cancel(id));
    }

    #[tokio::test]
    async fn test_never_token_stays_quiet() {
        let token = CancelToken::never();
        assert!(!token.is_cancelled());
        let raced = tokio::time::timeout(std::time::Duration::from_millis(20), token.cancelled());
        assert!(raced.await.is_err());
    }
}
