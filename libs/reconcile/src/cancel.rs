//! One-shot cancellation for queued services.

use std::sync::Arc;

use cove_id::ServiceId;
use cove_model::Service;
use tokio::sync::watch;

/// A close-once gate.
///
/// Clones share the same gate. Raising it more than once is a no-op, and
/// every current and future waiter observes the raised state.
#[derive(Debug, Clone)]
pub struct CancelSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelSignal {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Raise the signal.
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once the signal has been raised.
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives as long as self, so this only returns once raised.
        let _ = rx.wait_for(|raised| *raised).await;
    }

    /// A receiver for callers that select on `changed()` themselves.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    /// True when both handles share one gate.
    pub fn same_gate(&self, other: &CancelSignal) -> bool {
        Arc::ptr_eq(&self.tx, &other.tx)
    }
}

impl Default for CancelSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// A service paired with the signal that aborts the wait for its convergence.
#[derive(Debug, Clone)]
pub struct CancellableService {
    pub service: Service,
    signal: CancelSignal,
}

impl CancellableService {
    pub fn new(service: Service) -> Self {
        Self {
            service,
            signal: CancelSignal::new(),
        }
    }

    pub fn id(&self) -> &ServiceId {
        &self.service.id
    }

    pub fn cancel(&self) {
        self.signal.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.signal.is_cancelled()
    }

    pub fn signal(&self) -> &CancelSignal {
        &self.signal
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use cove_id::TenantId;

    fn test_service() -> Service {
        Service::new(ServiceId::new(), TenantId::new(), "svc")
    }

    #[test]
    fn test_cancel_twice_is_noop() {
        let svc = CancellableService::new(test_service());
        assert!(!svc.is_cancelled());
        svc.cancel();
        svc.cancel();
        assert!(svc.is_cancelled());
    }

    #[test]
    fn test_clones_share_gate() {
        let svc = CancellableService::new(test_service());
        let clone = svc.clone();
        clone.cancel();
        assert!(svc.is_cancelled());
        assert!(svc.signal().same_gate(clone.signal()));
    }

    #[tokio::test]
    async fn test_cancelled_wakes_waiter() {
        let signal = CancelSignal::new();
        let waiter = {
            let signal = signal.clone();
            tokio::spawn(async move { signal.cancelled().await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        signal.cancel();

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake")
            .unwrap();
    }

    #[tokio::test]
    async fn test_cancelled_returns_immediately_after_raise() {
        let signal = CancelSignal::new();
        signal.cancel();
        tokio::time::timeout(Duration::from_millis(100), signal.cancelled())
            .await
            .expect("already raised");
    }
}
