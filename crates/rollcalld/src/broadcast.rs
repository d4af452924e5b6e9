//! Process-wide registry of live observers.
//!
//! Constructed once at startup and shared by handle. Each observer gets a
//! bounded channel; a send that fails (receiver gone, or buffer full) evicts
//! that observer and delivery continues to the rest.

use rollcall_core::BroadcastEvent;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc::{self, error::TrySendError};

pub type ObserverId = u64;

/// Receiving side of one observer registration.
pub struct Observer {
    pub id: ObserverId,
    pub rx: mpsc::Receiver<Arc<str>>,
}

pub struct ObserverRegistry {
    observers: Mutex<HashMap<ObserverId, mpsc::Sender<Arc<str>>>>,
    next_id: AtomicU64,
    buffer: usize,
}

impl ObserverRegistry {
    pub fn new(buffer: usize) -> Self {
        Self {
            observers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            buffer: buffer.max(1),
        }
    }

    pub fn connect(&self) -> Observer {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.buffer);
        let count = {
            let mut observers = self.observers.lock().unwrap_or_else(PoisonError::into_inner);
            observers.insert(id, tx);
            observers.len()
        };
        tracing::info!(observer = id, total = count, "observer connected");
        Observer { id, rx }
    }

    /// Remove `id`. Returns false if it was already gone.
    pub fn disconnect(&self, id: ObserverId) -> bool {
        let mut observers = self.observers.lock().unwrap_or_else(PoisonError::into_inner);
        let removed = observers.remove(&id).is_some();
        if removed {
            tracing::info!(observer = id, total = observers.len(), "observer disconnected");
        }
        removed
    }

    /// Deliver `event` to every current observer. Returns how many accepted it.
    ///
    /// The registry lock is held for the whole fan-out, so concurrent
    /// broadcasts reach each observer in the order they were issued.
    pub fn broadcast(&self, event: &BroadcastEvent) -> usize {
        let message: Arc<str> = match serde_json::to_string(event) {
            Ok(json) => json.into(),
            Err(err) => {
                tracing::error!(error = %err, "failed to serialize broadcast event");
                return 0;
            }
        };

        let mut observers = self.observers.lock().unwrap_or_else(PoisonError::into_inner);
        let mut dead = Vec::new();
        for (id, tx) in observers.iter() {
            match tx.try_send(Arc::clone(&message)) {
                Ok(()) => {}
                Err(TrySendError::Closed(_)) => dead.push((*id, "closed")),
                Err(TrySendError::Full(_)) => dead.push((*id, "lagging")),
            }
        }
        for (id, reason) in &dead {
            observers.remove(id);
            tracing::warn!(observer = id, reason, "evicted observer after failed send");
        }

        let delivered = observers.len();
        tracing::debug!(delivered, evicted = dead.len(), "broadcast");
        delivered
    }

    pub fn len(&self) -> usize {
        self.observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every registration; open observer streams end.
    pub fn shutdown(&self) {
        let mut observers = self.observers.lock().unwrap_or_else(PoisonError::into_inner);
        let count = observers.len();
        observers.clear();
        tracing::info!(count, "observer registry cleared");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rollcall_core::ResetScope;

    fn reset() -> BroadcastEvent {
        BroadcastEvent::DatabaseReset {
            scope: ResetScope::All,
        }
    }

    #[test]
    fn test_empty_at_startup() {
        let registry = ObserverRegistry::new(4);
        assert!(registry.is_empty());
        assert_eq!(registry.broadcast(&reset()), 0);
    }

    #[test]
    fn test_dead_observer_is_evicted() {
        let registry = ObserverRegistry::new(4);
        let mut a = registry.connect();
        let dead = registry.connect();
        let mut c = registry.connect();
        drop(dead.rx);

        assert_eq!(registry.broadcast(&reset()), 2);
        assert_eq!(registry.len(), 2);
        assert!(!registry.disconnect(dead.id));

        let expected = serde_json::to_string(&reset()).unwrap();
        assert_eq!(&*a.rx.try_recv().unwrap(), expected.as_str());
        assert_eq!(&*c.rx.try_recv().unwrap(), expected.as_str());
    }

    #[test]
    fn test_lagging_observer_is_evicted() {
        let registry = ObserverRegistry::new(1);
        let _slow = registry.connect();
        assert_eq!(registry.broadcast(&reset()), 1);
        assert_eq!(registry.broadcast(&reset()), 0);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_per_observer_order() {
        let registry = ObserverRegistry::new(8);
        let mut obs = registry.connect();
        let scopes = [ResetScope::Students, ResetScope::Attendance, ResetScope::All];
        for scope in scopes {
            registry.broadcast(&BroadcastEvent::DatabaseReset { scope });
        }
        for scope in scopes {
            let got: BroadcastEvent = serde_json::from_str(&obs.rx.try_recv().unwrap()).unwrap();
            assert_eq!(got, BroadcastEvent::DatabaseReset { scope });
        }
    }

    #[test]
    fn test_late_observer_sees_no_replay() {
        let registry = ObserverRegistry::new(4);
        registry.broadcast(&reset());
        let mut late = registry.connect();
        assert!(late.rx.try_recv().is_err());
    }

    #[test]
    fn test_shutdown_closes_streams() {
        let registry = ObserverRegistry::new(4);
        let mut obs = registry.connect();
        registry.shutdown();
        assert!(registry.is_empty());
        assert!(matches!(
            obs.rx.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
    }
}
