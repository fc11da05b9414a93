use std::sync::{Arc, Mutex, Weak};

use crate::session::Session;

/// Session lifecycle observer.
///
/// `initialized` is the only required method; every other event has a no-op
/// default so observers implement just the subset they care about.
pub trait SessionObserver: Send + Sync {
    /// First resolution of the persisted session after startup. Also
    /// delivered synthetically to observers registered after initialization
    /// already completed.
    fn initialized(&self, session: Option<&Session>);
    fn did_resume_session(&self, _session: &Session) {}
    fn did_refresh_session(&self, _session: &Session) {}
    fn did_lose_network_connection(&self, _session: &Session) {}
    fn did_regain_network_connection(&self, _session: &Session) {}
    fn did_lose_session(&self) {}
    fn did_complete_login(&self, _session: &Session) {}
    fn did_logout(&self) {}
}

/// Registry of non-owning observer handles.
///
/// Observers are held weakly: an observer that is dropped without explicit
/// unregistration is silently skipped and pruned on the next broadcast.
/// Events are delivered in registration order.
pub struct ObserverRegistry {
    inner: Mutex<RegistryInner>,
}

struct RegistryInner {
    observers: Vec<Weak<dyn SessionObserver>>,
    /// Set once the first `initialized` broadcast has happened; replayed to
    /// late registrations so no observer can miss the resolved state.
    initialized_snapshot: Option<Option<Session>>,
}

impl ObserverRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(RegistryInner {
                observers: Vec::new(),
                initialized_snapshot: None,
            }),
        }
    }

    pub fn register(&self, observer: &Arc<dyn SessionObserver>) {
        let snapshot = {
            let mut inner = self.inner.lock().unwrap();
            inner.observers.retain(|weak| weak.strong_count() > 0);
            inner.observers.push(Arc::downgrade(observer));
            inner.initialized_snapshot.clone()
        };
        // Deliver outside the lock so observers may re-enter the registry.
        if let Some(session) = snapshot {
            observer.initialized(session.as_ref());
        }
    }

    /// Broadcast `initialized` and record the snapshot for late registrations.
    pub fn notify_initialized(&self, session: Option<&Session>) {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.initialized_snapshot = Some(session.cloned());
        }
        self.broadcast(|observer| observer.initialized(session));
    }

    /// Reset the initialization snapshot, e.g. after `delete_all_data`.
    pub fn reset_initialized(&self) {
        self.inner.lock().unwrap().initialized_snapshot = None;
    }

    pub fn broadcast<F>(&self, deliver: F)
    where
        F: Fn(&dyn SessionObserver),
    {
        let live: Vec<Arc<dyn SessionObserver>> = {
            let mut inner = self.inner.lock().unwrap();
            inner.observers.retain(|weak| weak.strong_count() > 0);
            inner
                .observers
                .iter()
                .filter_map(Weak::upgrade)
                .collect()
        };
        for observer in live {
            deliver(observer.as_ref());
        }
    }
}

impl Default for ObserverRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::test_support::make_session;
    use chrono::Duration;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingObserver {
        initialized: AtomicUsize,
        refreshed: AtomicUsize,
    }

    impl SessionObserver for CountingObserver {
        fn initialized(&self, _session: Option<&Session>) {
            self.initialized.fetch_add(1, Ordering::SeqCst);
        }
        fn did_refresh_session(&self, _session: &Session) {
            self.refreshed.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn broadcast_reaches_registered_observers() {
        let registry = ObserverRegistry::new();
        let observer = Arc::new(CountingObserver::default());
        let handle: Arc<dyn SessionObserver> = observer.clone();
        registry.register(&handle);

        let session = make_session(Duration::hours(1));
        registry.broadcast(|o| o.did_refresh_session(&session));
        assert_eq!(observer.refreshed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn dropped_observers_are_skipped() {
        let registry = ObserverRegistry::new();
        let kept = Arc::new(CountingObserver::default());
        let kept_handle: Arc<dyn SessionObserver> = kept.clone();
        registry.register(&kept_handle);
        {
            let dropped: Arc<dyn SessionObserver> = Arc::new(CountingObserver::default());
            registry.register(&dropped);
        }
        let session = make_session(Duration::hours(1));
        registry.broadcast(|o| o.did_refresh_session(&session));
        assert_eq!(kept.refreshed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn late_registration_receives_synthetic_initialized() {
        let registry = ObserverRegistry::new();
        registry.notify_initialized(Some(&make_session(Duration::hours(1))));

        let late = Arc::new(CountingObserver::default());
        let handle: Arc<dyn SessionObserver> = late.clone();
        registry.register(&handle);
        assert_eq!(late.initialized.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn registration_before_initialization_gets_no_synthetic_event() {
        let registry = ObserverRegistry::new();
        let early = Arc::new(CountingObserver::default());
        let handle: Arc<dyn SessionObserver> = early.clone();
        registry.register(&handle);
        assert_eq!(early.initialized.load(Ordering::SeqCst), 0);

        registry.notify_initialized(None);
        assert_eq!(early.initialized.load(Ordering::SeqCst), 1);
    }
}
