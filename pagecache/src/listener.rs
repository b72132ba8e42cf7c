//! Listeners notified of conditions detected by background work.
//!
//! Registering a listener returns a [Handle]. Listeners stay registered until the handle is passed
//! back to `unregister`.

use crate::Error;
use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex},
};

/// Free space fell below the configured limit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LowDiskSpace {
    /// Bytes available once allocated-but-unflushed pages are written.
    pub free: i64,

    /// The configured limit.
    pub threshold: u64,
}

pub trait LowDiskSpaceListener: Send + Sync {
    fn notify(&self, info: LowDiskSpace);
}

impl<F: Fn(LowDiskSpace) + Send + Sync> LowDiskSpaceListener for F {
    fn notify(&self, info: LowDiskSpace) {
        self(info)
    }
}

pub trait BackgroundErrorListener: Send + Sync {
    fn notify(&self, error: &Error);
}

impl<F: Fn(&Error) + Send + Sync> BackgroundErrorListener for F {
    fn notify(&self, error: &Error) {
        self(error)
    }
}

/// Identifies a registered listener.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Handle(u64);

/// A set of listeners of one kind.
pub(crate) struct Registry<L: ?Sized> {
    inner: Mutex<(u64, BTreeMap<u64, Arc<L>>)>,
}

impl<L: ?Sized> Registry<L> {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new((0, BTreeMap::new())),
        }
    }

    pub(crate) fn register(&self, listener: Arc<L>) -> Handle {
        let mut inner = self.inner.lock().unwrap();
        let id = inner.0;
        inner.0 += 1;
        inner.1.insert(id, listener);
        Handle(id)
    }

    /// Returns false if the handle was not registered.
    pub(crate) fn unregister(&self, handle: Handle) -> bool {
        self.inner.lock().unwrap().1.remove(&handle.0).is_some()
    }

    /// The registered listeners, in registration order.
    pub(crate) fn listeners(&self) -> Vec<Arc<L>> {
        self.inner.lock().unwrap().1.values().cloned().collect()
    }
}

impl Registry<dyn LowDiskSpaceListener> {
    pub(crate) fn notify(&self, info: LowDiskSpace) {
        for listener in self.listeners() {
            listener.notify(info);
        }
    }
}

impl Registry<dyn BackgroundErrorListener> {
    pub(crate) fn notify(&self, error: &Error) {
        for listener in self.listeners() {
            listener.notify(error);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_register_and_unregister() {
        let registry: Registry<dyn LowDiskSpaceListener> = Registry::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let first = registry.register(Arc::new({
            let calls = calls.clone();
            move |info: LowDiskSpace| {
                assert_eq!(info.threshold, 10);
                calls.fetch_add(1, Ordering::SeqCst);
            }
        }));
        let second = registry.register(Arc::new({
            let calls = calls.clone();
            move |_: LowDiskSpace| {
                calls.fetch_add(10, Ordering::SeqCst);
            }
        }));
        assert_ne!(first, second);

        let info = LowDiskSpace {
            free: 5,
            threshold: 10,
        };
        registry.notify(info);
        assert_eq!(calls.load(Ordering::SeqCst), 11);

        assert!(registry.unregister(second));
        assert!(!registry.unregister(second));
        registry.notify(info);
        assert_eq!(calls.load(Ordering::SeqCst), 12);
    }

    #[test]
    fn test_error_listener() {
        let registry: Registry<dyn BackgroundErrorListener> = Registry::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let handle = registry.register(Arc::new({
            let seen = seen.clone();
            move |error: &Error| seen.lock().unwrap().push(error.to_string())
        }));
        registry.notify(&Error::WriteFailed);
        assert!(registry.unregister(handle));
        registry.notify(&Error::ReadFailed);
        assert_eq!(*seen.lock().unwrap(), vec!["write failed".to_string()]);
    }
}
