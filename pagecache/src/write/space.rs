use crate::{
    listener::{LowDiskSpace, LowDiskSpaceListener, Registry},
    storage::Storage,
    Error,
};
use prometheus_client::metrics::counter::Counter;
use std::{
    sync::{
        atomic::{AtomicI64, AtomicU64, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};
use tracing::{debug, warn};

const NEVER: u64 = u64::MAX;

/// Tracks space allocated to files but not yet written and warns listeners when the storage is
/// about to run out of room.
pub(crate) struct SpaceMonitor {
    name: String,
    limit: u64,
    interval: Duration,

    // Bytes allocated by growing files whose pages have not been flushed yet.
    allocated: AtomicI64,

    epoch: Instant,
    last_check: AtomicU64,

    listeners: Arc<Registry<dyn LowDiskSpaceListener>>,
    notifications: Counter,
}

impl SpaceMonitor {
    pub(crate) fn new(
        name: String,
        limit: u64,
        interval: Duration,
        listeners: Arc<Registry<dyn LowDiskSpaceListener>>,
        notifications: Counter,
    ) -> Self {
        Self {
            name,
            limit,
            interval,
            allocated: AtomicI64::new(0),
            epoch: Instant::now(),
            last_check: AtomicU64::new(NEVER),
            listeners,
            notifications,
        }
    }

    pub(crate) fn allocated(&self) -> i64 {
        self.allocated.load(Ordering::Acquire)
    }

    /// Record `bytes` of newly allocated space and check free space if the sampling window has
    /// elapsed.
    pub(crate) fn allocate<S: Storage>(&self, storage: &S, bytes: u64) {
        self.allocated.fetch_add(bytes as i64, Ordering::AcqRel);
        self.sample(storage);
    }

    /// Record that `bytes` of allocated space were written (or dropped).
    pub(crate) fn release(&self, bytes: u64) {
        self.allocated.fetch_sub(bytes as i64, Ordering::AcqRel);
    }

    fn sample<S: Storage>(&self, storage: &S) {
        let now = self.epoch.elapsed().as_millis() as u64;
        let last = self.last_check.load(Ordering::Acquire);
        if last != NEVER && now.saturating_sub(last) < self.interval.as_millis() as u64 {
            return;
        }

        // Only one caller per window queries the storage.
        if self
            .last_check
            .compare_exchange(last, now, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        let info = match self.measure(storage) {
            Ok(Some(info)) => info,
            Ok(None) => return,
            Err(err) => {
                warn!(?err, "unable to query free space");
                return;
            }
        };
        let listeners = self.listeners.clone();
        let spawned = thread::Builder::new()
            .name(format!("{}-low-disk", self.name))
            .spawn(move || listeners.notify(info));
        if let Err(err) = spawned {
            warn!(?err, "unable to deliver low disk space notification");
        }
    }

    /// Compare free space (minus unflushed allocations) against the limit.
    fn measure<S: Storage>(&self, storage: &S) -> Result<Option<LowDiskSpace>, Error> {
        let free = storage.free_space()?;
        let free = i64::try_from(free)
            .unwrap_or(i64::MAX)
            .saturating_sub(self.allocated());
        if free >= 0 && free as u64 >= self.limit {
            return Ok(None);
        }
        warn!(free, threshold = self.limit, "low disk space");
        self.notifications.inc();
        Ok(Some(LowDiskSpace {
            free,
            threshold: self.limit,
        }))
    }

    /// Check free space now and notify listeners on the calling thread.
    pub(crate) fn check<S: Storage>(&self, storage: &S) -> Result<bool, Error> {
        self.last_check.store(
            self.epoch.elapsed().as_millis() as u64,
            Ordering::Release,
        );
        match self.measure(storage)? {
            Some(info) => {
                self.listeners.notify(info);
                Ok(true)
            }
            None => {
                debug!(allocated = self.allocated(), "free space above limit");
                Ok(false)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::Storage as MemoryStorage;
    use std::sync::Mutex;

    fn monitor(
        limit: u64,
        interval: Duration,
    ) -> (SpaceMonitor, Arc<Mutex<Vec<LowDiskSpace>>>) {
        let listeners: Arc<Registry<dyn LowDiskSpaceListener>> = Arc::new(Registry::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        listeners.register(Arc::new({
            let seen = seen.clone();
            move |info: LowDiskSpace| seen.lock().unwrap().push(info)
        }));
        let monitor = SpaceMonitor::new(
            "test".into(),
            limit,
            interval,
            listeners,
            Counter::default(),
        );
        (monitor, seen)
    }

    #[test]
    fn test_check_accounts_for_allocations() {
        let storage = MemoryStorage::default();
        storage.set_free_space(1000);
        let (monitor, seen) = monitor(600, Duration::from_secs(60));
        assert!(!monitor.check(&storage).unwrap());

        monitor.allocate(&storage, 500);
        assert_eq!(monitor.allocated(), 500);
        assert!(monitor.check(&storage).unwrap());
        assert_eq!(
            *seen.lock().unwrap(),
            vec![LowDiskSpace {
                free: 500,
                threshold: 600
            }]
        );

        monitor.release(500);
        assert!(!monitor.check(&storage).unwrap());
        assert_eq!(monitor.notifications.get(), 1);
    }

    #[test]
    fn test_one_notification_per_window() {
        let storage = MemoryStorage::default();
        storage.set_free_space(10);
        let (monitor, seen) = monitor(100, Duration::from_secs(3600));

        // The first allocation samples, later ones fall within the same window.
        for _ in 0..5 {
            monitor.allocate(&storage, 1);
        }
        let start = Instant::now();
        while seen.lock().unwrap().is_empty() {
            assert!(start.elapsed() < Duration::from_secs(10), "no notification");
            thread::sleep(Duration::from_millis(1));
        }
        thread::sleep(Duration::from_millis(20));
        assert_eq!(seen.lock().unwrap().len(), 1);
        assert_eq!(monitor.notifications.get(), 1);
    }
}
