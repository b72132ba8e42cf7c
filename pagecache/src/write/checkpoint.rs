use super::Inner;
use crate::{
    storage::{File, Storage},
    Error,
};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

impl<S: Storage> Inner<S> {
    /// Record a fuzzy checkpoint in the write-ahead log and drop the log records that no dirty page
    /// depends on anymore.
    ///
    /// The checkpoint starts at the oldest durable LSN any dirty page was loaded or last flushed
    /// at. Every open file is synced between the start and end records.
    pub(super) fn fuzzy_checkpoint(&self) -> Result<(), Error> {
        let Some(wal) = &self.wal else {
            return Ok(());
        };
        let Some(mut start) = wal.flushed_lsn() else {
            return Ok(());
        };
        let groups: Vec<_> = self.dirty.read().unwrap().values().cloned().collect();
        for group in groups {
            if let Some(lsn) = group.pointer().last_flushed_lsn() {
                start = start.min(lsn);
            }
        }

        wal.log_fuzzy_checkpoint_start(start)?;
        for (_, _, handle) in self.open_files() {
            handle.sync()?;
        }
        wal.log_fuzzy_checkpoint_end()?;
        wal.flush()?;
        wal.cut_till(start)?;

        self.metrics.checkpoints.inc();
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |since| since.as_millis() as i64);
        self.metrics.last_checkpoint.set(now);
        debug!(%start, "fuzzy checkpoint completed");
        Ok(())
    }
}
