//! Writing dirty pages to disk.
//!
//! A background pass sizes itself from how full the caches are: below [RAMP_START] occupancy
//! only [MIN_PAGES_PER_FLUSH] pages are written, the target grows linearly up to
//! [MAX_PAGES_PER_FLUSH] at [RAMP_END] and above it pages are written even if they were modified
//! recently.

use super::{Inner, PageGroup};
use crate::{
    key::PageKey,
    page,
    storage::{File, Storage},
    Error,
};
use std::{
    collections::HashSet,
    ops::Bound,
    sync::{atomic::Ordering, Arc},
    time::{Duration, Instant},
};
use tracing::{debug, trace};

/// Most pages written by one background pass.
pub const MAX_PAGES_PER_FLUSH: usize = 256;

/// Fewest pages a background pass tries to write.
pub const MIN_PAGES_PER_FLUSH: usize = 4;

/// Most runs of non-contiguous pages written by one background pass.
pub const MAX_REGIONS_PER_FLUSH: usize = 16;

const RAMP_START: f64 = 0.3;
const RAMP_END: f64 = 0.7;

/// Pages to write for a cache occupancy ratio and whether recently modified pages must be written
/// too.
fn ramp(ratio: f64) -> (usize, bool) {
    if ratio < RAMP_START {
        (0, false)
    } else if ratio > RAMP_END {
        (MAX_PAGES_PER_FLUSH, true)
    } else {
        let share = (ratio - RAMP_START) / (RAMP_END - RAMP_START);
        ((share * MAX_PAGES_PER_FLUSH as f64) as usize, false)
    }
}

/// Combine the exclusive-page and whole-cache occupancy into a pass target.
pub(crate) fn target(exclusive: f64, total: f64) -> (usize, bool) {
    let (exclusive_pages, exclusive_force) = ramp(exclusive);
    let (total_pages, total_force) = ramp(total);
    let pages = exclusive_pages
        .max(total_pages)
        .clamp(MIN_PAGES_PER_FLUSH, MAX_PAGES_PER_FLUSH);
    (pages, exclusive_force || total_force)
}

/// Returns true if a background pass should skip a page this time.
pub(crate) fn should_defer(recency: bool, age: Duration, ttl: Duration, force: bool) -> bool {
    recency && age < ttl && !force
}

struct Pass {
    target: usize,
    force: bool,
    flushed: usize,
    regions: usize,
    previous: Option<PageKey>,
    visited: HashSet<PageKey>,
}

impl<S: Storage> Inner<S> {
    /// Dirty pages after `cursor` followed by dirty pages up to and including it.
    fn dirty_ring(&self, cursor: Option<PageKey>) -> Vec<(PageKey, Arc<PageGroup>)> {
        let dirty = self.dirty.read().unwrap();
        let after = match cursor {
            Some(cursor) => Bound::Excluded(cursor),
            None => Bound::Unbounded,
        };
        let mut ring: Vec<_> = dirty
            .range((after, Bound::Unbounded))
            .map(|(key, group)| (*key, group.clone()))
            .collect();
        if let Some(cursor) = cursor {
            ring.extend(
                dirty
                    .range(..=cursor)
                    .map(|(key, group)| (*key, group.clone())),
            );
        }
        ring
    }

    fn exclusive_ring(&self, cursor: Option<PageKey>) -> Vec<(PageKey, Arc<PageGroup>)> {
        let keys = self.exclusive.ring(cursor);
        let dirty = self.dirty.read().unwrap();
        keys.into_iter()
            .filter_map(|key| dirty.get(&key).map(|group| (key, group.clone())))
            .collect()
    }

    /// Write a batch of dirty pages, sized by cache occupancy, and return how many were written.
    pub(super) fn flush_pass(&self) -> Result<usize, Error> {
        let start = Instant::now();
        let dirty = self.dirty.read().unwrap().len();
        if dirty == 0 {
            self.metrics.last_flush_pages.set(0);
            return Ok(0);
        }

        let exclusive = self.exclusive.len() as f64 / self.write_pages as f64;
        let resident = self.read_resident.load(Ordering::Relaxed) + dirty;
        let total = resident as f64 / (self.read_pages + self.write_pages) as f64;
        let (target, force) = target(exclusive, total);

        let cursor = *self.cursor.lock().unwrap();
        let mut pass = Pass {
            target,
            force,
            flushed: 0,
            regions: 0,
            previous: None,
            visited: HashSet::new(),
        };
        let result = self
            .flush_candidates(&mut pass, self.exclusive_ring(cursor))
            .and_then(|()| {
                if pass.flushed < pass.target && pass.regions < MAX_REGIONS_PER_FLUSH {
                    pass.previous = None;
                    self.flush_candidates(&mut pass, self.dirty_ring(cursor))
                } else {
                    Ok(())
                }
            });

        let elapsed = start.elapsed();
        self.metrics.last_flush_pages.set(pass.flushed as i64);
        self.metrics
            .last_flush_duration
            .set(elapsed.as_millis() as i64);
        if pass.flushed > 0 {
            debug!(
                pages = pass.flushed,
                regions = pass.regions,
                target,
                force,
                ?elapsed,
                "flushed dirty pages"
            );
        }
        result.map(|()| pass.flushed)
    }

    fn flush_candidates(
        &self,
        pass: &mut Pass,
        candidates: Vec<(PageKey, Arc<PageGroup>)>,
    ) -> Result<(), Error> {
        for (key, group) in candidates {
            if pass.flushed >= pass.target {
                break;
            }
            if !pass.visited.insert(key) {
                continue;
            }
            let age = group.created.elapsed();
            let recency = group.recency.load(Ordering::Acquire);
            if should_defer(recency, age, self.group_ttl, pass.force) {
                group.recency.store(false, Ordering::Release);
                trace!(file_id = key.file_id, page_index = key.page_index, "page deferred");
                continue;
            }

            let contiguous = pass.previous.is_some_and(|previous| previous.precedes(&key));
            if !contiguous {
                if pass.regions >= MAX_REGIONS_PER_FLUSH {
                    break;
                }
                pass.regions += 1;
            }
            if self.flush_page(key, &group, false)? {
                pass.flushed += 1;
                pass.previous = Some(key);
                *self.cursor.lock().unwrap() = Some(key);
            } else {
                pass.previous = None;
            }
        }
        Ok(())
    }

    /// Write the page at `key` if `group` still holds its dirty content.
    ///
    /// With `wait` unset, a page whose content lock is held by a writer is skipped. Returns true if
    /// the page was written.
    pub(super) fn flush_page(
        &self,
        key: PageKey,
        group: &Arc<PageGroup>,
        wait: bool,
    ) -> Result<bool, Error> {
        let _page = self.page_locks.exclusive(&key);
        let current = self
            .dirty
            .read()
            .unwrap()
            .get(&key)
            .is_some_and(|current| Arc::ptr_eq(current, group));
        if !current {
            return Ok(false);
        }

        let pointer = group.pointer();
        let content = if wait {
            Some(pointer.read(|page| page.to_vec()))
        } else {
            pointer.try_read(|page| page.to_vec())
        };
        let Some(content) = content else {
            trace!(file_id = key.file_id, page_index = key.page_index, "page busy");
            return Ok(false);
        };
        let lsn = page::lsn(&content);
        self.write_page(key, content)?;

        pointer.set_last_flushed_lsn(Some(lsn));
        let len = {
            let mut dirty = self.dirty.write().unwrap();
            dirty.remove(&key);
            dirty.len()
        };
        self.dirty_changed(len);
        if group.allocated {
            self.space.release(self.page_size as u64);
        }
        pointer.decrement_writers();
        Ok(true)
    }

    /// Seal and write a copy of a page, flushing the write-ahead log first if the page is ahead of
    /// it.
    fn write_page(&self, key: PageKey, mut content: Vec<u8>) -> Result<(), Error> {
        let entry = self.entry(key.file_id)?;
        let handle = entry.handle().ok_or(Error::FileClosed(key.file_id))?;

        if let Some(wal) = &self.wal {
            let lsn = page::lsn(&content);
            if wal.flushed_lsn().map_or(true, |flushed| flushed < lsn) {
                wal.flush()?;
            }
        }

        page::seal(&mut content);
        let page_size = self.page_size as u64;
        let offset = key
            .page_index
            .checked_mul(page_size)
            .ok_or(Error::OffsetOverflow)?;
        handle.write_at(&content, offset)?;
        entry.physical.fetch_max(offset + page_size, Ordering::AcqRel);
        if self.sync_on_flush {
            handle.sync()?;
        }
        self.metrics.flushed_pages.inc();
        Ok(())
    }

    /// Write every dirty page of a file and sync it.
    pub(super) fn flush_file(&self, file_id: u64) -> Result<(), Error> {
        let pages: Vec<_> = self
            .dirty
            .read()
            .unwrap()
            .range(PageKey::first(file_id)..=PageKey::last(file_id))
            .map(|(key, group)| (*key, group.clone()))
            .collect();
        for (key, group) in &pages {
            self.flush_page(*key, group, true)?;
        }
        if let Some(handle) = self.entry(file_id)?.handle() {
            handle.sync()?;
        }
        debug!(file_id, pages = pages.len(), "file flushed");
        Ok(())
    }

    /// Write every dirty page and sync every open file.
    pub(super) fn flush_all(&self) -> Result<(), Error> {
        let pages = self.dirty_ring(None);
        for (key, group) in &pages {
            self.flush_page(*key, group, true)?;
        }
        for (_, _, handle) in self.open_files() {
            handle.sync()?;
        }
        debug!(pages = pages.len(), "all files flushed");
        Ok(())
    }

    /// Drop the dirty pages of a file without writing them.
    pub(super) fn remove_file_pages(&self, file_id: u64) {
        let pages: Vec<_> = self
            .dirty
            .read()
            .unwrap()
            .range(PageKey::first(file_id)..=PageKey::last(file_id))
            .map(|(key, group)| (*key, group.clone()))
            .collect();
        for (key, group) in pages {
            let _page = self.page_locks.exclusive(&key);
            let len = {
                let mut dirty = self.dirty.write().unwrap();
                match dirty.get(&key) {
                    Some(current) if Arc::ptr_eq(current, &group) => {}
                    _ => continue,
                }
                dirty.remove(&key);
                dirty.len()
            };
            self.dirty_changed(len);
            if group.allocated {
                self.space.release(self.page_size as u64);
            }
            group.pointer().decrement_writers();
        }
        debug!(file_id, "file pages removed");
    }
}
