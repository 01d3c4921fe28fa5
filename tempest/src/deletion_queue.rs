/// Command buffer based deletion queue
///
/// Items are held until the command buffer they were last used on has
/// had its fence signaled past the point they were queued at.
use crate::cmdbuf::CmdBuffer;
use crate::{lock, Droppable};
use tp_utils::log;

use std::sync::{Arc, Mutex};

struct DeletionEntry {
    de_item: Arc<dyn Droppable + Send + Sync>,
    de_cmd: Arc<CmdBuffer>,
    /// The cmd's fence_signaled_counter when this was queued
    de_counter: u64,
}

/// A queue of references waiting on the GPU
///
/// The queue only holds a reference to each item. The item is destroyed
/// when its last reference goes away, which is usually the one dropped
/// here.
pub struct DeferredDeletionQueue {
    dq_entries: Mutex<Vec<DeletionEntry>>,
}

impl DeferredDeletionQueue {
    /// Creates an empty deletion queue
    pub fn new() -> Self {
        Self {
            dq_entries: Mutex::new(Vec::new()),
        }
    }

    /// Hold `item` until the work currently recorded in `cmd` completes
    pub fn enqueue(&self, item: Arc<dyn Droppable + Send + Sync>, cmd: &Arc<CmdBuffer>) {
        let counter = cmd.fence_signaled_counter();
        lock(&self.dq_entries).push(DeletionEntry {
            de_item: item,
            de_cmd: cmd.clone(),
            de_counter: counter,
        });
    }

    /// Drop every entry whose command buffer has moved past it
    ///
    /// Returns the number of entries released. The items are dropped
    /// after our lock is released, since dropping one may run arbitrary
    /// destructors.
    pub fn release_resources(&self) -> usize {
        let mut released = Vec::new();
        {
            let mut entries = lock(&self.dq_entries);
            // Walk backwards so swap_remove never skips an entry
            let mut i = entries.len();
            while i > 0 {
                i -= 1;
                if entries[i].de_cmd.has_advanced_past(entries[i].de_counter) {
                    released.push(entries.swap_remove(i));
                }
            }
        }

        let count = released.len();
        if count > 0 {
            let last_refs = released
                .iter()
                .filter(|e| Arc::strong_count(&e.de_item) == 1)
                .count();
            log::debug!(
                "Deletion queue released {} items ({} destroyed)",
                count,
                last_refs
            );
        }
        count
    }

    /// Drop everything regardless of fence state
    ///
    /// Only safe once all GPU work has been waited on.
    pub fn clear(&self) {
        let entries = std::mem::take(&mut *lock(&self.dq_entries));
        if !entries.is_empty() {
            log::debug!("Deletion queue force released {} items", entries.len());
        }
    }

    pub fn num_pending(&self) -> usize {
        lock(&self.dq_entries).len()
    }
}

impl Default for DeferredDeletionQueue {
    fn default() -> Self {
        Self::new()
    }
}
