use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::Instant,
};

use crate::{
    config::HookConfig,
    fingerprint::Fingerprint,
    store::{AllocationRecord, SnapshotStore},
};

/// Unwinder, capture and recorder frames sitting above the hooked call site.
const SKIP_FRAMES: usize = 4;

/// Turns intercepted allocator calls into [`SnapshotStore`] updates.
pub struct Recorder {
    config: HookConfig,
    store: SnapshotStore,
    epoch: Instant,
    seq: AtomicU64,
}

impl Recorder {
    pub fn new(config: HookConfig) -> Self {
        Self {
            config,
            store: SnapshotStore::new(),
            epoch: Instant::now(),
            seq: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &HookConfig {
        &self.config
    }

    pub fn store(&self) -> &SnapshotStore {
        &self.store
    }

    /// Record a new block, returns false if the block was filtered out.
    pub fn on_alloc(&self, address: usize, size: usize) -> bool {
        if address == 0 || size < self.config.min_record_size() {
            return false;
        }

        let fingerprint = Fingerprint::capture(SKIP_FRAMES, self.config.max_frames());

        let record = AllocationRecord {
            address,
            size,
            fingerprint,
            timestamp: self.epoch.elapsed().as_millis() as u64,
            seq: self.seq.fetch_add(1, Ordering::Relaxed) + 1,
            exported: false,
        };

        self.store.insert(record);

        true
    }

    /// Forget a block. Unknown addresses were filtered at allocation time, or allocated before the
    /// hooks were installed, and are ignored.
    pub fn on_free(&self, address: usize) {
        self.detach(address);
    }

    /// Remove and return the record of `address`, ahead of a `realloc` of that block.
    pub fn detach(&self, address: usize) -> Option<AllocationRecord> {
        if address == 0 {
            return None;
        }

        self.store.remove(address)
    }

    /// `realloc(old, size)` returned `new`, `previous` is the record detached from `old`.
    pub fn on_realloc(&self, previous: Option<AllocationRecord>, new: usize, size: usize) {
        if new == 0 && size != 0 {
            // failed, the old block is untouched.
            if let Some(previous) = previous {
                self.store.insert(previous);
            }

            return;
        }

        self.on_alloc(new, size);
    }

    /// Sequence number of the newest record, 0 before the first one.
    pub fn last_seq(&self) -> u64 {
        self.seq.load(Ordering::Relaxed)
    }
}
