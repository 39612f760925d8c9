use std::collections::HashMap;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::fingerprint::Fingerprint;

/// One live allocation observed by the interceptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationRecord {
    pub address: usize,
    pub size: usize,
    pub fingerprint: Fingerprint,
    /// Milliseconds since the hooks were installed.
    pub timestamp: u64,
    /// Process-wide allocation order.
    #[serde(skip)]
    pub seq: u64,
    /// Set once the record has been written by a dump.
    #[serde(skip)]
    pub exported: bool,
}

const SHARDS: usize = 64;

/// Table of live allocations keyed by address.
///
/// The table is split in independently locked shards so that allocating threads only contend
/// when their blocks hash to the same shard. Readers copy one shard at a time.
pub struct SnapshotStore {
    shards: Box<[Mutex<HashMap<usize, AllocationRecord>>]>,
}

impl Default for SnapshotStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SnapshotStore {
    pub fn new() -> Self {
        Self {
            shards: (0..SHARDS).map(|_| Mutex::new(HashMap::new())).collect(),
        }
    }

    #[inline]
    fn shard(&self, address: usize) -> &Mutex<HashMap<usize, AllocationRecord>> {
        // blocks are at least 8 byte aligned, mix in the page bits as well.
        let index = ((address >> 4) ^ (address >> 12)) % SHARDS;
        &self.shards[index]
    }

    /// Insert a record, returning the record previously stored at the same address.
    pub fn insert(&self, record: AllocationRecord) -> Option<AllocationRecord> {
        self.shard(record.address)
            .lock()
            .insert(record.address, record)
    }

    pub fn remove(&self, address: usize) -> Option<AllocationRecord> {
        self.shard(address).lock().remove(&address)
    }

    pub fn contains(&self, address: usize) -> bool {
        self.shard(address).lock().contains_key(&address)
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|shard| shard.lock().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.iter().all(|shard| shard.lock().is_empty())
    }

    /// Copy of every live record, in allocation order.
    pub fn snapshot(&self) -> Vec<AllocationRecord> {
        self.collect(|_| true)
    }

    /// Copy of the live records no dump has written yet, in allocation order.
    pub fn unexported(&self) -> Vec<AllocationRecord> {
        self.collect(|record| !record.exported)
    }

    /// Flag `records` as written. A block freed (or freed and reused) since the copy was taken is
    /// left alone.
    pub fn mark_exported(&self, records: &[AllocationRecord]) {
        for record in records {
            if let Some(live) = self.shard(record.address).lock().get_mut(&record.address) {
                if live.seq == record.seq {
                    live.exported = true;
                }
            }
        }
    }

    fn collect<F>(&self, filter: F) -> Vec<AllocationRecord>
    where
        F: Fn(&AllocationRecord) -> bool,
    {
        let mut records = vec![];

        for shard in self.shards.iter() {
            records.extend(shard.lock().values().filter(|&record| filter(record)).cloned());
        }

        records.sort_unstable_by_key(|record| record.seq);

        records
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, thread};

    use super::*;

    fn record(address: usize, size: usize, seq: u64) -> AllocationRecord {
        AllocationRecord {
            address,
            size,
            fingerprint: Fingerprint::new(vec![0x1000, 0x2000]),
            timestamp: seq,
            seq,
            exported: false,
        }
    }

    #[test]
    fn insert_remove() {
        let store = SnapshotStore::new();

        assert!(store.is_empty());

        assert!(store.insert(record(0x1000, 64, 1)).is_none());
        assert!(store.insert(record(0x2000, 32, 2)).is_none());

        assert_eq!(store.len(), 2);
        assert!(store.contains(0x1000));

        assert_eq!(store.remove(0x1000).map(|r| r.size), Some(64));
        assert!(store.remove(0x1000).is_none());
        assert!(store.remove(0xdead).is_none());

        assert_eq!(store.len(), 1);
    }

    #[test]
    fn reinsert_replaces() {
        let store = SnapshotStore::new();

        store.insert(record(0x1000, 64, 1));

        let previous = store.insert(record(0x1000, 128, 2));

        assert_eq!(previous.map(|r| r.size), Some(64));
        assert_eq!(store.len(), 1);
        assert_eq!(store.snapshot()[0].size, 128);
    }

    #[test]
    fn snapshot_is_ordered_and_filtered() {
        let store = SnapshotStore::new();

        for seq in (1..=100u64).rev() {
            store.insert(record(0x10_0000 + seq as usize * 0x40, 16, seq));
        }

        let all = store.snapshot();

        assert_eq!(all.len(), 100);
        assert!(all.windows(2).all(|pair| pair[0].seq < pair[1].seq));

        let mut tail = store.snapshot();
        tail.drain(..90);

        store.mark_exported(&store.snapshot()[..90]);

        assert_eq!(store.unexported(), tail);
    }

    #[test]
    fn mark_skips_reused_addresses() {
        let store = SnapshotStore::new();

        store.insert(record(0x1000, 64, 1));
        store.insert(record(0x2000, 64, 2));

        let copied = store.unexported();

        // 0x1000 is freed and handed out again before the copy is marked.
        store.remove(0x1000);
        store.insert(record(0x1000, 32, 3));

        store.mark_exported(&copied);

        let left = store.unexported();

        assert_eq!(left.len(), 1);
        assert_eq!((left[0].address, left[0].seq), (0x1000, 3));
    }

    #[test]
    fn concurrent_mutation_while_exporting() {
        let store = Arc::new(SnapshotStore::new());

        let writers = (0..4usize)
            .map(|thread_id| {
                let store = store.clone();

                thread::spawn(move || {
                    for i in 0..2000usize {
                        let address = (thread_id << 32) | (i << 4);
                        store.insert(record(address, i + 1, (thread_id * 10_000 + i) as u64 + 1));

                        if i % 2 == 1 {
                            store.remove(address);
                        }
                    }
                })
            })
            .collect::<Vec<_>>();

        for _ in 0..50 {
            for record in store.snapshot() {
                // the size was written together with the address.
                assert_eq!((record.address >> 4) & 0xfff_ffff, record.size - 1);
            }
        }

        for writer in writers {
            writer.join().unwrap();
        }

        assert_eq!(store.len(), 4 * 1000);
    }
}
