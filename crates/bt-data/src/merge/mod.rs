//! K-way merge of per-source entry streams

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

use bt_core::Timestamp;

use crate::sources::{Entry, EntryIter, SourceId, SourcedEntry};

struct Head {
    stamp: Timestamp,
    source: SourceId,
    slot: usize,
    entry: Entry,
}

impl Head {
    fn key(&self) -> (Timestamp, SourceId) {
        (self.stamp, self.source)
    }
}

impl PartialEq for Head {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for Head {}

impl PartialOrd for Head {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Head {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

/// Lazily merges already-sorted entry streams into one sorted stream.
///
/// Entries come out ordered by timestamp. Equal timestamps from different
/// sources come out in source registration order; within one source the
/// stream's own order is kept. Holds at most one pending entry per source.
pub struct MergeIterator {
    heap: BinaryHeap<Reverse<Head>>,
    streams: Vec<(SourceId, EntryIter)>,
}

impl MergeIterator {
    pub fn new(streams: Vec<(SourceId, EntryIter)>) -> Self {
        let mut merge = Self {
            heap: BinaryHeap::with_capacity(streams.len()),
            streams,
        };
        for slot in 0..merge.streams.len() {
            merge.advance(slot);
        }
        merge
    }

    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    fn advance(&mut self, slot: usize) {
        let (source, stream) = &mut self.streams[slot];
        if let Some(entry) = stream.next() {
            self.heap.push(Reverse(Head {
                stamp: entry.stamp,
                source: *source,
                slot,
                entry,
            }));
        }
    }
}

impl Iterator for MergeIterator {
    type Item = SourcedEntry;

    fn next(&mut self) -> Option<SourcedEntry> {
        let Reverse(head) = self.heap.pop()?;
        self.advance(head.slot);
        Some(SourcedEntry {
            source: head.source,
            entry: head.entry,
        })
    }
}
