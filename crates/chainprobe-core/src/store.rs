//! Append-only event buffer shared by one writer and many readers.
//!
//! The lock is held only while pushing a record or copying `Arc` handles
//! into a snapshot. Matching always runs against a snapshot, so a slow
//! predicate never blocks the feed task.

use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::record::EventRecord;

/// Position in an `EventStore`, i.e. the number of records already seen.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Cursor(pub usize);

impl Cursor {
    pub const START: Cursor = Cursor(0);

    pub fn position(&self) -> usize {
        self.0
    }
}

#[derive(Default)]
struct StoreInner {
    records: Vec<Arc<EventRecord>>,
    sealed: bool,
}

/// Thread-safe, append-only store of the records seen by one subscription.
///
/// Cloning yields another handle to the same store.
#[derive(Clone, Default)]
pub struct EventStore {
    inner: Arc<RwLock<StoreInner>>,
}

impl EventStore {
    pub fn new() -> Self {
        Self::default()
    }

    // A panicking reader cannot leave a half-written Vec behind, so a
    // poisoned lock is still safe to use.
    fn read(&self) -> RwLockReadGuard<'_, StoreInner> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, StoreInner> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Append a record and stamp its sequence number.
    ///
    /// Returns `false` if the store was sealed and the record was dropped.
    pub fn append(&self, mut record: EventRecord) -> bool {
        let mut inner = self.write();
        if inner.sealed {
            tracing::debug!("store sealed, dropping late record");
            return false;
        }
        record.sequence = Some(inner.records.len() as u64);
        inner.records.push(Arc::new(record));
        true
    }

    /// Records appended since `cursor`, plus the cursor to resume from.
    pub fn snapshot_since(&self, cursor: Cursor) -> Snapshot {
        let inner = self.read();
        let start = cursor.0.min(inner.records.len());
        Snapshot {
            records: inner.records[start..].to_vec(),
            next: Cursor(inner.records.len()),
        }
    }

    /// Reject every later append.
    pub fn seal(&self) {
        self.write().sealed = true;
    }

    pub fn is_sealed(&self) -> bool {
        self.read().sealed
    }

    pub fn len(&self) -> usize {
        self.read().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for EventStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.read();
        f.debug_struct("EventStore")
            .field("len", &inner.records.len())
            .field("sealed", &inner.sealed)
            .finish()
    }
}

/// Read-only view of the records appended after a cursor.
#[derive(Debug, Clone)]
pub struct Snapshot {
    records: Vec<Arc<EventRecord>>,
    next: Cursor,
}

impl Snapshot {
    /// Cursor to pass to the next `snapshot_since` call.
    pub fn next_cursor(&self) -> Cursor {
        self.next
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Records in append order, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<EventRecord>> {
        self.records.iter()
    }
}

impl IntoIterator for Snapshot {
    type Item = Arc<EventRecord>;
    type IntoIter = std::vec::IntoIter<Arc<EventRecord>>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.into_iter()
    }
}
