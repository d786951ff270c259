//! Registered root ranges.
//!
//! Three disjoint tables, all keyed by range start:
//!
//! - *normal*: precise ranges with a reference descriptor
//! - *pinned*: conservative ranges, no descriptor; every word is a
//!   pin candidate
//! - *wbarrier*: precise ranges whose stores go through the write barrier
//!
//! Re-registering an existing start replaces the entry in whichever table
//! holds it — thread-local blocks change size and descriptor over time.
//! All mutation happens under the GC lock.

use crate::object::Descriptor;
use indexmap::IndexMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RootKind {
    Normal = 0,
    Pinned = 1,
    WBarrier = 2,
}

pub const ROOT_KIND_COUNT: usize = 3;

/// One registered range: `[start, end)` plus its descriptor. Pinned-kind
/// records carry [`Descriptor::EMPTY`]; their scan ignores it.
#[derive(Clone, Copy)]
pub struct RootRecord {
    pub end: usize,
    pub descr: Descriptor,
}

pub struct RootTables {
    tables: [IndexMap<usize, RootRecord>; ROOT_KIND_COUNT],
    total_size: usize,
}

impl RootTables {
    pub fn new() -> Self {
        Self {
            tables: [IndexMap::new(), IndexMap::new(), IndexMap::new()],
            total_size: 0,
        }
    }

    /// Register `[start, start + size)`. If `start` is already registered
    /// under any kind, the existing entry is updated in place (size and
    /// descriptor changes are allowed) and keeps its original kind.
    pub fn register(&mut self, start: usize, size: usize, descr: Descriptor, kind: RootKind) {
        for table in self.tables.iter_mut() {
            if let Some(record) = table.get_mut(&start) {
                self.total_size -= record.end - start;
                self.total_size += size;
                record.end = start + size;
                record.descr = descr;
                return;
            }
        }
        self.tables[kind as usize].insert(
            start,
            RootRecord {
                end: start + size,
                descr,
            },
        );
        self.total_size += size;
        log::debug!(
            "registered root range {:#x}-{:#x} ({:?})",
            start,
            start + size,
            kind
        );
    }

    /// Remove the range starting at `start`, searching all kinds.
    pub fn deregister(&mut self, start: usize) {
        for table in self.tables.iter_mut() {
            if let Some(record) = table.shift_remove(&start) {
                self.total_size -= record.end - start;
                return;
            }
        }
    }

    /// Snapshot of one table, for scanning without holding the lock.
    pub fn snapshot(&self, kind: RootKind) -> Vec<(usize, RootRecord)> {
        self.tables[kind as usize]
            .iter()
            .map(|(&start, &record)| (start, record))
            .collect()
    }

    pub fn count(&self, kind: RootKind) -> usize {
        self.tables[kind as usize].len()
    }

    /// Total registered bytes across all kinds.
    pub fn total_size(&self) -> usize {
        self.total_size
    }
}

impl Default for RootTables {
    fn default() -> Self {
        Self::new()
    }
}
