//! Global index allocation, publication and lookup.
//!
//! A [`GlobalIndex`] packs the segment ordinal into the high 32 bits and the
//! sequence within that segment into the low 32 bits, so locating a record
//! never needs a side table: the segment id picks the file and the sequence
//! picks a slot in that file's slot table.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use crate::header::CommitState;
use crate::segment::{discover_segments, segment_path, Reservation, Segment, Slot};
use crate::{Error, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct GlobalIndex(u64);

impl GlobalIndex {
    pub const fn new(segment: u32, seq: u32) -> Self {
        Self(((segment as u64) << 32) | seq as u64)
    }

    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }

    pub const fn segment(self) -> u32 {
        (self.0 >> 32) as u32
    }

    pub const fn seq(self) -> u32 {
        self.0 as u32
    }
}

impl fmt::Display for GlobalIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.segment(), self.seq())
    }
}

impl From<GlobalIndex> for u64 {
    fn from(index: GlobalIndex) -> Self {
        index.raw()
    }
}

/// Where a committed record lives.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IndexEntry {
    pub segment_id: u32,
    pub offset: usize,
    pub len: usize,
}

/// The segment table of one store directory plus the allocate/publish
/// protocol over it.
///
/// Segments missing from the table are loaded from disk on demand, so a
/// read-only store follows segments created by the writer process.
pub struct Index {
    root: PathBuf,
    segments: RwLock<BTreeMap<u32, Arc<Segment>>>,
}

impl Index {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            segments: RwLock::new(BTreeMap::new()),
        }
    }

    pub(crate) fn insert(&self, segment: Arc<Segment>) {
        let mut segments = self.segments.write().unwrap_or_else(|e| e.into_inner());
        segments.insert(segment.id(), segment);
    }

    /// Drops every segment with an id below `id` from the table and returns
    /// them, oldest first.
    pub(crate) fn evict_before(&self, id: u32) -> Vec<Arc<Segment>> {
        let mut segments = self.segments.write().unwrap_or_else(|e| e.into_inner());
        let kept = segments.split_off(&id);
        let evicted = std::mem::replace(&mut *segments, kept);
        evicted.into_values().collect()
    }

    pub fn segment(&self, id: u32) -> Result<Option<Arc<Segment>>> {
        {
            let segments = self.segments.read().unwrap_or_else(|e| e.into_inner());
            if let Some(segment) = segments.get(&id) {
                return Ok(Some(Arc::clone(segment)));
            }
        }
        if !segment_path(&self.root, id).exists() {
            return Ok(None);
        }
        let segment = match Segment::open(&self.root, id) {
            Ok(segment) => Arc::new(segment),
            Err(Error::Io(err)) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err),
        };
        let mut segments = self.segments.write().unwrap_or_else(|e| e.into_inner());
        Ok(Some(Arc::clone(segments.entry(id).or_insert(segment))))
    }

    /// Brings the table in line with the segment files under the root: drops
    /// entries below the oldest file still on disk (evicted by the writer)
    /// and loads every file the table does not hold yet.
    pub fn refresh(&self) -> Result<()> {
        let ids = discover_segments(&self.root)?;
        if let Some(&oldest) = ids.first() {
            let dropped = self.evict_before(oldest);
            if !dropped.is_empty() {
                log::debug!(
                    "segments {:?} no longer on disk",
                    dropped.iter().map(|segment| segment.id()).collect::<Vec<_>>()
                );
            }
        }
        for id in ids {
            self.segment(id)?;
        }
        Ok(())
    }

    /// Lowest segment id that may still change: not sealed yet, or sealed
    /// with a reservation that has not resolved.
    pub fn first_incomplete_id(&self) -> Option<u32> {
        let segments = self.segments.read().unwrap_or_else(|e| e.into_inner());
        segments
            .values()
            .find(|segment| !segment.is_complete())
            .map(|segment| segment.id())
    }

    pub fn first_segment_id(&self) -> Option<u32> {
        let segments = self.segments.read().unwrap_or_else(|e| e.into_inner());
        segments.keys().next().copied()
    }

    pub fn last_segment_id(&self) -> Option<u32> {
        let segments = self.segments.read().unwrap_or_else(|e| e.into_inner());
        segments.keys().next_back().copied()
    }

    pub fn segment_ids(&self) -> Vec<u32> {
        let segments = self.segments.read().unwrap_or_else(|e| e.into_inner());
        segments.keys().copied().collect()
    }

    /// Claims the next index of `segment` together with room for
    /// `payload_capacity` bytes. Fails with `SegmentFull` and claims nothing
    /// when the segment cannot fit it.
    pub fn allocate(&self, segment: &Segment, payload_capacity: usize) -> Result<Reservation> {
        segment.reserve(payload_capacity)
    }

    /// Moves the frontier of `segment` over every leading resolved slot.
    ///
    /// Called after each commit or abort. Any caller may drain slots resolved
    /// by other appenders; a slot still pending stops the drain, and its own
    /// committer picks the work up again once it resolves.
    pub fn publish(&self, segment: &Segment) -> u32 {
        loop {
            let frontier = segment.frontier();
            if frontier >= segment.allocated() {
                return frontier;
            }
            match segment.commit_state(frontier) {
                Ok(state) if state.is_resolved() => {
                    segment.advance_frontier(frontier);
                }
                _ => return frontier,
            }
        }
    }

    /// Highest committed index that is visible, i.e. every earlier index is
    /// either visible too or was aborted.
    pub fn highest_published(&self) -> Result<Option<GlobalIndex>> {
        let Some(mut id) = self.first_segment_id() else {
            return Ok(None);
        };
        let mut visible = Vec::new();
        while let Some(segment) = self.segment(id)? {
            let complete = segment.is_complete();
            visible.push(segment);
            match id.checked_add(1) {
                Some(next) if complete => id = next,
                _ => break,
            }
        }
        for segment in visible.iter().rev() {
            let frontier = segment.frontier();
            for seq in (0..frontier).rev() {
                if let CommitState::Committed(_) = segment.commit_state(seq)? {
                    return Ok(Some(GlobalIndex::new(segment.id(), seq)));
                }
            }
        }
        Ok(None)
    }

    /// Segment id, offset and payload length of a visible committed record.
    pub fn lookup(&self, index: GlobalIndex) -> Result<IndexEntry> {
        let segment = match self.segment(index.segment())? {
            Some(segment) => segment,
            None => {
                return match self.first_segment_id() {
                    Some(first) if index.segment() < first => Err(Error::IndexEvicted(index.raw())),
                    _ => Err(Error::OutOfRange),
                }
            }
        };
        if index.seq() >= segment.allocated() {
            return Err(Error::OutOfRange);
        }
        if index.seq() >= segment.frontier() {
            return Err(Error::NotYetCommitted);
        }
        match segment.read(index.seq())? {
            Slot::Record(view) => Ok(IndexEntry {
                segment_id: segment.id(),
                offset: view.offset,
                len: view.payload.len(),
            }),
            Slot::Aborted => Err(Error::OutOfRange),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::SegmentGeometry;
    use std::sync::Barrier;
    use std::thread;
    use tempfile::tempdir;

    fn geometry() -> SegmentGeometry {
        SegmentGeometry::new(64 * 1024, 1024).unwrap()
    }

    #[test]
    fn global_index_packs_segment_and_seq() {
        let index = GlobalIndex::new(7, 42);
        assert_eq!(index.raw(), (7u64 << 32) | 42);
        assert_eq!(index.segment(), 7);
        assert_eq!(index.seq(), 42);
        assert!(GlobalIndex::new(1, 0) > GlobalIndex::new(0, u32::MAX));
        assert_eq!(index.to_string(), "7:42");
    }

    #[test]
    fn out_of_order_commit_holds_back_frontier() {
        let dir = tempdir().unwrap();
        let index = Index::new(dir.path());
        let segment = Arc::new(Segment::create(dir.path(), 0, 0, geometry(), 0).unwrap());
        index.insert(Arc::clone(&segment));

        let first = index.allocate(&segment, 8).unwrap();
        let second = index.allocate(&segment, 8).unwrap();
        segment.commit(&second, 0).unwrap();
        assert_eq!(index.publish(&segment), 0);
        assert_eq!(index.highest_published().unwrap(), None);
        assert!(matches!(
            index.lookup(second.index),
            Err(Error::NotYetCommitted)
        ));

        segment.commit(&first, 0).unwrap();
        assert_eq!(index.publish(&segment), 2);
        assert_eq!(index.highest_published().unwrap(), Some(second.index));
        let entry = index.lookup(second.index).unwrap();
        assert_eq!(entry.segment_id, 0);
        assert_eq!(entry.offset, second.offset);
        assert_eq!(entry.len, 0);
    }

    #[test]
    fn aborted_slots_release_the_frontier() {
        let dir = tempdir().unwrap();
        let index = Index::new(dir.path());
        let segment = Arc::new(Segment::create(dir.path(), 0, 0, geometry(), 0).unwrap());
        index.insert(Arc::clone(&segment));

        let first = index.allocate(&segment, 8).unwrap();
        let second = index.allocate(&segment, 8).unwrap();
        segment.commit(&first, 0).unwrap();
        segment.abort(&second).unwrap();
        assert_eq!(index.publish(&segment), 2);
        assert_eq!(index.highest_published().unwrap(), Some(first.index));
        assert!(matches!(index.lookup(second.index), Err(Error::OutOfRange)));
    }

    #[test]
    fn concurrent_allocations_are_distinct_and_dense() {
        let dir = tempdir().unwrap();
        let index = Arc::new(Index::new(dir.path()));
        let segment = Arc::new(Segment::create(dir.path(), 0, 0, geometry(), 0).unwrap());
        index.insert(Arc::clone(&segment));
        let barrier = Arc::new(Barrier::new(4));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let index = Arc::clone(&index);
                let segment = Arc::clone(&segment);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    let mut seqs = Vec::new();
                    for _ in 0..100 {
                        let reservation = index.allocate(&segment, 8).unwrap();
                        segment.commit(&reservation, 8).unwrap();
                        index.publish(&segment);
                        seqs.push(reservation.seq());
                    }
                    seqs
                })
            })
            .collect();

        let mut all: Vec<u32> = handles
            .into_iter()
            .flat_map(|handle| handle.join().unwrap())
            .collect();
        all.sort_unstable();
        assert_eq!(all, (0..400).collect::<Vec<_>>());
        assert_eq!(segment.frontier(), 400);
    }

    #[test]
    fn lookup_before_first_segment_is_evicted() {
        let dir = tempdir().unwrap();
        let index = Index::new(dir.path());
        for id in 0..3 {
            let segment = Segment::create(dir.path(), id, 0, geometry(), 0).unwrap();
            segment.seal();
            index.insert(Arc::new(segment));
        }
        let evicted = index.evict_before(2);
        assert_eq!(evicted.iter().map(|s| s.id()).collect::<Vec<_>>(), vec![0, 1]);
        for segment in evicted {
            std::fs::remove_file(segment.path()).unwrap();
        }
        assert!(matches!(
            index.lookup(GlobalIndex::new(1, 0)),
            Err(Error::IndexEvicted(_))
        ));
        assert!(matches!(
            index.lookup(GlobalIndex::new(9, 0)),
            Err(Error::OutOfRange)
        ));
    }

    #[test]
    fn segments_created_elsewhere_are_loaded_on_demand() {
        let dir = tempdir().unwrap();
        let writer = Segment::create(dir.path(), 4, 0, geometry(), 0).unwrap();
        let reservation = writer.reserve(3).unwrap();
        writer.commit(&reservation, 0).unwrap();

        let index = Index::new(dir.path());
        let loaded = index.segment(4).unwrap().expect("segment on disk");
        index.publish(&loaded);
        assert_eq!(
            index.highest_published().unwrap(),
            Some(GlobalIndex::new(4, 0))
        );
        assert!(index.segment(5).unwrap().is_none());
    }

    #[test]
    fn refresh_drops_segments_deleted_on_disk() {
        let dir = tempdir().unwrap();
        for id in 0..4 {
            let segment = Segment::create(dir.path(), id, 0, geometry(), 0).unwrap();
            if id < 3 {
                segment.seal();
            }
        }
        let index = Index::new(dir.path());
        index.refresh().unwrap();
        assert_eq!(index.segment_ids(), vec![0, 1, 2, 3]);
        assert_eq!(index.first_incomplete_id(), Some(3));

        std::fs::remove_file(segment_path(dir.path(), 0)).unwrap();
        std::fs::remove_file(segment_path(dir.path(), 1)).unwrap();
        Segment::create(dir.path(), 4, 0, geometry(), 0).unwrap();
        index.refresh().unwrap();
        assert_eq!(index.segment_ids(), vec![2, 3, 4]);
        assert_eq!(index.first_segment_id(), Some(2));
    }
}
