use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use crate::appender::Appender;
use crate::clock::{Clock, SystemClock};
use crate::index::{GlobalIndex, Index, IndexEntry};
use crate::retention::cleanup_segments;
use crate::segment::{discover_segments, parse_segment_id, Segment, SegmentGeometry};
use crate::tailer::Tailer;
use crate::writer_lock::{WriterLock, WRITER_LOCK_FILE};
use crate::{Error, Result};

const DEFAULT_SEGMENT_SIZE: usize = 64 * 1024 * 1024;
const DEFAULT_ENTRIES_PER_SEGMENT: u32 = 64 * 1024;
const MIN_TIME_CYCLE: Duration = Duration::from_secs(1);

/// When the store moves appends to a new segment, besides running out of
/// room in the current one.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum RollCycle {
    /// Only when the segment is full.
    #[default]
    Never,
    /// After this many entries (capped by `entries_per_segment`).
    Entries(u32),
    /// Whenever the wall clock enters a new bucket of this length.
    Time(Duration),
}

impl RollCycle {
    /// Bucket that `now_ns` falls into; always 0 unless rolling by time.
    pub fn cycle_at(&self, now_ns: u64) -> u64 {
        match self {
            RollCycle::Time(length) => now_ns / (length.as_nanos() as u64).max(1),
            RollCycle::Never | RollCycle::Entries(_) => 0,
        }
    }
}

impl fmt::Display for RollCycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RollCycle::Never => f.write_str("never"),
            RollCycle::Entries(n) => write!(f, "every {n} entries"),
            RollCycle::Time(length) => write!(f, "every {}s", length.as_secs()),
        }
    }
}

#[derive(Clone)]
pub struct StoreConfig {
    pub segment_size_bytes: usize,
    pub entries_per_segment: u32,
    pub roll_cycle: RollCycle,
    /// Keep at most this many segments; older ones are deleted at rotation.
    pub max_segments: Option<u64>,
    pub clock: Arc<dyn Clock>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            segment_size_bytes: DEFAULT_SEGMENT_SIZE,
            entries_per_segment: DEFAULT_ENTRIES_PER_SEGMENT,
            roll_cycle: RollCycle::Never,
            max_segments: None,
            clock: Arc::new(SystemClock),
        }
    }
}

impl fmt::Debug for StoreConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreConfig")
            .field("segment_size_bytes", &self.segment_size_bytes)
            .field("entries_per_segment", &self.entries_per_segment)
            .field("roll_cycle", &self.roll_cycle)
            .field("max_segments", &self.max_segments)
            .finish_non_exhaustive()
    }
}

impl fmt::Display for StoreConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "segment_size={} entries_per_segment={} roll={}",
            self.segment_size_bytes, self.entries_per_segment, self.roll_cycle
        )?;
        match self.max_segments {
            Some(max) => write!(f, " max_segments={max}"),
            None => f.write_str(" max_segments=unbounded"),
        }
    }
}

impl StoreConfig {
    pub fn geometry(&self) -> Result<SegmentGeometry> {
        let entries = match self.roll_cycle {
            RollCycle::Entries(0) => return Err(Error::Unsupported("roll cycle of zero entries")),
            RollCycle::Entries(n) => n.min(self.entries_per_segment),
            RollCycle::Time(length) if length < MIN_TIME_CYCLE => {
                return Err(Error::Unsupported("time roll cycle shorter than one second"))
            }
            RollCycle::Never | RollCycle::Time(_) => self.entries_per_segment,
        };
        if self.max_segments == Some(0) {
            return Err(Error::Unsupported("max_segments must be at least one"));
        }
        SegmentGeometry::new(self.segment_size_bytes, entries)
    }

    fn current_cycle(&self) -> u64 {
        self.roll_cycle.cycle_at(self.clock.now())
    }
}

/// Handle to an open queue directory. Cheap to clone; every clone, Appender
/// and Tailer shares the same state.
#[derive(Clone)]
pub struct Store {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    root: PathBuf,
    config: StoreConfig,
    geometry: SegmentGeometry,
    index: Index,
    current: RwLock<Option<Arc<Segment>>>,
    rotate_lock: Mutex<()>,
    read_only: bool,
    closed: AtomicBool,
    _lock: Option<WriterLock>,
}

impl Store {
    /// Opens (or creates) the store at `path` for writing.
    ///
    /// Any reservation left uncommitted by a previous writer is aborted and
    /// every segment but the newest is sealed.
    pub fn open(path: impl AsRef<Path>, config: StoreConfig) -> Result<Self> {
        let root = path.as_ref().to_path_buf();
        let geometry = config.geometry()?;
        std::fs::create_dir_all(&root)?;
        let lock = WriterLock::acquire(&root.join(WRITER_LOCK_FILE), config.clock.now())?;
        remove_temp_segments(&root)?;

        let index = Index::new(&root);
        let ids = discover_segments(&root)?;
        let last_id = ids.last().copied();
        for id in ids {
            let segment = Arc::new(Segment::open(&root, id)?);
            if !segment.is_complete() {
                let report = segment.recover()?;
                if report.aborted > 0 {
                    log::warn!(
                        "segment {}: aborted {} reservation(s) left open by a previous writer",
                        id,
                        report.aborted
                    );
                }
                if Some(id) != last_id {
                    segment.seal();
                }
            }
            index.insert(segment);
        }

        let current = match last_id {
            Some(id) => index.segment(id)?,
            None => None,
        };
        let current = match current {
            Some(segment) if !segment.is_sealed() => segment,
            Some(segment) => {
                let next = Segment::create(
                    &root,
                    segment.id() + 1,
                    config.current_cycle(),
                    geometry,
                    config.clock.now(),
                )?;
                let next = Arc::new(next);
                index.insert(Arc::clone(&next));
                next
            }
            None => {
                let first = Arc::new(Segment::create(
                    &root,
                    0,
                    config.current_cycle(),
                    geometry,
                    config.clock.now(),
                )?);
                index.insert(Arc::clone(&first));
                first
            }
        };

        let store = Self {
            inner: Arc::new(StoreInner {
                root,
                config,
                geometry,
                index,
                current: RwLock::new(Some(current)),
                rotate_lock: Mutex::new(()),
                read_only: false,
                closed: AtomicBool::new(false),
                _lock: Some(lock),
            }),
        };
        log::info!(
            "opened store {} ({} segments, last index {}) {}",
            store.inner.root.display(),
            store.inner.index.segment_ids().len(),
            display_index(store.last_index()?),
            store.inner.config
        );
        Ok(store)
    }

    /// Opens an existing store for reading only: no writer lock, no recovery,
    /// and `create_appender` fails with `ReadOnly`.
    pub fn open_read_only(path: impl AsRef<Path>) -> Result<Self> {
        let root = path.as_ref().to_path_buf();
        if !root.is_dir() {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "store directory does not exist",
            )));
        }
        let config = StoreConfig::default();
        let index = Index::new(&root);
        index.refresh()?;
        let store = Self {
            inner: Arc::new(StoreInner {
                geometry: config.geometry()?,
                root,
                config,
                index,
                current: RwLock::new(None),
                rotate_lock: Mutex::new(()),
                read_only: true,
                closed: AtomicBool::new(false),
                _lock: None,
            }),
        };
        log::info!(
            "opened store {} read-only ({} segments)",
            store.inner.root.display(),
            store.inner.index.segment_ids().len()
        );
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.inner.root
    }

    pub fn config(&self) -> &StoreConfig {
        &self.inner.config
    }

    pub fn is_read_only(&self) -> bool {
        self.inner.read_only
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    pub(crate) fn index(&self) -> &Index {
        &self.inner.index
    }

    pub fn segment_ids(&self) -> Vec<u32> {
        self.inner.index.segment_ids()
    }

    pub fn create_appender(&self) -> Result<Appender> {
        if self.inner.read_only {
            return Err(Error::ReadOnly);
        }
        self.ensure_open()?;
        Ok(Appender::new(self.clone(), self.current_segment()?))
    }

    /// A tailer positioned before the first retained record.
    pub fn create_tailer(&self) -> Tailer {
        Tailer::new(self.clone())
    }

    pub(crate) fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        Ok(())
    }

    pub(crate) fn current_segment(&self) -> Result<Arc<Segment>> {
        let current = self.inner.current.read().unwrap_or_else(|e| e.into_inner());
        current.as_ref().map(Arc::clone).ok_or(Error::ReadOnly)
    }

    /// Whether `segment` belongs to an elapsed time cycle.
    pub(crate) fn cycle_elapsed(&self, segment: &Segment) -> bool {
        matches!(self.inner.config.roll_cycle, RollCycle::Time(_))
            && segment.cycle() != self.inner.config.current_cycle()
    }

    /// Seals segment `expected` and makes its successor the append target.
    ///
    /// When another appender already rotated past `expected`, nothing is
    /// created and the current segment is returned.
    pub fn rotate(&self, expected: u32) -> Result<Arc<Segment>> {
        self.ensure_open()?;
        let _guard = self
            .inner
            .rotate_lock
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        let current = self.current_segment()?;
        if current.id() != expected {
            return Ok(current);
        }
        let next_id = current
            .id()
            .checked_add(1)
            .ok_or(Error::Unsupported("segment id space exhausted"))?;
        let config = &self.inner.config;
        let next = Arc::new(Segment::create(
            &self.inner.root,
            next_id,
            config.current_cycle(),
            self.inner.geometry,
            config.clock.now(),
        )?);
        self.inner.index.insert(Arc::clone(&next));
        let entries = current.seal();
        self.inner.index.publish(&current);
        {
            let mut slot = self.inner.current.write().unwrap_or_else(|e| e.into_inner());
            *slot = Some(Arc::clone(&next));
        }
        if let Err(err) = current.flush_async() {
            log::warn!("segment {}: flush after seal failed: {}", current.id(), err);
        }
        log::info!(
            "rolled segment {} ({} entries) -> {} (cycle {})",
            current.id(),
            entries,
            next.id(),
            next.cycle()
        );

        if let Some(max_segments) = config.max_segments {
            let evicted = cleanup_segments(&self.inner.root, &self.inner.index, next.id(), max_segments)?;
            if !evicted.is_empty() {
                log::info!("retention evicted segments {:?}", evicted);
            }
        }
        Ok(next)
    }

    /// Index of the first retained segment's first slot, if any segment
    /// exists.
    pub fn first_index(&self) -> Option<GlobalIndex> {
        self.inner
            .index
            .first_segment_id()
            .map(|id| GlobalIndex::new(id, 0))
    }

    /// Highest published index across every appender.
    pub fn highest_published(&self) -> Result<Option<GlobalIndex>> {
        self.sync_segments()?;
        self.inner.index.highest_published()
    }

    /// Rescans the directory of a read-only store so segments the writer
    /// created or evicted since the last look show up. The writer's own
    /// table is always current.
    pub(crate) fn sync_segments(&self) -> Result<()> {
        if self.inner.read_only {
            self.inner.index.refresh()?;
        }
        Ok(())
    }

    pub fn last_index(&self) -> Result<Option<GlobalIndex>> {
        self.highest_published()
    }

    /// Where the published record at `index` lives on disk.
    pub fn lookup(&self, index: GlobalIndex) -> Result<IndexEntry> {
        self.inner.index.lookup(index)
    }

    /// Stops accepting new records. Records already started may still be
    /// finished or aborted; mappings are released when the last handle drops.
    pub fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if let Some(current) = self.inner.current.read().unwrap_or_else(|e| e.into_inner()).as_ref() {
            current.flush_sync()?;
        }
        log::info!(
            "closed store {} (last index {})",
            self.inner.root.display(),
            display_index(self.last_index()?)
        );
        Ok(())
    }
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store")
            .field("root", &self.inner.root)
            .field("read_only", &self.inner.read_only)
            .field("closed", &self.is_closed())
            .finish()
    }
}

fn display_index(index: Option<GlobalIndex>) -> String {
    index.map_or_else(|| "none".to_string(), |index| index.to_string())
}

fn remove_temp_segments(root: &Path) -> Result<()> {
    for entry in std::fs::read_dir(root)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if name.strip_suffix(".tmp").and_then(parse_segment_id).is_some() {
            log::debug!("removing unpublished segment {}", name);
            std::fs::remove_file(entry.path())?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::segment::segment_temp_filename;
    use tempfile::tempdir;

    fn small_config() -> StoreConfig {
        StoreConfig {
            segment_size_bytes: 32 * 1024,
            entries_per_segment: 8,
            ..StoreConfig::default()
        }
    }

    #[test]
    fn config_validation() {
        let bad_entries = StoreConfig {
            roll_cycle: RollCycle::Entries(0),
            ..StoreConfig::default()
        };
        assert!(matches!(bad_entries.geometry(), Err(Error::Unsupported(_))));

        let bad_time = StoreConfig {
            roll_cycle: RollCycle::Time(Duration::from_millis(10)),
            ..StoreConfig::default()
        };
        assert!(matches!(bad_time.geometry(), Err(Error::Unsupported(_))));

        let bad_retention = StoreConfig {
            max_segments: Some(0),
            ..StoreConfig::default()
        };
        assert!(bad_retention.geometry().is_err());

        let capped = StoreConfig {
            roll_cycle: RollCycle::Entries(4),
            ..small_config()
        };
        assert_eq!(capped.geometry().unwrap().entries, 4);
    }

    #[test]
    fn config_display_lists_settings() {
        let config = StoreConfig {
            roll_cycle: RollCycle::Time(Duration::from_secs(3600)),
            max_segments: Some(24),
            ..small_config()
        };
        assert_eq!(
            config.to_string(),
            "segment_size=32768 entries_per_segment=8 roll=every 3600s max_segments=24"
        );
    }

    #[test]
    fn open_creates_first_segment_and_lock() {
        let dir = tempdir().unwrap();
        let store = Store::open(dir.path(), small_config()).unwrap();
        assert_eq!(store.segment_ids(), vec![0]);
        assert_eq!(store.first_index(), Some(GlobalIndex::new(0, 0)));
        assert_eq!(store.last_index().unwrap(), None);
        assert!(dir.path().join(WRITER_LOCK_FILE).exists());
        assert!(matches!(
            Store::open(dir.path(), small_config()),
            Err(Error::WriterAlreadyActive)
        ));
    }

    #[test]
    fn rotate_is_idempotent_per_segment() {
        let dir = tempdir().unwrap();
        let store = Store::open(dir.path(), small_config()).unwrap();
        let next = store.rotate(0).unwrap();
        assert_eq!(next.id(), 1);
        assert_eq!(store.rotate(0).unwrap().id(), 1);
        assert!(store.index().segment(0).unwrap().unwrap().is_sealed());
        assert_eq!(store.segment_ids(), vec![0, 1]);
    }

    #[test]
    fn reopen_continues_unsealed_segment_and_skips_sealed() {
        let dir = tempdir().unwrap();
        {
            let store = Store::open(dir.path(), small_config()).unwrap();
            store.rotate(0).unwrap();
        }
        let store = Store::open(dir.path(), small_config()).unwrap();
        assert_eq!(store.current_segment().unwrap().id(), 1);
        store.rotate(1).unwrap();
        drop(store);

        std::fs::write(dir.path().join(segment_temp_filename(9)), b"partial").unwrap();
        let store = Store::open(dir.path(), small_config()).unwrap();
        assert_eq!(store.current_segment().unwrap().id(), 2);
        assert!(!dir.path().join(segment_temp_filename(9)).exists());
    }

    #[test]
    fn time_cycle_is_detected() {
        let dir = tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(0));
        let config = StoreConfig {
            roll_cycle: RollCycle::Time(Duration::from_secs(60)),
            clock: clock.clone(),
            ..small_config()
        };
        let store = Store::open(dir.path(), config).unwrap();
        let segment = store.current_segment().unwrap();
        assert!(!store.cycle_elapsed(&segment));
        clock.advance(Duration::from_secs(61));
        assert!(store.cycle_elapsed(&segment));
        let next = store.rotate(segment.id()).unwrap();
        assert_eq!(next.cycle(), 1);
        assert!(!store.cycle_elapsed(&next));
    }

    #[test]
    fn read_only_store_refuses_appenders() {
        let dir = tempdir().unwrap();
        let _writer = Store::open(dir.path(), small_config()).unwrap();
        let reader = Store::open_read_only(dir.path()).unwrap();
        assert!(reader.is_read_only());
        assert!(matches!(reader.create_appender(), Err(Error::ReadOnly)));
        assert!(Store::open_read_only(dir.path().join("missing")).is_err());
    }

    #[test]
    fn closed_store_refuses_new_appenders() {
        let dir = tempdir().unwrap();
        let store = Store::open(dir.path(), small_config()).unwrap();
        store.close().unwrap();
        assert!(store.is_closed());
        assert!(matches!(store.create_appender(), Err(Error::Closed)));
        store.close().unwrap();
    }
}
