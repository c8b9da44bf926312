//! Segment files.
//!
//! A segment is one rotation unit: a pre-sized, memory-mapped file holding a
//! bounded run of records. Layout:
//!
//! ```text
//! 0        64                        data_start                     size
//! | header | slot table (u64/entry) | record | record | ...  free   |
//! ```
//!
//! The header carries two shared words:
//!
//! - the *cursor*: `sealed:1 | seq:24 | offset:39`, advanced by a single
//!   compare-and-swap so a sequence number and its bytes are claimed together
//!   (and a sealed segment can never hand out another reservation);
//! - the *frontier*: count of leading sequence numbers that are resolved
//!   (committed or aborted). Only records below the frontier are readable.
//!
//! Slot `n` of the table holds the data offset of sequence `n` (0 while the
//! reservation is still being set up, `u64::MAX` if recovery aborted it
//! before it got an offset).

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::header::{
    align_up, record_len, CommitState, RecordHeader, ABORTED, CHECKSUM_OFFSET, INDEX_OFFSET,
    RECORD_HEADER_SIZE,
};
use crate::index::GlobalIndex;
use crate::mmap::MmapFile;
use crate::{Error, Result};

pub const SEG_HEADER_SIZE: usize = 64;
pub const SEG_MAGIC: u32 = 0x4352_4856; // 'CHRV'
pub const SEG_VERSION: u32 = 1;

const MAGIC_OFFSET: usize = 0;
const VERSION_OFFSET: usize = 4;
const SEGMENT_ID_OFFSET: usize = 8;
const ENTRIES_OFFSET: usize = 12;
const CYCLE_OFFSET: usize = 16;
const CURSOR_OFFSET: usize = 24;
const FRONTIER_OFFSET: usize = 32;
const CREATED_NS_OFFSET: usize = 40;

const SEALED_BIT: u64 = 1 << 63;
const SEQ_SHIFT: u32 = 39;
const SEQ_MASK: u64 = (1 << 24) - 1;
const OFFSET_MASK: u64 = (1 << SEQ_SHIFT) - 1;

const SLOT_EMPTY: u64 = 0;
const SLOT_ABORTED: u64 = u64::MAX;

/// Most entries a single segment can index.
pub const MAX_ENTRIES_PER_SEGMENT: u32 = SEQ_MASK as u32;
/// Largest segment file the cursor word can address.
pub const MAX_SEGMENT_SIZE: usize = 1 << SEQ_SHIFT;

const PAGE_SIZE: usize = 4096;

/// Decoded cursor word.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Cursor {
    pub sealed: bool,
    /// Sequence numbers handed out so far.
    pub allocated: u32,
    /// Next free byte offset in the file.
    pub write_offset: usize,
}

impl Cursor {
    fn pack(self) -> u64 {
        let sealed = if self.sealed { SEALED_BIT } else { 0 };
        sealed | ((self.allocated as u64 & SEQ_MASK) << SEQ_SHIFT) | (self.write_offset as u64 & OFFSET_MASK)
    }

    fn unpack(word: u64) -> Self {
        Self {
            sealed: word & SEALED_BIT != 0,
            allocated: ((word >> SEQ_SHIFT) & SEQ_MASK) as u32,
            write_offset: (word & OFFSET_MASK) as usize,
        }
    }
}

/// Size and entry capacity shared by every segment of a store.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SegmentGeometry {
    pub size: usize,
    pub entries: u32,
}

impl SegmentGeometry {
    pub fn new(size: usize, entries: u32) -> Result<Self> {
        if entries == 0 || entries > MAX_ENTRIES_PER_SEGMENT {
            return Err(Error::Unsupported("entries per segment out of range"));
        }
        if size > MAX_SEGMENT_SIZE {
            return Err(Error::Unsupported("segment size exceeds cursor range"));
        }
        let geometry = Self { size, entries };
        if geometry.data_start() + PAGE_SIZE.min(size) > size {
            return Err(Error::Unsupported("segment size too small for its slot table"));
        }
        Ok(geometry)
    }

    pub fn data_start(&self) -> usize {
        align_up(SEG_HEADER_SIZE + self.entries as usize * 8, 64)
    }

    pub fn data_capacity(&self) -> usize {
        self.size - self.data_start()
    }
}

/// Space claimed by one `reserve` call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Reservation {
    pub index: GlobalIndex,
    /// File offset of the record header.
    pub offset: usize,
    /// Bytes claimed, header included.
    pub len: usize,
}

impl Reservation {
    pub fn seq(&self) -> u32 {
        self.index.seq()
    }

    pub fn payload_offset(&self) -> usize {
        self.offset + RECORD_HEADER_SIZE
    }

    pub fn payload_capacity(&self) -> usize {
        self.len - RECORD_HEADER_SIZE
    }
}

/// A committed record, borrowed from the segment mapping.
#[derive(Clone, Copy, Debug)]
pub struct RecordView<'a> {
    pub index: GlobalIndex,
    pub offset: usize,
    pub checksum: u32,
    pub payload: &'a [u8],
}

impl RecordView<'_> {
    pub fn validate_crc(&self) -> Result<()> {
        if RecordHeader::crc32(self.payload) == self.checksum {
            Ok(())
        } else {
            Err(Error::Corrupt("crc mismatch"))
        }
    }
}

/// Outcome of reading a resolved slot.
#[derive(Clone, Copy, Debug)]
pub enum Slot<'a> {
    Record(RecordView<'a>),
    Aborted,
}

/// What [`Segment::recover`] found and repaired.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub allocated: u32,
    pub committed: u32,
    /// Reservations that never committed and were marked aborted.
    pub aborted: u32,
    pub highest_committed: Option<u32>,
}

pub struct Segment {
    id: u32,
    cycle: u64,
    created_ns: u64,
    geometry: SegmentGeometry,
    path: PathBuf,
    mmap: MmapFile,
}

impl std::fmt::Debug for Segment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Segment")
            .field("id", &self.id)
            .field("cycle", &self.cycle)
            .field("cursor", &self.cursor())
            .field("frontier", &self.frontier())
            .finish()
    }
}

impl Segment {
    /// Creates segment `id` under `root`, fully initialised before it becomes
    /// visible under its final name.
    pub fn create(
        root: &Path,
        id: u32,
        cycle: u64,
        geometry: SegmentGeometry,
        created_ns: u64,
    ) -> Result<Self> {
        let temp_path = segment_temp_path(root, id);
        let _ = std::fs::remove_file(&temp_path);
        let mmap = MmapFile::create(&temp_path, geometry.size)?;
        write_u32(&mmap, MAGIC_OFFSET, SEG_MAGIC)?;
        write_u32(&mmap, VERSION_OFFSET, SEG_VERSION)?;
        write_u32(&mmap, SEGMENT_ID_OFFSET, id)?;
        write_u32(&mmap, ENTRIES_OFFSET, geometry.entries)?;
        write_u64(&mmap, CYCLE_OFFSET, cycle)?;
        write_u64(&mmap, CREATED_NS_OFFSET, created_ns)?;
        let cursor = Cursor {
            sealed: false,
            allocated: 0,
            write_offset: geometry.data_start(),
        };
        mmap.atomic_u64(CURSOR_OFFSET)?.store(cursor.pack(), Ordering::Release);
        mmap.atomic_u64(FRONTIER_OFFSET)?.store(0, Ordering::Release);
        prefault(&mmap, geometry.data_start());

        let path = segment_path(root, id);
        if let Err(err) = publish_segment(&temp_path, &path) {
            let _ = std::fs::remove_file(&temp_path);
            return Err(err);
        }
        log::debug!("created segment {} (cycle {}) at {}", id, cycle, path.display());
        Ok(Self {
            id,
            cycle,
            created_ns,
            geometry,
            path,
            mmap,
        })
    }

    pub fn open(root: &Path, id: u32) -> Result<Self> {
        let path = segment_path(root, id);
        let mmap = MmapFile::open(&path)?;
        if mmap.len() < SEG_HEADER_SIZE {
            return Err(Error::Corrupt("segment too small for header"));
        }
        if read_u32(&mmap, MAGIC_OFFSET)? != SEG_MAGIC {
            return Err(Error::Corrupt("segment magic mismatch"));
        }
        let version = read_u32(&mmap, VERSION_OFFSET)?;
        if version != SEG_VERSION {
            return Err(Error::UnsupportedVersion(version));
        }
        if read_u32(&mmap, SEGMENT_ID_OFFSET)? != id {
            return Err(Error::Corrupt("segment id mismatch"));
        }
        let geometry = SegmentGeometry::new(mmap.len(), read_u32(&mmap, ENTRIES_OFFSET)?)
            .map_err(|_| Error::Corrupt("segment geometry invalid"))?;
        let cycle = read_u64(&mmap, CYCLE_OFFSET)?;
        let created_ns = read_u64(&mmap, CREATED_NS_OFFSET)?;
        Ok(Self {
            id,
            cycle,
            created_ns,
            geometry,
            path,
            mmap,
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn cycle(&self) -> u64 {
        self.cycle
    }

    pub fn created_ns(&self) -> u64 {
        self.created_ns
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn geometry(&self) -> SegmentGeometry {
        self.geometry
    }

    fn header_word(&self, offset: usize) -> &AtomicU64 {
        debug_assert!(offset + 8 <= SEG_HEADER_SIZE && offset % 8 == 0);
        // SAFETY: every mapped segment is at least SEG_HEADER_SIZE bytes
        // (checked in create/open) and the mapping is page aligned.
        unsafe { &*(self.mmap.as_ptr().add(offset) as *const AtomicU64) }
    }

    fn cursor_word(&self) -> &AtomicU64 {
        self.header_word(CURSOR_OFFSET)
    }

    fn frontier_word(&self) -> &AtomicU64 {
        self.header_word(FRONTIER_OFFSET)
    }

    fn slot_word(&self, seq: u32) -> Result<&AtomicU64> {
        if seq >= self.geometry.entries {
            return Err(Error::OutOfRange);
        }
        self.mmap.atomic_u64(SEG_HEADER_SIZE + seq as usize * 8)
    }

    pub fn cursor(&self) -> Cursor {
        Cursor::unpack(self.cursor_word().load(Ordering::Acquire))
    }

    pub fn allocated(&self) -> u32 {
        self.cursor().allocated
    }

    pub fn is_sealed(&self) -> bool {
        self.cursor().sealed
    }

    /// Number of leading sequence numbers that are committed or aborted.
    pub fn frontier(&self) -> u32 {
        self.frontier_word().load(Ordering::SeqCst) as u32
    }

    pub(crate) fn advance_frontier(&self, from: u32) -> bool {
        self.frontier_word()
            .compare_exchange(from as u64, from as u64 + 1, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Sealed and every allocated sequence resolved: nothing more will ever
    /// become readable here.
    pub fn is_complete(&self) -> bool {
        let cursor = self.cursor();
        cursor.sealed && self.frontier() >= cursor.allocated
    }

    /// Atomically claims the next sequence number and room for a record of
    /// `payload_capacity` bytes.
    pub fn reserve(&self, payload_capacity: usize) -> Result<Reservation> {
        let len = record_len(payload_capacity);
        if len > self.geometry.data_capacity() {
            return Err(Error::PayloadTooLarge);
        }
        let word = self.cursor_word();
        let mut current = word.load(Ordering::Acquire);
        loop {
            let cursor = Cursor::unpack(current);
            if cursor.sealed
                || cursor.allocated >= self.geometry.entries
                || cursor.write_offset + len > self.geometry.size
            {
                return Err(Error::SegmentFull);
            }
            let next = Cursor {
                sealed: false,
                allocated: cursor.allocated + 1,
                write_offset: cursor.write_offset + len,
            };
            match word.compare_exchange_weak(current, next.pack(), Ordering::SeqCst, Ordering::Acquire) {
                Ok(_) => {
                    let reservation = Reservation {
                        index: GlobalIndex::new(self.id, cursor.allocated),
                        offset: cursor.write_offset,
                        len,
                    };
                    self.slot_word(cursor.allocated)?
                        .store(reservation.offset as u64, Ordering::SeqCst);
                    return Ok(reservation);
                }
                Err(actual) => current = actual,
            }
        }
    }

    /// Payload bytes of a reservation.
    ///
    /// # Safety
    ///
    /// The caller must own `reservation` (one writer per reservation) and must
    /// not have committed or aborted it yet.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn payload_mut(&self, reservation: &Reservation) -> Result<&mut [u8]> {
        self.mmap
            .range_mut(reservation.payload_offset(), reservation.payload_capacity())
    }

    /// Finalises `payload_len` bytes of `reservation` and flips its commit
    /// word. The frontier is not advanced here; see [`crate::index::Index::publish`].
    pub fn commit(&self, reservation: &Reservation, payload_len: usize) -> Result<()> {
        if payload_len > reservation.payload_capacity() {
            return Err(Error::ReservationOverflow {
                requested: payload_len,
                remaining: reservation.payload_capacity(),
            });
        }
        let commit_len = RecordHeader::commit_len_for_payload(payload_len)?;
        let payload = self.mmap.range(reservation.payload_offset(), payload_len)?;
        let checksum = RecordHeader::crc32(payload);
        self.write_record_header(reservation, checksum)?;
        self.shrink(reservation, record_len(payload_len));
        // SAFETY: header lies inside the reservation, 8-byte aligned.
        unsafe {
            RecordHeader::store_commit(self.mmap.as_ptr().add(reservation.offset), commit_len);
        }
        Ok(())
    }

    /// Permanently excludes `reservation` from the readable stream.
    pub fn abort(&self, reservation: &Reservation) -> Result<()> {
        self.write_record_header(reservation, 0)?;
        // SAFETY: as in `commit`.
        unsafe {
            RecordHeader::store_commit(self.mmap.as_ptr().add(reservation.offset), ABORTED);
        }
        Ok(())
    }

    fn write_record_header(&self, reservation: &Reservation, checksum: u32) -> Result<()> {
        // SAFETY: bytes 4..16 of the header belong to this reservation only;
        // the commit word at 0..4 is written separately through an atomic.
        let bytes = unsafe { self.mmap.range_mut(reservation.offset + CHECKSUM_OFFSET, 12)? };
        bytes[..4].copy_from_slice(&checksum.to_le_bytes());
        bytes[INDEX_OFFSET - CHECKSUM_OFFSET..].copy_from_slice(&reservation.index.raw().to_le_bytes());
        Ok(())
    }

    /// Gives back unused reservation tail when nobody has reserved after it.
    fn shrink(&self, reservation: &Reservation, used: usize) {
        if used >= reservation.len {
            return;
        }
        let end = Cursor {
            sealed: false,
            allocated: reservation.seq() + 1,
            write_offset: reservation.offset + reservation.len,
        };
        let shrunk = Cursor {
            write_offset: reservation.offset + used,
            ..end
        };
        let _ = self.cursor_word().compare_exchange(
            end.pack(),
            shrunk.pack(),
            Ordering::SeqCst,
            Ordering::Relaxed,
        );
    }

    /// State of sequence `seq` as seen right now.
    pub fn commit_state(&self, seq: u32) -> Result<CommitState> {
        match self.slot_word(seq)?.load(Ordering::SeqCst) {
            SLOT_EMPTY => Ok(CommitState::Pending),
            SLOT_ABORTED => Ok(CommitState::Aborted),
            offset => {
                let word = self.mmap.atomic_u32(self.checked_record_offset(offset)?)?;
                Ok(CommitState::from_word(word.load(Ordering::SeqCst)))
            }
        }
    }

    fn checked_record_offset(&self, offset: u64) -> Result<usize> {
        let offset = offset as usize;
        if offset < self.geometry.data_start() || offset + RECORD_HEADER_SIZE > self.geometry.size {
            return Err(Error::Corrupt("slot offset outside data region"));
        }
        Ok(offset)
    }

    /// Reads sequence `seq`.
    ///
    /// Fails with `OutOfRange` past the allocation cursor and with
    /// `NotYetCommitted` while the reservation is still open.
    pub fn read(&self, seq: u32) -> Result<Slot<'_>> {
        if seq >= self.allocated() {
            return Err(Error::OutOfRange);
        }
        let offset = match self.slot_word(seq)?.load(Ordering::Acquire) {
            SLOT_EMPTY => return Err(Error::NotYetCommitted),
            SLOT_ABORTED => return Ok(Slot::Aborted),
            offset => self.checked_record_offset(offset)?,
        };
        let word = self.mmap.atomic_u32(offset)?.load(Ordering::Acquire);
        match CommitState::from_word(word) {
            CommitState::Pending => Err(Error::NotYetCommitted),
            CommitState::Aborted => Ok(Slot::Aborted),
            CommitState::Committed(len) => {
                let mut raw = [0u8; RECORD_HEADER_SIZE];
                raw.copy_from_slice(self.mmap.range(offset, RECORD_HEADER_SIZE)?);
                let header = RecordHeader::from_bytes(&raw);
                let payload = self
                    .mmap
                    .range(offset + RECORD_HEADER_SIZE, len)
                    .map_err(|_| Error::Corrupt("record length out of bounds"))?;
                Ok(Slot::Record(RecordView {
                    index: GlobalIndex::from_raw(header.index),
                    offset,
                    checksum: header.checksum,
                    payload,
                }))
            }
        }
    }

    /// Payload of the committed record whose header sits at `offset`.
    pub fn payload(&self, offset: usize, len: usize) -> Result<&[u8]> {
        self.mmap.range(offset + RECORD_HEADER_SIZE, len)
    }

    /// Closes the segment to further reservations; returns the final
    /// allocation count.
    pub fn seal(&self) -> u32 {
        let word = self.cursor_word();
        let previous = word.fetch_or(SEALED_BIT, Ordering::SeqCst);
        Cursor::unpack(previous).allocated
    }

    /// Resolves every reservation left open by a writer that went away:
    /// pending slots are marked aborted and the frontier is moved past them.
    ///
    /// Only safe while no appender is live on this segment.
    pub fn recover(&self) -> Result<RecoveryReport> {
        let allocated = self.allocated().min(self.geometry.entries);
        let mut report = RecoveryReport {
            allocated,
            ..RecoveryReport::default()
        };
        for seq in 0..allocated {
            let slot = self.slot_word(seq)?;
            match self.commit_state(seq) {
                Ok(CommitState::Committed(_)) => {
                    report.committed += 1;
                    report.highest_committed = Some(seq);
                }
                Ok(CommitState::Aborted) => {}
                Ok(CommitState::Pending) | Err(Error::Corrupt(_)) => {
                    slot.store(SLOT_ABORTED, Ordering::SeqCst);
                    report.aborted += 1;
                }
                Err(err) => return Err(err),
            }
        }
        self.frontier_word().fetch_max(allocated as u64, Ordering::SeqCst);
        Ok(report)
    }

    pub fn flush_async(&self) -> Result<()> {
        self.mmap.flush_async()
    }

    pub fn flush_sync(&self) -> Result<()> {
        self.mmap.flush_sync()
    }
}

fn read_u32(mmap: &MmapFile, offset: usize) -> Result<u32> {
    Ok(mmap.atomic_u32(offset)?.load(Ordering::Acquire))
}

fn read_u64(mmap: &MmapFile, offset: usize) -> Result<u64> {
    Ok(mmap.atomic_u64(offset)?.load(Ordering::Acquire))
}

fn write_u32(mmap: &MmapFile, offset: usize, value: u32) -> Result<()> {
    mmap.atomic_u32(offset)?.store(value, Ordering::Relaxed);
    Ok(())
}

fn write_u64(mmap: &MmapFile, offset: usize, value: u64) -> Result<()> {
    mmap.atomic_u64(offset)?.store(value, Ordering::Relaxed);
    Ok(())
}

/// Touches every page of the data region so the first append into it does
/// not take a page fault.
fn prefault(mmap: &MmapFile, from: usize) {
    let mut offset = align_up(from, PAGE_SIZE);
    while offset < mmap.len() {
        // SAFETY: the segment is not published yet; nobody else maps it.
        if let Ok(byte) = unsafe { mmap.range_mut(offset, 1) } {
            byte[0] = 0;
        }
        offset += PAGE_SIZE;
    }
}

pub fn segment_filename(id: u32) -> String {
    format!("{:09}.q", id)
}

pub fn segment_temp_filename(id: u32) -> String {
    format!("{:09}.q.tmp", id)
}

pub fn segment_path(root: &Path, id: u32) -> PathBuf {
    root.join(segment_filename(id))
}

pub fn segment_temp_path(root: &Path, id: u32) -> PathBuf {
    root.join(segment_temp_filename(id))
}

pub fn parse_segment_id(name: &str) -> Option<u32> {
    let stem = name.strip_suffix(".q")?;
    if stem.len() != 9 || !stem.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    stem.parse().ok()
}

/// Ids of the segment files under `root`, ascending.
pub fn discover_segments(root: &Path) -> Result<Vec<u32>> {
    let mut ids = Vec::new();
    let entries = match std::fs::read_dir(root) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(ids),
        Err(err) => return Err(err.into()),
    };
    for entry in entries {
        let entry = entry?;
        if let Some(id) = entry.file_name().to_str().and_then(parse_segment_id) {
            ids.push(id);
        }
    }
    ids.sort_unstable();
    Ok(ids)
}

/// Renames a fully initialised temp segment into place without replacing an
/// existing file.
pub fn publish_segment(temp: &Path, final_path: &Path) -> Result<()> {
    #[cfg(target_os = "linux")]
    {
        use std::ffi::CString;
        use std::os::unix::ffi::OsStrExt;
        let temp_c = CString::new(temp.as_os_str().as_bytes())
            .map_err(|_| Error::Unsupported("segment temp path contains null byte"))?;
        let final_c = CString::new(final_path.as_os_str().as_bytes())
            .map_err(|_| Error::Unsupported("segment path contains null byte"))?;
        let rc = unsafe {
            libc::renameat2(
                libc::AT_FDCWD,
                temp_c.as_ptr(),
                libc::AT_FDCWD,
                final_c.as_ptr(),
                libc::RENAME_NOREPLACE,
            )
        };
        if rc == 0 {
            return Ok(());
        }
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ENOSYS) && err.raw_os_error() != Some(libc::EINVAL) {
            return Err(Error::Io(err));
        }
    }

    if final_path.exists() {
        return Err(Error::Io(std::io::Error::new(
            std::io::ErrorKind::AlreadyExists,
            "segment already exists",
        )));
    }
    std::fs::rename(temp, final_path)?;
    Ok(())
}
