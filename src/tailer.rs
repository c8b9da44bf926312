use std::sync::Arc;

use crate::codec::ByteReader;
use crate::index::GlobalIndex;
use crate::segment::{Segment, Slot};
use crate::store::Store;
use crate::{Error, Result};

/// Read cursor for one consumer.
///
/// `advance` is a non-blocking poll: it either moves to the next published
/// record and returns `true`, or returns `false` and leaves everything as it
/// was. Waiting is up to the caller.
///
/// After a successful `advance` or `seek` the record's payload can be decoded
/// with the `read_*` methods in the order it was written, as many times as
/// needed (`rewind`).
pub struct Tailer {
    store: Store,
    segment: Option<Arc<Segment>>,
    next: GlobalIndex,
    current: Option<Current>,
}

struct Current {
    segment: Arc<Segment>,
    index: GlobalIndex,
    offset: usize,
    len: usize,
    position: usize,
}

impl Tailer {
    pub(crate) fn new(store: Store) -> Self {
        let mut tailer = Self {
            store,
            segment: None,
            next: GlobalIndex::default(),
            current: None,
        };
        tailer.to_start();
        tailer
    }

    /// Positions before the first retained record.
    pub fn to_start(&mut self) -> &mut Self {
        if let Err(err) = self.store.sync_segments() {
            log::warn!("tailer could not rescan segments: {}", err);
        }
        self.next = self.store.first_index().unwrap_or_default();
        self.segment = None;
        self.current = None;
        self
    }

    /// Positions after the last published record, so `advance` only returns
    /// records published from now on.
    pub fn to_end(&mut self) -> Result<&mut Self> {
        let next = match self.store.highest_published()? {
            Some(last) => next_in_segment(last)?,
            None => self.store.first_index().unwrap_or_default(),
        };
        self.next = next;
        self.segment = None;
        self.current = None;
        Ok(self)
    }

    /// Moves to the record at `index`.
    ///
    /// Returns `false`, without moving, if no published record exists at
    /// `index` (yet). Fails with `IndexEvicted` if `index` lies before the
    /// earliest retained segment, and with `Corrupt` (positioned on the
    /// record, as in `advance`) on a checksum mismatch.
    pub fn seek(&mut self, index: GlobalIndex) -> Result<bool> {
        let Some(segment) = self.segment_for(index)? else {
            return Ok(false);
        };
        if index.seq() >= segment.frontier() {
            return Ok(false);
        }
        match segment.read(index.seq())? {
            Slot::Aborted => Ok(false),
            Slot::Record(view) => {
                let (offset, len) = (view.offset, view.payload.len());
                let checked = view.validate_crc();
                self.current = Some(Current {
                    segment: Arc::clone(&segment),
                    index,
                    offset,
                    len,
                    position: 0,
                });
                self.segment = Some(segment);
                if let Err(err) = checked {
                    self.next = index;
                    return Err(err);
                }
                self.next = next_in_segment(index)?;
                Ok(true)
            }
        }
    }

    /// Moves to the next published record.
    ///
    /// Aborted indices are passed over silently. A record whose checksum does
    /// not match fails with `Corrupt` and stays at the cursor, still readable
    /// through `index`/`payload`; `skip` moves past it.
    pub fn advance(&mut self) -> Result<bool> {
        loop {
            let Some(segment) = self.segment_for(self.next)? else {
                return Ok(false);
            };
            let seq = self.next.seq();
            if seq < segment.frontier() {
                match segment.read(seq)? {
                    Slot::Aborted => {
                        self.next = next_in_segment(self.next)?;
                    }
                    Slot::Record(view) => {
                        let (offset, len) = (view.offset, view.payload.len());
                        let checked = view.validate_crc();
                        self.current = Some(Current {
                            segment: Arc::clone(&segment),
                            index: self.next,
                            offset,
                            len,
                            position: 0,
                        });
                        // A corrupt record stays current for inspection;
                        // `skip` moves past it.
                        checked?;
                        self.next = next_in_segment(self.next)?;
                        return Ok(true);
                    }
                }
            } else if segment.is_complete() && seq >= segment.allocated() {
                let following = segment
                    .id()
                    .checked_add(1)
                    .ok_or(Error::OutOfRange)?;
                self.next = GlobalIndex::new(following, 0);
                self.segment = None;
            } else {
                return Ok(false);
            }
        }
    }

    /// Steps over the record at the cursor without reading it.
    pub fn skip(&mut self) -> Result<()> {
        log::warn!("tailer skipping record {}", self.next);
        self.next = next_in_segment(self.next)?;
        self.current = None;
        Ok(())
    }

    fn segment_for(&mut self, index: GlobalIndex) -> Result<Option<Arc<Segment>>> {
        if let Some(segment) = &self.segment {
            if segment.id() == index.segment() {
                return Ok(Some(Arc::clone(segment)));
            }
        }
        match self.store.index().segment(index.segment())? {
            Some(segment) => {
                self.segment = Some(Arc::clone(&segment));
                Ok(Some(segment))
            }
            None => {
                self.store.sync_segments()?;
                match self.store.first_index() {
                    Some(first) if index < first => Err(Error::IndexEvicted(index.raw())),
                    _ => Ok(None),
                }
            }
        }
    }

    /// Index of the record exposed by the last successful `advance`/`seek`.
    pub fn index(&self) -> Option<GlobalIndex> {
        self.current.as_ref().map(|c| c.index)
    }

    /// Index the next `advance` will look at.
    pub fn next_index(&self) -> GlobalIndex {
        self.next
    }

    pub fn payload(&self) -> Option<&[u8]> {
        let current = self.current.as_ref()?;
        current.segment.payload(current.offset, current.len).ok()
    }

    pub fn position(&self) -> usize {
        self.current.as_ref().map_or(0, |c| c.position)
    }

    /// Payload length of the current record.
    pub fn limit(&self) -> usize {
        self.current.as_ref().map_or(0, |c| c.len)
    }

    pub fn remaining(&self) -> usize {
        self.limit() - self.position()
    }

    pub fn set_position(&mut self, position: usize) -> Result<()> {
        let current = self
            .current
            .as_mut()
            .ok_or(Error::InvalidState("no current record"))?;
        if position > current.len {
            return Err(Error::OutOfRange);
        }
        current.position = position;
        Ok(())
    }

    /// Restarts decoding of the current record from its first byte.
    pub fn rewind(&mut self) {
        if let Some(current) = self.current.as_mut() {
            current.position = 0;
        }
    }

    /// Runs `read` over the current record from the current position; the
    /// position moves only if `read` succeeds.
    pub fn decode<'a, T>(
        &'a mut self,
        read: impl FnOnce(&mut ByteReader<'a>) -> Result<T>,
    ) -> Result<T> {
        let Current {
            segment,
            offset,
            len,
            position,
            ..
        } = self
            .current
            .as_mut()
            .ok_or(Error::InvalidState("read before advance"))?;
        let payload = segment.payload(*offset, *len)?;
        let mut reader = ByteReader::with_position(payload, *position);
        let out = read(&mut reader)?;
        *position = reader.position();
        Ok(out)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        self.decode(|r| r.get_u8())
    }

    pub fn read_i8(&mut self) -> Result<i8> {
        self.decode(|r| r.get_i8())
    }

    pub fn read_bool(&mut self) -> Result<bool> {
        self.decode(|r| r.get_bool())
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        self.decode(|r| r.get_u16())
    }

    pub fn read_i16(&mut self) -> Result<i16> {
        self.decode(|r| r.get_i16())
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        self.decode(|r| r.get_u32())
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        self.decode(|r| r.get_i32())
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        self.decode(|r| r.get_u64())
    }

    pub fn read_i64(&mut self) -> Result<i64> {
        self.decode(|r| r.get_i64())
    }

    pub fn read_f64(&mut self) -> Result<f64> {
        self.decode(|r| r.get_f64())
    }

    pub fn read_varint(&mut self) -> Result<u64> {
        self.decode(|r| r.get_varint())
    }

    pub fn read_str(&mut self) -> Result<&str> {
        self.decode(|r| r.get_str())
    }

    pub fn read_bytes(&mut self) -> Result<&[u8]> {
        self.decode(|r| r.get_bytes())
    }

    pub fn read_raw(&mut self, len: usize) -> Result<&[u8]> {
        self.decode(|r| r.get_raw(len))
    }
}

impl std::fmt::Debug for Tailer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tailer")
            .field("next", &self.next)
            .field("index", &self.index())
            .field("position", &self.position())
            .finish()
    }
}

fn next_in_segment(index: GlobalIndex) -> Result<GlobalIndex> {
    let seq = index.seq().checked_add(1).ok_or(Error::OutOfRange)?;
    Ok(GlobalIndex::new(index.segment(), seq))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoreConfig;
    use tempfile::tempdir;

    fn config() -> StoreConfig {
        StoreConfig {
            segment_size_bytes: 64 * 1024,
            entries_per_segment: 16,
            ..StoreConfig::default()
        }
    }

    #[test]
    fn advance_at_frontier_is_idempotent() {
        let dir = tempdir().unwrap();
        let store = Store::open(dir.path(), config()).unwrap();
        let mut tailer = store.create_tailer();
        for _ in 0..3 {
            assert!(!tailer.advance().unwrap());
            assert_eq!(tailer.next_index(), GlobalIndex::new(0, 0));
            assert_eq!(tailer.index(), None);
        }

        let mut appender = store.create_appender().unwrap();
        let index = appender.append(b"one").unwrap();
        assert!(tailer.advance().unwrap());
        assert_eq!(tailer.index(), Some(index));
        for _ in 0..3 {
            assert!(!tailer.advance().unwrap());
            assert_eq!(tailer.index(), Some(index));
        }
        assert_eq!(tailer.payload(), Some(&b"one"[..]));
    }

    #[test]
    fn decode_errors_leave_position_alone() {
        let dir = tempdir().unwrap();
        let store = Store::open(dir.path(), config()).unwrap();
        let mut appender = store.create_appender().unwrap();
        appender.start_record(16).unwrap();
        appender.write_i32(-5).unwrap();
        appender.write_str("hi").unwrap();
        appender.finish_record().unwrap();

        let mut tailer = store.create_tailer();
        assert!(matches!(tailer.read_i32(), Err(Error::InvalidState(_))));
        assert!(tailer.advance().unwrap());
        assert_eq!(tailer.limit(), 7);
        assert_eq!(tailer.read_i32().unwrap(), -5);
        assert!(matches!(
            tailer.read_u64(),
            Err(Error::TruncatedInput { needed: 8, remaining: 3 })
        ));
        assert_eq!(tailer.position(), 4);
        assert_eq!(tailer.read_str().unwrap(), "hi");
        assert_eq!(tailer.remaining(), 0);

        tailer.rewind();
        assert_eq!(tailer.read_i32().unwrap(), -5);
        tailer.set_position(5).unwrap();
        assert_eq!(tailer.read_raw(2).unwrap(), b"hi");
        assert!(matches!(tailer.set_position(8), Err(Error::OutOfRange)));
    }

    #[test]
    fn seek_and_to_end() {
        let dir = tempdir().unwrap();
        let store = Store::open(dir.path(), config()).unwrap();
        let mut appender = store.create_appender().unwrap();
        let indices: Vec<_> = (0..20u32)
            .map(|i| appender.append(&i.to_le_bytes()).unwrap())
            .collect();

        let mut tailer = store.create_tailer();
        assert!(tailer.seek(indices[17]).unwrap());
        assert_eq!(tailer.read_u32().unwrap(), 17);
        assert!(tailer.advance().unwrap());
        assert_eq!(tailer.read_u32().unwrap(), 18);

        assert!(!tailer.seek(GlobalIndex::new(1, 10)).unwrap());
        assert!(!tailer.seek(GlobalIndex::new(5, 0)).unwrap());
        assert_eq!(tailer.index(), Some(indices[18]));

        tailer.to_end().unwrap();
        assert!(!tailer.advance().unwrap());
        let later = appender.append(&99u32.to_le_bytes()).unwrap();
        assert!(tailer.advance().unwrap());
        assert_eq!(tailer.index(), Some(later));
        assert_eq!(tailer.read_u32().unwrap(), 99);
    }

    #[test]
    fn aborted_records_are_passed_over() {
        let dir = tempdir().unwrap();
        let store = Store::open(dir.path(), config()).unwrap();
        let mut appender = store.create_appender().unwrap();
        appender.append(b"a").unwrap();
        let skipped = appender.start_record(1).unwrap();
        appender.abort_record().unwrap();
        appender.append(b"c").unwrap();

        let mut tailer = store.create_tailer();
        let mut seen = Vec::new();
        while tailer.advance().unwrap() {
            seen.push(tailer.payload().unwrap().to_vec());
        }
        assert_eq!(seen, vec![b"a".to_vec(), b"c".to_vec()]);
        assert!(!tailer.seek(skipped).unwrap());
    }

    #[test]
    fn independent_tailers_do_not_interfere() {
        let dir = tempdir().unwrap();
        let store = Store::open(dir.path(), config()).unwrap();
        let mut appender = store.create_appender().unwrap();
        for i in 0..5u8 {
            appender.append(&[i]).unwrap();
        }
        let mut fast = store.create_tailer();
        let mut slow = store.create_tailer();
        while fast.advance().unwrap() {}
        assert!(slow.advance().unwrap());
        assert_eq!(slow.read_u8().unwrap(), 0);
        assert_eq!(fast.index(), Some(GlobalIndex::new(0, 4)));
    }
}
