use std::sync::Arc;

use crate::codec::ByteWriter;
use crate::index::GlobalIndex;
use crate::segment::{Reservation, Segment};
use crate::store::Store;
use crate::{Error, Result};

/// Write cursor for one producer.
///
/// `start_record(capacity)` claims the next index and `capacity` payload
/// bytes, `write_*` encodes fields straight into the mapped file, and
/// `finish_record` commits and publishes. Unused capacity is given back when
/// nothing was reserved after it.
///
/// One record is in flight at a time. Dropping an appender mid-record aborts
/// that record.
pub struct Appender {
    store: Store,
    segment: Arc<Segment>,
    in_flight: Option<InFlight>,
    last_published: Option<GlobalIndex>,
}

struct InFlight {
    reservation: Reservation,
    position: usize,
}

impl Appender {
    pub(crate) fn new(store: Store, segment: Arc<Segment>) -> Self {
        Self {
            store,
            segment,
            in_flight: None,
            last_published: None,
        }
    }

    /// Reserves room for a record of at most `capacity` payload bytes and
    /// returns the index it will be published under.
    pub fn start_record(&mut self, capacity: usize) -> Result<GlobalIndex> {
        if self.in_flight.is_some() {
            return Err(Error::InvalidState("record already in flight"));
        }
        self.store.ensure_open()?;
        if self.store.cycle_elapsed(&self.segment) {
            self.segment = self.store.rotate(self.segment.id())?;
        }
        let reservation = loop {
            match self.store.index().allocate(&self.segment, capacity) {
                Ok(reservation) => break reservation,
                Err(Error::SegmentFull) => {
                    self.segment = self.store.rotate(self.segment.id())?;
                }
                Err(err) => return Err(err),
            }
        };
        self.in_flight = Some(InFlight {
            reservation,
            position: 0,
        });
        Ok(reservation.index)
    }

    fn write_with<T>(&mut self, write: impl FnOnce(&mut ByteWriter<'_>) -> Result<T>) -> Result<T> {
        let in_flight = self
            .in_flight
            .as_mut()
            .ok_or(Error::InvalidState("write outside start_record/finish_record"))?;
        // SAFETY: this appender owns the reservation until it commits or
        // aborts it, and `&mut self` keeps the slice from escaping.
        let payload = unsafe { self.segment.payload_mut(&in_flight.reservation)? };
        let mut writer = ByteWriter::with_position(payload, in_flight.position);
        let out = write(&mut writer)?;
        in_flight.position = writer.position();
        Ok(out)
    }

    pub fn write_u8(&mut self, value: u8) -> Result<()> {
        self.write_with(|w| w.put_u8(value))
    }

    pub fn write_i8(&mut self, value: i8) -> Result<()> {
        self.write_with(|w| w.put_i8(value))
    }

    pub fn write_bool(&mut self, value: bool) -> Result<()> {
        self.write_with(|w| w.put_bool(value))
    }

    pub fn write_u16(&mut self, value: u16) -> Result<()> {
        self.write_with(|w| w.put_u16(value))
    }

    pub fn write_i16(&mut self, value: i16) -> Result<()> {
        self.write_with(|w| w.put_i16(value))
    }

    pub fn write_u32(&mut self, value: u32) -> Result<()> {
        self.write_with(|w| w.put_u32(value))
    }

    pub fn write_i32(&mut self, value: i32) -> Result<()> {
        self.write_with(|w| w.put_i32(value))
    }

    pub fn write_u64(&mut self, value: u64) -> Result<()> {
        self.write_with(|w| w.put_u64(value))
    }

    pub fn write_i64(&mut self, value: i64) -> Result<()> {
        self.write_with(|w| w.put_i64(value))
    }

    pub fn write_f64(&mut self, value: f64) -> Result<()> {
        self.write_with(|w| w.put_f64(value))
    }

    pub fn write_varint(&mut self, value: u64) -> Result<()> {
        self.write_with(|w| w.put_varint(value))
    }

    pub fn write_str(&mut self, text: &str) -> Result<()> {
        self.write_with(|w| w.put_str(text))
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        self.write_with(|w| w.put_bytes(bytes))
    }

    /// Bytes with no length prefix.
    pub fn write_raw(&mut self, bytes: &[u8]) -> Result<()> {
        self.write_with(|w| w.put_raw(bytes))
    }

    /// Commits the record in flight. It becomes visible to tailers once every
    /// earlier index has been committed or aborted.
    pub fn finish_record(&mut self) -> Result<GlobalIndex> {
        let in_flight = self
            .in_flight
            .take()
            .ok_or(Error::InvalidState("finish_record without start_record"))?;
        let reservation = in_flight.reservation;
        if let Err(err) = self.segment.commit(&reservation, in_flight.position) {
            self.resolve_aborted(&reservation);
            return Err(err);
        }
        self.store.index().publish(&self.segment);
        self.last_published = Some(reservation.index);
        Ok(reservation.index)
    }

    /// Drops the record in flight; its index is skipped by every tailer.
    pub fn abort_record(&mut self) -> Result<()> {
        let in_flight = self
            .in_flight
            .take()
            .ok_or(Error::InvalidState("abort_record without start_record"))?;
        self.segment.abort(&in_flight.reservation)?;
        self.store.index().publish(&self.segment);
        Ok(())
    }

    fn resolve_aborted(&self, reservation: &Reservation) {
        match self.segment.abort(reservation) {
            Ok(()) => {
                self.store.index().publish(&self.segment);
            }
            Err(err) => log::warn!("failed to abort record {}: {}", reservation.index, err),
        }
    }

    /// Writes `payload` as a single record.
    pub fn append(&mut self, payload: &[u8]) -> Result<GlobalIndex> {
        self.start_record(payload.len())?;
        if let Err(err) = self.write_raw(payload) {
            let _ = self.abort_record();
            return Err(err);
        }
        self.finish_record()
    }

    /// Index of the record in flight.
    pub fn index(&self) -> Option<GlobalIndex> {
        self.in_flight.as_ref().map(|f| f.reservation.index)
    }

    pub fn last_published_index(&self) -> Option<GlobalIndex> {
        self.last_published
    }

    pub fn is_writing(&self) -> bool {
        self.in_flight.is_some()
    }

    /// Payload bytes written into the record in flight.
    pub fn position(&self) -> usize {
        self.in_flight.as_ref().map_or(0, |f| f.position)
    }

    pub fn remaining(&self) -> usize {
        self.in_flight
            .as_ref()
            .map_or(0, |f| f.reservation.payload_capacity() - f.position)
    }
}

impl Drop for Appender {
    fn drop(&mut self) {
        if let Some(in_flight) = self.in_flight.take() {
            log::debug!(
                "appender dropped with record {} in flight; aborting it",
                in_flight.reservation.index
            );
            self.resolve_aborted(&in_flight.reservation);
        }
    }
}

impl std::fmt::Debug for Appender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Appender")
            .field("segment", &self.segment.id())
            .field("index", &self.index())
            .field("last_published", &self.last_published)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoreConfig;
    use tempfile::tempdir;

    fn config() -> StoreConfig {
        StoreConfig {
            segment_size_bytes: 64 * 1024,
            entries_per_segment: 32,
            ..StoreConfig::default()
        }
    }

    #[test]
    fn writes_outside_a_record_are_rejected() {
        let dir = tempdir().unwrap();
        let store = Store::open(dir.path(), config()).unwrap();
        let mut appender = store.create_appender().unwrap();
        assert!(matches!(appender.write_i32(1), Err(Error::InvalidState(_))));
        assert!(matches!(appender.finish_record(), Err(Error::InvalidState(_))));
        assert!(matches!(appender.abort_record(), Err(Error::InvalidState(_))));

        appender.start_record(8).unwrap();
        assert!(matches!(appender.start_record(8), Err(Error::InvalidState(_))));
        appender.finish_record().unwrap();
    }

    #[test]
    fn overflow_leaves_record_intact() {
        let dir = tempdir().unwrap();
        let store = Store::open(dir.path(), config()).unwrap();
        let mut appender = store.create_appender().unwrap();
        let index = appender.start_record(6).unwrap();
        appender.write_i32(7).unwrap();
        assert_eq!(appender.remaining(), 2);
        let err = appender.write_i32(8).unwrap_err();
        assert!(matches!(
            err,
            Error::ReservationOverflow {
                requested: 4,
                remaining: 2
            }
        ));
        appender.write_u16(9).unwrap();
        assert_eq!(appender.position(), 6);
        assert_eq!(appender.finish_record().unwrap(), index);
        assert_eq!(appender.last_published_index(), Some(index));
        assert_eq!(appender.position(), 0);
    }

    #[test]
    fn indices_increase_within_and_across_segments() {
        let dir = tempdir().unwrap();
        let store = Store::open(dir.path(), config()).unwrap();
        let mut appender = store.create_appender().unwrap();
        let mut last = None;
        for i in 0..100u64 {
            let index = appender.append(&i.to_le_bytes()).unwrap();
            assert!(Some(index) > last);
            last = Some(index);
        }
        assert_eq!(store.segment_ids().len(), 4);
        assert_eq!(last, Some(GlobalIndex::new(3, 3)));
        assert_eq!(store.last_index().unwrap(), last);
    }

    #[test]
    fn oversized_record_is_refused() {
        let dir = tempdir().unwrap();
        let store = Store::open(dir.path(), config()).unwrap();
        let mut appender = store.create_appender().unwrap();
        assert!(matches!(
            appender.start_record(64 * 1024),
            Err(Error::PayloadTooLarge)
        ));
        assert!(!appender.is_writing());
        assert_eq!(store.segment_ids(), vec![0]);
    }

    #[test]
    fn dropped_appender_aborts_its_record() {
        let dir = tempdir().unwrap();
        let store = Store::open(dir.path(), config()).unwrap();
        let mut first = store.create_appender().unwrap();
        first.start_record(8).unwrap();
        first.write_u64(1).unwrap();
        let mut second = store.create_appender().unwrap();
        let committed = second.append(b"after").unwrap();
        assert_eq!(store.last_index().unwrap(), None);
        drop(first);
        assert_eq!(store.last_index().unwrap(), Some(committed));
    }

    #[test]
    fn closed_store_stops_new_records_but_finishes_open_ones() {
        let dir = tempdir().unwrap();
        let store = Store::open(dir.path(), config()).unwrap();
        let mut appender = store.create_appender().unwrap();
        let index = appender.start_record(4).unwrap();
        appender.write_u32(4).unwrap();
        store.close().unwrap();
        assert_eq!(appender.finish_record().unwrap(), index);
        assert!(matches!(appender.start_record(4), Err(Error::Closed)));
    }
}
