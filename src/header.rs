use std::sync::atomic::{AtomicU32, Ordering};

use crate::{Error, Result};

pub const RECORD_HEADER_SIZE: usize = 16;
pub const RECORD_ALIGN: usize = 8;
pub const MAX_PAYLOAD_LEN: usize = u32::MAX as usize - 2;

pub const COMMIT_OFFSET: usize = 0;
pub const CHECKSUM_OFFSET: usize = 4;
pub const INDEX_OFFSET: usize = 8;

/// Commit word of a reservation that will never be committed.
pub const ABORTED: u32 = u32::MAX;

/// State encoded in a record's commit word.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommitState {
    Pending,
    Committed(usize),
    Aborted,
}

impl CommitState {
    pub fn from_word(word: u32) -> Self {
        match word {
            0 => CommitState::Pending,
            ABORTED => CommitState::Aborted,
            len => CommitState::Committed((len - 1) as usize),
        }
    }

    /// Committed or aborted; either way the slot will never change again.
    pub fn is_resolved(self) -> bool {
        !matches!(self, CommitState::Pending)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RecordHeader {
    /// Commit word:
    /// 0 = reserved, not yet committed
    /// u32::MAX = aborted
    /// otherwise payload length + 1
    pub commit_len: u32,
    pub checksum: u32,
    pub index: u64,
}

impl RecordHeader {
    pub fn to_bytes(&self) -> [u8; RECORD_HEADER_SIZE] {
        let mut buf = [0u8; RECORD_HEADER_SIZE];
        buf[COMMIT_OFFSET..COMMIT_OFFSET + 4].copy_from_slice(&self.commit_len.to_le_bytes());
        buf[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 4].copy_from_slice(&self.checksum.to_le_bytes());
        buf[INDEX_OFFSET..INDEX_OFFSET + 8].copy_from_slice(&self.index.to_le_bytes());
        buf
    }

    pub fn from_bytes(bytes: &[u8; RECORD_HEADER_SIZE]) -> Self {
        let word = |at: usize| u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]]);
        let mut index = [0u8; 8];
        index.copy_from_slice(&bytes[INDEX_OFFSET..INDEX_OFFSET + 8]);
        Self {
            commit_len: word(COMMIT_OFFSET),
            checksum: word(CHECKSUM_OFFSET),
            index: u64::from_le_bytes(index),
        }
    }

    pub fn state(&self) -> CommitState {
        CommitState::from_word(self.commit_len)
    }

    pub fn commit_len_for_payload(payload_len: usize) -> Result<u32> {
        if payload_len > MAX_PAYLOAD_LEN {
            return Err(Error::PayloadTooLarge);
        }
        Ok((payload_len as u32) + 1)
    }

    /// Publishes the commit word. Header fields and payload written before
    /// this call become visible to any thread that observes the word.
    ///
    /// # Safety
    ///
    /// `ptr` must point at a record header inside a live mapping, aligned to
    /// `RECORD_ALIGN`.
    pub unsafe fn store_commit(ptr: *mut u8, commit_len: u32) {
        let atomic = &*(ptr as *const AtomicU32);
        atomic.store(commit_len, Ordering::SeqCst);
    }

    pub fn crc32(payload: &[u8]) -> u32 {
        use crc32fast::Hasher;
        let mut hasher = Hasher::new();
        hasher.update(payload);
        hasher.finalize()
    }
}

pub(crate) fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

/// Bytes a record with `payload_len` bytes of payload occupies in a segment.
pub fn record_len(payload_len: usize) -> usize {
    align_up(RECORD_HEADER_SIZE + payload_len, RECORD_ALIGN)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc_matches_known_payload() {
        assert_eq!(RecordHeader::crc32(b"hello"), 0x3610A686);
    }

    #[test]
    fn header_round_trip_preserves_fields() {
        let header = RecordHeader {
            commit_len: 42,
            checksum: 0x0F0E_0D0C,
            index: 0x0000_0003_0000_0011,
        };
        let decoded = RecordHeader::from_bytes(&header.to_bytes());
        assert_eq!(decoded, header);
        assert_eq!(decoded.state(), CommitState::Committed(41));
    }

    #[test]
    fn commit_word_states() {
        assert_eq!(CommitState::from_word(0), CommitState::Pending);
        assert_eq!(CommitState::from_word(1), CommitState::Committed(0));
        assert_eq!(CommitState::from_word(ABORTED), CommitState::Aborted);
        assert!(!CommitState::Pending.is_resolved());
        assert!(CommitState::Aborted.is_resolved());
        assert_eq!(
            RecordHeader::commit_len_for_payload(MAX_PAYLOAD_LEN).unwrap(),
            ABORTED - 1
        );
        assert!(matches!(
            RecordHeader::commit_len_for_payload(MAX_PAYLOAD_LEN + 1),
            Err(Error::PayloadTooLarge)
        ));
    }

    #[test]
    fn record_len_is_aligned() {
        assert_eq!(record_len(0), 16);
        assert_eq!(record_len(1), 24);
        assert_eq!(record_len(8), 24);
        assert_eq!(record_len(35), 56);
    }
}
