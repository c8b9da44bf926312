//! The record exchanged by the ping/pong producer-consumer pair.
//!
//! Field order and encodings are fixed:
//!
//! | field       | encoding                 |
//! |-------------|--------------------------|
//! | `source_id` | `i32`, little-endian     |
//! | `seq`       | stop-bit varint          |
//! | `value`     | `i64`, little-endian     |
//! | `label`     | length-prefixed text     |
//! | `detail`    | length-prefixed text     |

use crate::appender::Appender;
use crate::codec::{varint_len, ByteReader, ByteWriter};
use crate::index::GlobalIndex;
use crate::tailer::Tailer;
use crate::Result;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SourceRecord {
    pub source_id: i32,
    pub seq: u64,
    pub value: i64,
    pub label: String,
    pub detail: String,
}

impl SourceRecord {
    pub fn encoded_len(&self) -> usize {
        fn text_len(text: &str) -> usize {
            varint_len(text.len() as u64) + text.len()
        }
        4 + varint_len(self.seq) + 8 + text_len(&self.label) + text_len(&self.detail)
    }

    pub fn encode(&self, writer: &mut ByteWriter<'_>) -> Result<()> {
        writer.put_i32(self.source_id)?;
        writer.put_varint(self.seq)?;
        writer.put_i64(self.value)?;
        writer.put_str(&self.label)?;
        writer.put_str(&self.detail)
    }

    pub fn decode(reader: &mut ByteReader<'_>) -> Result<Self> {
        Ok(Self {
            source_id: reader.get_i32()?,
            seq: reader.get_varint()?,
            value: reader.get_i64()?,
            label: reader.get_str()?.to_owned(),
            detail: reader.get_str()?.to_owned(),
        })
    }

    /// Appends this record as one entry of its exact encoded size.
    pub fn append_to(&self, appender: &mut Appender) -> Result<GlobalIndex> {
        appender.start_record(self.encoded_len())?;
        let written = (|| {
            appender.write_i32(self.source_id)?;
            appender.write_varint(self.seq)?;
            appender.write_i64(self.value)?;
            appender.write_str(&self.label)?;
            appender.write_str(&self.detail)
        })();
        if let Err(err) = written {
            let _ = appender.abort_record();
            return Err(err);
        }
        appender.finish_record()
    }

    /// Decodes the tailer's current record from its current position.
    pub fn read_from(tailer: &mut Tailer) -> Result<Self> {
        tailer.decode(|reader| Self::decode(reader))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(seq: u64) -> SourceRecord {
        SourceRecord {
            source_id: 0,
            seq,
            value: 0x0bad_cafe_dead_beef,
            label: "FooBar".to_string(),
            detail: "AnotherFooBar".to_string(),
        }
    }

    #[test]
    fn encoded_layout_matches_field_order() {
        let record = sample(300);
        let mut buf = [0u8; 64];
        let mut writer = ByteWriter::new(&mut buf);
        record.encode(&mut writer).unwrap();
        let len = writer.position();
        assert_eq!(len, record.encoded_len());
        assert_eq!(len, 4 + 2 + 8 + 7 + 14);
        assert_eq!(&buf[..4], &0i32.to_le_bytes());
        assert_eq!(&buf[4..6], &[0xAC, 0x02]);
        assert_eq!(&buf[6..14], &0x0bad_cafe_dead_beef_i64.to_le_bytes());
        assert_eq!(buf[14], 6);
        assert_eq!(&buf[15..21], b"FooBar");

        let decoded = SourceRecord::decode(&mut ByteReader::new(&buf[..len])).unwrap();
        assert_eq!(decoded, record);
    }

    #[test]
    fn truncated_record_fails_to_decode() {
        let record = sample(1);
        let mut buf = vec![0u8; record.encoded_len()];
        record.encode(&mut ByteWriter::new(&mut buf)).unwrap();
        let mut reader = ByteReader::new(&buf[..buf.len() - 1]);
        assert!(matches!(
            SourceRecord::decode(&mut reader),
            Err(crate::Error::TruncatedInput { .. })
        ));
    }
}
