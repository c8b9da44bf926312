//! Persisted, memory-mapped record log in the style of a chronicle queue.
//!
//! A [`Store`] is a directory of pre-sized segment files. Any number of
//! [`Appender`]s write records into it concurrently; each record gets a
//! [`GlobalIndex`] and becomes visible only once it and every record
//! allocated before it have been committed (or aborted). Any number of
//! [`Tailer`]s, in this process or another one that maps the same files,
//! poll for new records and decode them field by field.
//!
//! ```no_run
//! use vanilla_chronicle::{Store, StoreConfig};
//!
//! # fn main() -> vanilla_chronicle::Result<()> {
//! let store = Store::open("/tmp/chronicle", StoreConfig::default())?;
//! let mut appender = store.create_appender()?;
//! appender.start_record(64)?;
//! appender.write_i32(7)?;
//! appender.write_str("hello")?;
//! appender.finish_record()?;
//!
//! let mut tailer = store.create_tailer();
//! while tailer.advance()? {
//!     let id = tailer.read_i32()?;
//!     let text = tailer.read_str()?;
//!     println!("{id} {text}");
//! }
//! # Ok(())
//! # }
//! ```

pub mod appender;
pub mod clock;
pub mod codec;
pub mod error;
pub mod header;
pub mod index;
pub mod mmap;
pub mod record;
pub mod reset;
pub mod retention;
pub mod segment;
pub mod store;
pub mod tailer;
pub mod writer_lock;

pub use appender::Appender;
pub use clock::{Clock, ManualClock, QuantaClock, SystemClock};
pub use codec::{ByteReader, ByteWriter};
pub use error::{Error, Result};
pub use index::{GlobalIndex, IndexEntry};
pub use record::SourceRecord;
pub use store::{RollCycle, Store, StoreConfig};
pub use tailer::Tailer;
