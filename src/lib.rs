//! Append-only, log-structured record store for flash-like media divided
//! into fixed erase regions. Three layers: the record log itself
//! ([`record_log`]), a last-write-wins KV overlay on top of it ([`kv`]),
//! and a structured event log with a RAM mirror ([`eventlog`]).

pub mod common;
pub mod error;
pub mod eventlog;
pub mod flash;
pub mod kv;
pub mod record_log;
pub mod region;

pub use error::{Error, Result};
pub use eventlog::{Event, EventLog, EventType};
pub use flash::{FileFlash, Flash, RamFlash};
pub use kv::Kv;
pub use record_log::{ReadOutcome, RecordLog};
pub use region::Region;
