//! Transaction Log Module
//!
//! Append-only, position-addressed log of committed transactions, one per
//! replicated database, stored as a sequence of segment files.

mod record;
mod segment;
mod writer;
mod reader;
pub mod retention;

pub use record::{chain_checksum, payload_checksum, TxRecord};
pub use segment::{Segment, SegmentInfo};
pub use writer::{LogTip, LogWriter};
pub use reader::LogReader;

use std::path::PathBuf;

/// Position of a record within a database's log; 0 means empty
pub type Position = u64;

/// Log directory structure
#[derive(Debug, Clone)]
pub struct LogPaths {
    pub base_dir: PathBuf,
}

impl LogPaths {
    pub fn new(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    /// Get path for the segment starting at `first`
    pub fn segment_path(&self, first: Position) -> PathBuf {
        self.base_dir.join(format!("seg_{:020}.log", first))
    }

    /// Ensure log directory exists
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.base_dir)
    }
}
