//! Transaction Records
//!
//! A record is self-verifying: the payload checksum covers the page diff and
//! the chain checksum links it to every record before it.

use serde::{Deserialize, Serialize};

use super::Position;
use crate::boundary::PageDiff;
use crate::error::{Error, Result};

/// One committed transaction in a database's log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TxRecord {
    /// Database the transaction belongs to
    pub database: String,
    /// Position assigned by the primary
    pub position: Position,
    /// Pages written by the transaction
    pub diff: PageDiff,
    /// CRC32 of the page diff
    pub checksum: u32,
    /// Chain checksum of the preceding record (0 before position 1)
    pub prev_chain: u32,
    /// Commit time on the primary
    pub timestamp: chrono::DateTime<chrono::Utc>,
    /// Node that committed the transaction
    pub origin_node: String,
}

/// CRC32 over a page diff
pub fn payload_checksum(diff: &PageDiff) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&diff.page_size.to_le_bytes());
    hasher.update(&diff.commit.to_le_bytes());
    for page in &diff.pages {
        hasher.update(&page.pgno.to_le_bytes());
        hasher.update(&page.data);
    }
    hasher.finalize()
}

/// Chain checksum of the record at `position`
pub fn chain_checksum(prev_chain: u32, position: Position, checksum: u32) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&prev_chain.to_le_bytes());
    hasher.update(&position.to_le_bytes());
    hasher.update(&checksum.to_le_bytes());
    hasher.finalize()
}

impl TxRecord {
    /// Create a record at `position` following a predecessor with `prev_chain`
    pub fn new(
        database: String,
        position: Position,
        diff: PageDiff,
        prev_chain: u32,
        origin_node: String,
    ) -> Self {
        let checksum = payload_checksum(&diff);
        Self {
            database,
            position,
            diff,
            checksum,
            prev_chain,
            timestamp: chrono::Utc::now(),
            origin_node,
        }
    }

    /// Chain checksum of this record
    pub fn chain(&self) -> u32 {
        chain_checksum(self.prev_chain, self.position, self.checksum)
    }

    /// Verify the payload checksum
    pub fn verify(&self) -> Result<()> {
        let computed = payload_checksum(&self.diff);
        if computed != self.checksum {
            return Err(Error::ChecksumMismatch {
                database: self.database.clone(),
                position: self.position,
                reason: format!(
                    "payload checksum {:08x} does not match recorded {:08x}",
                    computed, self.checksum
                ),
            });
        }
        Ok(())
    }

    /// Verify this record directly follows `(position, chain)`
    pub fn verify_follows(&self, position: Position, chain: u32) -> Result<()> {
        if self.position != position + 1 {
            return Err(Error::Gap {
                database: self.database.clone(),
                expected: position + 1,
                received: self.position,
            });
        }

        if self.prev_chain != chain {
            return Err(Error::ChecksumMismatch {
                database: self.database.clone(),
                position: self.position,
                reason: format!(
                    "chain {:08x} does not extend local chain {:08x}",
                    self.prev_chain, chain
                ),
            });
        }

        self.verify()
    }
}
