//! Interception Boundary
//!
//! The narrow contract between the filesystem layer that observes database
//! commits and the replication engine. The filesystem layer hands the engine
//! a [`PageDiff`] through a [`CommitSink`]; the engine tells the filesystem
//! layer which cached byte ranges became stale through an [`Invalidator`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::txlog::Position;

/// A single database page written by a transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page {
    /// 1-based page number
    pub pgno: u32,
    /// Page contents, exactly `page_size` bytes
    pub data: Vec<u8>,
}

/// The set of pages changed by one committed transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageDiff {
    /// Page size in bytes
    pub page_size: u32,
    /// Database size in pages after the commit
    pub commit: u32,
    /// Changed pages
    pub pages: Vec<Page>,
}

/// A contiguous byte range of the database file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ByteRange {
    pub offset: u64,
    pub len: u64,
}

impl ByteRange {
    pub fn new(offset: u64, len: u64) -> Self {
        Self { offset, len }
    }

    /// Exclusive end offset
    pub fn end(&self) -> u64 {
        self.offset + self.len
    }
}

impl PageDiff {
    /// Create a diff for a database of `commit` pages
    pub fn new(page_size: u32, commit: u32, pages: Vec<Page>) -> Self {
        Self {
            page_size,
            commit,
            pages,
        }
    }

    /// Size of the database file after this diff is applied
    pub fn file_size(&self) -> u64 {
        self.commit as u64 * self.page_size as u64
    }

    /// Byte offset of a page in the database file
    pub fn page_offset(&self, pgno: u32) -> u64 {
        (pgno.saturating_sub(1)) as u64 * self.page_size as u64
    }

    /// Byte ranges touched by this diff, sorted and with adjacent pages merged
    pub fn affected_ranges(&self) -> Vec<ByteRange> {
        let mut pgnos: Vec<u32> = self.pages.iter().map(|p| p.pgno).collect();
        pgnos.sort_unstable();
        pgnos.dedup();

        let page_size = self.page_size as u64;
        let mut ranges: Vec<ByteRange> = Vec::with_capacity(pgnos.len());
        for pgno in pgnos {
            let offset = self.page_offset(pgno);
            match ranges.last_mut() {
                Some(last) if last.end() == offset => last.len += page_size,
                _ => ranges.push(ByteRange::new(offset, page_size)),
            }
        }
        ranges
    }

    /// Byte ranges a reader of a `previous_len` byte file must drop once
    /// this diff is applied: the written pages plus any grown or truncated tail
    pub fn invalidated_ranges(&self, previous_len: u64) -> Vec<ByteRange> {
        let mut ranges = self.affected_ranges();

        let new_len = self.file_size();
        if new_len != previous_len {
            let start = new_len.min(previous_len);
            ranges.push(ByteRange::new(start, new_len.max(previous_len) - start));
            ranges.sort_by_key(|r| r.offset);
        }

        let mut merged: Vec<ByteRange> = Vec::with_capacity(ranges.len());
        for range in ranges {
            match merged.last_mut() {
                Some(last) if range.offset <= last.end() => {
                    let end = last.end().max(range.end());
                    last.len = end - last.offset;
                }
                _ => merged.push(range),
            }
        }
        merged
    }

    /// Check the diff is well formed before it reaches the log
    pub fn validate(&self) -> Result<()> {
        if self.page_size == 0 || !self.page_size.is_power_of_two() {
            return Err(crate::Error::Log(format!(
                "invalid page size {}",
                self.page_size
            )));
        }

        for page in &self.pages {
            if page.pgno == 0 || page.pgno > self.commit {
                return Err(crate::Error::Log(format!(
                    "page {} outside database of {} pages",
                    page.pgno, self.commit
                )));
            }
            if page.data.len() != self.page_size as usize {
                return Err(crate::Error::Log(format!(
                    "page {} has {} bytes, expected {}",
                    page.pgno,
                    page.data.len(),
                    self.page_size
                )));
            }
        }

        Ok(())
    }
}

/// Receives committed transactions from the interception layer
#[async_trait]
pub trait CommitSink: Send + Sync {
    /// Durably log and apply a committed transaction, returning its position
    async fn on_commit(&self, database: &str, diff: PageDiff) -> Result<Position>;
}

/// Drops cached pages after the engine rewrites part of a database file
pub trait Invalidator: Send + Sync {
    fn invalidate(&self, database: &str, ranges: &[ByteRange]);
}

/// Invalidator for deployments without a page cache
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopInvalidator;

impl Invalidator for NoopInvalidator {
    fn invalidate(&self, _database: &str, _ranges: &[ByteRange]) {}
}
