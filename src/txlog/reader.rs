//! Log Reader
//!
//! Random access into a database's log by position. Readers run alongside
//! the writer task and retention, so the segment index is refreshed from the
//! directory before every lookup.

use std::collections::BTreeMap;
use std::path::PathBuf;

use super::record::TxRecord;
use super::segment::{list_segments, segment_first, Segment, SegmentInfo};
use super::{LogPaths, Position};
use crate::config::LogConfig;
use crate::error::{Error, Result};

/// Log reader for accessing records
pub struct LogReader {
    /// Database name, for error reporting
    database: String,
    /// Log paths
    paths: LogPaths,
    /// Log configuration
    config: LogConfig,
    /// Cached segment index: first position -> segment path
    segment_index: BTreeMap<Position, PathBuf>,
}

impl LogReader {
    /// Create a new log reader
    pub fn new(dir: PathBuf, database: String, config: LogConfig) -> Result<Self> {
        let mut reader = Self {
            database,
            paths: LogPaths::new(dir),
            config,
            segment_index: BTreeMap::new(),
        };

        reader.refresh_index()?;
        Ok(reader)
    }

    /// Refresh the segment index
    pub fn refresh_index(&mut self) -> Result<()> {
        self.segment_index.clear();

        for path in list_segments(&self.paths.base_dir)? {
            if let Some(first) = segment_first(&path) {
                self.segment_index.insert(first, path);
            }
        }

        Ok(())
    }

    /// Get the first position still present in the log
    pub fn first_position(&self) -> Option<Position> {
        self.segment_index.keys().next().copied()
    }

    /// Smallest position a reader may still request, given the log tip
    pub fn retained_min(&mut self, tip: Position) -> Result<Position> {
        self.refresh_index()?;
        Ok(self.first_position().unwrap_or(tip + 1))
    }

    fn open_segment(&self, path: &PathBuf, from: Position) -> Result<Segment> {
        match Segment::open(
            path.clone(),
            self.config.segment_size_mb,
            self.config.segment_max_records,
            self.config.compression,
        ) {
            Ok(segment) => Ok(segment),
            // Retention removed it after the index was built
            Err(Error::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::PositionExpired {
                    database: self.database.clone(),
                    position: from,
                    retained_min: from + 1,
                })
            }
            Err(e) => Err(e),
        }
    }

    /// Read up to `max_records` records in `from..=until`
    pub fn read_batch(
        &mut self,
        from: Position,
        until: Position,
        max_records: usize,
    ) -> Result<Vec<TxRecord>> {
        let mut records = Vec::new();
        if from > until || max_records == 0 {
            return Ok(records);
        }

        self.refresh_index()?;

        let retained_min = match self.first_position() {
            Some(first) => first,
            None => {
                return Err(Error::PositionExpired {
                    database: self.database.clone(),
                    position: from,
                    retained_min: until + 1,
                })
            }
        };
        if from < retained_min {
            return Err(Error::PositionExpired {
                database: self.database.clone(),
                position: from,
                retained_min,
            });
        }

        let start = self
            .segment_index
            .range(..=from)
            .next_back()
            .map(|(first, _)| *first)
            .unwrap_or(retained_min);

        let mut expected = from;
        let paths: Vec<PathBuf> = self
            .segment_index
            .range(start..)
            .map(|(_, path)| path.clone())
            .collect();

        'outer: for path in paths {
            let mut segment = self.open_segment(&path, from)?;

            for result in segment.iter() {
                let record = result?;
                if record.position < expected {
                    continue;
                }
                if record.position != expected {
                    return Err(Error::LogCorrupted {
                        position: expected,
                        reason: format!(
                            "found position {} in {:?} while reading {}",
                            record.position, path, self.database
                        ),
                    });
                }

                expected += 1;
                records.push(record);
                if expected > until || records.len() >= max_records {
                    break 'outer;
                }
            }
        }

        Ok(records)
    }

    /// Read the chain checksum of the record at `position`.
    ///
    /// Returns `None` if the position is no longer retained.
    pub fn chain_at(&mut self, position: Position) -> Result<Option<u32>> {
        self.refresh_index()?;

        if self.segment_index.is_empty() {
            return Ok(if position == 0 { Some(0) } else { None });
        }

        if let Some(path) = self.segment_index.get(&(position + 1)) {
            let info = Segment::read_info(path)?;
            return Ok(Some(info.base_chain));
        }

        let Some((_, path)) = self.segment_index.range(..=position).next_back() else {
            return Ok(None);
        };
        let mut segment = self.open_segment(&path.clone(), position)?;

        for result in segment.iter() {
            let record = result?;
            if record.position == position {
                return Ok(Some(record.chain()));
            }
            if record.position > position {
                break;
            }
        }

        Ok(None)
    }

    /// Get all segment info, oldest first
    pub fn segments(&mut self) -> Result<Vec<SegmentInfo>> {
        self.refresh_index()?;

        let mut infos = Vec::with_capacity(self.segment_index.len());
        for path in self.segment_index.values() {
            infos.push(Segment::read_info(path)?);
        }
        Ok(infos)
    }
}
