//! Log Segment Management
//!
//! Handles individual segment files. A segment holds a contiguous run of
//! records starting at the position encoded in its file name.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, TimeZone, Utc};

use super::record::TxRecord;
use super::Position;
use crate::error::{Error, Result};

/// Magic bytes at the start of each segment file
const SEGMENT_MAGIC: &[u8; 8] = b"WOLFLITE";

/// Segment file version
const SEGMENT_VERSION: u32 = 1;

/// Header size in bytes
pub(crate) const HEADER_SIZE: usize = 64;

/// Frame overhead: length, flags and trailing checksum
const FRAME_OVERHEAD: u64 = 4 + 1 + 4;

/// Frame flag: body is LZ4 compressed
const FLAG_COMPRESSED: u8 = 0x01;

/// Segment file header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentHeader {
    /// First position in this segment
    pub first: Position,
    /// Last position in this segment (first - 1 while empty)
    pub last: Position,
    /// Number of records in this segment
    pub count: u32,
    /// Whether this segment is sealed (no more writes)
    pub sealed: bool,
    /// Chain checksum of the record preceding `first`
    pub base_chain: u32,
    /// Commit timestamp of the last record, in milliseconds
    pub last_timestamp_ms: i64,
}

impl SegmentHeader {
    /// Create header for a new segment
    pub fn new(first: Position, base_chain: u32) -> Self {
        Self {
            first,
            last: first.saturating_sub(1),
            count: 0,
            sealed: false,
            base_chain,
            last_timestamp_ms: 0,
        }
    }

    /// Serialize header to bytes
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut bytes = [0u8; HEADER_SIZE];
        bytes[0..8].copy_from_slice(SEGMENT_MAGIC);
        bytes[8..12].copy_from_slice(&SEGMENT_VERSION.to_le_bytes());
        bytes[12..20].copy_from_slice(&self.first.to_le_bytes());
        bytes[20..28].copy_from_slice(&self.last.to_le_bytes());
        bytes[28..32].copy_from_slice(&self.count.to_le_bytes());
        bytes[32] = self.sealed as u8;
        bytes[36..40].copy_from_slice(&self.base_chain.to_le_bytes());
        bytes[40..48].copy_from_slice(&self.last_timestamp_ms.to_le_bytes());
        bytes
    }

    /// Parse header from bytes
    pub fn from_bytes(bytes: &[u8; HEADER_SIZE]) -> Result<Self> {
        if &bytes[0..8] != SEGMENT_MAGIC {
            return Err(Error::Log("Invalid segment magic bytes".into()));
        }

        let version = u32::from_le_bytes(le_array(&bytes[8..12]));
        if version != SEGMENT_VERSION {
            return Err(Error::Log(format!(
                "Unsupported segment version: {}",
                version
            )));
        }

        Ok(Self {
            first: u64::from_le_bytes(le_array(&bytes[12..20])),
            last: u64::from_le_bytes(le_array(&bytes[20..28])),
            count: u32::from_le_bytes(le_array(&bytes[28..32])),
            sealed: bytes[32] != 0,
            base_chain: u32::from_le_bytes(le_array(&bytes[36..40])),
            last_timestamp_ms: i64::from_le_bytes(le_array(&bytes[40..48])),
        })
    }
}

fn le_array<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&bytes[..N]);
    out
}

/// Summary of a segment, as needed by readers and retention
#[derive(Debug, Clone)]
pub struct SegmentInfo {
    pub path: PathBuf,
    pub first: Position,
    pub last: Position,
    pub count: u32,
    pub sealed: bool,
    pub base_chain: u32,
    pub last_timestamp: DateTime<Utc>,
}

/// A single log segment file
pub struct Segment {
    /// File path
    pub path: PathBuf,
    /// File handle
    file: File,
    /// Current write position
    write_pos: u64,
    /// Segment header
    header: SegmentHeader,
    /// Chain checksum of the last record (base chain while empty)
    last_chain: u32,
    /// Maximum segment size in bytes
    max_size: u64,
    /// Maximum number of records
    max_records: u32,
    /// Whether compression is enabled for new frames
    compression: bool,
}

impl Segment {
    /// Create a new segment file
    pub fn create(
        path: PathBuf,
        first: Position,
        base_chain: u32,
        max_size_mb: u64,
        max_records: u32,
        compression: bool,
    ) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;

        let mut segment = Self {
            path,
            file,
            write_pos: HEADER_SIZE as u64,
            header: SegmentHeader::new(first, base_chain),
            last_chain: base_chain,
            max_size: max_size_mb * 1024 * 1024,
            max_records,
            compression,
        };

        segment.write_header()?;

        Ok(segment)
    }

    /// Open an existing segment file
    pub fn open(path: PathBuf, max_size_mb: u64, max_records: u32, compression: bool) -> Result<Self> {
        let mut file = OpenOptions::new().read(true).write(true).open(&path)?;

        let mut header_bytes = [0u8; HEADER_SIZE];
        file.read_exact(&mut header_bytes)?;
        let header = SegmentHeader::from_bytes(&header_bytes)?;

        let write_pos = file.seek(SeekFrom::End(0))?;

        Ok(Self {
            path,
            file,
            write_pos,
            last_chain: header.base_chain,
            header,
            max_size: max_size_mb * 1024 * 1024,
            max_records,
            compression,
        })
    }

    /// Read only the header of a segment file
    pub fn read_info(path: &Path) -> Result<SegmentInfo> {
        let mut file = File::open(path)?;
        let mut header_bytes = [0u8; HEADER_SIZE];
        file.read_exact(&mut header_bytes)?;
        let header = SegmentHeader::from_bytes(&header_bytes)?;
        Ok(info_from_header(path.to_path_buf(), &header))
    }

    /// Scan every frame, truncating a torn or corrupt tail.
    ///
    /// Returns the number of bytes discarded. The in-memory header is rebuilt
    /// from the frames that survive.
    pub fn recover(&mut self) -> Result<u64> {
        let file_len = self.file.seek(SeekFrom::End(0))?;

        let mut pos = HEADER_SIZE as u64;
        let mut expected = self.header.first;
        let mut chain = self.header.base_chain;
        let mut count = 0u32;
        let mut last_timestamp_ms = 0i64;

        while pos < file_len {
            match self.read_at(pos) {
                Ok((record, next))
                    if record.verify_follows(expected - 1, chain).is_ok() =>
                {
                    chain = record.chain();
                    last_timestamp_ms = record.timestamp.timestamp_millis();
                    expected += 1;
                    count += 1;
                    pos = next;
                }
                Ok((record, _)) => {
                    tracing::warn!(
                        "Segment {:?}: record at offset {} breaks the sequence (position {}, expected {})",
                        self.path,
                        pos,
                        record.position,
                        expected
                    );
                    break;
                }
                Err(e) => {
                    tracing::debug!("Segment {:?}: stopping scan at offset {}: {}", self.path, pos, e);
                    break;
                }
            }
        }

        let discarded = file_len - pos;
        if discarded > 0 {
            if self.header.sealed {
                return Err(Error::LogCorrupted {
                    position: expected,
                    reason: format!("sealed segment {:?} has {} unreadable bytes", self.path, discarded),
                });
            }
            tracing::warn!(
                "Truncating torn tail of {:?}: {} bytes after position {}",
                self.path,
                discarded,
                expected - 1
            );
            self.file.set_len(pos)?;
            self.file.sync_all()?;
        }

        self.write_pos = pos;
        self.header.count = count;
        self.header.last = expected - 1;
        self.header.last_timestamp_ms = last_timestamp_ms;
        self.last_chain = chain;

        Ok(discarded)
    }

    /// Write a record to the segment, returning its frame offset
    pub fn append(&mut self, record: &TxRecord) -> Result<u64> {
        let serialized = bincode::serialize(record)?;

        let (flags, data) = if self.compression {
            (FLAG_COMPRESSED, lz4_flex::compress_prepend_size(&serialized))
        } else {
            (0, serialized)
        };

        // Frame format: [length: u32][flags: u8][data: bytes][checksum: u32]
        let frame_len = data.len() as u32;
        let checksum = crc32fast::hash(&data);

        let mut frame = Vec::with_capacity(data.len() + FRAME_OVERHEAD as usize);
        frame.extend_from_slice(&frame_len.to_le_bytes());
        frame.push(flags);
        frame.extend_from_slice(&data);
        frame.extend_from_slice(&checksum.to_le_bytes());

        #[cfg(test)]
        if fault::take(&self.path) {
            frame[5] ^= 0xff;
        }

        self.file.seek(SeekFrom::Start(self.write_pos))?;
        self.file.write_all(&frame)?;

        let frame_pos = self.write_pos;
        self.write_pos += frame.len() as u64;
        self.header.count += 1;
        self.header.last = record.position;
        self.header.last_timestamp_ms = record.timestamp.timestamp_millis();
        self.last_chain = record.chain();

        Ok(frame_pos)
    }

    /// Read the record at a frame offset, returning it and the next offset
    pub fn read_at(&mut self, pos: u64) -> Result<(TxRecord, u64)> {
        self.file.seek(SeekFrom::Start(pos))?;

        let mut prefix = [0u8; 5];
        self.file.read_exact(&mut prefix)?;
        let frame_len = u32::from_le_bytes(le_array(&prefix[0..4])) as u64;
        let flags = prefix[4];

        // A torn length prefix can claim anything; never allocate past the file
        if self.file.metadata()?.len() < pos + FRAME_OVERHEAD + frame_len {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "frame extends past end of segment",
            )));
        }

        let mut data = vec![0u8; frame_len as usize];
        self.file.read_exact(&mut data)?;

        let mut checksum_bytes = [0u8; 4];
        self.file.read_exact(&mut checksum_bytes)?;
        let stored_checksum = u32::from_le_bytes(checksum_bytes);
        let computed_checksum = crc32fast::hash(&data);

        if stored_checksum != computed_checksum {
            return Err(Error::Log(format!(
                "frame checksum mismatch at offset {} of {:?}",
                pos, self.path
            )));
        }

        let serialized = if flags & FLAG_COMPRESSED != 0 {
            lz4_flex::decompress_size_prepended(&data)
                .map_err(|e| Error::Log(format!("Decompression failed: {}", e)))?
        } else {
            data
        };

        let record: TxRecord = bincode::deserialize(&serialized)?;
        Ok((record, pos + FRAME_OVERHEAD + frame_len))
    }

    /// Discard everything from `offset` on, restoring an earlier header
    pub fn rollback(&mut self, offset: u64, header: SegmentHeader, last_chain: u32) -> Result<()> {
        self.file.set_len(offset)?;
        self.write_pos = offset;
        self.header = header;
        self.last_chain = last_chain;
        Ok(())
    }

    /// Iterate over all records in the segment
    pub fn iter(&mut self) -> SegmentIterator<'_> {
        SegmentIterator {
            segment: self,
            pos: HEADER_SIZE as u64,
        }
    }

    /// Sync segment to disk
    pub fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }

    /// Seal the segment (no more writes)
    pub fn seal(&mut self) -> Result<()> {
        self.header.sealed = true;
        self.write_header()?;
        self.sync()
    }

    /// Persist the in-memory header
    pub fn flush_header(&mut self) -> Result<()> {
        self.write_header()?;
        self.sync()
    }

    /// Check if the segment can take another record
    pub fn has_room(&self) -> bool {
        !self.header.sealed
            && self.header.count < self.max_records
            && self.write_pos < self.max_size
    }

    /// Check if segment is sealed
    pub fn is_sealed(&self) -> bool {
        self.header.sealed
    }

    /// Get the first position in this segment
    pub fn first(&self) -> Position {
        self.header.first
    }

    /// Get the last position in this segment
    pub fn last(&self) -> Position {
        self.header.last
    }

    /// Get record count
    pub fn count(&self) -> u32 {
        self.header.count
    }

    /// Chain checksum of the last record
    pub fn last_chain(&self) -> u32 {
        self.last_chain
    }

    /// Current header, for rollback
    pub fn header(&self) -> &SegmentHeader {
        &self.header
    }

    /// Current end of the written frames
    pub fn write_pos(&self) -> u64 {
        self.write_pos
    }

    pub fn info(&self) -> SegmentInfo {
        info_from_header(self.path.clone(), &self.header)
    }

    /// Write header to file
    fn write_header(&mut self) -> Result<()> {
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&self.header.to_bytes())?;
        Ok(())
    }
}

/// Injected write faults for tests
#[cfg(test)]
pub(crate) mod fault {
    use std::path::{Path, PathBuf};
    use std::sync::Mutex;

    static CORRUPT_NEXT: Mutex<Vec<PathBuf>> = Mutex::new(Vec::new());

    /// Damage the next frame appended to any segment in `dir`
    pub fn corrupt_next_append(dir: &Path) {
        CORRUPT_NEXT.lock().unwrap().push(dir.to_path_buf());
    }

    pub(super) fn take(segment: &Path) -> bool {
        let Some(dir) = segment.parent() else {
            return false;
        };
        let mut pending = CORRUPT_NEXT.lock().unwrap();
        match pending.iter().position(|d| d == dir) {
            Some(i) => {
                pending.swap_remove(i);
                true
            }
            None => false,
        }
    }
}

fn info_from_header(path: PathBuf, header: &SegmentHeader) -> SegmentInfo {
    SegmentInfo {
        path,
        first: header.first,
        last: header.last,
        count: header.count,
        sealed: header.sealed,
        base_chain: header.base_chain,
        last_timestamp: Utc
            .timestamp_millis_opt(header.last_timestamp_ms)
            .single()
            .unwrap_or_else(Utc::now),
    }
}

/// Iterator over records in a segment
pub struct SegmentIterator<'a> {
    segment: &'a mut Segment,
    pos: u64,
}

impl<'a> Iterator for SegmentIterator<'a> {
    type Item = Result<TxRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.segment.write_pos {
            return None;
        }

        match self.segment.read_at(self.pos) {
            Ok((record, next)) => {
                self.pos = next;
                Some(Ok(record))
            }
            Err(e) => {
                // Stop iteration on error
                self.pos = self.segment.write_pos;
                Some(Err(e))
            }
        }
    }
}

/// Parse the first position out of a segment file name
pub fn segment_first(path: &Path) -> Option<Position> {
    path.file_stem()
        .and_then(|s| s.to_str())
        .and_then(|s| s.strip_prefix("seg_"))
        .and_then(|s| s.parse().ok())
}

/// List all segment files in a directory, ordered by first position
pub fn list_segments(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut segments = Vec::new();

    if !dir.exists() {
        return Ok(segments);
    }

    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.extension().map_or(false, |ext| ext == "log") && segment_first(&path).is_some() {
            segments.push(path);
        }
    }

    // Zero-padded names sort by position
    segments.sort();
    Ok(segments)
}
