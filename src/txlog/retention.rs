//! Log Retention
//!
//! Decides which sealed segments may be deleted. A segment goes only when
//! every record in it is older than the retention window and at or below
//! the floor: the lowest position still needed by the local page image or
//! by any live (or recently disconnected) replica.

use chrono::{DateTime, Utc};
use std::time::Duration;

use super::reader::LogReader;
use super::segment::SegmentInfo;
use super::Position;
use crate::error::Result;

/// Lowest position anyone still depends on
pub fn retention_floor<I>(local_applied: Position, replicas: I) -> Position
where
    I: IntoIterator<Item = Position>,
{
    replicas.into_iter().fold(local_applied, Position::min)
}

/// Number of leading segments that may be deleted.
///
/// Only a prefix is ever removed so the retained log stays contiguous, and
/// the newest segment always survives because it carries the log's tip.
pub fn deletable_segments(segments: &[SegmentInfo], floor: Position, cutoff: DateTime<Utc>) -> usize {
    let candidates = segments.len().saturating_sub(1);

    segments[..candidates]
        .iter()
        .take_while(|s| s.sealed && s.count > 0 && s.last <= floor && s.last_timestamp <= cutoff)
        .count()
}

/// Delete every segment the floor and window allow, returning what went
pub fn enforce(
    reader: &mut LogReader,
    database: &str,
    floor: Position,
    retention: Duration,
    now: DateTime<Utc>,
) -> Result<Vec<SegmentInfo>> {
    let segments = reader.segments()?;
    let window = chrono::Duration::from_std(retention).unwrap_or(chrono::Duration::MAX);
    let cutoff = now.checked_sub_signed(window).unwrap_or(DateTime::<Utc>::MIN_UTC);

    let count = deletable_segments(&segments, floor, cutoff);
    let mut deleted = Vec::with_capacity(count);

    for segment in segments.into_iter().take(count) {
        if let Err(e) = std::fs::remove_file(&segment.path) {
            tracing::warn!(
                "Retention could not delete {:?} of {}: {} (will retry)",
                segment.path,
                database,
                e
            );
            break;
        }
        tracing::info!(
            "Retention deleted segment {}..={} of {} (floor {})",
            segment.first,
            segment.last,
            database,
            floor
        );
        deleted.push(segment);
    }

    if !deleted.is_empty() {
        reader.refresh_index()?;
    }

    Ok(deleted)
}
