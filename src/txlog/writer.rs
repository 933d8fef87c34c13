//! Log Writer
//!
//! Serializes every mutation of one database's log through a single task.
//! The task assigns positions, groups queued appends under one sync and only
//! then publishes the new tip.

use std::path::PathBuf;
use tokio::sync::{mpsc, oneshot, watch};

use super::record::TxRecord;
use super::segment::{list_segments, Segment};
use super::{LogPaths, Position};
use crate::boundary::PageDiff;
use crate::config::LogConfig;
use crate::error::{Error, Result};

/// Last durable position of a log and its chain checksum
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LogTip {
    pub position: Position,
    pub chain: u32,
}

/// Request sent to the writer task
enum WriteRequest {
    /// Assign the next position to a locally committed diff
    Append {
        diff: PageDiff,
        response: oneshot::Sender<Result<TxRecord>>,
    },
    /// Store a record received from the primary
    Replicate {
        record: TxRecord,
        response: oneshot::Sender<Result<TxRecord>>,
    },
    /// Discard the log and rebase it after a snapshot
    Reset {
        tip: LogTip,
        response: oneshot::Sender<Result<()>>,
    },
}

/// Reply waiting for the batch sync
enum Completion {
    Record(oneshot::Sender<Result<TxRecord>>, Result<TxRecord>),
    Reset(oneshot::Sender<Result<()>>, Result<()>),
}

/// Log writer handle
///
/// This is a cloneable handle to the underlying writer task.
#[derive(Clone)]
pub struct LogWriter {
    database: String,
    sender: mpsc::Sender<WriteRequest>,
    tip: watch::Receiver<LogTip>,
}

/// Internal writer that manages segments
struct WriterInner {
    database: String,
    node_id: String,
    paths: LogPaths,
    config: LogConfig,
    current_segment: Option<Segment>,
    /// Tip including appends not yet synced
    tip: LogTip,
    tip_tx: watch::Sender<LogTip>,
    /// Set once a sync fails; the log no longer accepts writes
    failed: Option<String>,
}

impl LogWriter {
    /// Open (recovering if needed) the log in `dir` and start its writer task
    pub async fn open(
        dir: PathBuf,
        database: String,
        node_id: String,
        config: LogConfig,
    ) -> Result<Self> {
        let paths = LogPaths::new(dir);
        paths.ensure_dirs()?;

        let (current_segment, tip) = Self::recover(&paths, &config)?;
        tracing::debug!(
            "Opened log for {} at position {} (chain {:08x})",
            database,
            tip.position,
            tip.chain
        );

        let (tip_tx, tip_rx) = watch::channel(tip);
        let (sender, receiver) = mpsc::channel(config.batch_size.max(1) * 4);

        let inner = WriterInner {
            database: database.clone(),
            node_id,
            paths,
            config,
            current_segment,
            tip,
            tip_tx,
            failed: None,
        };

        tokio::spawn(Self::writer_task(inner, receiver));

        Ok(Self {
            database,
            sender,
            tip: tip_rx,
        })
    }

    /// Find the durable tip, truncating a torn tail in the newest segment
    fn recover(paths: &LogPaths, config: &LogConfig) -> Result<(Option<Segment>, LogTip)> {
        let segments = list_segments(&paths.base_dir)?;

        let Some(last_path) = segments.last() else {
            return Ok((None, LogTip::default()));
        };

        let mut segment = Segment::open(
            last_path.clone(),
            config.segment_size_mb,
            config.segment_max_records,
            config.compression,
        )?;
        segment.recover()?;

        let tip = LogTip {
            position: segment.last(),
            chain: segment.last_chain(),
        };

        if segment.has_room() {
            return Ok((Some(segment), tip));
        }

        // A segment that filled up right before shutdown was never sealed
        if !segment.is_sealed() {
            segment.seal()?;
            tracing::debug!(
                "Sealed full segment {:?} ({}..={}) during recovery",
                segment.path,
                segment.first(),
                segment.last()
            );
        }
        Ok((None, tip))
    }

    /// Append a locally committed transaction, returning the durable record
    pub async fn append(&self, diff: PageDiff) -> Result<TxRecord> {
        let (tx, rx) = oneshot::channel();
        self.send(WriteRequest::Append { diff, response: tx }).await?;
        rx.await
            .map_err(|_| Error::Log("Write cancelled".into()))?
    }

    /// Append a record received from the primary
    pub async fn replicate(&self, record: TxRecord) -> Result<TxRecord> {
        let (tx, rx) = oneshot::channel();
        self.send(WriteRequest::Replicate {
            record,
            response: tx,
        })
        .await?;
        rx.await
            .map_err(|_| Error::Log("Write cancelled".into()))?
    }

    /// Drop every record and continue after `position` with `chain`
    pub async fn reset(&self, position: Position, chain: u32) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send(WriteRequest::Reset {
            tip: LogTip { position, chain },
            response: tx,
        })
        .await?;
        rx.await
            .map_err(|_| Error::Log("Reset cancelled".into()))?
    }

    /// Get the last durable position
    pub fn tip(&self) -> LogTip {
        *self.tip.borrow()
    }

    async fn send(&self, request: WriteRequest) -> Result<()> {
        self.sender
            .send(request)
            .await
            .map_err(|_| Error::Log(format!("Log writer for {} terminated", self.database)))
    }

    /// Writer task that processes write requests
    async fn writer_task(mut inner: WriterInner, mut receiver: mpsc::Receiver<WriteRequest>) {
        let batch_size = inner.config.batch_size.max(1);

        while let Some(request) = receiver.recv().await {
            let mut batch = Vec::with_capacity(batch_size);
            batch.push(request);
            while batch.len() < batch_size {
                match receiver.try_recv() {
                    Ok(request) => batch.push(request),
                    Err(_) => break,
                }
            }

            inner.process_batch(batch);
        }

        tracing::debug!("Log writer for {} stopped", inner.database);
    }
}

impl WriterInner {
    fn process_batch(&mut self, batch: Vec<WriteRequest>) {
        let mut pending = Vec::with_capacity(batch.len());

        for request in batch {
            if let Some(reason) = &self.failed {
                let err = Error::Log(format!("log for {} is unusable: {}", self.database, reason));
                match request {
                    WriteRequest::Append { response, .. }
                    | WriteRequest::Replicate { response, .. } => {
                        let _ = response.send(Err(err));
                    }
                    WriteRequest::Reset { response, .. } => {
                        let _ = response.send(Err(err));
                    }
                }
                continue;
            }

            match request {
                WriteRequest::Append { diff, response } => {
                    let result = diff.validate().and_then(|_| {
                        let record = TxRecord::new(
                            self.database.clone(),
                            self.tip.position + 1,
                            diff,
                            self.tip.chain,
                            self.node_id.clone(),
                        );
                        self.write_record(record)
                    });
                    pending.push(Completion::Record(response, result));
                }
                WriteRequest::Replicate { record, response } => {
                    let result = self
                        .check_replicated(&record)
                        .and_then(|_| self.write_record(record));
                    pending.push(Completion::Record(response, result));
                }
                WriteRequest::Reset { tip, response } => {
                    // Earlier appends must be settled before the log is discarded
                    self.finish(std::mem::take(&mut pending));
                    let result = self.reset(tip);
                    pending.push(Completion::Reset(response, result));
                }
            }
        }

        self.finish(pending);
    }

    /// Sync the batch, publish the new tip and reply
    fn finish(&mut self, pending: Vec<Completion>) {
        if pending.is_empty() {
            return;
        }

        let wrote = pending
            .iter()
            .any(|c| matches!(c, Completion::Record(_, Ok(_))));

        let mut sync_error = None;
        if wrote && self.config.fsync {
            if let Some(segment) = self.current_segment.as_ref() {
                if let Err(e) = segment.sync() {
                    tracing::error!("Log sync failed for {}: {}", self.database, e);
                    self.failed = Some(e.to_string());
                    sync_error = Some(e.to_string());
                }
            }
        }

        if sync_error.is_none() {
            self.tip_tx.send_replace(self.tip);
        }

        for completion in pending {
            match completion {
                Completion::Record(response, result) => {
                    let result = match (&sync_error, result) {
                        (Some(reason), Ok(_)) => Err(Error::Log(format!("sync failed: {}", reason))),
                        (_, result) => result,
                    };
                    let _ = response.send(result);
                }
                Completion::Reset(response, result) => {
                    let _ = response.send(result);
                }
            }
        }
    }

    fn check_replicated(&self, record: &TxRecord) -> Result<()> {
        if record.database != self.database {
            return Err(Error::Replication(format!(
                "record for {} delivered to log of {}",
                record.database, self.database
            )));
        }
        record.verify_follows(self.tip.position, self.tip.chain)
    }

    /// Append one record to the active segment
    fn write_record(&mut self, record: TxRecord) -> Result<TxRecord> {
        self.ensure_segment()?;
        let strict_verify = self.config.strict_verify;

        let segment = self
            .current_segment
            .as_mut()
            .ok_or_else(|| Error::Internal("no active segment".into()))?;

        let start = segment.write_pos();
        let saved_header = segment.header().clone();
        let saved_chain = segment.last_chain();

        let offset = match segment.append(&record) {
            Ok(offset) => offset,
            Err(e) => {
                segment.rollback(start, saved_header, saved_chain)?;
                return Err(e);
            }
        };

        if strict_verify {
            let verified = segment.read_at(offset).and_then(|(stored, _)| {
                stored.verify()?;
                if stored.position != record.position || stored.checksum != record.checksum {
                    return Err(Error::Log("stored frame differs from appended record".into()));
                }
                Ok(())
            });

            if let Err(e) = verified {
                tracing::error!(
                    "Strict verify failed for {} at position {}: {}",
                    self.database,
                    record.position,
                    e
                );
                segment.rollback(start, saved_header, saved_chain)?;
                return Err(Error::LogCorrupted {
                    position: record.position,
                    reason: e.to_string(),
                });
            }
        }

        self.tip = LogTip {
            position: record.position,
            chain: record.chain(),
        };
        Ok(record)
    }

    /// Ensure we have a segment with room for one more record
    fn ensure_segment(&mut self) -> Result<()> {
        if let Some(segment) = self.current_segment.as_mut() {
            if segment.has_room() {
                return Ok(());
            }
            segment.seal()?;
            tracing::debug!(
                "Sealed segment {:?} ({}..={})",
                segment.path,
                segment.first(),
                segment.last()
            );
        }

        let first = self.tip.position + 1;
        let segment = Segment::create(
            self.paths.segment_path(first),
            first,
            self.tip.chain,
            self.config.segment_size_mb,
            self.config.segment_max_records,
            self.config.compression,
        )?;
        self.current_segment = Some(segment);
        Ok(())
    }

    fn reset(&mut self, tip: LogTip) -> Result<()> {
        self.current_segment = None;

        for path in list_segments(&self.paths.base_dir)? {
            std::fs::remove_file(&path)?;
        }

        // An empty segment keeps the new base across restarts
        let first = tip.position + 1;
        let mut segment = Segment::create(
            self.paths.segment_path(first),
            first,
            tip.chain,
            self.config.segment_size_mb,
            self.config.segment_max_records,
            self.config.compression,
        )?;
        segment.flush_header()?;
        self.current_segment = Some(segment);

        self.tip = tip;
        self.tip_tx.send_replace(tip);

        tracing::info!(
            "Log for {} reset to position {} (chain {:08x})",
            self.database,
            tip.position,
            tip.chain
        );
        Ok(())
    }
}
