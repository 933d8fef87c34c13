//! Replicated Database
//!
//! One replicated database: its transaction log, its page image file and the
//! position the image reflects. Every mutation (local commit, replicated
//! record, snapshot) holds the image lock, so the log and the image advance
//! together.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};

use crate::boundary::{ByteRange, Page, PageDiff};
use crate::config::LogConfig;
use crate::error::{Error, Result};
use crate::state::{AppliedState, StateTracker};
use crate::stream::Snapshot;
use crate::txlog::{LogReader, LogTip, LogWriter, Position, TxRecord};

/// Name of the page image file inside a database directory
const IMAGE_FILE: &str = "database";

/// Check a database name is usable as a directory name
pub fn validate_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name.len() <= 255
        && !name.starts_with('.')
        && !name.contains(['/', '\\', '\0']);

    if valid {
        Ok(())
    } else {
        Err(Error::InvalidDatabaseName(name.to_string()))
    }
}

/// Page image file and what it reflects
struct Image {
    file: File,
    applied: AppliedState,
}

impl Image {
    fn apply(&mut self, diff: &PageDiff, fsync: bool) -> Result<()> {
        for page in &diff.pages {
            self.file.seek(SeekFrom::Start(diff.page_offset(page.pgno)))?;
            self.file.write_all(&page.data)?;
        }
        self.file.set_len(diff.file_size())?;
        if fsync {
            self.file.sync_data()?;
        }
        Ok(())
    }

    fn len(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }
}

pub struct Database {
    name: String,
    dir: PathBuf,
    node_id: String,
    log_config: LogConfig,
    writer: LogWriter,
    tracker: Arc<StateTracker>,
    image: Mutex<Image>,
    /// Published after the image reflects a position
    applied_tx: watch::Sender<LogTip>,
    needs_resync: AtomicBool,
}

impl Database {
    /// Open (or create) the database in `dir`, replaying the log onto the
    /// image if the image is behind it
    pub async fn open(
        dir: PathBuf,
        name: &str,
        node_id: &str,
        log_config: LogConfig,
        tracker: Arc<StateTracker>,
    ) -> Result<Arc<Self>> {
        validate_name(name)?;
        std::fs::create_dir_all(&dir)?;

        let writer = LogWriter::open(
            dir.join("log"),
            name.to_string(),
            node_id.to_string(),
            log_config.clone(),
        )
        .await?;

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(dir.join(IMAGE_FILE))?;

        let applied = tracker.applied(name).await?.unwrap_or_default();
        let mut image = Image { file, applied };

        let log_tip = writer.tip();
        let mut needs_resync = false;

        if applied.position > log_tip.position {
            tracing::warn!(
                "Image of {} is at position {} but its log ends at {}; resync required",
                name,
                applied.position,
                log_tip.position
            );
            needs_resync = true;
        } else if applied.position < log_tip.position {
            let mut reader = LogReader::new(dir.join("log"), name.to_string(), log_config.clone())?;
            match replay(&mut image, &mut reader, log_tip.position, log_config.fsync) {
                Ok(replayed) => {
                    tracing::info!(
                        "Replayed {} records onto image of {} (now at {})",
                        replayed,
                        name,
                        image.applied.position
                    );
                    tracker.set_applied(name, image.applied).await?;
                }
                Err(e) if e.requires_resync() => {
                    tracing::warn!("Cannot replay log of {}: {}; resync required", name, e);
                    needs_resync = true;
                }
                Err(e) => return Err(e),
            }
        } else if applied.chain != log_tip.chain {
            tracing::warn!(
                "Image of {} disagrees with its log at position {}; resync required",
                name,
                applied.position
            );
            needs_resync = true;
        }

        let tip = LogTip {
            position: image.applied.position,
            chain: image.applied.chain,
        };
        let (applied_tx, _) = watch::channel(tip);

        Ok(Arc::new(Self {
            name: name.to_string(),
            dir,
            node_id: node_id.to_string(),
            log_config,
            writer,
            tracker,
            image: Mutex::new(image),
            applied_tx,
            needs_resync: AtomicBool::new(needs_resync),
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Path of the page image file
    pub fn image_path(&self) -> PathBuf {
        self.dir.join(IMAGE_FILE)
    }

    /// Position and chain the image reflects
    pub fn tip(&self) -> LogTip {
        *self.applied_tx.borrow()
    }

    pub fn needs_resync(&self) -> bool {
        self.needs_resync.load(Ordering::SeqCst)
    }

    /// Flag the database so the next subscription asks for a snapshot
    pub fn mark_resync(&self) {
        if !self.needs_resync.swap(true, Ordering::SeqCst) {
            tracing::warn!("Database {} flagged for resync", self.name);
        }
    }

    /// Open a reader over this database's log
    pub fn reader(&self) -> Result<LogReader> {
        LogReader::new(self.dir.join("log"), self.name.clone(), self.log_config.clone())
    }

    /// Log and apply a locally committed transaction
    pub async fn commit(&self, diff: PageDiff) -> Result<TxRecord> {
        let mut image = self.image.lock().await;

        if self.needs_resync() {
            return Err(Error::Replication(format!(
                "{} is waiting for a resync and cannot accept commits",
                self.name
            )));
        }

        let record = self.writer.append(diff).await?;
        self.apply_to_image(&mut image, &record).await?;

        tracing::debug!("Committed {} at position {}", self.name, record.position);
        Ok(record)
    }

    /// Verify, log and apply a record from the primary.
    ///
    /// Returns the byte ranges of the image that changed.
    pub async fn apply_record(&self, record: TxRecord) -> Result<Vec<ByteRange>> {
        let mut image = self.image.lock().await;

        if self.needs_resync() {
            return Err(Error::ChecksumMismatch {
                database: self.name.clone(),
                position: record.position,
                reason: "database is waiting for a snapshot".into(),
            });
        }

        record.verify_follows(image.applied.position, image.applied.chain)?;
        let previous_len = image.len()?;

        let record = self.writer.replicate(record).await?;
        self.apply_to_image(&mut image, &record).await?;

        Ok(record.diff.invalidated_ranges(previous_len))
    }

    /// Replace the image with a snapshot and rebase the log on it
    pub async fn apply_snapshot(&self, snapshot: Snapshot) -> Result<Vec<ByteRange>> {
        let mut image = self.image.lock().await;

        let diff = PageDiff::new(snapshot.page_size, snapshot.commit, snapshot.pages);
        if snapshot.commit > 0 {
            diff.validate()?;
        }
        let old_len = image.len()?;

        // Log first: a crash before the image is written leaves a log the
        // image cannot replay, which flags another resync on restart
        self.writer.reset(snapshot.position, snapshot.checksum).await?;

        image.file.set_len(0)?;
        image.apply(&diff, self.log_config.fsync)?;
        image.applied = AppliedState {
            position: snapshot.position,
            chain: snapshot.checksum,
            page_size: snapshot.page_size,
        };
        self.tracker.set_applied(&self.name, image.applied).await?;

        self.needs_resync.store(false, Ordering::SeqCst);
        self.publish(&image);

        tracing::info!(
            "Applied snapshot of {} at position {} ({} pages)",
            self.name,
            snapshot.position,
            snapshot.commit
        );

        Ok(vec![ByteRange::new(0, old_len.max(diff.file_size()))])
    }

    /// Capture the full image at its current position
    pub async fn snapshot(&self) -> Result<Snapshot> {
        let mut image = self.image.lock().await;

        let page_size = image.applied.page_size;
        let len = image.len()?;
        let mut pages = Vec::new();

        if page_size > 0 {
            image.file.seek(SeekFrom::Start(0))?;
            let count = (len / page_size as u64) as u32;
            for pgno in 1..=count {
                let mut data = vec![0u8; page_size as usize];
                image.file.read_exact(&mut data)?;
                pages.push(Page { pgno, data });
            }
        }

        Ok(Snapshot {
            database: self.name.clone(),
            position: image.applied.position,
            checksum: image.applied.chain,
            page_size,
            commit: pages.len() as u32,
            pages,
        })
    }

    async fn apply_to_image(&self, image: &mut Image, record: &TxRecord) -> Result<()> {
        image.apply(&record.diff, self.log_config.fsync)?;
        image.applied = AppliedState {
            position: record.position,
            chain: record.chain(),
            page_size: record.diff.page_size,
        };
        self.tracker.set_applied(&self.name, image.applied).await?;
        self.publish(image);
        Ok(())
    }

    fn publish(&self, image: &Image) {
        self.applied_tx.send_replace(LogTip {
            position: image.applied.position,
            chain: image.applied.chain,
        });
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }
}

/// Apply retained log records after the image's position
fn replay(image: &mut Image, reader: &mut LogReader, until: Position, fsync: bool) -> Result<u64> {
    let mut replayed = 0;

    while image.applied.position < until {
        let records = reader.read_batch(image.applied.position + 1, until, 256)?;
        if records.is_empty() {
            return Err(Error::LogCorrupted {
                position: image.applied.position + 1,
                reason: "log ended before its recorded tip".into(),
            });
        }

        for record in records {
            record.verify_follows(image.applied.position, image.applied.chain)?;
            image.apply(&record.diff, fsync)?;
            image.applied = AppliedState {
                position: record.position,
                chain: record.chain(),
                page_size: record.diff.page_size,
            };
            replayed += 1;
        }
    }

    Ok(replayed)
}

/// List database names stored under `dir`
pub fn list_databases(dir: &Path) -> Result<Vec<String>> {
    let mut names = Vec::new();
    if !dir.exists() {
        return Ok(names);
    }

    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        if let Some(name) = entry.file_name().to_str() {
            if validate_name(name).is_ok() {
                names.push(name.to_string());
            }
        }
    }

    names.sort();
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn test_config() -> LogConfig {
        LogConfig {
            compression: false,
            fsync: false,
            strict_verify: true,
            segment_max_records: 2,
            segment_size_mb: 1,
            batch_size: 4,
        }
    }

    fn diff(pgno: u32, commit: u32, fill: u8) -> PageDiff {
        PageDiff::new(
            512,
            commit,
            vec![Page {
                pgno,
                data: vec![fill; 512],
            }],
        )
    }

    async fn open(root: &Path, tracker: &Arc<StateTracker>) -> Arc<Database> {
        Database::open(
            root.join("dbs").join("app.db"),
            "app.db",
            "node-1",
            test_config(),
            Arc::clone(tracker),
        )
        .await
        .unwrap()
    }

    #[test]
    fn test_validate_name() {
        assert!(validate_name("app.db").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("../etc").is_err());
        assert!(validate_name(".hidden").is_err());
        assert!(validate_name("a/b").is_err());
    }

    #[tokio::test]
    async fn test_commit_updates_image() {
        let dir = tempdir().unwrap();
        let tracker = Arc::new(StateTracker::new(dir.path().join("state"), "node-1".into()).unwrap());
        let db = open(dir.path(), &tracker).await;

        db.commit(diff(1, 2, 0xaa)).await.unwrap();
        let record = db.commit(diff(2, 2, 0xbb)).await.unwrap();
        assert_eq!(record.position, 2);
        assert_eq!(db.tip().position, 2);

        let bytes = std::fs::read(db.image_path()).unwrap();
        assert_eq!(bytes.len(), 1024);
        assert!(bytes[..512].iter().all(|b| *b == 0xaa));
        assert!(bytes[512..].iter().all(|b| *b == 0xbb));

        let applied = tracker.applied("app.db").await.unwrap().unwrap();
        assert_eq!(applied.position, 2);
        assert_eq!(applied.chain, record.chain());
    }

    #[tokio::test]
    async fn test_image_replayed_after_lost_update() {
        let dir = tempdir().unwrap();
        let tracker = Arc::new(StateTracker::new(dir.path().join("state"), "node-1".into()).unwrap());
        let expected = {
            let db = open(dir.path(), &tracker).await;
            for i in 1..=5u8 {
                db.commit(diff(1, 1, i)).await.unwrap();
            }
            std::fs::read(db.image_path()).unwrap()
        };

        // Simulate a crash after the log append but before the state update
        let mut reader = LogReader::new(
            dir.path().join("dbs").join("app.db").join("log"),
            "app.db".into(),
            test_config(),
        )
        .unwrap();
        let chain_at_2 = reader.chain_at(2).unwrap().unwrap();
        tracker
            .set_applied("app.db", AppliedState { position: 2, chain: chain_at_2, page_size: 512 })
            .await
            .unwrap();

        let db = open(dir.path(), &tracker).await;
        assert!(!db.needs_resync());
        assert_eq!(db.tip().position, 5);
        assert_eq!(std::fs::read(db.image_path()).unwrap(), expected);
    }

    #[tokio::test]
    async fn test_apply_record_rejects_gap() {
        let dir = tempdir().unwrap();
        let tracker = Arc::new(StateTracker::new(dir.path().join("state"), "node-2".into()).unwrap());
        let db = open(dir.path(), &tracker).await;

        let first = TxRecord::new("app.db".into(), 1, diff(1, 1, 1), 0, "node-1".into());
        let ranges = db.apply_record(first.clone()).await.unwrap();
        assert_eq!(ranges, vec![ByteRange::new(0, 512)]);

        let third = TxRecord::new("app.db".into(), 3, diff(1, 1, 3), first.chain(), "node-1".into());
        let err = db.apply_record(third).await.unwrap_err();
        assert!(err.requires_resync());
        assert_eq!(db.tip().position, 1);
    }

    #[tokio::test]
    async fn test_snapshot_roundtrip() {
        let dir = tempdir().unwrap();
        let primary_tracker =
            Arc::new(StateTracker::new(dir.path().join("p-state"), "node-1".into()).unwrap());
        let primary = Database::open(
            dir.path().join("p"),
            "app.db",
            "node-1",
            test_config(),
            primary_tracker,
        )
        .await
        .unwrap();

        primary.commit(diff(1, 3, 1)).await.unwrap();
        primary.commit(diff(3, 3, 3)).await.unwrap();
        let snapshot = primary.snapshot().await.unwrap();
        assert_eq!(snapshot.position, 2);
        assert_eq!(snapshot.commit, 3);

        let replica_tracker =
            Arc::new(StateTracker::new(dir.path().join("r-state"), "node-2".into()).unwrap());
        let replica = Database::open(
            dir.path().join("r"),
            "app.db",
            "node-2",
            test_config(),
            replica_tracker,
        )
        .await
        .unwrap();
        replica.mark_resync();
        replica.apply_snapshot(snapshot).await.unwrap();
        assert!(!replica.needs_resync());
        assert_eq!(replica.tip(), primary.tip());

        let next = primary.commit(diff(2, 3, 2)).await.unwrap();
        replica.apply_record(next).await.unwrap();
        assert_eq!(
            std::fs::read(primary.image_path()).unwrap(),
            std::fs::read(replica.image_path()).unwrap()
        );
    }
}
