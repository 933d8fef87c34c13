//! WolfLite - Lease-Coordinated Database Replication
//!
//! Replicates single-file transactional databases (SQLite-style page files)
//! from one primary node to any number of replicas.
//!
//! # Architecture
//!
//! Exactly one node at a time holds a time-bounded lease from an external
//! lock service and accepts commits. Every commit is appended to a
//! per-database transaction log, applied to the local page image, and
//! streamed to replicas, which apply records strictly in order. When the
//! primary disappears its lease expires and a caught-up node takes over.
//!
//! # Features
//!
//! - Segmented, checksummed, chained transaction log with optional compression
//! - Group-commit log writer with fsync before acknowledgment
//! - Consul, static and in-process lease strategies
//! - Incremental streaming with snapshot resync when history is missing
//! - Retention bounded by the slowest live replica
//! - HTTP status and readiness API

pub mod api;
pub mod boundary;
pub mod config;
pub mod error;
pub mod lease;
pub mod state;
pub mod store;
pub mod stream;
pub mod txlog;

pub use config::WolfLiteConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::boundary::{ByteRange, CommitSink, Invalidator, Page, PageDiff};
    pub use crate::config::WolfLiteConfig;
    pub use crate::error::{Error, Result};
    pub use crate::lease::{Lease, Leaser, PrimaryInfo};
    pub use crate::store::{Role, Store, StoreStatus};
    pub use crate::txlog::{LogReader, LogWriter, Position, TxRecord};
}
