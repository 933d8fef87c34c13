//! Lease Module
//!
//! A lease is the exclusive permission to accept writes. The store never
//! decides who is primary on its own; it asks a [`Leaser`] and steps down as
//! soon as it can no longer prove it holds the lease.

mod consul;
mod memory;
mod static_lease;

pub use consul::ConsulLeaser;
pub use memory::{AcquireError, LockService, LockTable, MemoryLeaser};
pub use static_lease::StaticLeaser;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::{LeaseMode, WolfLiteConfig};
use crate::error::Result;

/// Where to reach the current primary
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrimaryInfo {
    /// Node id of the primary
    pub hostname: String,
    /// Replication stream address of the primary
    pub advertise_addr: String,
}

/// A held lease
#[derive(Debug, Clone)]
pub struct Lease {
    /// Node holding the lease
    pub owner: String,
    /// Stream address published with the lease
    pub advertise_addr: String,
    /// Time-to-live; `None` for leases that never expire
    pub ttl: Option<Duration>,
    /// When the lease was first acquired
    pub acquired_at: Instant,
    /// When the lease was last confirmed by the lock service
    pub renewed_at: Instant,
    /// Lock service session, if any
    pub session: Option<String>,
}

impl Lease {
    /// Create a lease confirmed at `now`
    pub fn new(
        owner: String,
        advertise_addr: String,
        ttl: Option<Duration>,
        session: Option<String>,
        now: Instant,
    ) -> Self {
        Self {
            owner,
            advertise_addr,
            ttl,
            acquired_at: now,
            renewed_at: now,
            session,
        }
    }

    /// Local deadline after which the lease must be treated as lost
    pub fn deadline(&self) -> Option<Instant> {
        self.ttl.map(|ttl| self.renewed_at + ttl)
    }

    /// Whether the lease is still provably held at `now`
    pub fn is_valid_at(&self, now: Instant) -> bool {
        match self.deadline() {
            Some(deadline) => now < deadline,
            None => true,
        }
    }

    /// When the next renewal is due
    pub fn renew_at(&self) -> Option<Instant> {
        self.ttl.map(|ttl| self.renewed_at + ttl / 2)
    }

    /// The same lease, confirmed again at `now`
    pub fn renewed(&self, now: Instant) -> Self {
        Self {
            renewed_at: now,
            ..self.clone()
        }
    }

    pub fn primary_info(&self) -> PrimaryInfo {
        PrimaryInfo {
            hostname: self.owner.clone(),
            advertise_addr: self.advertise_addr.clone(),
        }
    }
}

/// Arbiter of exclusive write permission
///
/// `acquire` fails with `Error::LeaseHeld` when another node holds the lease
/// and with `Error::LeaseUnavailable` when the lock service cannot be reached.
/// `renew` fails with `Error::LeaseLost` once the lease is gone.
#[async_trait]
pub trait Leaser: Send + Sync {
    /// Strategy name, for logging and status
    fn kind(&self) -> &'static str;

    /// Address this node publishes when it holds the lease
    fn advertise_addr(&self) -> &str;

    async fn acquire(&self) -> Result<Lease>;

    async fn renew(&self, lease: &Lease) -> Result<Lease>;

    async fn release(&self, lease: &Lease) -> Result<()>;

    /// Current holder of the lease, if any
    async fn primary_info(&self) -> Result<Option<PrimaryInfo>>;
}

/// Build the leaser selected by the configuration
pub fn from_config(config: &WolfLiteConfig) -> Result<Arc<dyn Leaser>> {
    let leaser: Arc<dyn Leaser> = match config.lease_mode()? {
        LeaseMode::Consul(consul) => Arc::new(ConsulLeaser::new(
            consul,
            &config.node.id,
            config.advertise_address(),
        )?),
        LeaseMode::Static(fixed) => Arc::new(StaticLeaser::new(fixed, &config.node.id)),
    };

    tracing::info!("Using {} lease", leaser.kind());
    Ok(leaser)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lease_deadline() {
        let now = Instant::now();
        let lease = Lease::new(
            "node-1".into(),
            "node-1:20202".into(),
            Some(Duration::from_secs(10)),
            Some("session".into()),
            now,
        );

        assert!(lease.is_valid_at(now + Duration::from_secs(9)));
        assert!(!lease.is_valid_at(now + Duration::from_secs(10)));
        assert_eq!(lease.renew_at(), Some(now + Duration::from_secs(5)));

        let renewed = lease.renewed(now + Duration::from_secs(5));
        assert!(renewed.is_valid_at(now + Duration::from_secs(14)));
        assert_eq!(renewed.acquired_at, now);
    }

    #[test]
    fn test_static_lease_never_expires() {
        let now = Instant::now();
        let lease = Lease::new("node-1".into(), "node-1:20202".into(), None, None, now);
        assert!(lease.is_valid_at(now + Duration::from_secs(86_400)));
        assert!(lease.renew_at().is_none());
    }

    #[test]
    fn test_from_config_picks_strategy() {
        let mut config = WolfLiteConfig::new("node-1", "/tmp/wolflite");
        assert!(from_config(&config).is_err());

        config.static_lease = Some(crate::config::StaticConfig {
            primary: true,
            hostname: "node-1".into(),
            advertise_address: "node-1:20202".into(),
        });
        let leaser = from_config(&config).unwrap();
        assert_eq!(leaser.kind(), "static");
    }
}
