//! In-Process Lease
//!
//! A lock table with the same TTL and lock-delay rules as a Consul session
//! lock, shared by every node in one process. Used for single-host clusters
//! and tests.
//!
//! Time is passed in explicitly so the table can be driven by a model clock.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use super::{Lease, Leaser, PrimaryInfo};
use crate::error::{Error, Result};

#[derive(Debug, Clone)]
struct Holder {
    session: String,
    info: PrimaryInfo,
    expires_at: Instant,
    lock_delay: Duration,
}

#[derive(Debug, Default)]
struct LockState {
    holder: Option<Holder>,
    /// Key is unacquirable until then after the holder expired
    delay_until: Option<Instant>,
}

impl LockState {
    /// Drop an expired holder, starting its lock delay
    fn expire(&mut self, now: Instant) {
        if let Some(holder) = &self.holder {
            if holder.expires_at <= now {
                self.delay_until = Some(holder.expires_at + holder.lock_delay);
                self.holder = None;
            }
        }
    }
}

/// Why an acquisition was refused
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquireError {
    /// Another session holds the lock
    Held(PrimaryInfo),
    /// The previous holder expired and the lock delay has not passed
    LockDelay(Instant),
}

/// Session locks keyed by name
#[derive(Debug, Default)]
pub struct LockTable {
    locks: HashMap<String, LockState>,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire(
        &mut self,
        key: &str,
        session: &str,
        info: PrimaryInfo,
        ttl: Duration,
        lock_delay: Duration,
        now: Instant,
    ) -> std::result::Result<(), AcquireError> {
        let state = self.locks.entry(key.to_string()).or_default();
        state.expire(now);

        if let Some(holder) = &state.holder {
            if holder.session != session {
                return Err(AcquireError::Held(holder.info.clone()));
            }
        }

        if let Some(until) = state.delay_until {
            if now < until {
                return Err(AcquireError::LockDelay(until));
            }
            state.delay_until = None;
        }

        state.holder = Some(Holder {
            session: session.to_string(),
            info,
            expires_at: now + ttl,
            lock_delay,
        });
        Ok(())
    }

    /// Extend the holder's TTL; false if the session no longer holds the lock
    pub fn renew(&mut self, key: &str, session: &str, ttl: Duration, now: Instant) -> bool {
        let Some(state) = self.locks.get_mut(key) else {
            return false;
        };
        state.expire(now);

        match state.holder.as_mut() {
            Some(holder) if holder.session == session => {
                holder.expires_at = now + ttl;
                true
            }
            _ => false,
        }
    }

    /// Clean release; no lock delay applies
    pub fn release(&mut self, key: &str, session: &str, now: Instant) -> bool {
        let Some(state) = self.locks.get_mut(key) else {
            return false;
        };
        state.expire(now);

        if state.holder.as_ref().map(|h| h.session.as_str()) == Some(session) {
            state.holder = None;
            true
        } else {
            false
        }
    }

    /// Current holder of the lock
    pub fn holder(&mut self, key: &str, now: Instant) -> Option<PrimaryInfo> {
        let state = self.locks.get_mut(key)?;
        state.expire(now);
        state.holder.as_ref().map(|h| h.info.clone())
    }
}

/// A lock table shared between in-process leasers
#[derive(Debug, Clone, Default)]
pub struct LockService {
    table: Arc<Mutex<LockTable>>,
}

impl LockService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a leaser for one node
    pub fn leaser(
        &self,
        key: &str,
        hostname: &str,
        advertise_addr: &str,
        ttl: Duration,
        lock_delay: Duration,
    ) -> MemoryLeaser {
        MemoryLeaser {
            table: Arc::clone(&self.table),
            key: key.to_string(),
            info: PrimaryInfo {
                hostname: hostname.to_string(),
                advertise_addr: advertise_addr.to_string(),
            },
            ttl,
            lock_delay,
        }
    }

    /// Current holder of `key`
    pub fn holder(&self, key: &str) -> Option<PrimaryInfo> {
        self.table
            .lock()
            .ok()
            .and_then(|mut table| table.holder(key, Instant::now()))
    }
}

pub struct MemoryLeaser {
    table: Arc<Mutex<LockTable>>,
    key: String,
    info: PrimaryInfo,
    ttl: Duration,
    lock_delay: Duration,
}

impl MemoryLeaser {
    fn with_table<T>(&self, f: impl FnOnce(&mut LockTable) -> T) -> Result<T> {
        let mut table = self
            .table
            .lock()
            .map_err(|_| Error::Internal("lock table poisoned".into()))?;
        Ok(f(&mut table))
    }
}

#[async_trait]
impl Leaser for MemoryLeaser {
    fn kind(&self) -> &'static str {
        "memory"
    }

    fn advertise_addr(&self) -> &str {
        &self.info.advertise_addr
    }

    async fn acquire(&self) -> Result<Lease> {
        let now = Instant::now();
        let session = uuid::Uuid::new_v4().to_string();

        let result = self.with_table(|table| {
            table.acquire(
                &self.key,
                &session,
                self.info.clone(),
                self.ttl,
                self.lock_delay,
                now,
            )
        })?;

        match result {
            Ok(()) => Ok(Lease::new(
                self.info.hostname.clone(),
                self.info.advertise_addr.clone(),
                Some(self.ttl),
                Some(session),
                now,
            )),
            Err(AcquireError::Held(holder)) => Err(Error::LeaseHeld {
                holder: holder.hostname,
            }),
            Err(AcquireError::LockDelay(until)) => Err(Error::LeaseUnavailable(format!(
                "lock delay active for another {:?}",
                until.saturating_duration_since(now)
            ))),
        }
    }

    async fn renew(&self, lease: &Lease) -> Result<Lease> {
        let session = lease.session.as_deref().ok_or(Error::LeaseLost)?;
        let now = Instant::now();

        if self.with_table(|table| table.renew(&self.key, session, self.ttl, now))? {
            Ok(lease.renewed(now))
        } else {
            Err(Error::LeaseLost)
        }
    }

    async fn release(&self, lease: &Lease) -> Result<()> {
        if let Some(session) = lease.session.as_deref() {
            self.with_table(|table| table.release(&self.key, session, Instant::now()))?;
        }
        Ok(())
    }

    async fn primary_info(&self) -> Result<Option<PrimaryInfo>> {
        self.with_table(|table| table.holder(&self.key, Instant::now()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(10);
    const DELAY: Duration = Duration::from_secs(5);

    fn info(name: &str) -> PrimaryInfo {
        PrimaryInfo {
            hostname: name.into(),
            advertise_addr: format!("{}:20202", name),
        }
    }

    #[test]
    fn test_crashed_holder_blocks_until_ttl_and_delay() {
        let mut table = LockTable::new();
        let t0 = Instant::now();

        table.acquire("k", "s1", info("a"), TTL, DELAY, t0).unwrap();
        assert_eq!(
            table.acquire("k", "s2", info("b"), TTL, DELAY, t0 + Duration::from_secs(9)),
            Err(AcquireError::Held(info("a")))
        );

        // Expired, but inside the lock delay
        let expired = t0 + TTL;
        assert!(matches!(
            table.acquire("k", "s2", info("b"), TTL, DELAY, expired + Duration::from_secs(1)),
            Err(AcquireError::LockDelay(_))
        ));
        assert!(table.holder("k", expired).is_none());

        table
            .acquire("k", "s2", info("b"), TTL, DELAY, expired + DELAY)
            .unwrap();
        assert_eq!(table.holder("k", expired + DELAY), Some(info("b")));
        assert!(!table.renew("k", "s1", TTL, expired + DELAY));
    }

    #[test]
    fn test_renew_extends_and_release_is_immediate() {
        let mut table = LockTable::new();
        let t0 = Instant::now();

        table.acquire("k", "s1", info("a"), TTL, DELAY, t0).unwrap();
        assert!(table.renew("k", "s1", TTL, t0 + Duration::from_secs(8)));
        assert!(table.holder("k", t0 + Duration::from_secs(15)).is_some());

        assert!(table.release("k", "s1", t0 + Duration::from_secs(16)));
        table
            .acquire("k", "s2", info("b"), TTL, DELAY, t0 + Duration::from_secs(16))
            .unwrap();
    }

    #[tokio::test]
    async fn test_memory_leaser() {
        let service = LockService::new();
        let a = service.leaser("primary", "a", "a:1", TTL, DELAY);
        let b = service.leaser("primary", "b", "b:1", TTL, DELAY);

        let lease = a.acquire().await.unwrap();
        assert!(matches!(b.acquire().await, Err(Error::LeaseHeld { .. })));
        assert_eq!(b.primary_info().await.unwrap(), Some(info_with("a", "a:1")));

        a.release(&lease).await.unwrap();
        assert!(b.acquire().await.is_ok());
        assert!(matches!(a.renew(&lease).await, Err(Error::LeaseLost)));
        assert_eq!(service.holder("primary").map(|h| h.hostname), Some("b".into()));
    }

    fn info_with(name: &str, addr: &str) -> PrimaryInfo {
        PrimaryInfo {
            hostname: name.into(),
            advertise_addr: addr.into(),
        }
    }
}
