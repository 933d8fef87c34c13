//! Lease Monitor
//!
//! Background task that resolves this node's role. As primary it renews the
//! lease at half its TTL and steps down the moment renewal cannot be proven
//! before the local deadline. Otherwise it keeps trying to acquire the lease,
//! following the holder as a replica in the meantime.

use rand::Rng;
use std::time::{Duration, Instant};
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

use super::{Role, Store};
use crate::error::Error;
use crate::lease::Lease;

/// Jittered exponential backoff
pub(super) struct Backoff {
    min: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub(super) fn new(min: Duration, max: Duration) -> Self {
        let min = min.max(Duration::from_millis(1));
        Self {
            min,
            max: max.max(min),
            current: min,
        }
    }

    /// Next delay: somewhere in the upper half of the current step
    pub(super) fn next(&mut self) -> Duration {
        let step = self.current.as_millis() as u64;
        self.current = (self.current * 2).min(self.max);

        let ms = rand::thread_rng().gen_range(step / 2..=step.max(1));
        Duration::from_millis(ms)
    }

    pub(super) fn reset(&mut self) {
        self.current = self.min;
    }
}

pub(super) async fn run(store: Store, token: CancellationToken) {
    let stream = &store.config().stream;
    let mut backoff = Backoff::new(stream.backoff_min(), stream.backoff_max());

    tracing::debug!("Lease monitor started for {}", store.node_id());

    loop {
        if token.is_cancelled() {
            break;
        }

        let wait = match store.current_lease().await {
            Some(lease) => maintain_lease(&store, lease).await,
            None => seek_lease(&store, &mut backoff).await,
        };

        tokio::select! {
            _ = token.cancelled() => break,
            _ = sleep(wait) => {}
        }
    }

    tracing::debug!("Lease monitor stopped for {}", store.node_id());
}

/// Renew a held lease when due, demoting if it cannot be proven valid
async fn maintain_lease(store: &Store, lease: Lease) -> Duration {
    let (Some(renew_at), Some(deadline)) = (lease.renew_at(), lease.deadline()) else {
        // Leases without a TTL never need renewing
        return store.config().node.lease_poll_interval();
    };

    let now = Instant::now();
    if now < renew_at {
        return renew_at - now;
    }
    if now >= deadline {
        store.demote("lease deadline passed before renewal").await;
        return Duration::ZERO;
    }

    match timeout(deadline - now, store.leaser().renew(&lease)).await {
        Ok(Ok(renewed)) => {
            tracing::debug!("Renewed lease for {}", store.node_id());
            store.store_lease(renewed).await;
            Duration::ZERO
        }
        Ok(Err(e)) if e.is_retryable() => {
            tracing::warn!("Lease renewal failed: {} (retrying until deadline)", e);
            store
                .config()
                .stream
                .backoff_min()
                .min(deadline.saturating_duration_since(Instant::now()))
        }
        Ok(Err(e)) => {
            store.demote(&format!("lease renewal failed: {}", e)).await;
            Duration::ZERO
        }
        Err(_) => {
            store
                .demote("lease renewal did not complete before the deadline")
                .await;
            Duration::ZERO
        }
    }
}

/// Try to take the lease, following the holder if someone else has it
pub(super) async fn seek_lease(store: &Store, backoff: &mut Backoff) -> Duration {
    let poll = store.config().node.lease_poll_interval();

    if !store.config().node.candidate {
        store.become_replica().await;
        return poll;
    }

    match store.leaser().acquire().await {
        Ok(lease) => {
            if store.role() == Role::Replica && !store.caught_up().await {
                tracing::info!(
                    "Acquired lease but {} has not caught up with the last primary; releasing",
                    store.node_id()
                );
                if let Err(e) = store.leaser().release(&lease).await {
                    tracing::debug!("Release failed: {}", e);
                }
                return backoff.next();
            }

            tracing::info!("Acquired {} lease", store.leaser().kind());
            match store.promote(lease.clone()).await {
                Ok(()) => {
                    backoff.reset();
                    Duration::ZERO
                }
                Err(e) => {
                    tracing::error!("Promotion failed: {}", e);
                    store.demote("promotion failed").await;
                    backoff.next()
                }
            }
        }
        Err(Error::LeaseHeld { holder }) => {
            tracing::debug!("Lease held by {}", holder);
            store.become_replica().await;
            backoff.reset();
            poll
        }
        Err(e) => {
            let delay = backoff.next();
            tracing::warn!("Lease acquisition failed: {} (retrying in {:?})", e, delay);
            delay
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows_and_caps() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_millis(400));

        let first = backoff.next();
        assert!(first >= Duration::from_millis(50) && first <= Duration::from_millis(100));

        backoff.next();
        backoff.next();
        for _ in 0..5 {
            assert!(backoff.next() <= Duration::from_millis(400));
        }

        backoff.reset();
        assert!(backoff.next() <= Duration::from_millis(100));
    }

    #[test]
    fn test_backoff_zero_min() {
        let mut backoff = Backoff::new(Duration::ZERO, Duration::ZERO);
        assert!(backoff.next() <= Duration::from_millis(1));
    }
}
