//! Replica Follower
//!
//! Streams records from the lease holder and applies them strictly in order.
//! Any error drops the connection; the follower backs off, resolves the
//! primary again through the leaser and resubscribes from what it has applied.

use tokio_util::sync::CancellationToken;

use super::monitor::Backoff;
use super::Store;
use crate::error::{Error, Result};
use crate::stream::{Message, StreamClient};

pub(super) async fn run(store: Store, token: CancellationToken) {
    let stream = &store.config().stream;
    let mut backoff = Backoff::new(stream.backoff_min(), stream.backoff_max());

    while !token.is_cancelled() {
        match follow(&store, &token, &mut backoff).await {
            Ok(()) => {}
            Err(e) if e.requires_resync() => {
                tracing::info!("Reconnecting to resync: {}", e);
            }
            Err(e) => {
                tracing::warn!("Replication stream failed: {}", e);
            }
        }

        let delay = backoff.next();
        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    tracing::debug!("Replica follower stopped for {}", store.node_id());
}

/// Follow the current primary until the stream ends or fails.
///
/// Only the wait for the next message is cancellable; a record being
/// applied always completes.
async fn follow(store: &Store, token: &CancellationToken, backoff: &mut Backoff) -> Result<()> {
    let info = store.leaser().primary_info().await?.ok_or(Error::NoPrimary)?;
    if info.hostname == store.node_id() {
        return Err(Error::NoPrimary);
    }
    store.set_primary_info(Some(info.clone())).await;

    let config = &store.config().stream;
    let mut conn = StreamClient::connect(&info.advertise_addr, config.connect_timeout()).await?;

    let positions = store.stream_positions().await;
    conn.send(&Message::Subscribe {
        node_id: store.node_id().to_string(),
        databases: positions,
    })
    .await?;

    tracing::info!(
        "Following primary {} at {}",
        info.hostname,
        info.advertise_addr
    );

    loop {
        let message = tokio::select! {
            _ = token.cancelled() => return Ok(()),
            message = conn.recv(config.heartbeat_timeout()) => message?,
        };

        match message {
            Message::Heartbeat { positions } => {
                store.record_high_water(&positions).await;
                backoff.reset();

                let applied = store.stream_positions().await;
                conn.send(&Message::Ack {
                    node_id: store.node_id().to_string(),
                    positions: applied,
                })
                .await?;

                check_ready(store).await;
            }
            Message::Record(record) => {
                tracing::trace!("Applying {} position {}", record.database, record.position);
                store.apply_record(record).await?;
                check_ready(store).await;
            }
            Message::ResyncRequired {
                database,
                requested,
                retained_min,
            } => {
                tracing::info!(
                    "Primary requires resync of {} (requested {}, retained from {})",
                    database,
                    requested,
                    retained_min
                );
            }
            Message::Snapshot(snapshot) => {
                store.apply_snapshot(snapshot).await?;
                check_ready(store).await;
            }
            Message::Error { code, message } => {
                return Err(Error::Replication(format!(
                    "primary refused stream ({:?}): {}",
                    code, message
                )));
            }
            other => {
                return Err(Error::Replication(format!(
                    "unexpected {} from primary",
                    other.type_name()
                )));
            }
        }
    }
}

/// Readiness needs at least one heartbeat to measure against
async fn check_ready(store: &Store) {
    if store.ready() || store.inner.high_water.lock().await.is_none() {
        return;
    }
    if store.caught_up().await {
        tracing::info!("Replica {} caught up with primary", store.node_id());
        store.set_ready(true);
    }
}
