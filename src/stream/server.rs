//! Stream Server
//!
//! Primary side of the replication stream. Each subscribed replica gets its
//! own task that reads records back from the log on disk, so a slow replica
//! never holds up commits. Every session belongs to the primary term it was
//! opened in and ends when that term is cancelled.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Instant;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use super::{read_message, write_message, ErrorCode, Message, StreamPosition};
use crate::error::{Error, Result};
use crate::store::{Database, Store};
use crate::txlog::{LogReader, Position};

/// Replication stream server
pub struct StreamServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    store: Store,
}

impl StreamServer {
    /// Serve on an already bound listener
    pub fn from_listener(listener: TcpListener, store: Store) -> Result<Self> {
        let local_addr = listener.local_addr()?;
        Ok(Self {
            listener,
            local_addr,
            store,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept replicas until `shutdown` is cancelled
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        tracing::info!("Stream server listening on {}", self.local_addr);

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((socket, addr)) => {
                            let peer_addr = addr.to_string();
                            let store = self.store.clone();

                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(socket, peer_addr.clone(), store).await {
                                    tracing::warn!("Stream to {} ended: {}", peer_addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown.cancelled() => break,
            }
        }

        tracing::info!("Stream server stopped");
        Ok(())
    }
}

/// Handle a single replica connection
async fn handle_connection(socket: TcpStream, peer_addr: String, store: Store) -> Result<()> {
    socket.set_nodelay(true)?;
    let (mut reader, mut writer) = socket.into_split();

    let Some(term) = store.primary_token().await else {
        let refusal = Message::Error {
            code: ErrorCode::NotPrimary,
            message: format!("{} is not primary", store.node_id()),
        };
        write_message(&mut writer, &refusal).await?;
        return Ok(());
    };

    let connect_timeout = store.config().stream.connect_timeout();
    let first = match timeout(connect_timeout, read_message(&mut reader)).await {
        Ok(message) => message?,
        Err(_) => return Err(Error::ConnectionTimeout(peer_addr)),
    };

    let (node_id, requested) = match first {
        Message::Subscribe { node_id, databases } => (node_id, databases),
        other => {
            let violation = Message::Error {
                code: ErrorCode::ProtocolViolation,
                message: format!("expected Subscribe, got {}", other.type_name()),
            };
            write_message(&mut writer, &violation).await?;
            return Err(Error::Replication(format!(
                "{} opened with {}",
                peer_addr,
                other.type_name()
            )));
        }
    };

    let registry = store.registry();
    registry.connect(&node_id, &peer_addr, &requested).await;

    let session = term.child_token();
    let acks = tokio::spawn(read_acks(reader, node_id.clone(), store.clone(), session.clone()));

    let mut stream = ReplicaSession::new(store, node_id.clone(), writer, session.clone(), requested);
    let result = stream.run().await;

    session.cancel();
    let _ = acks.await;
    registry.disconnect(&node_id).await;

    match result {
        Err(Error::Cancelled) => Ok(()),
        other => other,
    }
}

/// Read acknowledgments until the replica goes away
async fn read_acks(mut reader: OwnedReadHalf, node_id: String, store: Store, session: CancellationToken) {
    let registry = store.registry();

    loop {
        let message = tokio::select! {
            _ = session.cancelled() => break,
            message = read_message(&mut reader) => message,
        };

        match message {
            Ok(Message::Ack { positions, .. }) => registry.record_ack(&node_id, &positions).await,
            Ok(other) => {
                tracing::warn!("Unexpected {} from replica {}", other.type_name(), node_id);
                break;
            }
            Err(Error::Io(ref e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => {
                tracing::warn!("Error reading from replica {}: {}", node_id, e);
                break;
            }
        }
    }

    session.cancel();
}

/// Outbound half of one replica's stream
struct ReplicaSession {
    store: Store,
    node_id: String,
    writer: OwnedWriteHalf,
    session: CancellationToken,
    /// Positions the replica subscribed with, until its database is first seen
    requested: HashMap<String, StreamPosition>,
    /// Last position sent per database
    cursors: HashMap<String, Position>,
    readers: HashMap<String, LogReader>,
}

impl ReplicaSession {
    fn new(
        store: Store,
        node_id: String,
        writer: OwnedWriteHalf,
        session: CancellationToken,
        requested: Vec<StreamPosition>,
    ) -> Self {
        Self {
            store,
            node_id,
            writer,
            session,
            requested: requested
                .into_iter()
                .map(|p| (p.database.clone(), p))
                .collect(),
            cursors: HashMap::new(),
            readers: HashMap::new(),
        }
    }

    async fn run(&mut self) -> Result<()> {
        let stream = self.store.config().stream.clone();
        let mut commits = self.store.subscribe_commits();

        for database in self.requested.keys() {
            if self.store.database(database).await.is_none() {
                tracing::warn!(
                    "Replica {} subscribed to {} which does not exist here",
                    self.node_id,
                    database
                );
            }
        }

        self.send_heartbeat().await?;
        let mut last_heartbeat = Instant::now();

        loop {
            commits.borrow_and_update();

            let mut sent = 0;
            for db in self.store.databases().await {
                sent += self.send_pending(&db, stream.max_batch_entries).await?;
            }

            if last_heartbeat.elapsed() >= stream.heartbeat_interval() {
                self.send_heartbeat().await?;
                last_heartbeat = Instant::now();
            }

            if sent > 0 {
                continue;
            }

            let next_heartbeat = last_heartbeat + stream.heartbeat_interval();
            tokio::select! {
                _ = self.session.cancelled() => return Err(Error::Cancelled),
                changed = commits.changed() => {
                    if changed.is_err() {
                        return Err(Error::ShuttingDown);
                    }
                }
                _ = tokio::time::sleep_until(next_heartbeat.into()) => {}
            }
        }
    }

    /// Send up to `max` records of `db` the replica has not seen yet
    async fn send_pending(&mut self, db: &Database, max: usize) -> Result<usize> {
        let name = db.name().to_string();
        let tip = db.tip();

        let cursor = match self.cursors.get(&name) {
            Some(cursor) => *cursor,
            None => {
                let start = self.resolve_start(db).await?;
                self.cursors.insert(name.clone(), start);
                start
            }
        };
        if cursor >= tip.position {
            return Ok(0);
        }

        let batch = {
            let reader = match self.readers.entry(name.clone()) {
                Entry::Occupied(entry) => entry.into_mut(),
                Entry::Vacant(entry) => entry.insert(db.reader()?),
            };
            reader.read_batch(cursor + 1, tip.position, max)
        };

        match batch {
            Ok(records) => {
                let count = records.len();
                for record in records {
                    let position = record.position;
                    self.send(&Message::Record(record)).await?;
                    self.cursors.insert(name.clone(), position);
                }
                Ok(count)
            }
            Err(Error::PositionExpired { retained_min, .. }) => {
                let position = self.resync(db, cursor, retained_min).await?;
                self.cursors.insert(name, position);
                Ok(1)
            }
            Err(e) => Err(e),
        }
    }

    /// Where to start streaming a database the session has not touched yet
    async fn resolve_start(&mut self, db: &Database) -> Result<Position> {
        let Some(requested) = self.requested.remove(db.name()) else {
            return Ok(0);
        };
        let tip = db.tip();

        let reason = if requested.resync {
            Some("replica asked for a snapshot")
        } else if requested.position > tip.position {
            Some("replica is ahead of the primary")
        } else if requested.position == 0 {
            None
        } else {
            let mut reader = db.reader()?;
            match reader.chain_at(requested.position)? {
                Some(chain) if chain == requested.checksum => None,
                Some(_) => Some("replica history diverges"),
                None => Some("position no longer retained"),
            }
        };

        let Some(reason) = reason else {
            return Ok(requested.position);
        };

        tracing::info!(
            "Resyncing {} on {} from position {}: {}",
            db.name(),
            self.node_id,
            requested.position,
            reason
        );
        let retained_min = db.reader()?.retained_min(tip.position)?;
        self.resync(db, requested.position, retained_min).await
    }

    /// Send a full snapshot; records continue after its position
    async fn resync(&mut self, db: &Database, requested: Position, retained_min: Position) -> Result<Position> {
        self.send(&Message::ResyncRequired {
            database: db.name().to_string(),
            requested,
            retained_min,
        })
        .await?;

        let snapshot = db.snapshot().await?;
        let position = snapshot.position;
        tracing::info!(
            "Sending snapshot of {} at position {} to {}",
            db.name(),
            position,
            self.node_id
        );
        self.send(&Message::Snapshot(snapshot)).await?;
        Ok(position)
    }

    async fn send_heartbeat(&mut self) -> Result<()> {
        let positions = self
            .store
            .databases()
            .await
            .iter()
            .map(|db| {
                let tip = db.tip();
                StreamPosition {
                    database: db.name().to_string(),
                    position: tip.position,
                    checksum: tip.chain,
                    resync: false,
                }
            })
            .collect();

        self.send(&Message::Heartbeat { positions }).await
    }

    /// Write a message unless the session is cancelled first
    async fn send(&mut self, message: &Message) -> Result<()> {
        tokio::select! {
            _ = self.session.cancelled() => Err(Error::Cancelled),
            result = write_message(&mut self.writer, message) => result,
        }
    }
}
