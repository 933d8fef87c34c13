//! Stream Client
//!
//! Replica side of the replication stream: a single long-lived connection to
//! the primary.

use std::time::Duration;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;

use super::{read_message, write_message, Message};
use crate::error::{Error, Result};

pub struct StreamClient;

impl StreamClient {
    /// Connect to a primary's stream address
    pub async fn connect(address: &str, connect_timeout: Duration) -> Result<StreamConnection> {
        let result = timeout(connect_timeout, TcpStream::connect(address)).await;

        match result {
            Ok(Ok(stream)) => {
                stream.set_nodelay(true)?;
                let (reader, writer) = stream.into_split();
                Ok(StreamConnection {
                    address: address.to_string(),
                    reader,
                    writer,
                })
            }
            Ok(Err(e)) => Err(Error::ConnectionFailed {
                address: address.to_string(),
                reason: e.to_string(),
            }),
            Err(_) => Err(Error::ConnectionTimeout(address.to_string())),
        }
    }
}

/// An open stream connection
pub struct StreamConnection {
    address: String,
    reader: OwnedReadHalf,
    writer: OwnedWriteHalf,
}

impl StreamConnection {
    pub async fn send(&mut self, message: &Message) -> Result<()> {
        write_message(&mut self.writer, message).await
    }

    /// Receive the next message, failing if none arrives within `idle`
    pub async fn recv(&mut self, idle: Duration) -> Result<Message> {
        match timeout(idle, read_message(&mut self.reader)).await {
            Ok(result) => result,
            Err(_) => Err(Error::ConnectionTimeout(self.address.clone())),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }
}
