//! Replication Stream Protocol
//!
//! Defines the messages exchanged between a primary and its replicas.

use serde::{Deserialize, Serialize};

use crate::boundary::Page;
use crate::txlog::{Position, TxRecord};

/// A database position as seen by one side of the stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamPosition {
    pub database: String,
    pub position: Position,
    /// Chain checksum at `position`
    pub checksum: u32,
    /// Replica asks for a full snapshot regardless of position
    pub resync: bool,
}

/// Full page image of a database at a position
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub database: String,
    pub position: Position,
    /// Chain checksum at `position`
    pub checksum: u32,
    pub page_size: u32,
    /// Database size in pages
    pub commit: u32,
    pub pages: Vec<Page>,
}

/// Protocol messages for the replication stream
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    /// First message from a replica: where each database stands
    Subscribe {
        node_id: String,
        databases: Vec<StreamPosition>,
    },

    /// Primary high-water positions
    Heartbeat { positions: Vec<StreamPosition> },

    /// One committed transaction
    Record(TxRecord),

    /// The replica cannot continue incrementally; a snapshot follows
    ResyncRequired {
        database: String,
        requested: Position,
        retained_min: Position,
    },

    /// Full image, after which records continue from its position
    Snapshot(Snapshot),

    /// Replica applied positions
    Ack {
        node_id: String,
        positions: Vec<StreamPosition>,
    },

    /// Error response
    Error { code: ErrorCode, message: String },
}

/// Error codes for protocol errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    /// The node is not primary
    NotPrimary,
    /// Unexpected message
    ProtocolViolation,
}

impl Message {
    /// Serialize message to bytes
    pub fn serialize(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Deserialize message from bytes
    pub fn deserialize(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }

    /// Get the message type name (for logging)
    pub fn type_name(&self) -> &'static str {
        match self {
            Message::Subscribe { .. } => "Subscribe",
            Message::Heartbeat { .. } => "Heartbeat",
            Message::Record(_) => "Record",
            Message::ResyncRequired { .. } => "ResyncRequired",
            Message::Snapshot(_) => "Snapshot",
            Message::Ack { .. } => "Ack",
            Message::Error { .. } => "Error",
        }
    }
}

/// Frame header for length-prefixed messages
#[derive(Debug, Clone, Copy)]
pub struct FrameHeader {
    /// Message length
    pub length: u32,
    /// Message checksum
    pub checksum: u32,
}

impl FrameHeader {
    /// Header size in bytes
    pub const SIZE: usize = 8;

    /// Largest message body accepted from the wire
    pub const MAX_LENGTH: u32 = 512 * 1024 * 1024;

    /// Create a new frame header
    pub fn new(data: &[u8]) -> Self {
        Self {
            length: data.len() as u32,
            checksum: crc32fast::hash(data),
        }
    }

    /// Serialize header to bytes
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0..4].copy_from_slice(&self.length.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.checksum.to_le_bytes());
        bytes
    }

    /// Deserialize header from bytes
    pub fn from_bytes(bytes: &[u8; Self::SIZE]) -> Self {
        let [l0, l1, l2, l3, c0, c1, c2, c3] = *bytes;
        Self {
            length: u32::from_le_bytes([l0, l1, l2, l3]),
            checksum: u32::from_le_bytes([c0, c1, c2, c3]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::boundary::PageDiff;

    #[test]
    fn test_message_serialization() {
        let msg = Message::Subscribe {
            node_id: "node-2".to_string(),
            databases: vec![StreamPosition {
                database: "app.db".to_string(),
                position: 5,
                checksum: 77,
                resync: false,
            }],
        };

        let bytes = msg.serialize().unwrap();
        match Message::deserialize(&bytes).unwrap() {
            Message::Subscribe { node_id, databases } => {
                assert_eq!(node_id, "node-2");
                assert_eq!(databases[0].position, 5);
            }
            other => panic!("unexpected {}", other.type_name()),
        }
    }

    #[test]
    fn test_record_message() {
        let record = TxRecord::new(
            "app.db".into(),
            3,
            PageDiff::new(
                512,
                1,
                vec![Page {
                    pgno: 1,
                    data: vec![9; 512],
                }],
            ),
            42,
            "node-1".into(),
        );

        let bytes = Message::Record(record.clone()).serialize().unwrap();
        match Message::deserialize(&bytes).unwrap() {
            Message::Record(decoded) => {
                assert_eq!(decoded, record);
                assert!(decoded.verify().is_ok());
            }
            other => panic!("unexpected {}", other.type_name()),
        }
    }

    #[test]
    fn test_frame_header() {
        let data = b"test data";
        let header = FrameHeader::new(data);
        let restored = FrameHeader::from_bytes(&header.to_bytes());

        assert_eq!(header.length, restored.length);
        assert_eq!(header.checksum, restored.checksum);
    }
}
