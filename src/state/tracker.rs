//! State Tracker
//!
//! Persistent storage for node state, tracking which log position each
//! database's page image has applied.

use rusqlite::{params, Connection};
use std::path::PathBuf;
use tokio::sync::Mutex;

use crate::error::{Error, Result};
use crate::txlog::Position;

/// What a database's page image reflects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AppliedState {
    /// Last log position written into the image
    pub position: Position,
    /// Chain checksum at that position
    pub chain: u32,
    /// Page size of the image (0 while empty)
    pub page_size: u32,
}

/// Persistent state tracker backed by SQLite
pub struct StateTracker {
    /// Database connection
    conn: Mutex<Connection>,
    /// Node ID
    node_id: String,
}

impl StateTracker {
    /// Create or open the state tracker database
    pub fn new(data_dir: PathBuf, node_id: String) -> Result<Self> {
        std::fs::create_dir_all(&data_dir)?;

        let db_path = data_dir.join("state.db");
        let conn = Connection::open(&db_path)?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS node_state (
                key TEXT PRIMARY KEY,
                value_int INTEGER,
                value_text TEXT,
                updated_at TEXT DEFAULT CURRENT_TIMESTAMP
            );

            CREATE TABLE IF NOT EXISTS applied_positions (
                database TEXT PRIMARY KEY,
                position INTEGER NOT NULL,
                chain INTEGER NOT NULL,
                page_size INTEGER NOT NULL,
                updated_at TEXT DEFAULT CURRENT_TIMESTAMP
            );
            "#,
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
            node_id,
        })
    }

    /// Get the applied state of a database's image
    pub async fn applied(&self, database: &str) -> Result<Option<AppliedState>> {
        let conn = self.conn.lock().await;
        let result = conn.query_row(
            "SELECT position, chain, page_size FROM applied_positions WHERE database = ?1",
            params![database],
            |row| {
                Ok(AppliedState {
                    position: row.get::<_, i64>(0)? as Position,
                    chain: row.get::<_, i64>(1)? as u32,
                    page_size: row.get::<_, i64>(2)? as u32,
                })
            },
        );

        match result {
            Ok(state) => Ok(Some(state)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(Error::State(format!("Failed to get applied position: {}", e))),
        }
    }

    /// Record the applied state of a database's image
    pub async fn set_applied(&self, database: &str, state: AppliedState) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            r#"
            INSERT INTO applied_positions (database, position, chain, page_size)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(database) DO UPDATE SET
                position = ?2,
                chain = ?3,
                page_size = ?4,
                updated_at = CURRENT_TIMESTAMP
            "#,
            params![
                database,
                state.position as i64,
                state.chain as i64,
                state.page_size as i64
            ],
        )?;
        Ok(())
    }

    /// Get the applied state of every known database
    pub async fn all_applied(&self) -> Result<Vec<(String, AppliedState)>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT database, position, chain, page_size FROM applied_positions ORDER BY database",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                AppliedState {
                    position: row.get::<_, i64>(1)? as Position,
                    chain: row.get::<_, i64>(2)? as u32,
                    page_size: row.get::<_, i64>(3)? as u32,
                },
            ))
        })?;

        let mut states = Vec::new();
        for result in rows {
            states.push(result?);
        }

        Ok(states)
    }

    /// Record the role this node last held
    pub async fn set_last_role(&self, role: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            r#"
            INSERT INTO node_state (key, value_text) VALUES ('last_role', ?1)
            ON CONFLICT(key) DO UPDATE SET value_text = ?1, updated_at = CURRENT_TIMESTAMP
            "#,
            params![role],
        )?;
        Ok(())
    }

    /// Get the role this node last held
    pub async fn last_role(&self) -> Result<Option<String>> {
        let conn = self.conn.lock().await;
        let result: std::result::Result<String, _> = conn.query_row(
            "SELECT value_text FROM node_state WHERE key = 'last_role'",
            [],
            |row| row.get(0),
        );

        match result {
            Ok(role) => Ok(Some(role)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(Error::State(format!("Failed to get last role: {}", e))),
        }
    }

    /// Get node ID
    pub fn node_id(&self) -> &str {
        &self.node_id
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::State(format!("SQLite error: {}", e))
    }
}
