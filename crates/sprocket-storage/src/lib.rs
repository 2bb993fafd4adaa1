//! Sprocket Storage
//!
//! SQLite-backed namespaced key-value snapshots.

use anyhow::Result;
use rusqlite::OptionalExtension;
use std::path::Path;

pub struct KvStore {
    conn: rusqlite::Connection,
}

impl KvStore {
    pub fn open<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = rusqlite::Connection::open(db_path.as_ref())?;

        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS snapshots (
                namespace TEXT NOT NULL,
                key TEXT NOT NULL,
                value BLOB NOT NULL,
                updated_at DATETIME DEFAULT CURRENT_TIMESTAMP,
                PRIMARY KEY (namespace, key)
            );
            ",
        )?;

        Ok(Self { conn })
    }

    pub fn get(&self, namespace: &str, key: &str) -> Result<Option<Vec<u8>>> {
        let mut stmt = self
            .conn
            .prepare("SELECT value FROM snapshots WHERE namespace = ?1 AND key = ?2")?;
        let value: Option<Vec<u8>> = stmt
            .query_row([namespace, key], |row| row.get(0))
            .optional()?;
        Ok(value)
    }

    pub fn put(&self, namespace: &str, key: &str, value: &[u8]) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO snapshots (namespace, key, value, updated_at)
             VALUES (?1, ?2, ?3, CURRENT_TIMESTAMP)",
            (namespace, key, value),
        )?;
        Ok(())
    }

    pub fn remove(&self, namespace: &str, key: &str) -> Result<()> {
        self.conn.execute(
            "DELETE FROM snapshots WHERE namespace = ?1 AND key = ?2",
            [namespace, key],
        )?;
        Ok(())
    }
}
