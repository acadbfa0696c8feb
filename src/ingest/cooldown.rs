use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::Path;

use crate::{from_epoch_ms, to_epoch_ms};

/// Per-site "last accepted" timestamps, the only mutable ingestion state.
pub trait CooldownStore: Send {
    fn last_accepted(&mut self, site_id: &str) -> Result<Option<DateTime<Utc>>>;

    fn record_accepted(&mut self, site_id: &str, at: DateTime<Utc>) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct InMemoryCooldownStore {
    last: HashMap<String, DateTime<Utc>>,
}

impl InMemoryCooldownStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CooldownStore for InMemoryCooldownStore {
    fn last_accepted(&mut self, site_id: &str) -> Result<Option<DateTime<Utc>>> {
        Ok(self.last.get(site_id).copied())
    }

    fn record_accepted(&mut self, site_id: &str, at: DateTime<Utc>) -> Result<()> {
        self.last.insert(site_id.to_string(), at);
        Ok(())
    }
}

/// SQLite-backed store so a restart inside the window does not re-trigger.
pub struct SqliteCooldownStore {
    conn: Connection,
}

impl SqliteCooldownStore {
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(db_path.as_ref())?;
        let mut store = Self { conn };
        store.ensure_schema()?;
        Ok(store)
    }

    fn ensure_schema(&mut self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;

            CREATE TABLE IF NOT EXISTS site_cooldowns (
              site_id TEXT PRIMARY KEY,
              last_accepted_ms INTEGER NOT NULL
            );
            "#,
        )?;
        Ok(())
    }
}

impl CooldownStore for SqliteCooldownStore {
    fn last_accepted(&mut self, site_id: &str) -> Result<Option<DateTime<Utc>>> {
        let ms: Option<i64> = self
            .conn
            .query_row(
                "SELECT last_accepted_ms FROM site_cooldowns WHERE site_id = ?1",
                params![site_id],
                |row| row.get(0),
            )
            .optional()?;
        match ms {
            Some(ms) => from_epoch_ms(ms)
                .map(Some)
                .ok_or_else(|| anyhow!("corrupt cooldown row for {}: {}", site_id, ms)),
            None => Ok(None),
        }
    }

    fn record_accepted(&mut self, site_id: &str, at: DateTime<Utc>) -> Result<()> {
        self.conn.execute(
            "INSERT INTO site_cooldowns (site_id, last_accepted_ms) VALUES (?1, ?2)
             ON CONFLICT(site_id) DO UPDATE SET last_accepted_ms = excluded.last_accepted_ms",
            params![site_id, to_epoch_ms(at)],
        )?;
        Ok(())
    }
}
