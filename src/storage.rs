// SQLite persistence for connections, feature bindings and refresh material

use anyhow::Context;
use rusqlite::{params, OptionalExtension};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Mutex;

use crate::auth::{token_key, CredentialStore, RefreshMaterial};
use crate::connection::{Connection, ConnectionId, ConnectionKind, FeatureId};
use crate::error::Result;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS auth_kv (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS connections (
    id     TEXT PRIMARY KEY,
    label  TEXT NOT NULL,
    kind   TEXT NOT NULL,
    scopes TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS feature_bindings (
    feature       TEXT PRIMARY KEY,
    connection_id TEXT NOT NULL
);
"#;

/// SQLite-backed store
pub struct SqliteStore {
    conn: Mutex<rusqlite::Connection>,
}

impl SqliteStore {
    /// Open (creating if needed) the database at `path`
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let conn = rusqlite::Connection::open(path)
            .with_context(|| format!("Failed to open SQLite database: {}", path.display()))?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> anyhow::Result<Self> {
        let conn = rusqlite::Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        Self::init(conn)
    }

    fn init(conn: rusqlite::Connection) -> anyhow::Result<Self> {
        conn.execute_batch(SCHEMA)
            .context("Failed to initialize credential database schema")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, rusqlite::Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn load_connections(&self) -> Result<Vec<Connection>> {
        let conn = self.lock();
        let mut stmt = conn.prepare("SELECT id, label, kind, scopes FROM connections ORDER BY id")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?;

        let mut connections = Vec::new();
        for row in rows {
            let (id, label, kind, scopes) = row?;
            let kind: ConnectionKind = serde_json::from_str(&kind)?;
            let scopes: BTreeSet<String> = serde_json::from_str(&scopes)?;
            connections.push(Connection {
                id: ConnectionId::new(id),
                label,
                kind,
                scopes,
            });
        }
        Ok(connections)
    }

    /// Replace all stored connections with `connections`
    pub fn save_connections(&self, connections: &[Connection]) -> Result<()> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM connections", [])?;
        for c in connections {
            tx.execute(
                "INSERT INTO connections (id, label, kind, scopes) VALUES (?1, ?2, ?3, ?4)",
                params![
                    c.id.as_str(),
                    c.label,
                    serde_json::to_string(&c.kind)?,
                    serde_json::to_string(&c.scopes)?
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn load_bindings(&self) -> Result<Vec<(FeatureId, ConnectionId)>> {
        let conn = self.lock();
        let mut stmt = conn.prepare("SELECT feature, connection_id FROM feature_bindings ORDER BY feature")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                FeatureId::new(row.get::<_, String>(0)?),
                ConnectionId::new(row.get::<_, String>(1)?),
            ))
        })?;
        let bindings = rows.collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(bindings)
    }

    /// Replace all stored feature bindings
    pub fn save_bindings(&self, bindings: &[(FeatureId, ConnectionId)]) -> Result<()> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM feature_bindings", [])?;
        for (feature, connection_id) in bindings {
            tx.execute(
                "INSERT INTO feature_bindings (feature, connection_id) VALUES (?1, ?2)",
                params![feature.as_str(), connection_id.as_str()],
            )?;
        }
        tx.commit()?;
        Ok(())
    }
}

impl CredentialStore for SqliteStore {
    fn get(&self, id: &ConnectionId) -> Result<Option<RefreshMaterial>> {
        let conn = self.lock();
        let value: Option<String> = conn
            .query_row("SELECT value FROM auth_kv WHERE key = ?", [token_key(id)], |row| row.get(0))
            .optional()?;
        match value {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    fn put(&self, id: &ConnectionId, material: &RefreshMaterial) -> Result<()> {
        let json = serde_json::to_string(material)?;
        let conn = self.lock();
        conn.execute(
            "INSERT OR REPLACE INTO auth_kv (key, value) VALUES (?1, ?2)",
            params![token_key(id), json],
        )?;
        Ok(())
    }

    fn remove(&self, id: &ConnectionId) -> Result<bool> {
        let conn = self.lock();
        let deleted = conn.execute("DELETE FROM auth_kv WHERE key = ?", [token_key(id)])?;
        Ok(deleted > 0)
    }
}
