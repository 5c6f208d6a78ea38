//! SQLite-based state store for node agent.
//!
//! Every mutation is a single statement or a single transaction, so a crash
//! never leaves a half-written record.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use fleet_id::{BindingId, InstanceId, NodeId};
use fleet_messages::{BindingKey, Fields};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use thiserror::Error;
use tracing::debug;

use crate::process::LaunchSpec;

/// Errors from state store operations.
#[derive(Debug, Error)]
pub enum StateStoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("State not found: {0}")]
    NotFound(String),
}

/// A service instance owned by this node.
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceRecord {
    /// Instance ID.
    pub instance_id: InstanceId,
    /// Plan the instance was provisioned with.
    pub plan: String,
    /// Allocated port, for backends that listen on one.
    pub port: Option<u16>,
    /// Allocated memory in MB.
    pub memory_mb: u64,
    /// Backing process id, if the backend runs one.
    pub pid: Option<u32>,
    /// How to (re)start the backing process.
    pub launch: Option<LaunchSpec>,
    /// Connection fields returned to the provisioner.
    pub credentials: Fields,
    /// Working directory removed on unprovision.
    pub workdir: Option<PathBuf>,
    /// Created timestamp (Unix seconds).
    pub created_at: i64,
}

/// Per-application credentials for an instance.
#[derive(Debug, Clone, PartialEq)]
pub struct BindingRecord {
    pub binding_id: BindingId,
    pub instance_id: InstanceId,
    pub application_id: String,
    pub binding_options: String,
    pub credentials: Fields,
    pub created_at: i64,
}

impl BindingRecord {
    pub fn key(&self) -> BindingKey {
        BindingKey::new(self.instance_id, self.application_id.clone())
            .with_options(self.binding_options.clone())
    }
}

const INSTANCE_COLUMNS: &str =
    "instance_id, plan, port, memory_mb, pid, launch, credentials, workdir, created_at";

const BINDING_COLUMNS: &str =
    "binding_id, instance_id, application_id, binding_options, credentials, created_at";

/// SQLite state store.
pub struct StateStore {
    conn: Connection,
}

impl StateStore {
    /// Open or create a state store at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StateStoreError> {
        let conn = Connection::open(path)?;

        // Enable WAL mode for better concurrency
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        let store = Self { conn };
        store.init_schema()?;

        Ok(store)
    }

    /// Open an in-memory store (for testing).
    pub fn open_in_memory() -> Result<Self, StateStoreError> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn };
        store.init_schema()?;
        Ok(store)
    }

    /// Initialize database schema.
    fn init_schema(&self) -> Result<(), StateStoreError> {
        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS node_state (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                node_id TEXT
            );

            INSERT OR IGNORE INTO node_state (id) VALUES (1);

            CREATE TABLE IF NOT EXISTS instances (
                instance_id TEXT PRIMARY KEY,
                plan TEXT NOT NULL,
                port INTEGER UNIQUE,
                memory_mb INTEGER NOT NULL,
                pid INTEGER,
                launch TEXT,
                credentials TEXT NOT NULL,
                workdir TEXT,
                created_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS bindings (
                binding_id TEXT NOT NULL UNIQUE,
                instance_id TEXT NOT NULL,
                application_id TEXT NOT NULL,
                binding_options TEXT NOT NULL,
                credentials TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                PRIMARY KEY (instance_id, application_id, binding_options)
            );
            "#,
        )?;

        debug!("State store schema initialized");
        Ok(())
    }

    // =========================================================================
    // Node state
    // =========================================================================

    /// The persisted node id, if one was ever stored.
    pub fn node_id(&self) -> Result<Option<NodeId>, StateStoreError> {
        let raw: Option<String> =
            self.conn
                .query_row("SELECT node_id FROM node_state WHERE id = 1", [], |row| {
                    row.get(0)
                })?;

        raw.map(|s| {
            s.parse::<NodeId>()
                .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, Type::Text, Box::new(e)))
        })
        .transpose()
        .map_err(Into::into)
    }

    pub fn set_node_id(&self, node_id: &NodeId) -> Result<(), StateStoreError> {
        self.conn.execute(
            "UPDATE node_state SET node_id = ?1 WHERE id = 1",
            params![node_id.to_string()],
        )?;
        Ok(())
    }

    // =========================================================================
    // Instances
    // =========================================================================

    /// Insert a new instance record. Fails if the id or port is taken.
    pub fn insert_instance(&self, record: &InstanceRecord) -> Result<(), StateStoreError> {
        let launch = record
            .launch
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let credentials = serde_json::to_string(&record.credentials)?;
        let workdir = record
            .workdir
            .as_ref()
            .map(|p| p.to_string_lossy().into_owned());

        self.conn.execute(
            &format!(
                "INSERT INTO instances ({INSTANCE_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"
            ),
            params![
                record.instance_id.to_string(),
                record.plan,
                record.port,
                record.memory_mb as i64,
                record.pid,
                launch,
                credentials,
                workdir,
                record.created_at,
            ],
        )?;
        Ok(())
    }

    /// Get an instance record.
    pub fn get_instance(
        &self,
        instance_id: &InstanceId,
    ) -> Result<Option<InstanceRecord>, StateStoreError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {INSTANCE_COLUMNS} FROM instances WHERE instance_id = ?1"
        ))?;

        stmt.query_row(params![instance_id.to_string()], instance_from_row)
            .optional()
            .map_err(Into::into)
    }

    /// List all instances, oldest first.
    pub fn list_instances(&self) -> Result<Vec<InstanceRecord>, StateStoreError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {INSTANCE_COLUMNS} FROM instances ORDER BY created_at, instance_id"
        ))?;

        let records = stmt
            .query_map([], instance_from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(records)
    }

    /// Record a new backing process id.
    pub fn set_instance_pid(
        &self,
        instance_id: &InstanceId,
        pid: Option<u32>,
    ) -> Result<(), StateStoreError> {
        let updated = self.conn.execute(
            "UPDATE instances SET pid = ?1 WHERE instance_id = ?2",
            params![pid, instance_id.to_string()],
        )?;
        if updated == 0 {
            return Err(StateStoreError::NotFound(instance_id.to_string()));
        }
        Ok(())
    }

    /// Delete an instance and its bindings in one transaction. Returns
    /// `false` if no such instance existed.
    pub fn delete_instance(&self, instance_id: &InstanceId) -> Result<bool, StateStoreError> {
        let id = instance_id.to_string();
        let tx = self.conn.unchecked_transaction()?;
        tx.execute("DELETE FROM bindings WHERE instance_id = ?1", params![id])?;
        let deleted = tx.execute("DELETE FROM instances WHERE instance_id = ?1", params![id])?;
        tx.commit()?;
        Ok(deleted > 0)
    }

    pub fn instance_count(&self) -> Result<usize, StateStoreError> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM instances", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    // =========================================================================
    // Bindings
    // =========================================================================

    pub fn get_binding(&self, key: &BindingKey) -> Result<Option<BindingRecord>, StateStoreError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {BINDING_COLUMNS} FROM bindings
             WHERE instance_id = ?1 AND application_id = ?2 AND binding_options = ?3"
        ))?;

        stmt.query_row(
            params![
                key.instance_id.to_string(),
                key.application_id,
                key.binding_options
            ],
            binding_from_row,
        )
        .optional()
        .map_err(Into::into)
    }

    /// Insert a binding unless one already exists for the same key. Returns
    /// `true` if this record was stored.
    pub fn insert_binding(&self, record: &BindingRecord) -> Result<bool, StateStoreError> {
        let credentials = serde_json::to_string(&record.credentials)?;
        let inserted = self.conn.execute(
            &format!(
                "INSERT OR IGNORE INTO bindings ({BINDING_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6)"
            ),
            params![
                record.binding_id.to_string(),
                record.instance_id.to_string(),
                record.application_id,
                record.binding_options,
                credentials,
                record.created_at,
            ],
        )?;
        Ok(inserted > 0)
    }

    pub fn list_bindings(
        &self,
        instance_id: &InstanceId,
    ) -> Result<Vec<BindingRecord>, StateStoreError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {BINDING_COLUMNS} FROM bindings WHERE instance_id = ?1 ORDER BY created_at"
        ))?;

        let records = stmt
            .query_map(params![instance_id.to_string()], binding_from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(records)
    }

    /// Delete a binding. Returns `false` if it did not exist.
    pub fn delete_binding(&self, key: &BindingKey) -> Result<bool, StateStoreError> {
        let deleted = self.conn.execute(
            "DELETE FROM bindings
             WHERE instance_id = ?1 AND application_id = ?2 AND binding_options = ?3",
            params![
                key.instance_id.to_string(),
                key.application_id,
                key.binding_options
            ],
        )?;
        Ok(deleted > 0)
    }
}

// =============================================================================
// Row mapping
// =============================================================================

fn parsed<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw: String = row.get(idx)?;
    raw.parse()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn json<T: serde::de::DeserializeOwned>(raw: &str, idx: usize) -> rusqlite::Result<T> {
    serde_json::from_str(raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn instance_from_row(row: &Row<'_>) -> rusqlite::Result<InstanceRecord> {
    let launch: Option<String> = row.get(5)?;
    let credentials: String = row.get(6)?;
    let workdir: Option<String> = row.get(7)?;
    let memory_mb: i64 = row.get(3)?;

    Ok(InstanceRecord {
        instance_id: parsed(row, 0)?,
        plan: row.get(1)?,
        port: row.get(2)?,
        memory_mb: memory_mb.max(0) as u64,
        pid: row.get(4)?,
        launch: launch.as_deref().map(|raw| json(raw, 5)).transpose()?,
        credentials: json(&credentials, 6)?,
        workdir: workdir.map(PathBuf::from),
        created_at: row.get(8)?,
    })
}

fn binding_from_row(row: &Row<'_>) -> rusqlite::Result<BindingRecord> {
    let credentials: String = row.get(4)?;

    Ok(BindingRecord {
        binding_id: parsed(row, 0)?,
        instance_id: parsed(row, 1)?,
        application_id: row.get(2)?,
        binding_options: row.get(3)?,
        credentials: json(&credentials, 4)?,
        created_at: row.get(5)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(port: Option<u16>) -> InstanceRecord {
        let mut credentials = Fields::new();
        credentials.insert("password".to_string(), json!("s3cret"));
        InstanceRecord {
            instance_id: InstanceId::new(),
            plan: "free".to_string(),
            port,
            memory_mb: 256,
            pid: Some(4242),
            launch: Some(LaunchSpec::new("kv-server").arg("--port").arg("15000")),
            credentials,
            workdir: Some(PathBuf::from("/var/lib/fleet/instances/x")),
            created_at: 1000,
        }
    }

    fn binding(instance_id: InstanceId, app: &str) -> BindingRecord {
        let mut credentials = Fields::new();
        credentials.insert("username".to_string(), json!(app));
        BindingRecord {
            binding_id: BindingId::new(),
            instance_id,
            application_id: app.to_string(),
            binding_options: "all".to_string(),
            credentials,
            created_at: 1000,
        }
    }

    #[test]
    fn test_node_id_persists() {
        let store = StateStore::open_in_memory().unwrap();
        assert_eq!(store.node_id().unwrap(), None);

        let id = NodeId::new();
        store.set_node_id(&id).unwrap();
        assert_eq!(store.node_id().unwrap(), Some(id));
    }

    #[test]
    fn test_instance_lifecycle() {
        let store = StateStore::open_in_memory().unwrap();
        let record = record(Some(15000));

        store.insert_instance(&record).unwrap();
        assert_eq!(
            store.get_instance(&record.instance_id).unwrap(),
            Some(record.clone())
        );

        store
            .set_instance_pid(&record.instance_id, Some(5151))
            .unwrap();
        let fetched = store.get_instance(&record.instance_id).unwrap().unwrap();
        assert_eq!(fetched.pid, Some(5151));

        assert_eq!(store.list_instances().unwrap().len(), 1);
        assert!(store.delete_instance(&record.instance_id).unwrap());
        assert!(!store.delete_instance(&record.instance_id).unwrap());
        assert_eq!(store.instance_count().unwrap(), 0);
    }

    #[test]
    fn test_port_unique_among_instances() {
        let store = StateStore::open_in_memory().unwrap();
        store.insert_instance(&record(Some(15000))).unwrap();

        assert!(store.insert_instance(&record(Some(15000))).is_err());
        // Portless instances do not collide.
        store.insert_instance(&record(None)).unwrap();
        store.insert_instance(&record(None)).unwrap();
        assert_eq!(store.instance_count().unwrap(), 3);
    }

    #[test]
    fn test_set_pid_of_missing_instance() {
        let store = StateStore::open_in_memory().unwrap();
        let err = store
            .set_instance_pid(&InstanceId::new(), Some(1))
            .unwrap_err();
        assert!(matches!(err, StateStoreError::NotFound(_)));
    }

    #[test]
    fn test_binding_insert_is_idempotent() {
        let store = StateStore::open_in_memory().unwrap();
        let instance = record(Some(15000));
        store.insert_instance(&instance).unwrap();

        let first = binding(instance.instance_id, "app-1");
        let second = binding(instance.instance_id, "app-1");
        assert!(store.insert_binding(&first).unwrap());
        assert!(!store.insert_binding(&second).unwrap());

        assert_eq!(store.get_binding(&first.key()).unwrap(), Some(first.clone()));
        assert_eq!(store.list_bindings(&instance.instance_id).unwrap(), vec![first]);
    }

    #[test]
    fn test_binding_options_distinguish_bindings() {
        let store = StateStore::open_in_memory().unwrap();
        let instance_id = InstanceId::new();

        let all = binding(instance_id, "app-1");
        let mut read_only = binding(instance_id, "app-1");
        read_only.binding_options = "read".to_string();

        assert!(store.insert_binding(&all).unwrap());
        assert!(store.insert_binding(&read_only).unwrap());
        assert!(store.delete_binding(&read_only.key()).unwrap());
        assert!(store.get_binding(&all.key()).unwrap().is_some());
    }

    #[test]
    fn test_delete_instance_removes_bindings() {
        let store = StateStore::open_in_memory().unwrap();
        let instance = record(None);
        store.insert_instance(&instance).unwrap();
        store
            .insert_binding(&binding(instance.instance_id, "app-1"))
            .unwrap();
        store
            .insert_binding(&binding(instance.instance_id, "app-2"))
            .unwrap();

        store.delete_instance(&instance.instance_id).unwrap();
        assert!(store.list_bindings(&instance.instance_id).unwrap().is_empty());
    }

    #[test]
    fn test_records_survive_reopen() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("state.db");
        let instance = record(Some(15001));

        {
            let store = StateStore::open(&path).unwrap();
            store.insert_instance(&instance).unwrap();
        }

        let store = StateStore::open(&path).unwrap();
        assert_eq!(store.list_instances().unwrap(), vec![instance]);
    }
}
