//! Durable storage for sequence/trigger-script libraries and device
//! aliases (spec.md §4.9), grounded on the corpus's `Db` wrapper around a
//! single `rusqlite::Connection` with WAL pragmas and an embedded schema.

use std::path::Path;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use rusqlite::{params, Connection, OptionalExtension};
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;

use bench_core::sequence::SequenceDefinition;
use bench_core::trigger::TriggerScript;

const SCHEMA_SQL: &str = include_str!("storage/schema.sql");

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("serialization: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("not found: {0}")]
    NotFound(String),
}

pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_millis() as i64
}

/// Uniform interface over a durable library of records keyed by `id`
/// (spec.md §4.9). `save` assigns a fresh id and timestamps; `update`
/// preserves `id`/`created_at` and refreshes `updated_at`.
pub trait Library<T> {
    fn list(&self) -> Result<Vec<T>, PersistenceError>;
    fn get(&self, id: &str) -> Result<Option<T>, PersistenceError>;
    fn save(&self, definition: T) -> Result<String, PersistenceError>;
    fn update(&self, definition: T) -> Result<(), PersistenceError>;
    fn delete(&self, id: &str) -> Result<(), PersistenceError>;
}

pub struct Db {
    conn: Mutex<Connection>,
}

impl Db {
    pub fn open(path: &Path) -> Result<Self, PersistenceError> {
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, PersistenceError> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self, PersistenceError> {
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL; PRAGMA foreign_keys=ON;")?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Db { conn: Mutex::new(conn) })
    }
}

fn document_library<'a, T>(db: &'a Db, table: &'static str) -> DocumentLibrary<'a, T> {
    DocumentLibrary {
        db,
        table,
        _marker: std::marker::PhantomData,
    }
}

/// Generic JSON-document-backed `Library<T>` shared by the sequence and
/// trigger-script stores: the full record is serialized into one `document`
/// column, with `id`/`created_at`/`updated_at` promoted to real columns so
/// listing and ordering don't require deserializing every row.
struct DocumentLibrary<'a, T> {
    db: &'a Db,
    table: &'static str,
    _marker: std::marker::PhantomData<T>,
}

impl<'a, T> DocumentLibrary<'a, T>
where
    T: Serialize + DeserializeOwned + Clone + HasId,
{
    fn list(&self) -> Result<Vec<T>, PersistenceError> {
        let conn = self.db.conn.lock().expect("db mutex poisoned");
        let sql = format!("SELECT document FROM {} ORDER BY created_at", self.table);
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(serde_json::from_str(&row?)?);
        }
        Ok(out)
    }

    fn get(&self, id: &str) -> Result<Option<T>, PersistenceError> {
        let conn = self.db.conn.lock().expect("db mutex poisoned");
        let sql = format!("SELECT document FROM {} WHERE id = ?1", self.table);
        let doc: Option<String> = conn.query_row(&sql, params![id], |row| row.get(0)).optional()?;
        Ok(doc.map(|d| serde_json::from_str(&d)).transpose()?)
    }

    fn save(&self, mut definition: T) -> Result<String, PersistenceError> {
        let now = now_ms();
        definition.set_id(uuid::Uuid::new_v4().to_string());
        definition.set_timestamps(now, now);
        let id = definition.id().to_owned();
        let doc = serde_json::to_string(&definition)?;
        let conn = self.db.conn.lock().expect("db mutex poisoned");
        let sql = format!(
            "INSERT INTO {} (id, document, created_at, updated_at) VALUES (?1, ?2, ?3, ?3)",
            self.table
        );
        conn.execute(&sql, params![id, doc, now])?;
        Ok(id)
    }

    fn update(&self, mut definition: T) -> Result<(), PersistenceError> {
        let id = definition.id().to_owned();
        let existing = self.get(&id)?.ok_or_else(|| PersistenceError::NotFound(id.clone()))?;
        let now = now_ms();
        definition.set_timestamps(existing.created_at(), now);
        let doc = serde_json::to_string(&definition)?;
        let conn = self.db.conn.lock().expect("db mutex poisoned");
        let sql = format!("UPDATE {} SET document = ?1, updated_at = ?2 WHERE id = ?3", self.table);
        let changed = conn.execute(&sql, params![doc, now, id])?;
        if changed == 0 {
            return Err(PersistenceError::NotFound(id));
        }
        Ok(())
    }

    fn delete(&self, id: &str) -> Result<(), PersistenceError> {
        let conn = self.db.conn.lock().expect("db mutex poisoned");
        let sql = format!("DELETE FROM {} WHERE id = ?1", self.table);
        conn.execute(&sql, params![id])?;
        Ok(())
    }
}

/// Accessor trait letting `DocumentLibrary` stamp id/timestamps generically
/// across `SequenceDefinition` and `TriggerScript`.
pub trait HasId {
    fn id(&self) -> &str;
    fn set_id(&mut self, id: String);
    fn created_at(&self) -> i64;
    fn set_timestamps(&mut self, created_at: i64, updated_at: i64);
}

impl HasId for SequenceDefinition {
    fn id(&self) -> &str {
        &self.id
    }
    fn set_id(&mut self, id: String) {
        self.id = id;
    }
    fn created_at(&self) -> i64 {
        self.created_at
    }
    fn set_timestamps(&mut self, created_at: i64, updated_at: i64) {
        self.created_at = created_at;
        self.updated_at = updated_at;
    }
}

impl HasId for TriggerScript {
    fn id(&self) -> &str {
        &self.id
    }
    fn set_id(&mut self, id: String) {
        self.id = id;
    }
    fn created_at(&self) -> i64 {
        self.created_at
    }
    fn set_timestamps(&mut self, created_at: i64, updated_at: i64) {
        self.created_at = created_at;
        self.updated_at = updated_at;
    }
}

pub struct SequenceLibrary<'a>(DocumentLibrary<'a, SequenceDefinition>);

impl<'a> SequenceLibrary<'a> {
    pub fn new(db: &'a Db) -> Self {
        SequenceLibrary(document_library(db, "sequences"))
    }
}

impl<'a> Library<SequenceDefinition> for SequenceLibrary<'a> {
    fn list(&self) -> Result<Vec<SequenceDefinition>, PersistenceError> {
        self.0.list()
    }
    fn get(&self, id: &str) -> Result<Option<SequenceDefinition>, PersistenceError> {
        self.0.get(id)
    }
    fn save(&self, definition: SequenceDefinition) -> Result<String, PersistenceError> {
        self.0.save(definition)
    }
    fn update(&self, definition: SequenceDefinition) -> Result<(), PersistenceError> {
        self.0.update(definition)
    }
    fn delete(&self, id: &str) -> Result<(), PersistenceError> {
        self.0.delete(id)
    }
}

pub struct TriggerScriptLibrary<'a>(DocumentLibrary<'a, TriggerScript>);

impl<'a> TriggerScriptLibrary<'a> {
    pub fn new(db: &'a Db) -> Self {
        TriggerScriptLibrary(document_library(db, "trigger_scripts"))
    }
}

impl<'a> Library<TriggerScript> for TriggerScriptLibrary<'a> {
    fn list(&self) -> Result<Vec<TriggerScript>, PersistenceError> {
        self.0.list()
    }
    fn get(&self, id: &str) -> Result<Option<TriggerScript>, PersistenceError> {
        self.0.get(id)
    }
    fn save(&self, definition: TriggerScript) -> Result<String, PersistenceError> {
        self.0.save(definition)
    }
    fn update(&self, definition: TriggerScript) -> Result<(), PersistenceError> {
        self.0.update(definition)
    }
    fn delete(&self, id: &str) -> Result<(), PersistenceError> {
        self.0.delete(id)
    }
}

/// Device-alias store, keyed by IDN string rather than a generated id
/// (spec.md §6: `aliases/{idn}`).
pub struct AliasStore<'a> {
    db: &'a Db,
}

impl<'a> AliasStore<'a> {
    pub fn new(db: &'a Db) -> Self {
        AliasStore { db }
    }

    pub fn list(&self) -> Result<std::collections::BTreeMap<String, String>, PersistenceError> {
        let conn = self.db.conn.lock().expect("db mutex poisoned");
        let mut stmt = conn.prepare("SELECT idn, alias FROM device_aliases")?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?;
        let mut out = std::collections::BTreeMap::new();
        for row in rows {
            let (idn, alias) = row?;
            out.insert(idn, alias);
        }
        Ok(out)
    }

    pub fn get(&self, idn: &str) -> Result<Option<String>, PersistenceError> {
        let conn = self.db.conn.lock().expect("db mutex poisoned");
        Ok(conn
            .query_row("SELECT alias FROM device_aliases WHERE idn = ?1", params![idn], |row| row.get(0))
            .optional()?)
    }

    pub fn set(&self, idn: &str, alias: &str) -> Result<(), PersistenceError> {
        let now = now_ms();
        let conn = self.db.conn.lock().expect("db mutex poisoned");
        conn.execute(
            "INSERT INTO device_aliases (idn, alias, created_at, updated_at) VALUES (?1, ?2, ?3, ?3)
             ON CONFLICT(idn) DO UPDATE SET alias = excluded.alias, updated_at = excluded.updated_at",
            params![idn, alias, now],
        )?;
        Ok(())
    }

    pub fn clear(&self, idn: &str) -> Result<(), PersistenceError> {
        let conn = self.db.conn.lock().expect("db mutex poisoned");
        conn.execute("DELETE FROM device_aliases WHERE idn = ?1", params![idn])?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bench_core::waveform::{StandardShape, Waveform, WaveformParams};

    fn sample_def() -> SequenceDefinition {
        SequenceDefinition {
            id: String::new(),
            name: "ramp".into(),
            unit: "V".into(),
            waveform: Waveform::Standard(WaveformParams {
                shape: StandardShape::Ramp,
                min: 0.0,
                max: 10.0,
                points_per_cycle: 100,
                interval_ms: 100,
            }),
            pre_value: None,
            post_value: None,
            scale: 1.0,
            offset: 0.0,
            min_clamp: None,
            max_clamp: None,
            max_slew_rate: None,
            created_at: 0,
            updated_at: 0,
        }
    }

    #[test]
    fn save_then_get_round_trips() {
        let db = Db::open_in_memory().unwrap();
        let lib = SequenceLibrary::new(&db);
        let id = lib.save(sample_def()).unwrap();
        let fetched = lib.get(&id).unwrap().unwrap();
        assert_eq!(fetched.id, id);
        assert_eq!(fetched.name, "ramp");
        assert!(fetched.created_at > 0);
    }

    #[test]
    fn update_preserves_created_at() {
        let db = Db::open_in_memory().unwrap();
        let lib = SequenceLibrary::new(&db);
        let id = lib.save(sample_def()).unwrap();
        let mut fetched = lib.get(&id).unwrap().unwrap();
        let original_created = fetched.created_at;
        fetched.name = "renamed".into();
        lib.update(fetched).unwrap();
        let updated = lib.get(&id).unwrap().unwrap();
        assert_eq!(updated.name, "renamed");
        assert_eq!(updated.created_at, original_created);
    }

    #[test]
    fn delete_removes_entry() {
        let db = Db::open_in_memory().unwrap();
        let lib = SequenceLibrary::new(&db);
        let id = lib.save(sample_def()).unwrap();
        lib.delete(&id).unwrap();
        assert!(lib.get(&id).unwrap().is_none());
    }

    #[test]
    fn list_returns_all_in_creation_order() {
        let db = Db::open_in_memory().unwrap();
        let lib = SequenceLibrary::new(&db);
        lib.save(sample_def()).unwrap();
        lib.save(sample_def()).unwrap();
        assert_eq!(lib.list().unwrap().len(), 2);
    }

    #[test]
    fn alias_store_set_get_clear() {
        let db = Db::open_in_memory().unwrap();
        let aliases = AliasStore::new(&db);
        aliases.set("Keysight,E36313A,MY1", "Bench PSU").unwrap();
        assert_eq!(aliases.get("Keysight,E36313A,MY1").unwrap().as_deref(), Some("Bench PSU"));
        aliases.clear("Keysight,E36313A,MY1").unwrap();
        assert!(aliases.get("Keysight,E36313A,MY1").unwrap().is_none());
    }
}
