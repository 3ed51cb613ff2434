use chrono::{DateTime, Utc};
use rollcall_core::{Embedding, IdentityDirectory, IdentityRecord, ReferenceSet, ReferenceStore, StoreError};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use uuid::Uuid;

const SCHEMA: &str = r#"
PRAGMA journal_mode=WAL;
PRAGMA foreign_keys=ON;

CREATE TABLE IF NOT EXISTS identities (
  key TEXT PRIMARY KEY,
  display_name TEXT NOT NULL,
  enrolled_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS reference_sets (
  id TEXT PRIMARY KEY,
  built_at TEXT NOT NULL,
  identity_count INTEGER NOT NULL,
  sample_count INTEGER NOT NULL,
  dimension INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS reference_embeddings (
  set_id TEXT NOT NULL REFERENCES reference_sets(id) ON DELETE CASCADE,
  identity_key TEXT NOT NULL,
  position INTEGER NOT NULL,
  model_version TEXT,
  vector BLOB NOT NULL,
  PRIMARY KEY (set_id, identity_key, position)
);
"#;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("database path is empty")]
    MissingPath,
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("create database directory: {0}")]
    Io(#[from] std::io::Error),
    #[error("corrupt embedding for {identity}: {reason}")]
    CorruptEmbedding { identity: String, reason: String },
    #[error("stored reference set is invalid: {0}")]
    InvalidSet(#[from] rollcall_core::reference::ReferenceSetError),
}

impl From<DbError> for StoreError {
    fn from(e: DbError) -> Self {
        match e {
            DbError::MissingPath => StoreError::MissingPath,
            DbError::CorruptEmbedding { .. } | DbError::InvalidSet(_) => StoreError::Corrupt(e.to_string()),
            other => StoreError::Backend(Box::new(other)),
        }
    }
}

/// Metadata of the persisted reference set.
#[derive(Debug, Clone, PartialEq)]
pub struct BuildInfo {
    pub id: Uuid,
    pub built_at: DateTime<Utc>,
    pub identity_count: usize,
    pub sample_count: usize,
    pub dimension: usize,
}

/// Single-file store for the durable reference set and the identity directory.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (creating if needed) the database at `path`.
    pub fn open(path: &Path) -> Result<Self, DbError> {
        if path.as_os_str().is_empty() {
            return Err(DbError::MissingPath);
        }
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let store = Self::with_connection(Connection::open(path)?)?;
        tracing::info!(path = %path.display(), "database opened");
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, DbError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, DbError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert or rename an identity.
    pub fn upsert_identity(&self, key: &str, display_name: &str) -> Result<(), DbError> {
        self.conn().execute(
            "INSERT INTO identities (key, display_name, enrolled_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET display_name = excluded.display_name",
            params![key, display_name, Utc::now().to_rfc3339()],
        )?;
        tracing::debug!(identity = key, "identity recorded");
        Ok(())
    }

    /// Returns false if the identity was not recorded.
    pub fn remove_identity(&self, key: &str) -> Result<bool, DbError> {
        let removed = self.conn().execute("DELETE FROM identities WHERE key = ?1", params![key])?;
        Ok(removed > 0)
    }

    pub fn list_identities(&self) -> Result<Vec<IdentityRecord>, DbError> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT key, display_name FROM identities ORDER BY key")?;
        let rows = stmt.query_map([], |row| {
            Ok(IdentityRecord {
                key: row.get(0)?,
                display_name: row.get(1)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn identity(&self, key: &str) -> Result<Option<IdentityRecord>, DbError> {
        Ok(self
            .conn()
            .query_row(
                "SELECT key, display_name FROM identities WHERE key = ?1",
                params![key],
                |row| {
                    Ok(IdentityRecord {
                        key: row.get(0)?,
                        display_name: row.get(1)?,
                    })
                },
            )
            .optional()?)
    }

    /// Metadata for the persisted set, if any.
    pub fn last_build(&self) -> Result<Option<BuildInfo>, DbError> {
        let row = self
            .conn()
            .query_row(
                "SELECT id, built_at, identity_count, sample_count, dimension FROM reference_sets
                 ORDER BY built_at DESC LIMIT 1",
                [],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, i64>(4)?,
                    ))
                },
            )
            .optional()?;

        let Some((id, built_at, identity_count, sample_count, dimension)) = row else {
            return Ok(None);
        };
        let corrupt = |reason: String| DbError::CorruptEmbedding {
            identity: "<set>".into(),
            reason,
        };
        Ok(Some(BuildInfo {
            id: Uuid::parse_str(&id).map_err(|e| corrupt(e.to_string()))?,
            built_at: DateTime::parse_from_rfc3339(&built_at)
                .map_err(|e| corrupt(e.to_string()))?
                .with_timezone(&Utc),
            identity_count: identity_count as usize,
            sample_count: sample_count as usize,
            dimension: dimension as usize,
        }))
    }

    fn load_set(&self) -> Result<Option<ReferenceSet>, DbError> {
        let conn = self.conn();
        let set_id: Option<String> = conn
            .query_row(
                "SELECT id FROM reference_sets ORDER BY built_at DESC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?;
        let Some(set_id) = set_id else {
            return Ok(None);
        };

        let mut stmt = conn.prepare(
            "SELECT identity_key, model_version, vector FROM reference_embeddings
             WHERE set_id = ?1 ORDER BY identity_key, position",
        )?;
        let rows = stmt.query_map(params![set_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, Option<String>>(1)?,
                row.get::<_, Vec<u8>>(2)?,
            ))
        })?;

        let mut identities: BTreeMap<String, Vec<Embedding>> = BTreeMap::new();
        for row in rows {
            let (identity, model_version, blob) = row?;
            let values = decode_vector(&blob).ok_or_else(|| DbError::CorruptEmbedding {
                identity: identity.clone(),
                reason: format!("blob length {} is not a multiple of 4", blob.len()),
            })?;
            identities.entry(identity).or_default().push(Embedding {
                values,
                model_version,
            });
        }

        let set = ReferenceSet::from_identities(identities)?;
        tracing::info!(
            set = %set_id,
            identities = set.identity_count(),
            samples = set.sample_count(),
            "reference set loaded"
        );
        Ok(Some(set))
    }

    /// Replace the persisted set in one transaction.
    fn save_set(&self, set: &ReferenceSet) -> Result<Uuid, DbError> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let id = Uuid::new_v4();

        tx.execute("DELETE FROM reference_embeddings", [])?;
        tx.execute("DELETE FROM reference_sets", [])?;
        tx.execute(
            "INSERT INTO reference_sets (id, built_at, identity_count, sample_count, dimension)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                id.to_string(),
                Utc::now().to_rfc3339(),
                set.identity_count() as i64,
                set.sample_count() as i64,
                set.dimension().unwrap_or(0) as i64,
            ],
        )?;
        {
            let mut insert = tx.prepare(
                "INSERT INTO reference_embeddings (set_id, identity_key, position, model_version, vector)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for (identity, embeddings) in set.iter() {
                for (position, embedding) in embeddings.iter().enumerate() {
                    insert.execute(params![
                        id.to_string(),
                        identity,
                        position as i64,
                        embedding.model_version,
                        encode_vector(&embedding.values),
                    ])?;
                }
            }
        }
        tx.commit()?;

        tracing::info!(set = %id, identities = set.identity_count(), "reference set persisted");
        Ok(id)
    }
}

impl ReferenceStore for SqliteStore {
    fn load(&self) -> Result<Option<ReferenceSet>, StoreError> {
        Ok(self.load_set()?)
    }

    fn save(&self, set: &ReferenceSet) -> Result<(), StoreError> {
        self.save_set(set)?;
        Ok(())
    }
}

impl IdentityDirectory for SqliteStore {
    fn lookup(&self, key: &str) -> Option<IdentityRecord> {
        match self.identity(key) {
            Ok(record) => record,
            Err(e) => {
                tracing::warn!(identity = key, error = %e, "identity lookup failed");
                None
            }
        }
    }
}

fn encode_vector(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn decode_vector(blob: &[u8]) -> Option<Vec<f32>> {
    if blob.len() % 4 != 0 {
        return None;
    }
    Some(
        blob.chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn set() -> ReferenceSet {
        let mut map = BTreeMap::new();
        map.insert(
            "S1".to_string(),
            vec![
                Embedding {
                    values: vec![0.6, 0.8, 0.0],
                    model_version: Some("w600k_r50".into()),
                },
                Embedding::new(vec![0.1, 0.2, 0.3]),
            ],
        );
        map.insert("S2".to_string(), vec![Embedding::new(vec![-1.0, 0.0, 1e-7])]);
        ReferenceSet::from_identities(map).unwrap()
    }

    #[test]
    fn test_load_before_save_is_none() {
        let store = SqliteStore::open_in_memory().unwrap();
        assert!(store.load().unwrap().is_none());
        assert!(store.last_build().unwrap().is_none());
    }

    #[test]
    fn test_save_then_load_preserves_order_and_values() {
        let store = SqliteStore::open_in_memory().unwrap();
        let original = set();
        store.save(&original).unwrap();

        let loaded = store.load().unwrap().unwrap();
        assert_eq!(loaded.per_identity_counts(), original.per_identity_counts());
        let s1 = loaded.embeddings("S1").unwrap();
        assert_relative_eq!(s1[0].values[1], 0.8);
        assert_relative_eq!(s1[1].values[2], 0.3);
        assert_eq!(s1[0].model_version.as_deref(), Some("w600k_r50"));
        assert_relative_eq!(loaded.embeddings("S2").unwrap()[0].values[2], 1e-7);

        let info = store.last_build().unwrap().unwrap();
        assert_eq!(info.identity_count, 2);
        assert_eq!(info.sample_count, 3);
        assert_eq!(info.dimension, 3);
    }

    #[test]
    fn test_save_replaces_previous_set() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.save(&set()).unwrap();
        let first = store.last_build().unwrap().unwrap();

        let mut map = BTreeMap::new();
        map.insert("S3".to_string(), vec![Embedding::new(vec![1.0, 0.0])]);
        store.save(&ReferenceSet::from_identities(map).unwrap()).unwrap();

        let loaded = store.load().unwrap().unwrap();
        assert_eq!(loaded.identity_count(), 1);
        assert!(loaded.contains("S3"));
        assert_ne!(store.last_build().unwrap().unwrap().id, first.id);
    }

    #[test]
    fn test_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/rollcall.db");

        SqliteStore::open(&path).unwrap().save(&set()).unwrap();
        let reopened = SqliteStore::open(&path).unwrap();
        assert_eq!(reopened.load().unwrap().unwrap().sample_count(), 3);
    }

    #[test]
    fn test_empty_path_is_missing_path() {
        let err = SqliteStore::open(Path::new("")).err().unwrap();
        assert!(matches!(StoreError::from(err), StoreError::MissingPath));
    }

    #[test]
    fn test_corrupt_blob_reported() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.save(&set()).unwrap();
        store
            .conn()
            .execute("UPDATE reference_embeddings SET vector = X'0102' WHERE identity_key = 'S2'", [])
            .unwrap();
        assert!(matches!(store.load(), Err(StoreError::Corrupt(_))));
    }

    #[test]
    fn test_identity_directory() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.upsert_identity("S1", "Ada").unwrap();
        store.upsert_identity("S2", "Grace").unwrap();
        store.upsert_identity("S1", "Ada Lovelace").unwrap();

        assert_eq!(store.lookup("S1").unwrap().display_name, "Ada Lovelace");
        assert!(store.lookup("S9").is_none());
        let keys: Vec<_> = store.list_identities().unwrap().into_iter().map(|r| r.key).collect();
        assert_eq!(keys, vec!["S1", "S2"]);

        assert!(store.remove_identity("S2").unwrap());
        assert!(!store.remove_identity("S2").unwrap());
        assert_eq!(store.list_identities().unwrap().len(), 1);
    }

    #[test]
    fn test_vector_codec() {
        let values = [1.5f32, -0.25, 0.0];
        assert_eq!(decode_vector(&encode_vector(&values)).unwrap(), values);
        assert!(decode_vector(&[0, 1, 2]).is_none());
    }
}
