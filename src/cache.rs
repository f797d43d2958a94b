//! Durable cache of completed pipeline runs.
//!
//! Rows live in a DuckDB table and are only ever appended; a newer row for
//! the same key supersedes older ones. Artifact bytes are kept as
//! content-addressed blobs next to the database. A blob is fully on disk
//! before the row that points at it commits, so a reader either sees no
//! entry or a complete one.

use duckdb::{AccessMode, Config, Connection, params};
use serde::Serialize;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tracing::{debug, warn};

use crate::config::PipelineConfig;
use crate::snapshot::{SnapshotRef, copy_atomic, digest_file, store_blob};

const DB_FILE: &str = "cache.duckdb";
const ARTIFACT_DIR: &str = "artifacts";

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("cache database: {0}")]
    Db(#[from] duckdb::Error),

    #[error("cache io on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("encode cache key: {0}")]
    Encode(#[from] serde_json::Error),
}

fn io_err(path: &Path) -> impl FnOnce(io::Error) -> CacheError + '_ {
    move |source| CacheError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[derive(Serialize)]
struct KeyMaterial<'a> {
    config: &'a PipelineConfig,
    input_digest: &'a str,
    input_size: u64,
}

/// Digest over (operation + version, full configuration, input content).
/// Any field change, including a different stage backend, gives a new key.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn compute(config: &PipelineConfig, input: &SnapshotRef) -> Result<Self, CacheError> {
        let material = serde_json::to_vec(&KeyMaterial {
            config,
            input_digest: &input.digest,
            input_size: input.size,
        })?;
        Ok(CacheKey(blake3::hash(&material).to_hex().to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0[..16])
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub seq: i64,
    pub operation: String,
    pub input_digest: String,
    pub artifact_digest: String,
    pub artifact_bytes: i64,
    pub completed_at: String,
}

pub struct CacheStore {
    root: PathBuf,
    conn: Mutex<Connection>,
}

impl CacheStore {
    /// Open (creating if needed) the store under `root`.
    pub fn open(root: &Path) -> Result<Self, CacheError> {
        std::fs::create_dir_all(root.join(ARTIFACT_DIR)).map_err(io_err(root))?;
        let conn = Connection::open(root.join(DB_FILE))?;
        conn.execute("PRAGMA threads=1", [])?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS cache_entries (
                cache_key       VARCHAR NOT NULL,
                seq             BIGINT  NOT NULL,
                operation       VARCHAR NOT NULL,
                input_digest    VARCHAR NOT NULL,
                params_json     VARCHAR NOT NULL,
                artifact_digest VARCHAR NOT NULL,
                artifact_bytes  BIGINT  NOT NULL,
                completed_at    VARCHAR NOT NULL,
                PRIMARY KEY (cache_key, seq)
            )",
            [],
        )?;
        Ok(Self {
            root: root.to_path_buf(),
            conn: Mutex::new(conn),
        })
    }

    /// Open an existing store without write access. `None` when there is no
    /// database yet, in which case every key is a miss.
    pub fn open_read_only(root: &Path) -> Result<Option<Self>, CacheError> {
        let db = root.join(DB_FILE);
        if !db.is_file() {
            return Ok(None);
        }
        let config = Config::default().access_mode(AccessMode::ReadOnly)?;
        let conn = Connection::open_with_flags(&db, config)?;
        Ok(Some(Self {
            root: root.to_path_buf(),
            conn: Mutex::new(conn),
        }))
    }

    fn blob_path(&self, digest: &str) -> PathBuf {
        self.root
            .join(ARTIFACT_DIR)
            .join(&digest[..2])
            .join(digest)
    }

    pub fn artifact_path(&self, entry: &CacheEntry) -> PathBuf {
        self.blob_path(&entry.artifact_digest)
    }

    /// Newest entry for `key` whose artifact blob is still present.
    pub fn lookup(&self, key: &CacheKey) -> Result<Option<CacheEntry>, CacheError> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(
            "SELECT seq, operation, input_digest, artifact_digest, artifact_bytes, completed_at
             FROM cache_entries WHERE cache_key = ? ORDER BY seq DESC",
        )?;
        let rows = stmt.query_map(params![key.as_str()], |r| {
            Ok(CacheEntry {
                key: key.clone(),
                seq: r.get(0)?,
                operation: r.get(1)?,
                input_digest: r.get(2)?,
                artifact_digest: r.get(3)?,
                artifact_bytes: r.get(4)?,
                completed_at: r.get(5)?,
            })
        })?;

        for row in rows {
            let entry = row?;
            if self.artifact_path(&entry).is_file() {
                return Ok(Some(entry));
            }
            warn!(key = %key, seq = entry.seq, "cache entry artifact missing; ignoring entry");
        }
        Ok(None)
    }

    /// Record `artifact` as the result for `key`. The blob is stored first,
    /// then the row is appended in one transaction.
    pub fn commit(
        &self,
        key: &CacheKey,
        config: &PipelineConfig,
        input: &SnapshotRef,
        artifact: &Path,
    ) -> Result<CacheEntry, CacheError> {
        let file = std::fs::File::open(artifact).map_err(io_err(artifact))?;
        let artifact_root = self.root.join(ARTIFACT_DIR);
        let (artifact_digest, size, _) =
            store_blob(file, &artifact_root, |d| self.blob_path(d)).map_err(io_err(artifact))?;

        let params_json = serde_json::to_string(config)?;
        let operation = format!("{}@{}", config.operation.name, config.operation.version);
        let completed_at = OffsetDateTime::now_utc()
            .format(&Rfc3339)
            .unwrap_or_else(|_| String::from("unknown"));

        let bytes = size as i64;

        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute("BEGIN TRANSACTION", [])?;
        let inserted = (|| -> Result<i64, duckdb::Error> {
            let seq: i64 = conn.query_row(
                "SELECT COALESCE(MAX(seq), 0) + 1 FROM cache_entries WHERE cache_key = ?",
                params![key.as_str()],
                |r| r.get(0),
            )?;
            conn.execute(
                "INSERT INTO cache_entries VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
                params![
                    key.as_str(),
                    seq,
                    operation,
                    input.digest,
                    params_json,
                    artifact_digest,
                    bytes,
                    completed_at
                ],
            )?;
            Ok(seq)
        })();

        let seq = match inserted {
            Ok(seq) => {
                conn.execute("COMMIT", [])?;
                seq
            }
            Err(e) => {
                let _ = conn.execute("ROLLBACK", []);
                return Err(e.into());
            }
        };
        debug!(key = %key, seq, artifact = %artifact_digest, "cache entry committed");

        Ok(CacheEntry {
            key: key.clone(),
            seq,
            operation,
            input_digest: input.digest.clone(),
            artifact_digest,
            artifact_bytes: bytes,
            completed_at,
        })
    }

    /// Put the cached artifact at `dest`, unless `dest` already holds it.
    pub fn materialize(&self, entry: &CacheEntry, dest: &Path) -> Result<(), CacheError> {
        if dest.is_file() {
            if let Ok((digest, _)) = digest_file(dest) {
                if digest == entry.artifact_digest {
                    return Ok(());
                }
            }
        }
        let blob = self.artifact_path(entry);
        copy_atomic(&blob, dest).map_err(io_err(dest))
    }

    /// Number of rows ever committed for `key`.
    pub fn entry_count(&self, key: &CacheKey) -> Result<usize, CacheError> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM cache_entries WHERE cache_key = ?",
            params![key.as_str()],
            |r| r.get(0),
        )?;
        Ok(n as usize)
    }
}
