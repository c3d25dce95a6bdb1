//! SQLite metadata cache
//!
//! Mirrors the bucket listing in a local table so that existence and stat
//! queries do not need a network round trip:
//! - one row per canonical `s3://` URI (primary key)
//! - directories are synthesized rows with `dir = 1`
//! - full rebuilds are staged in `<table>_temp` and swapped in with two
//!   renames inside a single transaction, so readers never see a partial
//!   cache and a failed rebuild leaves the live table untouched

use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Cache database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Invalid cache table name: {0}")]
    InvalidTableName(String),

    #[error("Cannot create cache directory: {0}")]
    Io(#[from] std::io::Error),
}

/// One cached file or folder
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataRecord {
    /// Canonical `s3://` URI, no trailing slash
    pub uri: String,
    /// Size in bytes (0 for directories)
    pub filesize: u64,
    /// Last modification time (epoch seconds)
    pub timestamp: i64,
    pub is_directory: bool,
    /// Remote version id when the bucket is versioned
    pub version: Option<String>,
}

impl MetadataRecord {
    pub fn file(uri: impl Into<String>, filesize: u64, timestamp: i64, version: Option<String>) -> Self {
        Self {
            uri: uri.into(),
            filesize,
            timestamp,
            is_directory: false,
            version,
        }
    }

    pub fn directory(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            filesize: 0,
            timestamp: 0,
            is_directory: true,
            version: None,
        }
    }
}

/// Storage for metadata records
pub trait MetadataStore: Send + Sync {
    /// Look up a single record
    fn get(&self, uri: &str) -> Result<Option<MetadataRecord>, CacheError>;

    /// Insert or replace records in the live table
    fn put_many(&self, records: &[MetadataRecord]) -> Result<(), CacheError>;

    fn put(&self, record: &MetadataRecord) -> Result<(), CacheError> {
        self.put_many(std::slice::from_ref(record))
    }

    /// Remove a record; missing records are not an error
    fn delete(&self, uri: &str) -> Result<(), CacheError>;

    /// Direct children of a directory URI (`s3://` for the root)
    fn list_children(&self, dir_uri: &str) -> Result<Vec<MetadataRecord>, CacheError>;

    /// Number of rows in the live table
    fn row_count(&self) -> Result<u64, CacheError>;

    /// Drop any leftover shadow table and create an empty one
    fn begin_rebuild(&self) -> Result<(), CacheError>;

    /// Insert or replace records in the shadow table
    fn write_rebuild(&self, records: &[MetadataRecord]) -> Result<(), CacheError>;

    /// Atomically replace the live table with the shadow table
    fn commit_rebuild(&self) -> Result<(), CacheError>;
}

/// Metadata cache backed by a SQLite database file
pub struct SqliteMetadataCache {
    conn: Mutex<Connection>,
    table: String,
    temp_table: String,
}

/// Table names are interpolated into SQL, so only identifiers are allowed
pub fn validate_table_name(name: &str) -> Result<(), CacheError> {
    let valid = !name.is_empty()
        && name.len() <= 58
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !name.starts_with(|c: char| c.is_ascii_digit())
        && !name.starts_with("sqlite_");
    if valid {
        Ok(())
    } else {
        Err(CacheError::InvalidTableName(name.to_string()))
    }
}

fn table_ddl(name: &str) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {name} (
            uri TEXT NOT NULL PRIMARY KEY,
            filesize INTEGER NOT NULL DEFAULT 0,
            timestamp INTEGER NOT NULL DEFAULT 0,
            dir INTEGER NOT NULL DEFAULT 0,
            version TEXT
        ) WITHOUT ROWID;"
    )
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<MetadataRecord> {
    Ok(MetadataRecord {
        uri: row.get(0)?,
        filesize: row.get::<_, i64>(1)?.max(0) as u64,
        timestamp: row.get(2)?,
        is_directory: row.get::<_, i64>(3)? != 0,
        version: row.get(4)?,
    })
}

impl SqliteMetadataCache {
    /// Open (or create) the cache database at `path`
    pub fn open(path: &Path, table: &str) -> Result<Self, CacheError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA busy_timeout = 5000;",
        )?;
        Self::with_connection(conn, table)
    }

    /// In-memory cache (tests, dry runs)
    pub fn in_memory(table: &str) -> Result<Self, CacheError> {
        Self::with_connection(Connection::open_in_memory()?, table)
    }

    fn with_connection(conn: Connection, table: &str) -> Result<Self, CacheError> {
        validate_table_name(table)?;
        conn.execute_batch(&table_ddl(table))?;
        Ok(Self {
            conn: Mutex::new(conn),
            table: table.to_string(),
            temp_table: format!("{}_temp", table),
        })
    }

    /// Acquire DB lock with poison recovery
    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| {
            tracing::warn!("[CACHE] Metadata cache mutex was poisoned, recovering: {e}");
            e.into_inner()
        })
    }

    fn insert_into(conn: &Connection, table: &str, records: &[MetadataRecord]) -> Result<(), CacheError> {
        let tx = conn.unchecked_transaction()?;
        {
            let mut stmt = tx.prepare_cached(&format!(
                "INSERT OR REPLACE INTO {} (uri, filesize, timestamp, dir, version) VALUES (?1, ?2, ?3, ?4, ?5)",
                table
            ))?;
            for record in records {
                stmt.execute(params![
                    record.uri,
                    record.filesize as i64,
                    record.timestamp,
                    record.is_directory as i64,
                    record.version,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Whether the shadow table currently exists
    pub fn has_pending_rebuild(&self) -> Result<bool, CacheError> {
        let conn = self.lock();
        let exists = conn
            .query_row(
                "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
                params![self.temp_table],
                |_| Ok(()),
            )
            .optional()?
            .is_some();
        Ok(exists)
    }

    /// All URIs in the live table, sorted
    pub fn all_uris(&self) -> Result<Vec<String>, CacheError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!("SELECT uri FROM {} ORDER BY uri", self.table))?;
        let uris = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(uris)
    }
}

impl MetadataStore for SqliteMetadataCache {
    fn get(&self, uri: &str) -> Result<Option<MetadataRecord>, CacheError> {
        let conn = self.lock();
        let record = conn
            .query_row(
                &format!(
                    "SELECT uri, filesize, timestamp, dir, version FROM {} WHERE uri = ?1",
                    self.table
                ),
                params![uri],
                row_to_record,
            )
            .optional()?;
        Ok(record)
    }

    fn put_many(&self, records: &[MetadataRecord]) -> Result<(), CacheError> {
        if records.is_empty() {
            return Ok(());
        }
        let conn = self.lock();
        Self::insert_into(&conn, &self.table, records)
    }

    fn delete(&self, uri: &str) -> Result<(), CacheError> {
        let conn = self.lock();
        conn.execute(&format!("DELETE FROM {} WHERE uri = ?1", self.table), params![uri])?;
        Ok(())
    }

    fn list_children(&self, dir_uri: &str) -> Result<Vec<MetadataRecord>, CacheError> {
        let prefix = if dir_uri.ends_with("://") {
            dir_uri.to_string()
        } else {
            format!("{}/", dir_uri.trim_end_matches('/'))
        };

        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT uri, filesize, timestamp, dir, version FROM {}
             WHERE substr(uri, 1, length(?1)) = ?1 AND length(uri) > length(?1)
             ORDER BY uri",
            self.table
        ))?;
        let rows = stmt
            .query_map(params![prefix], row_to_record)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(rows
            .into_iter()
            .filter(|r| !r.uri[prefix.len()..].contains('/'))
            .collect())
    }

    fn row_count(&self) -> Result<u64, CacheError> {
        let conn = self.lock();
        let count: i64 = conn.query_row(&format!("SELECT COUNT(*) FROM {}", self.table), [], |r| r.get(0))?;
        Ok(count.max(0) as u64)
    }

    fn begin_rebuild(&self) -> Result<(), CacheError> {
        let conn = self.lock();
        conn.execute_batch(&format!(
            "DROP TABLE IF EXISTS {temp};
             {ddl}",
            temp = self.temp_table,
            ddl = table_ddl(&self.temp_table)
        ))?;
        Ok(())
    }

    fn write_rebuild(&self, records: &[MetadataRecord]) -> Result<(), CacheError> {
        if records.is_empty() {
            return Ok(());
        }
        let conn = self.lock();
        Self::insert_into(&conn, &self.temp_table, records)
    }

    fn commit_rebuild(&self) -> Result<(), CacheError> {
        let mut conn = self.lock();
        let old = format!("{}_old", self.table);
        let tx = conn.transaction()?;
        tx.execute_batch(&format!(
            "DROP TABLE IF EXISTS {old};
             ALTER TABLE {live} RENAME TO {old};
             ALTER TABLE {temp} RENAME TO {live};
             DROP TABLE {old};",
            old = old,
            live = self.table,
            temp = self.temp_table
        ))?;
        tx.commit()?;
        tracing::debug!("[CACHE] Swapped {} into {}", self.temp_table, self.table);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache() -> SqliteMetadataCache {
        SqliteMetadataCache::in_memory("s3fs_file").unwrap()
    }

    #[test]
    fn test_put_get_delete() {
        let cache = cache();
        let record = MetadataRecord::file("s3://a.txt", 12, 1_700_000_000, Some("v1".to_string()));
        cache.put(&record).unwrap();
        assert_eq!(cache.get("s3://a.txt").unwrap(), Some(record));

        // Upsert keeps one row per uri
        cache.put(&MetadataRecord::file("s3://a.txt", 20, 1_700_000_100, None)).unwrap();
        assert_eq!(cache.row_count().unwrap(), 1);
        assert_eq!(cache.get("s3://a.txt").unwrap().unwrap().filesize, 20);

        cache.delete("s3://a.txt").unwrap();
        assert_eq!(cache.get("s3://a.txt").unwrap(), None);
        cache.delete("s3://a.txt").unwrap();
    }

    #[test]
    fn test_list_children_is_one_level() {
        let cache = cache();
        cache
            .put_many(&[
                MetadataRecord::file("s3://a.txt", 1, 0, None),
                MetadataRecord::directory("s3://dir"),
                MetadataRecord::file("s3://dir/b.txt", 2, 0, None),
                MetadataRecord::directory("s3://dir/sub"),
                MetadataRecord::file("s3://dir/sub/c.txt", 3, 0, None),
                MetadataRecord::file("s3://dirt.txt", 4, 0, None),
            ])
            .unwrap();

        let root: Vec<String> = cache.list_children("s3://").unwrap().into_iter().map(|r| r.uri).collect();
        assert_eq!(root, vec!["s3://a.txt", "s3://dir", "s3://dirt.txt"]);

        let dir: Vec<String> = cache.list_children("s3://dir").unwrap().into_iter().map(|r| r.uri).collect();
        assert_eq!(dir, vec!["s3://dir/b.txt", "s3://dir/sub"]);
    }

    #[test]
    fn test_rebuild_swaps_tables() {
        let cache = cache();
        cache.put(&MetadataRecord::file("s3://stale.txt", 1, 0, None)).unwrap();

        cache.begin_rebuild().unwrap();
        assert!(cache.has_pending_rebuild().unwrap());
        cache
            .write_rebuild(&[MetadataRecord::file("s3://fresh.txt", 1, 0, None)])
            .unwrap();
        // Live table untouched until commit
        assert!(cache.get("s3://stale.txt").unwrap().is_some());

        cache.commit_rebuild().unwrap();
        assert!(!cache.has_pending_rebuild().unwrap());
        assert_eq!(cache.all_uris().unwrap(), vec!["s3://fresh.txt"]);

        // A second rebuild cycle works on the renamed tables
        cache.begin_rebuild().unwrap();
        cache.commit_rebuild().unwrap();
        assert_eq!(cache.row_count().unwrap(), 0);
    }

    #[test]
    fn test_begin_rebuild_discards_abandoned_shadow() {
        let cache = cache();
        cache.begin_rebuild().unwrap();
        cache
            .write_rebuild(&[MetadataRecord::file("s3://half.txt", 1, 0, None)])
            .unwrap();

        cache.begin_rebuild().unwrap();
        cache.commit_rebuild().unwrap();
        assert!(cache.get("s3://half.txt").unwrap().is_none());
    }

    #[test]
    fn test_open_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("cache.db");
        {
            let cache = SqliteMetadataCache::open(&path, "files").unwrap();
            cache.put(&MetadataRecord::directory("s3://d")).unwrap();
        }
        let reopened = SqliteMetadataCache::open(&path, "files").unwrap();
        assert!(reopened.get("s3://d").unwrap().unwrap().is_directory);
    }

    #[test]
    fn test_table_name_validation() {
        assert!(validate_table_name("s3fs_file").is_ok());
        assert!(validate_table_name("files; DROP TABLE x").is_err());
        assert!(validate_table_name("1abc").is_err());
        assert!(validate_table_name("").is_err());
        assert!(SqliteMetadataCache::in_memory("bad-name").is_err());
    }
}
