use std::fs;
use std::path::Path;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, params};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::StorageError;

pub const DATABASE_FILE: &str = "ap_support.db";

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS system_config (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    config_key TEXT UNIQUE NOT NULL,
    config_value TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS api_credentials (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    service_name TEXT UNIQUE NOT NULL,
    encrypted_data TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    last_used TEXT
);
CREATE TABLE IF NOT EXISTS devices (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    ap_id TEXT UNIQUE NOT NULL,
    host TEXT NOT NULL,
    port INTEGER NOT NULL DEFAULT 22,
    ssh_username TEXT NOT NULL,
    ssh_password TEXT NOT NULL,
    java_version TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
";

pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON; PRAGMA busy_timeout=30000;",
        )?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self, StorageError> {
        conn.execute_batch(SCHEMA)?;
        migrate(&conn)?;
        tracing::debug!("database schema ready");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn with_conn<F, T>(&self, f: F) -> Result<T, StorageError>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T>,
    {
        let conn = self.conn.lock();
        f(&conn).map_err(StorageError::from)
    }

    pub fn config_value(&self, key: &str) -> Result<Option<String>, StorageError> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT config_value FROM system_config WHERE config_key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()
        })
    }

    pub fn set_config_value(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let now = timestamp_now();
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO system_config (config_key, config_value, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?3)
                 ON CONFLICT(config_key) DO UPDATE SET
                    config_value = excluded.config_value,
                    updated_at = excluded.updated_at",
                params![key, value, now],
            )
            .map(|_| ())
        })
    }
}

// Databases created before devices tracked the firmware's Java version.
fn migrate(conn: &Connection) -> rusqlite::Result<()> {
    let has_java_version = conn
        .prepare("SELECT 1 FROM pragma_table_info('devices') WHERE name = 'java_version'")?
        .exists([])?;
    if !has_java_version {
        conn.execute_batch("ALTER TABLE devices ADD COLUMN java_version TEXT")?;
        tracing::info!("added devices.java_version column");
    }
    Ok(())
}

pub fn timestamp_now() -> String {
    Utc::now().to_rfc3339()
}

pub fn parse_timestamp(value: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(value)
        .map(|parsed| parsed.with_timezone(&Utc))
        .unwrap_or(DateTime::UNIX_EPOCH)
}

pub fn load_json<T: DeserializeOwned + Default>(path: &Path) -> Result<T, StorageError> {
    if !path.exists() {
        return Ok(T::default());
    }
    let content = fs::read_to_string(path)?;
    let value = serde_json::from_str(&content)?;
    Ok(value)
}

pub fn save_json<T: Serialize>(path: &Path, value: &T) -> Result<(), StorageError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let content = serde_json::to_string_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, content)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(unix)]
pub fn restrict_permissions(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
pub fn restrict_permissions(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn config_values_upsert() {
        let db = Database::open_in_memory().unwrap();
        assert_eq!(db.config_value("encryption_key").unwrap(), None);
        db.set_config_value("encryption_key", "one").unwrap();
        db.set_config_value("encryption_key", "two").unwrap();
        assert_eq!(
            db.config_value("encryption_key").unwrap().as_deref(),
            Some("two")
        );
        let rows: i64 = db
            .with_conn(|conn| {
                conn.query_row("SELECT COUNT(*) FROM system_config", [], |row| row.get(0))
            })
            .unwrap();
        assert_eq!(rows, 1);
    }

    #[test]
    fn opens_file_database_in_new_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data").join(DATABASE_FILE);
        let db = Database::open(&path).unwrap();
        db.set_config_value("k", "v").unwrap();
        drop(db);
        let reopened = Database::open(&path).unwrap();
        assert_eq!(reopened.config_value("k").unwrap().as_deref(), Some("v"));
    }

    #[test]
    fn older_device_table_gains_java_version() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(DATABASE_FILE);
        {
            let conn = Connection::open(&path).unwrap();
            conn.execute_batch(
                "CREATE TABLE devices (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    ap_id TEXT UNIQUE NOT NULL,
                    host TEXT NOT NULL,
                    port INTEGER NOT NULL DEFAULT 22,
                    ssh_username TEXT NOT NULL,
                    ssh_password TEXT NOT NULL,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );",
            )
            .unwrap();
        }
        let db = Database::open(&path).unwrap();
        let columns: i64 = db
            .with_conn(|conn| {
                conn.query_row(
                    "SELECT COUNT(*) FROM pragma_table_info('devices') WHERE name = 'java_version'",
                    [],
                    |row| row.get(0),
                )
            })
            .unwrap();
        assert_eq!(columns, 1);
        drop(db);
        assert!(Database::open(&path).is_ok());
    }

    #[test]
    fn json_round_trip_and_missing_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.json");
        let empty: BTreeMap<String, u32> = load_json(&path).unwrap();
        assert!(empty.is_empty());
        let mut map = BTreeMap::new();
        map.insert("a".to_string(), 1u32);
        save_json(&path, &map).unwrap();
        let back: BTreeMap<String, u32> = load_json(&path).unwrap();
        assert_eq!(back, map);
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn bad_timestamp_falls_back_to_epoch() {
        assert_eq!(parse_timestamp("garbage"), DateTime::UNIX_EPOCH);
        let now = Utc::now();
        let parsed = parse_timestamp(&now.to_rfc3339());
        assert_eq!(parsed.timestamp(), now.timestamp());
    }
}
