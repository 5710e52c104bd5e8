use std::sync::Arc;

use rusqlite::{OptionalExtension, Row, params};

use crate::cipher::{CipherProvider, Keyspace, blob_from_column, blob_to_column};
use crate::config::DEFAULT_SSH_PORT;
use crate::error::VaultError;
use crate::model::{DeviceRecord, SshTarget};
use crate::storage::{Database, parse_timestamp, timestamp_now};

pub const DEFAULT_SSH_USERNAME: &str = "esl";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewDevice {
    pub ap_id: String,
    pub host: String,
    pub port: u16,
    pub ssh_username: String,
    pub ssh_password: String,
}

impl NewDevice {
    pub fn new(ap_id: &str, host: &str, ssh_password: &str) -> Self {
        Self {
            ap_id: ap_id.trim().to_string(),
            host: host.trim().to_string(),
            port: DEFAULT_SSH_PORT,
            ssh_username: DEFAULT_SSH_USERNAME.to_string(),
            ssh_password: ssh_password.to_string(),
        }
    }
}

pub struct DeviceDirectory {
    db: Arc<Database>,
    cipher: Arc<CipherProvider>,
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<DeviceRecord> {
    let updated_at: String = row.get(5)?;
    Ok(DeviceRecord {
        ap_id: row.get(0)?,
        host: row.get(1)?,
        port: row.get(2)?,
        ssh_username: row.get(3)?,
        java_version: row.get(4)?,
        updated_at: parse_timestamp(&updated_at),
    })
}

impl DeviceDirectory {
    pub fn new(db: Arc<Database>, cipher: Arc<CipherProvider>) -> Self {
        Self { db, cipher }
    }

    pub fn upsert(&self, device: &NewDevice) -> Result<(), VaultError> {
        if device.ap_id.is_empty() || device.host.is_empty() {
            return Err(VaultError::Validation {
                service: "devices".to_string(),
                message: "ap id and host are required".to_string(),
            });
        }
        let username = if device.ssh_username.trim().is_empty() {
            DEFAULT_SSH_USERNAME
        } else {
            device.ssh_username.trim()
        };
        let others: i64 = self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM devices WHERE ap_id != ?1",
                params![device.ap_id],
                |row| row.get(0),
            )
        })?;
        let blob = self.cipher.encrypt_string_checked(
            Keyspace::DatabaseFields,
            &device.ssh_password,
            others > 0,
        )?;
        let column = blob_to_column(&blob)?;
        let now = timestamp_now();
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO devices (ap_id, host, port, ssh_username, ssh_password, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
                 ON CONFLICT(ap_id) DO UPDATE SET
                    host = excluded.host,
                    port = excluded.port,
                    ssh_username = excluded.ssh_username,
                    ssh_password = excluded.ssh_password,
                    updated_at = excluded.updated_at",
                params![device.ap_id, device.host, device.port, username, column, now],
            )
        })?;
        tracing::info!(ap_id = %device.ap_id, "saved device");
        Ok(())
    }

    pub fn get(&self, ap_id: &str) -> Result<Option<DeviceRecord>, VaultError> {
        let record = self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT ap_id, host, port, ssh_username, java_version, updated_at FROM devices WHERE ap_id = ?1",
                params![ap_id],
                record_from_row,
            )
            .optional()
        })?;
        Ok(record)
    }

    pub fn list(&self) -> Result<Vec<DeviceRecord>, VaultError> {
        let records = self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT ap_id, host, port, ssh_username, java_version, updated_at FROM devices ORDER BY ap_id",
            )?;
            let rows = stmt
                .query_map([], record_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })?;
        Ok(records)
    }

    pub fn remove(&self, ap_id: &str) -> Result<bool, VaultError> {
        let removed = self
            .db
            .with_conn(|conn| conn.execute("DELETE FROM devices WHERE ap_id = ?1", params![ap_id]))?;
        Ok(removed > 0)
    }

    pub fn set_java_version(&self, ap_id: &str, version: &str) -> Result<bool, VaultError> {
        let now = timestamp_now();
        let updated = self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE devices SET java_version = ?1, updated_at = ?2 WHERE ap_id = ?3",
                params![version.trim(), now, ap_id],
            )
        })?;
        if updated > 0 {
            tracing::info!(ap_id, version, "recorded java version");
        }
        Ok(updated > 0)
    }

    pub fn target(&self, ap_id: &str) -> Result<Option<SshTarget>, VaultError> {
        let row: Option<(String, u16, String, String)> = self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT host, port, ssh_username, ssh_password FROM devices WHERE ap_id = ?1",
                params![ap_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .optional()
        })?;
        let Some((host, port, username, column)) = row else {
            return Ok(None);
        };
        let password = blob_from_column(&column)
            .and_then(|blob| self.cipher.decrypt_string(Keyspace::DatabaseFields, &blob))
            .map_err(|err| {
                tracing::error!(ap_id, error = %err, "device password failed to decrypt");
                VaultError::Unreadable {
                    service: format!("device {ap_id}"),
                }
            })?;
        Ok(Some(SshTarget::new(host, port, username, password)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cipher::DatabaseKeyStore;

    fn directory() -> (Arc<Database>, DeviceDirectory) {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let cipher = Arc::new(CipherProvider::new(Box::new(DatabaseKeyStore::new(db.clone()))));
        (db.clone(), DeviceDirectory::new(db, cipher))
    }

    #[test]
    fn stores_device_and_builds_target() {
        let (db, devices) = directory();
        devices
            .upsert(&NewDevice::new("AP-0042", "10.20.30.40", "hunter2"))
            .unwrap();

        let record = devices.get("AP-0042").unwrap().unwrap();
        assert_eq!(record.ssh_username, "esl");
        assert_eq!(record.port, 22);

        let target = devices.target("AP-0042").unwrap().unwrap();
        assert_eq!(target, SshTarget::new("10.20.30.40", 22, "esl", "hunter2"));

        let stored: String = db
            .with_conn(|conn| {
                conn.query_row("SELECT ssh_password FROM devices", [], |row| row.get(0))
            })
            .unwrap();
        assert!(!stored.contains("hunter2"));
    }

    #[test]
    fn upsert_replaces_existing_device() {
        let (_db, devices) = directory();
        devices
            .upsert(&NewDevice::new("AP-1", "10.0.0.1", "one"))
            .unwrap();
        let mut moved = NewDevice::new("AP-1", "10.0.0.2", "two");
        moved.port = 2222;
        moved.ssh_username = "root".to_string();
        devices.upsert(&moved).unwrap();

        assert_eq!(devices.list().unwrap().len(), 1);
        let target = devices.target("AP-1").unwrap().unwrap();
        assert_eq!(target.address(), "10.0.0.2:2222");
        assert_eq!(target.username, "root");
        assert_eq!(target.password, "two");
    }

    #[test]
    fn remove_and_missing_devices() {
        let (_db, devices) = directory();
        devices
            .upsert(&NewDevice::new("AP-1", "10.0.0.1", "pw"))
            .unwrap();
        assert!(devices.remove("AP-1").unwrap());
        assert!(!devices.remove("AP-1").unwrap());
        assert!(devices.target("AP-1").unwrap().is_none());
        assert!(devices.get("AP-1").unwrap().is_none());
    }

    #[test]
    fn rejects_blank_identity() {
        let (_db, devices) = directory();
        assert!(matches!(
            devices.upsert(&NewDevice::new(" ", "10.0.0.1", "pw")),
            Err(VaultError::Validation { .. })
        ));
    }

    #[test]
    fn java_version_survives_login_updates() {
        let (_db, devices) = directory();
        devices
            .upsert(&NewDevice::new("AP-1", "10.0.0.1", "pw"))
            .unwrap();
        assert_eq!(devices.get("AP-1").unwrap().unwrap().java_version, None);

        assert!(devices.set_java_version("AP-1", " 1.8.0_292 ").unwrap());
        assert!(!devices.set_java_version("AP-404", "1.8").unwrap());
        devices
            .upsert(&NewDevice::new("AP-1", "10.0.0.9", "pw2"))
            .unwrap();
        let record = devices.get("AP-1").unwrap().unwrap();
        assert_eq!(record.java_version.as_deref(), Some("1.8.0_292"));
        assert_eq!(record.host, "10.0.0.9");
    }

    #[test]
    fn lost_field_key_is_not_silently_replaced() {
        let (db, devices) = directory();
        devices
            .upsert(&NewDevice::new("AP-1", "10.0.0.1", "pw"))
            .unwrap();
        db.with_conn(|conn| {
            conn.execute(
                "DELETE FROM system_config WHERE config_key = 'encryption_key.database_fields'",
                [],
            )
        })
        .unwrap();

        let cipher = Arc::new(CipherProvider::new(Box::new(DatabaseKeyStore::new(db.clone()))));
        let reopened = DeviceDirectory::new(db.clone(), cipher);
        assert!(matches!(
            reopened.upsert(&NewDevice::new("AP-2", "10.0.0.2", "pw")),
            Err(VaultError::KeyUnavailable)
        ));
        assert!(matches!(
            reopened.target("AP-1"),
            Err(VaultError::Unreadable { .. })
        ));
        assert!(db
            .config_value("encryption_key.database_fields")
            .unwrap()
            .is_none());
    }

    #[test]
    fn corrupt_password_is_unreadable() {
        let (db, devices) = directory();
        devices
            .upsert(&NewDevice::new("AP-1", "10.0.0.1", "pw"))
            .unwrap();
        db.with_conn(|conn| conn.execute("UPDATE devices SET ssh_password = 'plain'", []))
            .unwrap();
        assert!(matches!(
            devices.target("AP-1"),
            Err(VaultError::Unreadable { .. })
        ));
    }
}
