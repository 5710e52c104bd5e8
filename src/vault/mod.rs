use std::sync::Arc;

use parking_lot::RwLock;
use rusqlite::{OptionalExtension, params};

use crate::cipher::{CipherProvider, Keyspace, blob_from_column, blob_to_column};
use crate::error::{CipherError, VaultError};
use crate::model::{CredentialMap, ServiceSummary};
use crate::sanitize;
use crate::storage::{Database, parse_timestamp, timestamp_now};

pub mod schema;

pub use schema::{SchemaRegistry, ServiceCredentials, JIRA, VUSION_CLOUD};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VaultHealth {
    Empty,
    Healthy { records: usize },
    Degraded { unreadable: Vec<String> },
    KeyLost { records: usize },
}

pub struct CredentialVault {
    db: Arc<Database>,
    cipher: Arc<CipherProvider>,
    schemas: RwLock<SchemaRegistry>,
}

impl CredentialVault {
    pub fn new(db: Arc<Database>, cipher: Arc<CipherProvider>) -> Self {
        Self {
            db,
            cipher,
            schemas: RwLock::new(SchemaRegistry::default()),
        }
    }

    pub fn register_schema(&self, service: &str, required: &[&str]) {
        self.schemas.write().register(service, required);
    }

    pub fn store_credentials(&self, service: &str, data: &CredentialMap) -> Result<(), VaultError> {
        let json = serde_json::to_string(data)
            .map_err(|err| VaultError::Storage(err.into()))?;
        let others: i64 = self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM api_credentials WHERE service_name != ?1",
                params![service],
                |row| row.get(0),
            )
        })?;
        let blob = self
            .cipher
            .encrypt_string_checked(Keyspace::Credentials, &json, others > 0)?;
        let column = blob_to_column(&blob)?;
        let now = timestamp_now();
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO api_credentials (service_name, encrypted_data, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?3)
                 ON CONFLICT(service_name) DO UPDATE SET
                    encrypted_data = excluded.encrypted_data,
                    updated_at = excluded.updated_at",
                params![service, column, now],
            )
        })?;
        tracing::info!(service, "stored credentials");
        Ok(())
    }

    pub fn store_typed(&self, credentials: &ServiceCredentials) -> Result<(), VaultError> {
        self.store_credentials(credentials.service(), &credentials.to_map())
    }

    pub fn get_credentials(&self, service: &str) -> Result<CredentialMap, VaultError> {
        let column: Option<String> = self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT encrypted_data FROM api_credentials WHERE service_name = ?1",
                params![service],
                |row| row.get(0),
            )
            .optional()
        })?;
        let Some(column) = column else {
            return Ok(CredentialMap::new());
        };
        match self.decrypt_record(&column) {
            Ok(map) => {
                self.touch(service);
                Ok(map)
            }
            Err(err) => {
                tracing::error!(service, error = %err, "stored credentials failed to decrypt");
                Err(self.classify_decrypt_failure(service))
            }
        }
    }

    pub fn typed_credentials(&self, service: &str) -> Result<ServiceCredentials, VaultError> {
        let map = self.get_credentials(service)?;
        let schemas = self.schemas.read();
        ServiceCredentials::from_map(service, &map, &schemas).map_err(|missing| {
            VaultError::Validation {
                service: service.to_string(),
                message: format!("missing required fields: {}", missing.join(", ")),
            }
        })
    }

    pub fn delete_credentials(&self, service: &str) -> Result<bool, VaultError> {
        let removed = self.db.with_conn(|conn| {
            conn.execute(
                "DELETE FROM api_credentials WHERE service_name = ?1",
                params![service],
            )
        })?;
        if removed > 0 {
            tracing::info!(service, "deleted credentials");
        }
        Ok(removed > 0)
    }

    pub fn list_services(&self) -> Result<Vec<ServiceSummary>, VaultError> {
        let rows = self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT service_name, updated_at FROM api_credentials ORDER BY service_name",
            )?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })?;
        Ok(rows
            .into_iter()
            .map(|(service, updated_at)| ServiceSummary {
                service,
                updated_at: parse_timestamp(&updated_at),
            })
            .collect())
    }

    pub fn test_credentials(&self, service: &str) -> (bool, String) {
        let credentials = match self.get_credentials(service) {
            Ok(credentials) => credentials,
            Err(VaultError::Unreadable { .. }) => {
                return (
                    false,
                    format!("Stored credentials for {service} could not be decrypted"),
                );
            }
            Err(VaultError::KeyUnavailable) => {
                return (
                    false,
                    "Encryption key unavailable - stored credentials cannot be recovered"
                        .to_string(),
                );
            }
            Err(err) => return (false, sanitize::report("reading credentials", &err)),
        };
        if credentials.is_empty() {
            return (false, format!("No credentials found for {service}"));
        }
        let missing = self.schemas.read().missing_fields(service, &credentials);
        if !missing.is_empty() {
            return (
                false,
                format!("Missing required fields: {}", missing.join(", ")),
            );
        }
        (true, "Credentials found".to_string())
    }

    pub fn health(&self) -> Result<VaultHealth, VaultError> {
        let rows = self.all_records()?;
        if rows.is_empty() {
            return Ok(VaultHealth::Empty);
        }
        let unreadable: Vec<String> = rows
            .iter()
            .filter(|(_, column)| self.decrypt_record(column).is_err())
            .map(|(service, _)| service.clone())
            .collect();
        let health = if unreadable.is_empty() {
            VaultHealth::Healthy {
                records: rows.len(),
            }
        } else if unreadable.len() == rows.len() {
            VaultHealth::KeyLost {
                records: rows.len(),
            }
        } else {
            VaultHealth::Degraded { unreadable }
        };
        if !matches!(health, VaultHealth::Healthy { .. }) {
            tracing::error!(?health, "credential vault health check failed");
        }
        Ok(health)
    }

    fn decrypt_record(&self, column: &str) -> Result<CredentialMap, CipherError> {
        let blob = blob_from_column(column)?;
        let json = self.cipher.decrypt_string(Keyspace::Credentials, &blob)?;
        serde_json::from_str(&json).map_err(|_| CipherError::Decryption)
    }

    fn classify_decrypt_failure(&self, service: &str) -> VaultError {
        match self.health() {
            Ok(VaultHealth::KeyLost { .. }) => VaultError::KeyUnavailable,
            _ => VaultError::Unreadable {
                service: service.to_string(),
            },
        }
    }

    fn all_records(&self) -> Result<Vec<(String, String)>, VaultError> {
        let rows = self.db.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT service_name, encrypted_data FROM api_credentials")?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })?;
        Ok(rows)
    }

    fn touch(&self, service: &str) {
        let now = timestamp_now();
        let result = self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE api_credentials SET last_used = ?1 WHERE service_name = ?2",
                params![now, service],
            )
        });
        if let Err(err) = result {
            tracing::debug!(service, %err, "could not record credential use");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cipher::{FileKeyStore, KeyStore};
    use crate::model::CredentialValue;

    fn vault_in(dir: &std::path::Path) -> (Arc<Database>, CredentialVault) {
        let db = Arc::new(Database::open(&dir.join("vault.db")).unwrap());
        let cipher = Arc::new(CipherProvider::new(Box::new(FileKeyStore::new(dir.join("keys")))));
        let vault = CredentialVault::new(db.clone(), cipher);
        (db, vault)
    }

    fn jira() -> CredentialMap {
        let mut map = CredentialMap::new();
        map.insert("url".into(), "https://x.atlassian.net".into());
        map.insert("username".into(), "a@b.com".into());
        map.insert("api_token".into(), "tok123".into());
        map
    }

    #[test]
    fn credential_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let (_db, vault) = vault_in(dir.path());
        vault.store_credentials("jira", &jira()).unwrap();
        assert_eq!(
            vault.test_credentials("jira"),
            (true, "Credentials found".to_string())
        );
        assert!(vault.delete_credentials("jira").unwrap());
        assert!(vault.get_credentials("jira").unwrap().is_empty());
        assert!(!vault.delete_credentials("jira").unwrap());
    }

    #[test]
    fn round_trip_with_mixed_values() {
        let dir = tempfile::tempdir().unwrap();
        let (_db, vault) = vault_in(dir.path());
        let mut map = jira();
        map.insert("verify_ssl".into(), CredentialValue::Flag(false));
        map.insert("use_cert_pinning".into(), CredentialValue::Flag(true));
        vault.store_credentials("jira", &map).unwrap();
        assert_eq!(vault.get_credentials("jira").unwrap(), map);
    }

    #[test]
    fn overwrite_keeps_one_record() {
        let dir = tempfile::tempdir().unwrap();
        let (db, vault) = vault_in(dir.path());
        vault.store_credentials("jira", &jira()).unwrap();
        let mut second = CredentialMap::new();
        second.insert("url".into(), "https://y.atlassian.net".into());
        vault.store_credentials("jira", &second).unwrap();

        let count: i64 = db
            .with_conn(|conn| {
                conn.query_row("SELECT COUNT(*) FROM api_credentials", [], |row| row.get(0))
            })
            .unwrap();
        assert_eq!(count, 1);
        assert_eq!(vault.get_credentials("jira").unwrap(), second);
    }

    #[test]
    fn absent_service_is_empty_not_error() {
        let dir = tempfile::tempdir().unwrap();
        let (_db, vault) = vault_in(dir.path());
        assert!(vault.get_credentials("nonexistent").unwrap().is_empty());
        assert_eq!(
            vault.test_credentials("nonexistent"),
            (false, "No credentials found for nonexistent".to_string())
        );
        assert_eq!(vault.health().unwrap(), VaultHealth::Empty);
    }

    #[test]
    fn missing_fields_are_reported() {
        let dir = tempfile::tempdir().unwrap();
        let (_db, vault) = vault_in(dir.path());
        let mut map = CredentialMap::new();
        map.insert("url".into(), "https://cloud.example".into());
        vault.store_credentials("vusion_cloud", &map).unwrap();
        assert_eq!(
            vault.test_credentials("vusion_cloud"),
            (false, "Missing required fields: api_key".to_string())
        );
        assert!(matches!(
            vault.typed_credentials("vusion_cloud"),
            Err(VaultError::Validation { .. })
        ));
    }

    #[test]
    fn ciphertext_is_not_stored_in_clear() {
        let dir = tempfile::tempdir().unwrap();
        let (db, vault) = vault_in(dir.path());
        vault.store_credentials("jira", &jira()).unwrap();
        let column: String = db
            .with_conn(|conn| {
                conn.query_row("SELECT encrypted_data FROM api_credentials", [], |row| {
                    row.get(0)
                })
            })
            .unwrap();
        assert!(!column.contains("tok123"));
        assert!(!column.contains("atlassian"));
    }

    #[test]
    fn corrupted_record_is_distinct_from_empty() {
        let dir = tempfile::tempdir().unwrap();
        let (db, vault) = vault_in(dir.path());
        vault.store_credentials("jira", &jira()).unwrap();
        vault.store_credentials("vusion_cloud", &jira()).unwrap();
        db.with_conn(|conn| {
            conn.execute(
                "UPDATE api_credentials SET encrypted_data = 'gAAAAABold' WHERE service_name = 'jira'",
                [],
            )
        })
        .unwrap();

        let err = vault.get_credentials("jira").unwrap_err();
        assert!(matches!(err, VaultError::Unreadable { .. }));
        assert!(!err.to_string().contains("gAAAA"));
        let (ok, message) = vault.test_credentials("jira");
        assert!(!ok);
        assert!(message.contains("could not be decrypted"));
        assert_eq!(
            vault.health().unwrap(),
            VaultHealth::Degraded {
                unreadable: vec!["jira".to_string()]
            }
        );
    }

    #[test]
    fn losing_the_key_is_reported_once_for_everything() {
        let dir = tempfile::tempdir().unwrap();
        {
            let (_db, vault) = vault_in(dir.path());
            vault.store_credentials("jira", &jira()).unwrap();
            vault.store_credentials("vusion_cloud", &jira()).unwrap();
        }
        std::fs::remove_file(dir.path().join("keys").join("credentials.key")).unwrap();

        let (_db, vault) = vault_in(dir.path());
        assert!(matches!(
            vault.get_credentials("jira"),
            Err(VaultError::KeyUnavailable)
        ));
        assert_eq!(vault.health().unwrap(), VaultHealth::KeyLost { records: 2 });
        let (ok, message) = vault.test_credentials("vusion_cloud");
        assert!(!ok);
        assert!(message.starts_with("Encryption key unavailable"));
    }

    #[test]
    fn storing_after_key_loss_does_not_mint_a_new_key() {
        let dir = tempfile::tempdir().unwrap();
        let key_file = dir.path().join("keys").join("credentials.key");
        {
            let (_db, vault) = vault_in(dir.path());
            vault.store_credentials("jira", &jira()).unwrap();
            vault.store_credentials("vusion_cloud", &jira()).unwrap();
        }
        std::fs::remove_file(&key_file).unwrap();

        let (_db, vault) = vault_in(dir.path());
        assert!(matches!(
            vault.store_credentials("pagerduty", &jira()),
            Err(VaultError::KeyUnavailable)
        ));
        assert!(!key_file.exists());
        assert!(matches!(
            vault.get_credentials("jira"),
            Err(VaultError::KeyUnavailable)
        ));
        assert_eq!(vault.health().unwrap(), VaultHealth::KeyLost { records: 2 });

        // Once the unreadable rows are gone, a fresh key may be generated.
        vault.delete_credentials("jira").unwrap();
        vault.delete_credentials("vusion_cloud").unwrap();
        vault.store_credentials("pagerduty", &jira()).unwrap();
        assert!(key_file.exists());
        assert_eq!(vault.health().unwrap(), VaultHealth::Healthy { records: 1 });
    }

    #[test]
    fn the_only_record_can_be_reentered_after_key_loss() {
        let dir = tempfile::tempdir().unwrap();
        {
            let (_db, vault) = vault_in(dir.path());
            vault.store_credentials("jira", &jira()).unwrap();
        }
        std::fs::remove_file(dir.path().join("keys").join("credentials.key")).unwrap();

        let (_db, vault) = vault_in(dir.path());
        vault.store_credentials("jira", &jira()).unwrap();
        assert_eq!(vault.get_credentials("jira").unwrap(), jira());
    }

    #[test]
    fn lists_services_in_name_order() {
        let dir = tempfile::tempdir().unwrap();
        let (_db, vault) = vault_in(dir.path());
        vault.store_credentials("vusion_cloud", &jira()).unwrap();
        vault.store_credentials("jira", &jira()).unwrap();
        let names: Vec<String> = vault
            .list_services()
            .unwrap()
            .into_iter()
            .map(|summary| summary.service)
            .collect();
        assert_eq!(names, vec!["jira", "vusion_cloud"]);
    }

    #[test]
    fn typed_round_trip_and_custom_schema() {
        let dir = tempfile::tempdir().unwrap();
        let (_db, vault) = vault_in(dir.path());
        let typed = ServiceCredentials::from_map(JIRA, &jira(), &SchemaRegistry::default()).unwrap();
        vault.store_typed(&typed).unwrap();
        assert_eq!(vault.typed_credentials(JIRA).unwrap(), typed);

        let mut map = CredentialMap::new();
        map.insert("routing_key".into(), "".into());
        vault.store_credentials("pagerduty", &map).unwrap();
        assert!(vault.test_credentials("pagerduty").0);
        vault.register_schema("pagerduty", &["routing_key"]);
        assert!(!vault.test_credentials("pagerduty").0);
    }

    #[test]
    fn key_is_persisted_before_first_record() {
        let dir = tempfile::tempdir().unwrap();
        let (_db, vault) = vault_in(dir.path());
        vault.store_credentials("jira", &jira()).unwrap();
        let store = FileKeyStore::new(dir.path().join("keys"));
        assert!(store.load(Keyspace::Credentials).unwrap().is_some());
    }
}
