pub mod cipher;
pub mod config;
pub mod devices;
pub mod error;
pub mod logging;
pub mod model;
pub mod sanitize;
pub mod ssh;
pub mod storage;
pub mod trust;
pub mod vault;

pub use cipher::{CipherProvider, DatabaseKeyStore, FileKeyStore, KeyStore, Keyspace, PassphraseKeyStore};
pub use config::AppConfig;
pub use devices::{DeviceDirectory, NewDevice};
pub use error::{CertError, CipherError, SshError, StorageError, VaultError};
pub use ssh::{SessionMultiplexer, SshConnection, Ssh2Connector};
pub use storage::Database;
pub use trust::{TlsFetcher, TrustStore};
pub use vault::{CredentialVault, VaultHealth};
