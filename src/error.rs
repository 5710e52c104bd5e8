use thiserror::Error;

#[derive(Debug, Error)]
pub enum CipherError {
    #[error("key store error: {0}")]
    KeyStore(String),

    #[error("random generator failed")]
    Random,

    #[error("encryption failed")]
    Encrypt,

    #[error("decryption failed")]
    Decryption,

    #[error("persisted key does not match the generated key")]
    KeyNotPersisted,

    #[error("no encryption key is stored")]
    MissingKey,
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum VaultError {
    #[error("credential storage is unavailable")]
    Storage(#[source] StorageError),

    #[error("encryption key is unavailable")]
    Cipher(#[source] CipherError),

    #[error("stored credentials for {service} could not be decrypted")]
    Unreadable { service: String },

    #[error("no stored credentials can be decrypted; the encryption key appears to be lost")]
    KeyUnavailable,

    #[error("invalid credentials for {service}: {message}")]
    Validation { service: String, message: String },
}

impl From<StorageError> for VaultError {
    fn from(err: StorageError) -> Self {
        VaultError::Storage(err)
    }
}

impl From<CipherError> for VaultError {
    fn from(err: CipherError) -> Self {
        match err {
            CipherError::MissingKey => VaultError::KeyUnavailable,
            err => VaultError::Cipher(err),
        }
    }
}

#[derive(Debug, Error)]
pub enum CertError {
    #[error("connection failed: {0}")]
    Connection(String),

    #[error("connection timed out: {0}")]
    Timeout(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("certificate could not be parsed: {0}")]
    Parse(String),

    #[error("certificate cache error: {0}")]
    Storage(String),

    #[error("no trusted certificate for {0}")]
    NotTrusted(String),
}

impl CertError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, CertError::Connection(_) | CertError::Timeout(_))
    }
}

#[derive(Debug, Error)]
pub enum SshError {
    #[error("Authentication failed - check username/password")]
    Auth,

    #[error("Connection to {0} timed out")]
    Timeout(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("SSH protocol error: {0}")]
    Protocol(String),

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Not connected")]
    NotConnected,

    #[error("Service mode recovery failed after {attempts} attempt(s)")]
    RecoveryFailed { attempts: u32 },

    #[error("Operation cancelled")]
    Cancelled,
}

impl SshError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SshError::Timeout(_) | SshError::Network(_) | SshError::Channel(_)
        )
    }
}

impl From<ssh2::Error> for SshError {
    fn from(err: ssh2::Error) -> Self {
        SshError::Protocol(err.message().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_failures_are_not_retryable() {
        assert!(!SshError::Auth.is_retryable());
        assert!(!SshError::RecoveryFailed { attempts: 3 }.is_retryable());
        assert!(SshError::Timeout("10.0.0.1:22".into()).is_retryable());
    }

    #[test]
    fn cert_errors_distinguish_network_from_protocol() {
        assert!(CertError::Timeout("host:443".into()).is_retryable());
        assert!(!CertError::Tls("handshake".into()).is_retryable());
    }

    #[test]
    fn unreadable_message_does_not_leak_detail() {
        let err = VaultError::Unreadable {
            service: "jira".into(),
        };
        assert_eq!(
            err.to_string(),
            "stored credentials for jira could not be decrypted"
        );
    }
}
