use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EncryptedBlob {
    pub nonce: String,
    pub ciphertext: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum CredentialValue {
    Flag(bool),
    Text(String),
}

impl CredentialValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            CredentialValue::Text(text) => Some(text),
            CredentialValue::Flag(_) => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            CredentialValue::Flag(flag) => Some(*flag),
            CredentialValue::Text(text) => match text.trim().to_ascii_lowercase().as_str() {
                "true" | "yes" | "1" => Some(true),
                "false" | "no" | "0" => Some(false),
                _ => None,
            },
        }
    }

    pub fn is_blank(&self) -> bool {
        match self {
            CredentialValue::Text(text) => text.trim().is_empty(),
            CredentialValue::Flag(flag) => !flag,
        }
    }
}

impl From<&str> for CredentialValue {
    fn from(value: &str) -> Self {
        CredentialValue::Text(value.to_string())
    }
}

impl From<String> for CredentialValue {
    fn from(value: String) -> Self {
        CredentialValue::Text(value)
    }
}

impl From<bool> for CredentialValue {
    fn from(value: bool) -> Self {
        CredentialValue::Flag(value)
    }
}

pub type CredentialMap = BTreeMap<String, CredentialValue>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServiceSummary {
    pub service: String,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CertInfo {
    pub fingerprint: String,
    pub subject: String,
    pub issuer: String,
    #[serde(default)]
    pub common_name: Option<String>,
    #[serde(default)]
    pub version: u32,
    #[serde(default)]
    pub serial_number: String,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    #[serde(default)]
    pub subject_alt_names: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TrustedCertificate {
    pub host: String,
    pub port: u16,
    pub fingerprint: String,
    pub subject: String,
    pub issuer: String,
    pub not_after: DateTime<Utc>,
    pub trusted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CertStatus {
    Trusted,
    New,
    Changed,
    Error,
}

impl fmt::Display for CertStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            CertStatus::Trusted => "trusted",
            CertStatus::New => "new",
            CertStatus::Changed => "changed",
            CertStatus::Error => "error",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verification {
    pub status: CertStatus,
    pub info: Option<CertInfo>,
    pub error: Option<String>,
}

impl Verification {
    pub fn is_trusted(&self) -> bool {
        self.status == CertStatus::Trusted
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct SshTarget {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
}

impl SshTarget {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            username: username.into(),
            password: password.into(),
        }
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Debug for SshTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SshTarget")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceRecord {
    pub ap_id: String,
    pub host: String,
    pub port: u16,
    pub ssh_username: String,
    pub java_version: Option<String>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    ServiceModeDetected,
    Recovering,
}

impl ConnectionState {
    pub fn has_shell(self) -> bool {
        matches!(
            self,
            ConnectionState::Connected
                | ConnectionState::ServiceModeDetected
                | ConnectionState::Recovering
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    StateChanged {
        device_id: String,
        state: ConnectionState,
    },
    ServiceModeDetected {
        device_id: String,
    },
    JavaVersion {
        device_id: String,
        version: String,
    },
    RecoveryFinished {
        device_id: String,
        ok: bool,
        attempts: u32,
    },
    Closed {
        device_id: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryReport {
    pub attempts: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpenOutcome {
    Connected(String),
    Existing(String),
    Pending(String),
}

impl OpenOutcome {
    pub fn message(&self) -> &str {
        match self {
            OpenOutcome::Connected(message)
            | OpenOutcome::Existing(message)
            | OpenOutcome::Pending(message) => message,
        }
    }
}
