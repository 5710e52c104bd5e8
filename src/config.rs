use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};

pub const APP_DIR_NAME: &str = "ap-support";
pub const DEFAULT_SSH_PORT: u16 = 22;
pub const DEFAULT_AUTOMATION_BUFFER_CHARS: usize = 5000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum KeyBackend {
    #[default]
    File,
    Passphrase,
    Database,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub data_dir: Option<PathBuf>,
    pub key_backend: KeyBackend,
    pub ssh: SshSettings,
    pub tls: TlsSettings,
    pub log: LogSettings,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            key_backend: KeyBackend::File,
            ssh: SshSettings::default(),
            tls: TlsSettings::default(),
            log: LogSettings::default(),
        }
    }
}

impl AppConfig {
    pub fn resolved_data_dir(&self) -> Result<PathBuf> {
        match &self.data_dir {
            Some(dir) => Ok(dir.clone()),
            None => default_data_dir(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SshSettings {
    pub port: u16,
    pub connect_timeout_ms: u64,
    pub pty_cols: u32,
    pub pty_rows: u32,
    pub poll_interval_ms: u64,
    pub automation_buffer_chars: usize,
    pub probe_delay_ms: u64,
    pub probe_window_chars: usize,
    pub auto_recover: bool,
    pub service_mode: ServiceModeProtocol,
}

impl Default for SshSettings {
    fn default() -> Self {
        Self {
            port: DEFAULT_SSH_PORT,
            connect_timeout_ms: 10_000,
            pty_cols: 120,
            pty_rows: 40,
            poll_interval_ms: 10,
            automation_buffer_chars: DEFAULT_AUTOMATION_BUFFER_CHARS,
            probe_delay_ms: 4_000,
            probe_window_chars: 1_000,
            auto_recover: true,
            service_mode: ServiceModeProtocol::default(),
        }
    }
}

impl SshSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn probe_delay(&self) -> Duration {
        Duration::from_millis(self.probe_delay_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnlockStep {
    pub command: String,
    pub delay_ms: u64,
}

impl UnlockStep {
    pub fn new(command: &str, delay_ms: u64) -> Self {
        Self {
            command: command.to_string(),
            delay_ms,
        }
    }

    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}

// The delays are field-observed defaults, not a vendor contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceModeProtocol {
    pub markers: Vec<String>,
    pub unlock_steps: Vec<UnlockStep>,
    pub settle_ms: u64,
    pub max_attempts: u32,
    /// Sent once service mode is detected; empty skips the query.
    pub status_command: String,
    pub status_wait_ms: u64,
    pub version_label: String,
}

impl Default for ServiceModeProtocol {
    fn default() -> Self {
        Self {
            markers: vec!["servicemode>".to_string(), "service mode".to_string()],
            unlock_steps: vec![
                UnlockStep::new("extended matex2010", 2_000),
                UnlockStep::new("enableshell true", 2_000),
                UnlockStep::new("exit", 1_000),
                UnlockStep::new("exit", 2_000),
            ],
            settle_ms: 1_000,
            max_attempts: 3,
            status_command: "status".to_string(),
            status_wait_ms: 3_000,
            version_label: "Java Version".to_string(),
        }
    }
}

impl ServiceModeProtocol {
    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    pub fn status_wait(&self) -> Duration {
        Duration::from_millis(self.status_wait_ms)
    }

    pub fn parse_version(&self, output: &str) -> Option<String> {
        if self.version_label.trim().is_empty() {
            return None;
        }
        let pattern = format!(r"(?i){}\s*[:=]?\s*([^\r\n]+)", regex::escape(self.version_label.trim()));
        let re = Regex::new(&pattern).ok()?;
        re.captures_iter(output)
            .filter_map(|caps| caps.get(1))
            .map(|value| value.as_str().trim().to_string())
            .filter(|value| !value.is_empty())
            .last()
    }

    pub fn detect(&self, output: &str) -> bool {
        let lowered = output.to_lowercase();
        self.markers
            .iter()
            .any(|marker| lowered.contains(&marker.to_lowercase()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsSettings {
    pub timeout_ms: u64,
}

impl Default for TlsSettings {
    fn default() -> Self {
        Self { timeout_ms: 10_000 }
    }
}

impl TlsSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogSettings {
    pub level: String,
    pub retention_days: i64,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            retention_days: 7,
        }
    }
}

pub fn config_path() -> Result<PathBuf> {
    if let Some(mut dir) = dirs::config_dir() {
        dir.push(APP_DIR_NAME);
        dir.push("config.json");
        return Ok(dir);
    }
    let mut fallback = std::env::current_dir().context("current dir")?;
    fallback.push("ap-support-config.json");
    Ok(fallback)
}

pub fn default_data_dir() -> Result<PathBuf> {
    if let Some(mut dir) = dirs::data_local_dir() {
        dir.push(APP_DIR_NAME);
        return Ok(dir);
    }
    let mut fallback = std::env::current_dir().context("current dir")?;
    fallback.push(".ap-support");
    Ok(fallback)
}

pub fn load_config(path: &Path) -> Result<AppConfig> {
    if !path.exists() {
        return Ok(AppConfig::default());
    }
    let content = fs::read_to_string(path).context("read config file")?;
    let config = serde_json::from_str(&content).context("parse config file")?;
    Ok(config)
}

pub fn save_config(path: &Path, config: &AppConfig) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).context("create config dir")?;
    }
    let content = serde_json::to_string_pretty(config).context("serialize config")?;
    fs::write(path, content).context("write config file")?;
    Ok(())
}
