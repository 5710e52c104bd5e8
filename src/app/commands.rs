use anyhow::{Result, anyhow, bail};
use clap::{Args, Parser, Subcommand};

use ap_support::config::DEFAULT_SSH_PORT;
use ap_support::trust::endpoint_from_url;

use crate::app::constants::{DEFAULT_TLS_PORT, DEFAULT_WINDOW, ENVIRONMENT_HELP};

#[derive(Debug, Parser)]
#[command(
    name = "ap-support",
    version,
    about = "Credential vault, certificate pinning and SSH sessions for ESL access points",
    after_help = ENVIRONMENT_HELP
)]
pub(crate) struct Cli {
    #[command(subcommand)]
    pub(crate) command: Option<Command>,
}

#[derive(Debug, Clone, PartialEq, Eq, Subcommand)]
pub(crate) enum Command {
    /// Encrypted API credentials
    #[command(subcommand)]
    Creds(CredsCommand),
    /// Access points and their SSH logins
    #[command(subcommand)]
    Device(DeviceCommand),
    /// Pinned TLS certificates
    #[command(subcommand)]
    Cert(CertCommand),
    /// Interactive shell on an access point (`:help` inside)
    Ssh {
        ap_id: String,
        #[arg(long, default_value = DEFAULT_WINDOW)]
        window: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Subcommand)]
pub(crate) enum CredsCommand {
    /// Stored services
    List,
    /// Decrypted fields, secrets masked
    Show {
        service: String,
        #[arg(long)]
        reveal: bool,
    },
    /// Store fields; a bare key is read from a hidden prompt
    Set {
        service: String,
        #[arg(required = true, value_parser = parse_field)]
        fields: Vec<FieldArg>,
    },
    Delete { service: String },
    /// Check that the required fields are present
    Test { service: String },
    /// Report unreadable records or a lost key
    Health,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum FieldArg {
    Value(String, String),
    Prompt(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Subcommand)]
pub(crate) enum DeviceCommand {
    /// Save an access point; the SSH password is prompted for
    Add {
        ap_id: String,
        host: String,
        #[arg(long, default_value_t = DEFAULT_SSH_PORT)]
        port: u16,
        #[arg(long = "user")]
        username: Option<String>,
    },
    List,
    Remove { ap_id: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Subcommand)]
pub(crate) enum CertCommand {
    /// Compare the live certificate with the pin
    Verify(Endpoint),
    /// Pin the certificate currently served
    Trust {
        #[command(flatten)]
        endpoint: Endpoint,
        #[arg(long)]
        yes: bool,
    },
    Remove(Endpoint),
    List,
}

#[derive(Debug, Clone, PartialEq, Eq, Args)]
pub(crate) struct Endpoint {
    /// Host name, address or https:// URL
    target: String,
    port: Option<u16>,
}

impl Endpoint {
    pub(crate) fn resolve(&self) -> Result<(String, u16)> {
        if self.target.contains("://") {
            if self.port.is_some() {
                bail!("give the port inside the URL, not after it");
            }
            return endpoint_from_url(&self.target)
                .ok_or_else(|| anyhow!("cannot read a host from '{}'", self.target));
        }
        Ok((self.target.clone(), self.port.unwrap_or(DEFAULT_TLS_PORT)))
    }
}

fn parse_field(pair: &str) -> Result<FieldArg, String> {
    match pair.split_once('=') {
        Some((key, _)) if key.trim().is_empty() => Err(format!("empty field name in '{pair}'")),
        Some((key, value)) => Ok(FieldArg::Value(key.trim().to_string(), value.to_string())),
        None if pair.trim().is_empty() => Err("empty field name".to_string()),
        None => Ok(FieldArg::Prompt(pair.trim().to_string())),
    }
}
