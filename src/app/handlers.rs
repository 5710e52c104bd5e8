use std::io::{self, BufRead, Write};

use anyhow::{Result, anyhow, bail};
use crossterm::style::Stylize;
use rpassword::prompt_password;

use ap_support::devices::NewDevice;
use ap_support::model::{CertInfo, CertStatus, CredentialMap, CredentialValue};
use ap_support::sanitize;
use ap_support::trust::format_fingerprint;
use ap_support::vault::VaultHealth;

use crate::app::App;
use crate::app::commands::{CertCommand, CredsCommand, DeviceCommand, FieldArg};
use crate::app::constants::{
    DEVICE_PASSWORD_PROMPT, PLAIN_FIELDS, SECRET_MASK, TRUST_CONFIRM_WORD,
};

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M";

impl App {
    pub(super) fn run_creds(&self, command: CredsCommand, out: &mut dyn Write) -> Result<()> {
        match command {
            CredsCommand::List => {
                let services = self.vault.list_services().map_err(|err| failure("listing credentials", &err))?;
                if services.is_empty() {
                    writeln!(out, "No stored credentials")?;
                }
                for summary in services {
                    writeln!(
                        out,
                        "{:<20} updated {}",
                        summary.service,
                        summary.updated_at.format(TIME_FORMAT)
                    )?;
                }
            }
            CredsCommand::Show { service, reveal } => {
                let credentials = self
                    .vault
                    .get_credentials(&service)
                    .map_err(|err| failure("reading credentials", &err))?;
                if credentials.is_empty() {
                    writeln!(out, "No credentials found for {service}")?;
                }
                for (key, value) in &credentials {
                    writeln!(out, "{key} = {}", display_value(key, value, reveal))?;
                }
            }
            CredsCommand::Set { service, fields } => {
                let mut data = CredentialMap::new();
                for field in fields {
                    let (key, value) = match field {
                        FieldArg::Value(key, value) => (key, value),
                        FieldArg::Prompt(key) => {
                            let value = prompt_password(format!("{key}: "))?;
                            (key, value)
                        }
                    };
                    data.insert(key, parse_value(value));
                }
                self.vault
                    .store_credentials(&service, &data)
                    .map_err(|err| failure("storing credentials", &err))?;
                writeln!(out, "Stored {} field(s) for {service}", data.len())?;
            }
            CredsCommand::Delete { service } => {
                let removed = self
                    .vault
                    .delete_credentials(&service)
                    .map_err(|err| failure("deleting credentials", &err))?;
                if removed {
                    writeln!(out, "Deleted credentials for {service}")?;
                } else {
                    writeln!(out, "No credentials found for {service}")?;
                }
            }
            CredsCommand::Test { service } => {
                let (ok, message) = self.vault.test_credentials(&service);
                let label = if ok { "ok".green() } else { "failed".red() };
                writeln!(out, "[{label}] {message}")?;
            }
            CredsCommand::Health => {
                let health = self.vault.health().map_err(|err| failure("checking the vault", &err))?;
                let line = match health {
                    VaultHealth::Empty => "Vault is empty".to_string(),
                    VaultHealth::Healthy { records } => format!("{records} record(s), all readable"),
                    VaultHealth::Degraded { unreadable } => format!(
                        "{} unreadable record(s): {}",
                        unreadable.len(),
                        unreadable.join(", ")
                    )
                    .yellow()
                    .to_string(),
                    VaultHealth::KeyLost { records } => format!(
                        "None of {records} record(s) can be decrypted; the encryption key is lost. \
                         Re-enter the credentials to recover."
                    )
                    .red()
                    .bold()
                    .to_string(),
                };
                writeln!(out, "{line}")?;
                writeln!(out, "data dir: {}", self.data_dir.display())?;
            }
        }
        Ok(())
    }

    pub(super) fn run_device(&self, command: DeviceCommand, out: &mut dyn Write) -> Result<()> {
        match command {
            DeviceCommand::Add {
                ap_id,
                host,
                port,
                username,
            } => {
                let password = prompt_password(DEVICE_PASSWORD_PROMPT)?;
                let mut device = NewDevice::new(&ap_id, &host, &password);
                device.port = port;
                if let Some(username) = username {
                    device.ssh_username = username;
                }
                self.add_device(&device, out)?;
            }
            DeviceCommand::List => {
                let devices = self.devices.list().map_err(|err| failure("listing devices", &err))?;
                if devices.is_empty() {
                    writeln!(out, "No devices")?;
                }
                for device in devices {
                    let java = device.java_version.as_deref().unwrap_or("-");
                    writeln!(
                        out,
                        "{:<16} {}@{}:{}  java {java}",
                        device.ap_id, device.ssh_username, device.host, device.port
                    )?;
                }
            }
            DeviceCommand::Remove { ap_id } => {
                let removed = self
                    .devices
                    .remove(&ap_id)
                    .map_err(|err| failure("removing device", &err))?;
                if removed {
                    writeln!(out, "Removed {ap_id}")?;
                } else {
                    writeln!(out, "Unknown device {ap_id}")?;
                }
            }
        }
        Ok(())
    }

    pub(super) fn record_java_version(&self, ap_id: &str, version: &str) {
        match self.devices.set_java_version(ap_id, version) {
            Ok(true) => {}
            Ok(false) => tracing::warn!(ap_id, "java version for unknown device"),
            Err(err) => tracing::warn!(ap_id, error = %err, "java version not saved"),
        }
    }

    pub(super) fn add_device(&self, device: &NewDevice, out: &mut dyn Write) -> Result<()> {
        self.devices
            .upsert(device)
            .map_err(|err| failure("saving device", &err))?;
        writeln!(out, "Saved {}", device.ap_id)?;
        Ok(())
    }

    pub(super) fn run_cert(&self, command: CertCommand, out: &mut dyn Write) -> Result<()> {
        match command {
            CertCommand::List => {
                let pins = self.trust.trusted_certificates();
                if pins.is_empty() {
                    writeln!(out, "No trusted certificates")?;
                }
                for pin in pins {
                    writeln!(out, "{}:{}  {}", pin.host, pin.port, pin.subject)?;
                    writeln!(out, "  sha256 {}", format_fingerprint(&pin.fingerprint))?;
                    writeln!(
                        out,
                        "  trusted {}  expires {}",
                        pin.trusted_at.format(TIME_FORMAT),
                        pin.not_after.format(TIME_FORMAT)
                    )?;
                }
            }
            CertCommand::Verify(endpoint) => {
                let (host, port) = endpoint.resolve()?;
                let verification = self.trust.verify_certificate(&host, port);
                if let Some(error) = &verification.error {
                    bail!(sanitize::report("checking the certificate", error));
                }
                write_status(out, &host, port, verification.status)?;
                if let Some(info) = &verification.info {
                    write_info(out, info)?;
                }
            }
            CertCommand::Trust { endpoint, yes } => {
                let (host, port) = endpoint.resolve()?;
                let verification = self.trust.verify_certificate(&host, port);
                if let Some(error) = &verification.error {
                    bail!(sanitize::report("fetching the certificate", error));
                }
                let info = verification
                    .info
                    .ok_or_else(|| anyhow!("no certificate was presented"))?;
                write_status(out, &host, port, verification.status)?;
                write_info(out, &info)?;
                if verification.status == CertStatus::Trusted {
                    return Ok(());
                }
                if !yes && !confirm(out)? {
                    writeln!(out, "Not trusted")?;
                    return Ok(());
                }
                self.trust
                    .trust_certificate(&host, port, Some(&info))
                    .map_err(|err| failure("saving the certificate", &err))?;
                writeln!(out, "Trusted {host}:{port}")?;
            }
            CertCommand::Remove(endpoint) => {
                let (host, port) = endpoint.resolve()?;
                let removed = self
                    .trust
                    .remove_certificate(&host, port)
                    .map_err(|err| failure("removing the certificate", &err))?;
                if removed {
                    writeln!(out, "Removed pin for {host}:{port}")?;
                } else {
                    writeln!(out, "No pin for {host}:{port}")?;
                }
            }
        }
        Ok(())
    }
}

pub(super) fn failure(context: &str, err: &dyn std::fmt::Display) -> anyhow::Error {
    anyhow!(sanitize::report(context, err))
}

fn parse_value(value: String) -> CredentialValue {
    match value.as_str() {
        "true" => CredentialValue::Flag(true),
        "false" => CredentialValue::Flag(false),
        _ => CredentialValue::Text(value),
    }
}

fn display_value(key: &str, value: &CredentialValue, reveal: bool) -> String {
    match value {
        CredentialValue::Flag(flag) => flag.to_string(),
        CredentialValue::Text(text) if reveal || PLAIN_FIELDS.contains(&key) => text.clone(),
        CredentialValue::Text(_) => SECRET_MASK.to_string(),
    }
}

fn write_status(out: &mut dyn Write, host: &str, port: u16, status: CertStatus) -> Result<()> {
    match status {
        CertStatus::Trusted => writeln!(out, "{host}:{port} {}", "trusted".green())?,
        CertStatus::New => writeln!(out, "{host}:{port} {}", "not trusted yet".yellow())?,
        CertStatus::Changed => {
            writeln!(
                out,
                "{}",
                format!("WARNING: the certificate for {host}:{port} has CHANGED since it was trusted")
                    .red()
                    .bold()
            )?;
            writeln!(
                out,
                "{}",
                "Someone may be intercepting the connection. Trust it only if the change is expected.".red()
            )?;
        }
        CertStatus::Error => writeln!(out, "{host}:{port} {}", "error".red())?,
    }
    Ok(())
}

fn write_info(out: &mut dyn Write, info: &CertInfo) -> Result<()> {
    writeln!(out, "  subject  {}", info.subject)?;
    writeln!(out, "  issuer   {}", info.issuer)?;
    if let Some(common_name) = &info.common_name {
        writeln!(out, "  cn       {common_name}")?;
    }
    writeln!(
        out,
        "  valid    {} .. {}",
        info.not_before.format(TIME_FORMAT),
        info.not_after.format(TIME_FORMAT)
    )?;
    if !info.subject_alt_names.is_empty() {
        writeln!(out, "  san      {}", info.subject_alt_names.join(", "))?;
    }
    writeln!(out, "  serial   {} (v{})", info.serial_number, info.version)?;
    writeln!(out, "  sha256   {}", format_fingerprint(&info.fingerprint))?;
    Ok(())
}

fn confirm(out: &mut dyn Write) -> Result<bool> {
    write!(out, "Type '{TRUST_CONFIRM_WORD}' to trust this certificate: ")?;
    out.flush()?;
    let mut answer = String::new();
    io::stdin().lock().read_line(&mut answer)?;
    Ok(answer.trim() == TRUST_CONFIRM_WORD)
}
