use std::io::{self, BufRead, Write};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use crossterm::style::Stylize;

use ap_support::model::{ConnectionEvent, ConnectionState};
use ap_support::ssh::SshConnection;

use crate::app::App;
use crate::app::constants::{SHELL_HELP, SHELL_QUIT, SHELL_RECOVER, SHELL_STATUS, SHELL_USAGE};
use crate::app::handlers::failure;

const TICK: Duration = Duration::from_millis(50);

impl App {
    pub(super) fn run_shell(&self, ap_id: &str, window: &str) -> Result<()> {
        let target = self
            .devices
            .target(ap_id)
            .map_err(|err| failure("loading the device", &err))?
            .ok_or_else(|| anyhow!("Unknown device {ap_id}; add it with `device add`"))?;
        let outcome = self
            .sessions
            .open(window, ap_id, target)
            .map_err(|err| failure("connecting", &err))?;
        eprintln!("{}", outcome.message().dim());

        let sessions = &self.sessions;
        let events = sessions
            .with_connection(window, ap_id, SshConnection::subscribe)
            .ok_or_else(|| anyhow!("Connection to {ap_id} is not open"))?;
        let lines = spawn_stdin_reader()?;
        let mut stdout = io::stdout();

        thread::scope(|scope| -> Result<()> {
            loop {
                if let Some(output) = sessions.with_connection(window, ap_id, SshConnection::get_output) {
                    if !output.is_empty() {
                        write!(stdout, "{output}")?;
                        stdout.flush()?;
                    }
                }
                for event in events.try_iter() {
                    if let ConnectionEvent::JavaVersion { device_id, version } = &event {
                        self.record_java_version(device_id, version);
                    }
                    report_event(&event);
                }
                let ended = sessions
                    .with_connection(window, ap_id, |connection| {
                        connection.state() == ConnectionState::Disconnected
                            && !connection.is_reconnecting()
                    })
                    .unwrap_or(true);
                if ended {
                    eprintln!("{}", format!("Connection to {ap_id} closed").yellow());
                    break;
                }

                let line = match lines.recv_timeout(TICK) {
                    Ok(line) => line,
                    Err(RecvTimeoutError::Timeout) => continue,
                    Err(RecvTimeoutError::Disconnected) => break,
                };
                match line.trim() {
                    SHELL_QUIT => break,
                    SHELL_HELP => eprintln!("{SHELL_USAGE}"),
                    SHELL_STATUS => {
                        let state = sessions.with_connection(window, ap_id, SshConnection::state);
                        eprintln!("{ap_id} in window {window}: {state:?}");
                    }
                    SHELL_RECOVER => {
                        eprintln!("{}", "Starting service mode recovery".yellow());
                        thread::Builder::new()
                            .name("recovery".to_string())
                            .spawn_scoped(scope, move || {
                                let result = sessions.with_connection(
                                    window,
                                    ap_id,
                                    SshConnection::recover_service_mode,
                                );
                                if let Some(Err(err)) = result {
                                    eprintln!("{}", failure("recovering", &err).to_string().red());
                                }
                            })
                            .context("spawn recovery thread")?;
                    }
                    _ => {
                        let sent = sessions
                            .with_connection(window, ap_id, |connection| connection.send_command(&line));
                        if let Some(Err(err)) = sent {
                            eprintln!("{}", failure("sending", &err).to_string().red());
                        }
                    }
                }
            }
            Ok(())
        })?;

        sessions.close(window, ap_id);
        tracing::info!(device = ap_id, window, "shell session ended");
        Ok(())
    }
}

fn report_event(event: &ConnectionEvent) {
    match event {
        ConnectionEvent::ServiceModeDetected { device_id } => {
            eprintln!("{}", format!("{device_id} is in service mode").yellow().bold());
        }
        ConnectionEvent::JavaVersion { device_id, version } => {
            eprintln!("{}", format!("{device_id} runs Java {version}").dim());
        }
        ConnectionEvent::RecoveryFinished {
            device_id,
            ok: true,
            attempts,
        } => {
            eprintln!(
                "{}",
                format!("{device_id} recovered after {attempts} attempt(s)").green()
            );
        }
        ConnectionEvent::RecoveryFinished {
            device_id,
            ok: false,
            attempts,
        } => {
            eprintln!(
                "{}",
                format!("{device_id} still in service mode after {attempts} attempt(s)").red()
            );
        }
        ConnectionEvent::StateChanged { .. } | ConnectionEvent::Closed { .. } => {}
    }
}

fn spawn_stdin_reader() -> Result<Receiver<String>> {
    let (tx, rx) = mpsc::channel();
    thread::Builder::new()
        .name("stdin".to_string())
        .spawn(move || {
            for line in io::stdin().lock().lines() {
                let Ok(line) = line else { break };
                if tx.send(line).is_err() {
                    break;
                }
            }
        })
        .context("spawn stdin reader")?;
    Ok(rx)
}
