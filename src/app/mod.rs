use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::CommandFactory;
use rpassword::prompt_password;
use tracing_appender::non_blocking::WorkerGuard;

use ap_support::cipher::{CipherProvider, DatabaseKeyStore, FileKeyStore, KeyStore, PassphraseKeyStore};
use ap_support::config::{AppConfig, KeyBackend, config_path, load_config};
use ap_support::devices::DeviceDirectory;
use ap_support::logging;
use ap_support::ssh::{SessionMultiplexer, Ssh2Connector};
use ap_support::storage::{DATABASE_FILE, Database};
use ap_support::trust::{CERTIFICATE_DIR, TlsFetcher, TrustStore};
use ap_support::vault::CredentialVault;

use crate::app::commands::{Cli, Command};
use crate::app::constants::PASSPHRASE_PROMPT;

pub(crate) mod commands;
mod constants;
mod handlers;
mod terminal;

const KEY_DIR_NAME: &str = "keys";

pub(crate) struct App {
    pub(crate) data_dir: PathBuf,
    pub(crate) vault: CredentialVault,
    pub(crate) devices: DeviceDirectory,
    pub(crate) trust: TrustStore,
    pub(crate) sessions: SessionMultiplexer,
    _log_guard: Option<WorkerGuard>,
}

impl App {
    pub(crate) fn load() -> Result<Self> {
        let config = load_config(&config_path()?)?;
        let data_dir = config.resolved_data_dir()?;
        std::fs::create_dir_all(&data_dir).context("create data dir")?;
        let guard = logging::init(&data_dir, &config.log)?;

        let db = Arc::new(Database::open(&data_dir.join(DATABASE_FILE)).context("open database")?);
        let store: Box<dyn KeyStore> = match config.key_backend {
            KeyBackend::File => Box::new(FileKeyStore::new(data_dir.join(KEY_DIR_NAME))),
            KeyBackend::Passphrase => {
                let passphrase = prompt_password(PASSPHRASE_PROMPT).context("read vault passphrase")?;
                Box::new(PassphraseKeyStore::new(data_dir.join(KEY_DIR_NAME), passphrase))
            }
            KeyBackend::Database => Box::new(DatabaseKeyStore::new(db.clone())),
        };
        tracing::info!(backend = store.describe(), dir = %data_dir.display(), "opening stores");

        let trust = TrustStore::open(
            &data_dir.join(CERTIFICATE_DIR),
            Box::new(TlsFetcher::new(config.tls.timeout())),
        );
        let mut app = Self::assemble(config, data_dir, db, store, trust);
        app._log_guard = Some(guard);
        Ok(app)
    }

    pub(crate) fn assemble(
        config: AppConfig,
        data_dir: PathBuf,
        db: Arc<Database>,
        store: Box<dyn KeyStore>,
        trust: TrustStore,
    ) -> Self {
        let cipher = Arc::new(CipherProvider::new(store));
        let sessions = SessionMultiplexer::new(Arc::new(Ssh2Connector), config.ssh.clone());
        Self {
            vault: CredentialVault::new(db.clone(), cipher.clone()),
            devices: DeviceDirectory::new(db, cipher),
            trust,
            sessions,
            data_dir,
            _log_guard: None,
        }
    }

    pub(crate) fn run(&self, command: Command, out: &mut dyn Write) -> Result<()> {
        match command {
            Command::Creds(command) => self.run_creds(command, out),
            Command::Device(command) => self.run_device(command, out),
            Command::Cert(command) => self.run_cert(command, out),
            Command::Ssh { ap_id, window } => self.run_shell(&ap_id, &window),
        }
    }

    pub(crate) fn help(out: &mut dyn Write) -> Result<()> {
        writeln!(out, "{}", Cli::command().render_help())?;
        Ok(())
    }
}
