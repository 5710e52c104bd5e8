pub(crate) const DEFAULT_WINDOW: &str = "main";
pub(crate) const DEFAULT_TLS_PORT: u16 = 443;

pub(crate) const PASSPHRASE_PROMPT: &str = "Vault passphrase: ";
pub(crate) const DEVICE_PASSWORD_PROMPT: &str = "SSH password: ";
pub(crate) const TRUST_CONFIRM_WORD: &str = "yes";

pub(crate) const SECRET_MASK: &str = "********";
pub(crate) const PLAIN_FIELDS: &[&str] = &["url", "username", "email", "verify_ssl"];

pub(crate) const SHELL_QUIT: &str = ":quit";
pub(crate) const SHELL_RECOVER: &str = ":recover";
pub(crate) const SHELL_STATUS: &str = ":status";
pub(crate) const SHELL_HELP: &str = ":help";

pub(crate) const ENVIRONMENT_HELP: &str = "Environment: AP_SUPPORT_LOG overrides the configured log level";

pub(crate) const SHELL_USAGE: &str = "\
  :recover   run service mode recovery
  :status    connection state
  :quit      close the tab and exit";
