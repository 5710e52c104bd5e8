use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::NaiveDate;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

use crate::config::LogSettings;

pub const LOG_DIR_NAME: &str = "logs";
pub const LOG_FILE_PREFIX: &str = "ap-support.log";
pub const LOG_ENV_VAR: &str = "AP_SUPPORT_LOG";
const LOG_DATE_FORMAT: &str = "%Y-%m-%d";

pub fn log_dir(data_dir: &Path) -> PathBuf {
    data_dir.join(LOG_DIR_NAME)
}

fn file_date(path: &Path) -> Option<NaiveDate> {
    let name = path.file_name()?.to_str()?;
    let date = name.strip_prefix(LOG_FILE_PREFIX)?.strip_prefix('.')?;
    NaiveDate::parse_from_str(date, LOG_DATE_FORMAT).ok()
}

pub fn prune_logs(dir: &Path, retention_days: i64, today: NaiveDate) -> usize {
    let Ok(entries) = fs::read_dir(dir) else {
        return 0;
    };
    let cutoff = today - chrono::Duration::days(retention_days.max(0));
    entries
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| file_date(path).is_some_and(|date| date < cutoff))
        .filter(|path| fs::remove_file(path).is_ok())
        .count()
}

fn env_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV_VAR).unwrap_or_else(|_| {
        EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"))
    })
}

/// Keep the returned guard alive until exit so buffered lines flush.
pub fn init(data_dir: &Path, settings: &LogSettings) -> Result<WorkerGuard> {
    let dir = log_dir(data_dir);
    fs::create_dir_all(&dir).context("create log dir")?;
    let pruned = prune_logs(&dir, settings.retention_days, chrono::Local::now().date_naive());

    let appender = tracing_appender::rolling::daily(&dir, LOG_FILE_PREFIX);
    let (writer, guard) = tracing_appender::non_blocking(appender);
    let file_layer = fmt::layer()
        .with_writer(writer)
        .with_ansi(false)
        .with_target(true)
        .with_thread_names(true);

    tracing_subscriber::registry()
        .with(env_filter(&settings.level))
        .with(file_layer)
        .try_init()
        .context("install log subscriber")?;

    tracing::info!(dir = %dir.display(), level = %settings.level, "logging initialized");
    if pruned > 0 {
        tracing::info!(pruned, "removed old log files");
    }
    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prunes_only_expired_daily_files() {
        let dir = tempfile::tempdir().unwrap();
        let today = NaiveDate::from_ymd_opt(2026, 10, 17).unwrap();
        for name in [
            "ap-support.log.2026-10-01",
            "ap-support.log.2026-10-12",
            "ap-support.log.2026-10-17",
            "notes.txt",
        ] {
            fs::write(dir.path().join(name), "line\n").unwrap();
        }

        assert_eq!(prune_logs(dir.path(), 7, today), 1);
        assert!(!dir.path().join("ap-support.log.2026-10-01").exists());
        assert!(dir.path().join("ap-support.log.2026-10-12").exists());
        assert!(dir.path().join("ap-support.log.2026-10-17").exists());
        assert!(dir.path().join("notes.txt").exists());
    }

    #[test]
    fn missing_dir_prunes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let today = NaiveDate::from_ymd_opt(2026, 10, 17).unwrap();
        assert_eq!(prune_logs(&dir.path().join("absent"), 7, today), 0);
    }

    #[test]
    fn file_dates_need_the_prefix() {
        assert_eq!(
            file_date(Path::new("/x/ap-support.log.2026-01-02")),
            NaiveDate::from_ymd_opt(2026, 1, 2)
        );
        assert_eq!(file_date(Path::new("/x/other.log.2026-01-02")), None);
        assert_eq!(file_date(Path::new("/x/ap-support.log")), None);
    }
}
