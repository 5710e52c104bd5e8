use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::config::SshSettings;
use crate::error::SshError;
use crate::model::{OpenOutcome, SshTarget};
use crate::ssh::connection::SshConnection;
use crate::ssh::transport::ShellConnector;

enum Slot {
    Connecting(u64),
    Live(Arc<SshConnection>),
}

struct SshWindow {
    title: String,
    visible: bool,
    active: Option<String>,
    tabs: BTreeMap<String, Slot>,
}

impl SshWindow {
    fn new(window_id: &str) -> Self {
        Self {
            title: format!("SSH - {window_id}"),
            visible: true,
            active: None,
            tabs: BTreeMap::new(),
        }
    }

    fn remove_tab(&mut self, device_id: &str) -> Option<Slot> {
        let slot = self.tabs.remove(device_id)?;
        if self.active.as_deref() == Some(device_id) {
            self.active = self.tabs.keys().next().cloned();
        }
        Some(slot)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowSummary {
    pub window_id: String,
    pub title: String,
    pub visible: bool,
    pub active_device: Option<String>,
    pub devices: Vec<String>,
}

fn shut_down(slots: impl IntoIterator<Item = Slot>) {
    for slot in slots {
        if let Slot::Live(connection) = slot {
            connection.disconnect(false);
        }
    }
}

/// Registry of SSH windows and their per-device tabs. At most one tab, and
/// so one channel, exists per window and device.
pub struct SessionMultiplexer {
    connector: Arc<dyn ShellConnector>,
    settings: SshSettings,
    windows: Mutex<BTreeMap<String, SshWindow>>,
    next_ticket: AtomicU64,
}

impl SessionMultiplexer {
    pub fn new(connector: Arc<dyn ShellConnector>, settings: SshSettings) -> Self {
        Self {
            connector,
            settings,
            windows: Mutex::new(BTreeMap::new()),
            next_ticket: AtomicU64::new(1),
        }
    }

    pub fn open(
        &self,
        window_id: &str,
        device_id: &str,
        target: SshTarget,
    ) -> Result<OpenOutcome, SshError> {
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        let stale = {
            let mut windows = self.windows.lock();
            let window = windows
                .entry(window_id.to_string())
                .or_insert_with(|| SshWindow::new(window_id));
            window.visible = true;
            let stale = match window.tabs.get(device_id) {
                Some(Slot::Live(connection)) if connection.is_connected() => {
                    window.active = Some(device_id.to_string());
                    return Ok(OpenOutcome::Existing(format!(
                        "Already connected to {device_id}"
                    )));
                }
                Some(Slot::Connecting(_)) => {
                    return Ok(OpenOutcome::Pending(format!(
                        "Connection to {device_id} already in progress"
                    )));
                }
                Some(Slot::Live(_)) => window.tabs.remove(device_id),
                None => None,
            };
            window
                .tabs
                .insert(device_id.to_string(), Slot::Connecting(ticket));
            stale
        };
        shut_down(stale);

        let connection = Arc::new(SshConnection::new(
            device_id,
            target,
            self.settings.clone(),
            self.connector.clone(),
        ));
        let result = connection.connect();

        let mut windows = self.windows.lock();
        let reserved = windows.get(window_id).is_some_and(|window| {
            matches!(window.tabs.get(device_id), Some(Slot::Connecting(held)) if *held == ticket)
        });
        match result {
            Ok(message) if reserved => {
                if let Some(window) = windows.get_mut(window_id) {
                    window
                        .tabs
                        .insert(device_id.to_string(), Slot::Live(connection));
                    window.active = Some(device_id.to_string());
                }
                tracing::info!(window = window_id, device = device_id, "opened ssh tab");
                Ok(OpenOutcome::Connected(message))
            }
            Ok(_) => {
                drop(windows);
                tracing::info!(device = device_id, "tab closed while connecting");
                connection.disconnect(false);
                Err(SshError::Cancelled)
            }
            Err(err) => {
                if reserved {
                    if let Some(window) = windows.get_mut(window_id) {
                        window.remove_tab(device_id);
                        if window.tabs.is_empty() {
                            windows.remove(window_id);
                        }
                    }
                }
                Err(err)
            }
        }
    }

    pub fn close(&self, window_id: &str, device_id: &str) -> bool {
        let slot = {
            let mut windows = self.windows.lock();
            let Some(window) = windows.get_mut(window_id) else {
                return false;
            };
            let slot = window.remove_tab(device_id);
            if window.tabs.is_empty() {
                windows.remove(window_id);
            }
            slot
        };
        let closed = slot.is_some();
        shut_down(slot);
        closed
    }

    pub fn close_window(&self, window_id: &str) -> usize {
        let window = self.windows.lock().remove(window_id);
        let Some(window) = window else {
            return 0;
        };
        let count = window.tabs.len();
        shut_down(window.tabs.into_values());
        tracing::info!(window = window_id, tabs = count, "closed ssh window");
        count
    }

    pub fn close_all(&self) -> usize {
        let windows = std::mem::take(&mut *self.windows.lock());
        windows
            .into_values()
            .map(|window| {
                let count = window.tabs.len();
                shut_down(window.tabs.into_values());
                count
            })
            .sum()
    }

    pub fn show_window(&self, window_id: &str) -> bool {
        self.update_window(window_id, |window| window.visible = true)
    }

    pub fn hide_window(&self, window_id: &str) -> bool {
        self.update_window(window_id, |window| window.visible = false)
    }

    pub fn set_title(&self, window_id: &str, title: &str) -> bool {
        self.update_window(window_id, |window| window.title = title.to_string())
    }

    pub fn activate(&self, window_id: &str, device_id: &str) -> bool {
        let mut windows = self.windows.lock();
        match windows.get_mut(window_id) {
            Some(window) if window.tabs.contains_key(device_id) => {
                window.visible = true;
                window.active = Some(device_id.to_string());
                true
            }
            _ => false,
        }
    }

    pub fn windows(&self) -> Vec<WindowSummary> {
        self.windows
            .lock()
            .iter()
            .map(|(window_id, window)| WindowSummary {
                window_id: window_id.clone(),
                title: window.title.clone(),
                visible: window.visible,
                active_device: window.active.clone(),
                devices: window.tabs.keys().cloned().collect(),
            })
            .collect()
    }

    pub fn devices(&self, window_id: &str) -> Vec<String> {
        self.windows
            .lock()
            .get(window_id)
            .map(|window| window.tabs.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn is_live(&self, window_id: &str, device_id: &str) -> bool {
        self.connection(window_id, device_id)
            .is_some_and(|connection| connection.is_connected())
    }

    pub fn with_connection<R>(
        &self,
        window_id: &str,
        device_id: &str,
        f: impl FnOnce(&SshConnection) -> R,
    ) -> Option<R> {
        let connection = self.connection(window_id, device_id)?;
        Some(f(&connection))
    }

    fn connection(&self, window_id: &str, device_id: &str) -> Option<Arc<SshConnection>> {
        match self.windows.lock().get(window_id)?.tabs.get(device_id)? {
            Slot::Live(connection) => Some(connection.clone()),
            Slot::Connecting(_) => None,
        }
    }

    fn update_window(&self, window_id: &str, f: impl FnOnce(&mut SshWindow)) -> bool {
        match self.windows.lock().get_mut(window_id) {
            Some(window) => {
                f(window);
                true
            }
            None => false,
        }
    }
}

impl Drop for SessionMultiplexer {
    fn drop(&mut self) {
        self.close_all();
    }
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::Duration;

    use super::*;
    use crate::model::ConnectionState;
    use crate::ssh::connection::tests::{fast_settings, wait_until};
    use crate::ssh::transport::MockConnector;

    fn target() -> SshTarget {
        SshTarget::new("10.20.30.40", 22, "esl", "pw")
    }

    fn multiplexer(connector: &Arc<MockConnector>) -> SessionMultiplexer {
        SessionMultiplexer::new(connector.clone(), fast_settings())
    }

    #[test]
    fn second_open_reuses_the_live_tab() {
        let connector = Arc::new(MockConnector::new());
        let mux = multiplexer(&connector);
        assert!(matches!(
            mux.open("w1", "AP-1", target()).unwrap(),
            OpenOutcome::Connected(_)
        ));
        mux.hide_window("w1");
        assert!(matches!(
            mux.open("w1", "AP-1", target()).unwrap(),
            OpenOutcome::Existing(_)
        ));
        assert_eq!(connector.opens(), 1);
        assert!(mux.windows()[0].visible);
        assert_eq!(mux.devices("w1"), vec!["AP-1"]);
    }

    #[test]
    fn concurrent_opens_make_one_connection() {
        let connector = Arc::new(MockConnector::new().with_open_delay(Duration::from_millis(80)));
        let mux = Arc::new(multiplexer(&connector));
        let handles: Vec<_> = (0..6)
            .map(|_| {
                let mux = mux.clone();
                thread::spawn(move || mux.open("w1", "AP-1", target()).unwrap())
            })
            .collect();
        let outcomes: Vec<OpenOutcome> = handles
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .collect();

        let connected = outcomes
            .iter()
            .filter(|outcome| matches!(outcome, OpenOutcome::Connected(_)))
            .count();
        assert_eq!(connected, 1);
        assert_eq!(connector.opens(), 1);
        assert!(mux.is_live("w1", "AP-1"));
    }

    #[test]
    fn same_device_in_two_windows_gets_two_tabs() {
        let connector = Arc::new(MockConnector::new());
        let mux = multiplexer(&connector);
        mux.open("w1", "AP-1", target()).unwrap();
        mux.open("w2", "AP-1", target()).unwrap();
        assert_eq!(connector.opens(), 2);
        assert_eq!(mux.windows().len(), 2);
    }

    #[test]
    fn failed_open_leaves_no_reservation() {
        let connector = Arc::new(MockConnector::new());
        connector.set_fail(true);
        let mux = multiplexer(&connector);
        assert!(matches!(
            mux.open("w1", "AP-1", target()),
            Err(SshError::Network(_))
        ));
        assert!(mux.devices("w1").is_empty());

        connector.set_fail(false);
        assert!(matches!(
            mux.open("w1", "AP-1", target()).unwrap(),
            OpenOutcome::Connected(_)
        ));
    }

    #[test]
    fn dead_tab_is_replaced() {
        let connector = Arc::new(MockConnector::new());
        let mux = multiplexer(&connector);
        mux.open("w1", "AP-1", target()).unwrap();
        connector.hang_up();
        assert!(wait_until(|| !mux.is_live("w1", "AP-1")));
        assert!(matches!(
            mux.open("w1", "AP-1", target()).unwrap(),
            OpenOutcome::Connected(_)
        ));
        assert_eq!(connector.opens(), 2);
    }

    #[test]
    fn close_and_close_window() {
        let connector = Arc::new(MockConnector::new());
        let mux = multiplexer(&connector);
        mux.open("w1", "AP-1", target()).unwrap();
        mux.open("w1", "AP-2", target()).unwrap();
        mux.open("w2", "AP-3", target()).unwrap();

        assert!(mux.activate("w1", "AP-1"));
        let state = mux
            .with_connection("w1", "AP-2", |connection| connection.state())
            .unwrap();
        assert_eq!(state, ConnectionState::Connected);

        assert!(mux.close("w1", "AP-1"));
        assert!(!mux.close("w1", "AP-1"));
        assert_eq!(mux.windows()[0].active_device.as_deref(), Some("AP-2"));
        assert_eq!(mux.close_window("w1"), 1);
        assert_eq!(mux.close_window("w1"), 0);
        assert!(mux.with_connection("w1", "AP-2", |_| ()).is_none());
        assert_eq!(mux.close_all(), 1);
        assert!(mux.windows().is_empty());
    }

    #[test]
    fn cancelled_open_does_not_take_over_a_newer_reservation() {
        let connector = Arc::new(MockConnector::new().with_open_delay(Duration::from_millis(150)));
        let mux = Arc::new(multiplexer(&connector));
        let spawn_open = || {
            let mux = mux.clone();
            thread::spawn(move || mux.open("w1", "AP-1", target()))
        };

        let first = spawn_open();
        assert!(wait_until(|| mux.devices("w1") == vec!["AP-1"]));
        assert_eq!(mux.close_window("w1"), 1);
        let second = spawn_open();
        assert!(wait_until(|| mux.devices("w1") == vec!["AP-1"]));

        assert!(matches!(first.join().unwrap(), Err(SshError::Cancelled)));
        assert!(matches!(second.join().unwrap(), Ok(OpenOutcome::Connected(_))));
        assert_eq!(connector.opens(), 2);
        assert!(mux.is_live("w1", "AP-1"));
        assert_eq!(mux.devices("w1"), vec!["AP-1"]);
    }

    #[test]
    fn closing_the_window_cancels_a_pending_open() {
        let connector = Arc::new(MockConnector::new().with_open_delay(Duration::from_millis(150)));
        let mux = Arc::new(multiplexer(&connector));
        let opener = {
            let mux = mux.clone();
            thread::spawn(move || mux.open("w1", "AP-1", target()))
        };
        assert!(wait_until(|| mux.devices("w1") == vec!["AP-1"]));
        assert_eq!(mux.close_window("w1"), 1);
        assert!(matches!(opener.join().unwrap(), Err(SshError::Cancelled)));
        assert!(mux.windows().is_empty());
    }
}
