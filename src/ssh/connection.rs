use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::config::SshSettings;
use crate::error::SshError;
use crate::model::{ConnectionEvent, ConnectionState, RecoveryReport, SshTarget};
use crate::ssh::buffer::{OutputBuffers, tail};
use crate::ssh::recovery::{RecoveryPlan, ShellControl, recover_service_mode};
use crate::ssh::transport::{ShellConnector, ShellTransport};

const READ_CHUNK: usize = 4096;

struct ReaderHandle {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

struct Inner {
    device_id: String,
    target: SshTarget,
    settings: SshSettings,
    connector: Arc<dyn ShellConnector>,
    transport: Mutex<Option<Box<dyn ShellTransport>>>,
    buffers: Mutex<OutputBuffers>,
    state: Mutex<ConnectionState>,
    reader: Mutex<Option<ReaderHandle>>,
    subscribers: Mutex<Vec<mpsc::Sender<ConnectionEvent>>>,
    recovery: Mutex<()>,
    java_version: Mutex<Option<String>>,
    /// Set by `disconnect`, cleared by `connect`.
    closed: AtomicBool,
    reconnecting: AtomicBool,
}

enum ReadOutcome {
    Data(usize),
    Idle,
    Ended(Option<String>),
    Detached,
}

pub struct SshConnection {
    inner: Arc<Inner>,
}

impl SshConnection {
    pub fn new(
        device_id: &str,
        target: SshTarget,
        settings: SshSettings,
        connector: Arc<dyn ShellConnector>,
    ) -> Self {
        let cap = settings.automation_buffer_chars;
        Self {
            inner: Arc::new(Inner {
                device_id: device_id.to_string(),
                target,
                settings,
                connector,
                transport: Mutex::new(None),
                buffers: Mutex::new(OutputBuffers::new(cap)),
                state: Mutex::new(ConnectionState::Disconnected),
                reader: Mutex::new(None),
                subscribers: Mutex::new(Vec::new()),
                recovery: Mutex::new(()),
                java_version: Mutex::new(None),
                closed: AtomicBool::new(false),
                reconnecting: AtomicBool::new(false),
            }),
        }
    }

    pub fn device_id(&self) -> &str {
        &self.inner.device_id
    }

    pub fn target(&self) -> &SshTarget {
        &self.inner.target
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.lock()
    }

    pub fn is_connected(&self) -> bool {
        self.state().has_shell()
    }

    pub fn java_version(&self) -> Option<String> {
        self.inner.java_version.lock().clone()
    }

    pub fn is_reconnecting(&self) -> bool {
        self.inner.reconnecting.load(Ordering::SeqCst)
    }

    pub fn subscribe(&self) -> mpsc::Receiver<ConnectionEvent> {
        let (tx, rx) = mpsc::channel();
        self.inner.subscribers.lock().push(tx);
        rx
    }

    pub fn connect(&self) -> Result<String, SshError> {
        self.inner.connect()
    }

    pub fn send_command(&self, text: &str) -> Result<(), SshError> {
        self.inner.send_line(text)
    }

    pub fn get_output(&self) -> String {
        self.inner.buffers.lock().take_display()
    }

    pub fn peek_output(&self, chars: usize) -> String {
        self.inner.buffers.lock().display_tail(chars)
    }

    pub fn get_automation_output(&self, chars: usize) -> String {
        self.inner.buffers.lock().automation_tail(chars)
    }

    pub fn recover_service_mode(&self) -> Result<RecoveryReport, SshError> {
        self.inner.recover()
    }

    pub fn disconnect(&self, preserve_buffers: bool) {
        self.inner.disconnect(preserve_buffers);
    }
}

impl Drop for SshConnection {
    fn drop(&mut self) {
        if !self.inner.closed.load(Ordering::SeqCst) || self.inner.reader.lock().is_some() {
            self.inner.disconnect(false);
        }
    }
}

impl Inner {
    fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    fn emit(&self, event: ConnectionEvent) {
        self.subscribers
            .lock()
            .retain(|tx| tx.send(event.clone()).is_ok());
    }

    fn set_state(&self, next: ConnectionState) {
        if self.closed.load(Ordering::SeqCst) && next != ConnectionState::Disconnected {
            return;
        }
        let changed = {
            let mut state = self.state.lock();
            let changed = *state != next;
            *state = next;
            changed
        };
        if changed {
            tracing::debug!(device = %self.device_id, state = ?next, "connection state");
            self.emit(ConnectionEvent::StateChanged {
                device_id: self.device_id.clone(),
                state: next,
            });
        }
    }

    fn connect(self: &Arc<Self>) -> Result<String, SshError> {
        let address = self.target.address();
        if self.state().has_shell() {
            return Ok(format!("Already connected to {address}"));
        }
        self.closed.store(false, Ordering::SeqCst);
        self.set_state(ConnectionState::Connecting);
        tracing::info!(device = %self.device_id, %address, "connecting");
        let mark = self.buffers.lock().received();

        if let Err(err) = self.open_channel() {
            tracing::warn!(device = %self.device_id, %address, %err, "connect failed");
            self.set_state(ConnectionState::Disconnected);
            return Err(err);
        }
        self.set_state(ConnectionState::Connected);
        self.spawn_probe(mark);
        Ok(format!("Connected to {address}"))
    }

    fn open_channel(self: &Arc<Self>) -> Result<(), SshError> {
        let transport = self.connector.open(&self.target, &self.settings)?;
        *self.transport.lock() = Some(transport);
        if self.closed.load(Ordering::SeqCst) {
            self.close_channel();
            return Err(SshError::Cancelled);
        }
        self.spawn_reader()
    }

    fn spawn_reader(self: &Arc<Self>) -> Result<(), SshError> {
        self.stop_reader();
        let stop = Arc::new(AtomicBool::new(false));
        let inner = Arc::clone(self);
        let flag = Arc::clone(&stop);
        let handle = thread::Builder::new()
            .name(format!("ssh-reader-{}", self.device_id))
            .spawn(move || inner.read_loop(&flag))
            .map_err(|err| {
                self.close_channel();
                SshError::Channel(format!("spawn reader: {err}"))
            })?;
        *self.reader.lock() = Some(ReaderHandle { stop, handle });
        Ok(())
    }

    fn stop_reader(&self) {
        let reader = self.reader.lock().take();
        if let Some(reader) = reader {
            reader.stop.store(true, Ordering::SeqCst);
            if reader.handle.thread().id() != thread::current().id() {
                let _ = reader.handle.join();
            }
        }
    }

    fn close_channel(&self) {
        let transport = self.transport.lock().take();
        if let Some(mut transport) = transport {
            transport.close();
        }
        self.buffers.lock().reset_stream();
    }

    fn read_once(&self, chunk: &mut [u8]) -> ReadOutcome {
        let mut transport = self.transport.lock();
        let Some(transport) = transport.as_mut() else {
            return ReadOutcome::Detached;
        };
        match transport.read(chunk) {
            Ok(0) if transport.is_eof() => ReadOutcome::Ended(None),
            Ok(0) => ReadOutcome::Idle,
            Ok(count) => ReadOutcome::Data(count),
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                if transport.is_eof() {
                    ReadOutcome::Ended(None)
                } else {
                    ReadOutcome::Idle
                }
            }
            Err(err) => ReadOutcome::Ended(Some(err.to_string())),
        }
    }

    fn read_loop(&self, stop: &AtomicBool) {
        let poll = self.settings.poll_interval();
        let mut chunk = [0u8; READ_CHUNK];
        while !stop.load(Ordering::SeqCst) {
            match self.read_once(&mut chunk) {
                ReadOutcome::Data(count) => self.buffers.lock().push_bytes(&chunk[..count]),
                ReadOutcome::Idle => thread::sleep(poll),
                ReadOutcome::Detached => break,
                ReadOutcome::Ended(error) => {
                    if stop.load(Ordering::SeqCst) || self.reconnecting.load(Ordering::SeqCst) {
                        break;
                    }
                    match error {
                        Some(err) => {
                            tracing::warn!(device = %self.device_id, %err, "shell read failed")
                        }
                        None => tracing::info!(device = %self.device_id, "shell closed by remote"),
                    }
                    self.close_channel();
                    self.set_state(ConnectionState::Disconnected);
                    self.emit(ConnectionEvent::Closed {
                        device_id: self.device_id.clone(),
                    });
                    break;
                }
            }
        }
    }

    fn send_line(&self, text: &str) -> Result<(), SshError> {
        let mut transport = self.transport.lock();
        let transport = transport.as_mut().ok_or(SshError::NotConnected)?;
        transport
            .write_all(format!("{text}\n").as_bytes())
            .map_err(|err| SshError::Channel(err.to_string()))
    }

    fn pause(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        let step = self.settings.poll_interval();
        loop {
            if self.closed.load(Ordering::SeqCst) {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            thread::sleep(step.min(deadline - now));
        }
    }

    fn spawn_probe(self: &Arc<Self>, mark: u64) {
        let inner = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name(format!("ssh-probe-{}", self.device_id))
            .spawn(move || inner.probe(mark));
        if let Err(err) = spawned {
            tracing::warn!(device = %self.device_id, %err, "service mode probe not started");
        }
    }

    fn probe(self: &Arc<Self>, mark: u64) {
        if !self.pause(self.settings.probe_delay()) {
            return;
        }
        let window = {
            let fresh = self.buffers.lock().automation_since(mark);
            tail(&fresh, self.settings.probe_window_chars).to_string()
        };
        if !self.settings.service_mode.detect(&window) {
            tracing::debug!(device = %self.device_id, "no service mode prompt");
            return;
        }
        tracing::warn!(device = %self.device_id, "service mode prompt detected");
        self.set_state(ConnectionState::ServiceModeDetected);
        self.emit(ConnectionEvent::ServiceModeDetected {
            device_id: self.device_id.clone(),
        });
        self.query_status();
        if self.settings.auto_recover {
            if let Err(err) = self.recover() {
                tracing::warn!(device = %self.device_id, %err, "automatic recovery failed");
            }
        }
    }

    fn query_status(&self) {
        let protocol = &self.settings.service_mode;
        if protocol.status_command.trim().is_empty() {
            return;
        }
        let mark = self.buffers.lock().received();
        if let Err(err) = self.send_line(protocol.status_command.trim()) {
            tracing::warn!(device = %self.device_id, %err, "status query not sent");
            return;
        }
        if !self.pause(protocol.status_wait()) {
            return;
        }
        let output = self.buffers.lock().automation_since(mark);
        let Some(version) = protocol.parse_version(&output) else {
            tracing::info!(device = %self.device_id, "status output carried no java version");
            return;
        };
        tracing::info!(device = %self.device_id, %version, "java version reported");
        *self.java_version.lock() = Some(version.clone());
        self.emit(ConnectionEvent::JavaVersion {
            device_id: self.device_id.clone(),
            version,
        });
    }

    fn recover(self: &Arc<Self>) -> Result<RecoveryReport, SshError> {
        let Some(_running) = self.recovery.try_lock() else {
            return Err(SshError::Protocol(
                "service mode recovery already running".to_string(),
            ));
        };
        let plan = RecoveryPlan {
            protocol: &self.settings.service_mode,
            probe_delay: self.settings.probe_delay(),
            probe_window: self.settings.probe_window_chars,
        };
        let control = RecoveryControl { inner: self };
        // The unlock sequence ends the shell; readers must not treat that as a hang-up.
        self.reconnecting.store(true, Ordering::SeqCst);
        let result = recover_service_mode(&control, &plan);
        self.reconnecting.store(false, Ordering::SeqCst);
        if !control.shell_alive() {
            self.close_channel();
        }
        let (ok, attempts) = match &result {
            Ok(report) => (true, report.attempts),
            Err(SshError::RecoveryFailed { attempts }) => (false, *attempts),
            Err(_) => return result,
        };
        self.emit(ConnectionEvent::RecoveryFinished {
            device_id: self.device_id.clone(),
            ok,
            attempts,
        });
        result
    }

    fn disconnect(&self, preserve_buffers: bool) {
        self.closed.store(true, Ordering::SeqCst);
        self.stop_reader();
        self.close_channel();
        if !preserve_buffers {
            self.buffers.lock().clear();
        }
        let was = self.state();
        self.set_state(ConnectionState::Disconnected);
        if was != ConnectionState::Disconnected {
            tracing::info!(device = %self.device_id, "disconnected");
            self.emit(ConnectionEvent::Closed {
                device_id: self.device_id.clone(),
            });
        }
    }
}

struct RecoveryControl<'a> {
    inner: &'a Arc<Inner>,
}

impl ShellControl for RecoveryControl<'_> {
    fn send_line(&self, text: &str) -> Result<(), SshError> {
        self.inner.send_line(text)
    }

    fn pause(&self, duration: Duration) -> bool {
        self.inner.pause(duration)
    }

    fn reconnect(&self) -> Result<u64, SshError> {
        let inner = self.inner;
        inner.stop_reader();
        inner.close_channel();
        let mark = inner.buffers.lock().received();
        if inner.closed.load(Ordering::SeqCst) {
            return Err(SshError::Cancelled);
        }
        inner.open_channel().map(|()| mark)
    }

    fn output_since(&self, mark: u64) -> String {
        self.inner.buffers.lock().automation_since(mark)
    }

    fn shell_alive(&self) -> bool {
        self.inner
            .transport
            .lock()
            .as_ref()
            .is_some_and(|transport| !transport.is_eof())
    }

    fn enter(&self, state: ConnectionState) {
        self.inner.set_state(state);
    }

    fn device_id(&self) -> &str {
        &self.inner.device_id
    }
}
