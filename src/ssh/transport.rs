use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::thread;
use std::time::{Duration, Instant};

use ssh2::{Channel, ErrorCode, Session};

use crate::config::SshSettings;
use crate::error::SshError;
use crate::model::SshTarget;

const LIBSSH2_ERROR_TIMEOUT: i32 = -9;
const WRITE_RETRY_DELAY: Duration = Duration::from_millis(5);

pub trait ShellTransport: Send {
    /// Returns `Ok(0)` or `WouldBlock` when nothing is waiting.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;
    fn write_all(&mut self, data: &[u8]) -> io::Result<()>;
    fn is_eof(&self) -> bool;
    fn close(&mut self);
}

pub trait ShellConnector: Send + Sync {
    fn open(
        &self,
        target: &SshTarget,
        settings: &SshSettings,
    ) -> Result<Box<dyn ShellTransport>, SshError>;
}

#[derive(Debug, Default)]
pub struct Ssh2Connector;

fn is_timeout(err: &ssh2::Error) -> bool {
    err.code() == ErrorCode::Session(LIBSSH2_ERROR_TIMEOUT)
}

fn connect_tcp(target: &SshTarget, timeout: Duration) -> Result<TcpStream, SshError> {
    let address = target.address();
    let mut last_err = None;
    let addrs = (target.host.as_str(), target.port)
        .to_socket_addrs()
        .map_err(|err| SshError::Network(format!("cannot resolve {}: {err}", target.host)))?;
    for addr in addrs {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(stream) => {
                stream.set_read_timeout(Some(timeout)).ok();
                stream.set_write_timeout(Some(timeout)).ok();
                return Ok(stream);
            }
            Err(err) => last_err = Some(err),
        }
    }
    Err(match last_err {
        Some(err) if err.kind() == io::ErrorKind::TimedOut => SshError::Timeout(address),
        Some(err) => SshError::Network(format!("connect {address} failed: {err}")),
        None => SshError::Network(format!("no address for {}", target.host)),
    })
}

impl ShellConnector for Ssh2Connector {
    fn open(
        &self,
        target: &SshTarget,
        settings: &SshSettings,
    ) -> Result<Box<dyn ShellTransport>, SshError> {
        let timeout = settings.connect_timeout();
        let address = target.address();
        let tcp = connect_tcp(target, timeout)?;

        let mut session = Session::new()?;
        session.set_timeout(u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX));
        session.set_tcp_stream(tcp);
        session.handshake().map_err(|err| {
            if is_timeout(&err) {
                SshError::Timeout(address.clone())
            } else {
                SshError::Protocol(format!("ssh handshake: {}", err.message()))
            }
        })?;

        session
            .userauth_password(&target.username, &target.password)
            .map_err(|err| {
                if is_timeout(&err) {
                    SshError::Timeout(address.clone())
                } else {
                    tracing::debug!(%address, error = %err.message(), "password auth rejected");
                    SshError::Auth
                }
            })?;
        if !session.authenticated() {
            return Err(SshError::Auth);
        }

        let channel_err = |err: ssh2::Error| SshError::Channel(err.message().to_string());
        let mut channel = session.channel_session().map_err(channel_err)?;
        channel
            .request_pty(
                "xterm",
                None,
                Some((settings.pty_cols, settings.pty_rows, 0, 0)),
            )
            .map_err(channel_err)?;
        channel.shell().map_err(channel_err)?;
        session.set_blocking(false);

        Ok(Box::new(Ssh2Shell { session, channel }))
    }
}

pub struct Ssh2Shell {
    session: Session,
    channel: Channel,
}

impl ShellTransport for Ssh2Shell {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.channel.read(buf) {
            Ok(0) => {}
            Ok(count) => return Ok(count),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
            Err(err) => return Err(err),
        }
        match self.channel.stderr().read(buf) {
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(0),
            other => other,
        }
    }

    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut written = 0;
        while written < data.len() {
            match self.channel.write(&data[written..]) {
                Ok(0) => return Err(io::Error::new(io::ErrorKind::WriteZero, "channel closed")),
                Ok(count) => written += count,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    if Instant::now() > deadline {
                        return Err(io::Error::new(io::ErrorKind::TimedOut, "channel write stalled"));
                    }
                    thread::sleep(WRITE_RETRY_DELAY);
                }
                Err(err) => return Err(err),
            }
        }
        match self.channel.flush() {
            Err(err) if err.kind() != io::ErrorKind::WouldBlock => Err(err),
            _ => Ok(()),
        }
    }

    fn is_eof(&self) -> bool {
        self.channel.eof()
    }

    fn close(&mut self) {
        self.session.set_blocking(true);
        self.channel.close().ok();
        self.session.disconnect(None, "closing", None).ok();
    }
}

#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct MockDevice {
    pub(crate) service_mode: bool,
    pub(crate) stuck_in_service_mode: bool,
    pub(crate) fail_open: bool,
    pub(crate) opens: usize,
    pub(crate) hung_up_through: usize,
    pub(crate) commands: Vec<String>,
}

#[cfg(test)]
pub(crate) const MOCK_PROMPT: &str = "esl@ap:~$ ";
#[cfg(test)]
pub(crate) const MOCK_SERVICE_PROMPT: &str = "servicemode> ";
#[cfg(test)]
pub(crate) const MOCK_JAVA_VERSION: &str = "1.8.0_292";

#[cfg(test)]
#[derive(Default)]
pub(crate) struct MockConnector {
    pub(crate) device: std::sync::Arc<parking_lot::Mutex<MockDevice>>,
    open_delay: Duration,
}

#[cfg(test)]
impl MockConnector {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn in_service_mode(stuck: bool) -> Self {
        let connector = Self::default();
        {
            let mut device = connector.device.lock();
            device.service_mode = true;
            device.stuck_in_service_mode = stuck;
        }
        connector
    }

    pub(crate) fn with_open_delay(mut self, delay: Duration) -> Self {
        self.open_delay = delay;
        self
    }

    pub(crate) fn opens(&self) -> usize {
        self.device.lock().opens
    }

    pub(crate) fn commands(&self) -> Vec<String> {
        self.device.lock().commands.clone()
    }

    pub(crate) fn set_fail(&self, fail: bool) {
        self.device.lock().fail_open = fail;
    }

    pub(crate) fn hang_up(&self) {
        let mut device = self.device.lock();
        device.hung_up_through = device.opens;
    }
}

#[cfg(test)]
impl ShellConnector for MockConnector {
    fn open(
        &self,
        target: &SshTarget,
        _settings: &SshSettings,
    ) -> Result<Box<dyn ShellTransport>, SshError> {
        thread::sleep(self.open_delay);
        let mut device = self.device.lock();
        if device.fail_open {
            return Err(SshError::Network(format!(
                "connection refused by {}",
                target.address()
            )));
        }
        device.opens += 1;
        let prompt = if device.service_mode {
            MOCK_SERVICE_PROMPT
        } else {
            MOCK_PROMPT
        };
        Ok(Box::new(MockShell {
            device: self.device.clone(),
            generation: device.opens,
            pending: format!("Welcome\r\n{prompt}").into_bytes(),
            closed: false,
        }))
    }
}

#[cfg(test)]
struct MockShell {
    device: std::sync::Arc<parking_lot::Mutex<MockDevice>>,
    generation: usize,
    pending: Vec<u8>,
    closed: bool,
}

#[cfg(test)]
impl ShellTransport for MockShell {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pending.is_empty() {
            return Err(io::ErrorKind::WouldBlock.into());
        }
        let count = buf.len().min(self.pending.len());
        buf[..count].copy_from_slice(&self.pending[..count]);
        self.pending.drain(..count);
        Ok(count)
    }

    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        if self.is_eof() {
            return Err(io::ErrorKind::BrokenPipe.into());
        }
        let text = String::from_utf8_lossy(data).into_owned();
        let mut device = self.device.lock();
        for line in text.lines() {
            device.commands.push(line.to_string());
            if device.service_mode {
                if line == "enableshell true" && !device.stuck_in_service_mode {
                    device.service_mode = false;
                }
                let reply = if line == "status" {
                    format!("{line}\r\nJava Version: {MOCK_JAVA_VERSION}\r\n{MOCK_SERVICE_PROMPT}")
                } else {
                    format!("{line}\r\n{MOCK_SERVICE_PROMPT}")
                };
                self.pending.extend_from_slice(reply.as_bytes());
            } else {
                self.pending
                    .extend_from_slice(format!("{line}\r\n{MOCK_PROMPT}").as_bytes());
            }
        }
        Ok(())
    }

    fn is_eof(&self) -> bool {
        self.closed || self.generation <= self.device.lock().hung_up_through
    }

    fn close(&mut self) {
        self.closed = true;
    }
}
