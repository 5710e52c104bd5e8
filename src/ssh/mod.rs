mod buffer;
mod connection;
mod multiplexer;
mod recovery;
mod transport;

pub use connection::SshConnection;
pub use multiplexer::{SessionMultiplexer, WindowSummary};
pub use transport::{ShellConnector, ShellTransport, Ssh2Connector, Ssh2Shell};
