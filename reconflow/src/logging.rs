//! Logging setup
//!
//! One subscriber per process, installed by the binary before any work
//! starts. Console output always; optionally a copy of every line shipped
//! over TCP to the study's log server.

use std::io;
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::Mutex;
use std::time::Duration;
use tracing_subscriber::util::TryInitError;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Conventional TCP logging port, used when the server gives none
pub const LOG_SERVER_PORT: u16 = 9020;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Filter used when `RUST_LOG` is unset
pub fn default_directives(debug: bool) -> &'static str {
    if debug {
        "reconflow=debug,reconflow_common=debug"
    } else {
        "reconflow=info,reconflow_common=info"
    }
}

/// `host` or `host:port` → `host:port`
pub fn log_server_address(server: &str) -> String {
    match server.rsplit_once(':') {
        Some((_, port)) if port.parse::<u16>().is_ok() => server.to_string(),
        _ => format!("{}:{}", server, LOG_SERVER_PORT),
    }
}

fn connect(address: &str) -> io::Result<TcpStream> {
    let socket = address.to_socket_addrs()?.next().ok_or_else(|| {
        io::Error::new(io::ErrorKind::NotFound, format!("cannot resolve {}", address))
    })?;
    TcpStream::connect_timeout(&socket, CONNECT_TIMEOUT)
}

/// How remote shipping went, reported once the subscriber is up
#[derive(Debug)]
pub enum RemoteLogging {
    Disabled,
    Connected(String),
    Failed { address: String, error: io::Error },
}

/// Install the global subscriber
///
/// `log_server` is `Some` only when remote shipping was requested. A
/// server that cannot be reached does not prevent startup; the outcome is
/// returned so the caller can log it.
pub fn init(debug: bool, log_server: Option<&str>) -> Result<RemoteLogging, TryInitError> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives(debug)));

    let (remote_layer, outcome) = match log_server {
        None => (None, RemoteLogging::Disabled),
        Some(server) => {
            let address = log_server_address(server);
            match connect(&address) {
                Ok(stream) => (
                    Some(
                        fmt::layer()
                            .with_ansi(false)
                            .with_writer(Mutex::new(stream)),
                    ),
                    RemoteLogging::Connected(address),
                ),
                Err(error) => (None, RemoteLogging::Failed { address, error }),
            }
        }
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .with(remote_layer)
        .try_init()?;
    Ok(outcome)
}
