//! Transport to the peer
//!
//! The peer listens on TCP (`host:port`, optionally written as a URL) or on a
//! Unix domain socket (`unix:/path/to.sock`). The connector dials out, retrying
//! with exponential backoff while the peer starts up.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use eyre::{Context, Result};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, UnixStream};
use tracing::{debug, info, warn};

/// Port the peer listens on when the address names none
pub const DEFAULT_PORT: u16 = 24337;

/// Longest pause between connection attempts
const MAX_BACKOFF: Duration = Duration::from_secs(10);

pub type BoxedReader = Box<dyn AsyncRead + Unpin + Send>;
pub type BoxedWriter = Box<dyn AsyncWrite + Unpin + Send>;

/// Where the peer listens
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Tcp(String),
    Unix(PathBuf),
}

impl Endpoint {
    pub fn parse(address: &str) -> Result<Self> {
        let address = address.trim();
        if let Some(path) = address.strip_prefix("unix:") {
            let path = path.trim_start_matches("//");
            if path.is_empty() {
                return Err(eyre::eyre!("Empty socket path in '{}'", address));
            }
            return Ok(Endpoint::Unix(PathBuf::from(path)));
        }

        let rest = ["http://", "https://", "tcp://", "ws://"]
            .iter()
            .find_map(|scheme| address.strip_prefix(scheme))
            .unwrap_or(address);
        let authority = rest.split('/').next().unwrap_or_default();
        if authority.is_empty() {
            return Err(eyre::eyre!("No host in server address '{}'", address));
        }

        match authority.rsplit_once(':') {
            Some((host, port)) => {
                let port: u16 = port
                    .parse()
                    .with_context(|| format!("Invalid port in server address '{}'", address))?;
                Ok(Endpoint::Tcp(format!("{}:{}", host, port)))
            }
            None => Ok(Endpoint::Tcp(format!("{}:{}", authority, DEFAULT_PORT))),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Tcp(addr) => write!(f, "{}", addr),
            Endpoint::Unix(path) => write!(f, "unix:{}", path.display()),
        }
    }
}

/// Open one connection and split it into owned halves
pub async fn connect(endpoint: &Endpoint) -> std::io::Result<(BoxedReader, BoxedWriter)> {
    debug!(%endpoint, "connect: called");
    match endpoint {
        Endpoint::Tcp(addr) => {
            let stream = TcpStream::connect(addr).await?;
            stream.set_nodelay(true)?;
            let (reader, writer) = stream.into_split();
            Ok((Box::new(reader), Box::new(writer)))
        }
        Endpoint::Unix(path) => {
            let stream = UnixStream::connect(path).await?;
            let (reader, writer) = stream.into_split();
            Ok((Box::new(reader), Box::new(writer)))
        }
    }
}

/// Pause before attempt `attempt + 1`
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(2u32.saturating_pow(attempt)).min(MAX_BACKOFF)
}

/// Connect, retrying up to `retries` more times
pub async fn connect_with_retry(
    endpoint: &Endpoint,
    retries: u32,
    backoff: Duration,
) -> Result<(BoxedReader, BoxedWriter)> {
    let mut attempt = 0;
    loop {
        match connect(endpoint).await {
            Ok(halves) => {
                info!(%endpoint, attempt, "Connected to peer");
                return Ok(halves);
            }
            Err(e) if attempt < retries => {
                let delay = backoff_delay(backoff, attempt);
                warn!(%endpoint, error = %e, ?delay, "connect_with_retry: connection failed, retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to connect to {} after {} attempts", endpoint, attempt + 1));
            }
        }
    }
}
