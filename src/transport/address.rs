//! Bus addresses, client connect and broker listeners
//!
//! Two address forms are understood: `tcp://host:port` and
//! `unix:///absolute/path`. Both produce a stream split into boxed halves so
//! the rest of the crate never cares which one is underneath.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};
use tracing::{debug, warn};

use crate::utils::error::{Error, Result};

const TCP_SCHEME: &str = "tcp://";
const UNIX_SCHEME: &str = "unix://";

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum BusAddress {
    /// `host:port`
    Tcp(String),
    Unix(PathBuf),
}

impl FromStr for BusAddress {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if let Some(rest) = s.strip_prefix(TCP_SCHEME) {
            let Some((host, port)) = rest.rsplit_once(':') else {
                return Err(Error::InvalidArgument(format!(
                    "address '{s}' is missing a port"
                )));
            };
            if host.is_empty() {
                return Err(Error::InvalidArgument(format!(
                    "address '{s}' is missing a host"
                )));
            }
            port.parse::<u16>().map_err(|_| {
                Error::InvalidArgument(format!("address '{s}' has an invalid port"))
            })?;
            return Ok(BusAddress::Tcp(rest.to_string()));
        }
        if let Some(path) = s.strip_prefix(UNIX_SCHEME) {
            if !path.starts_with('/') {
                return Err(Error::InvalidArgument(format!(
                    "address '{s}' needs an absolute socket path"
                )));
            }
            return Ok(BusAddress::Unix(PathBuf::from(path)));
        }
        Err(Error::InvalidArgument(format!(
            "address '{s}' must start with {TCP_SCHEME} or {UNIX_SCHEME}"
        )))
    }
}

impl fmt::Display for BusAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BusAddress::Tcp(host_port) => write!(f, "{TCP_SCHEME}{host_port}"),
            BusAddress::Unix(path) => write!(f, "{UNIX_SCHEME}{}", path.display()),
        }
    }
}

/// A connected stream split into owned halves.
pub struct Transport {
    pub reader: BoxedReader,
    pub writer: BoxedWriter,
    pub local: String,
    pub peer: String,
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transport")
            .field("local", &self.local)
            .field("peer", &self.peer)
            .finish_non_exhaustive()
    }
}

/// Opens a stream to a broker.
pub async fn connect(address: &BusAddress, no_delay: bool) -> Result<Transport> {
    match address {
        BusAddress::Tcp(host_port) => {
            let stream = TcpStream::connect(host_port.as_str()).await?;
            tcp_transport(stream, no_delay)
        }
        BusAddress::Unix(path) => {
            let stream = UnixStream::connect(path).await?;
            Ok(unix_transport(stream, path))
        }
    }
}

fn tcp_transport(stream: TcpStream, no_delay: bool) -> Result<Transport> {
    if no_delay {
        stream.set_nodelay(true)?;
    }
    let local = stream.local_addr()?.to_string();
    let peer = stream.peer_addr()?.to_string();
    let (reader, writer) = stream.into_split();
    Ok(Transport {
        reader: Box::new(reader),
        writer: Box::new(writer),
        local,
        peer,
    })
}

fn unix_transport(stream: UnixStream, socket_path: &Path) -> Transport {
    let name = |addr: std::io::Result<tokio::net::unix::SocketAddr>| {
        addr.ok()
            .and_then(|a| a.as_pathname().map(|p| p.display().to_string()))
            .unwrap_or_else(|| socket_path.display().to_string())
    };
    let local = name(stream.local_addr());
    let peer = name(stream.peer_addr());
    let (reader, writer) = stream.into_split();
    Transport {
        reader: Box::new(reader),
        writer: Box::new(writer),
        local,
        peer,
    }
}

/// A bound broker socket. A unix listener removes its socket file on drop.
#[derive(Debug)]
pub enum Listener {
    Tcp {
        listener: TcpListener,
        no_delay: bool,
    },
    Unix {
        listener: UnixListener,
        path: PathBuf,
    },
}

impl Listener {
    pub async fn bind(address: &BusAddress, no_delay: bool) -> Result<Listener> {
        match address {
            BusAddress::Tcp(host_port) => {
                let listener = TcpListener::bind(host_port.as_str()).await?;
                Ok(Listener::Tcp { listener, no_delay })
            }
            BusAddress::Unix(path) => {
                // a leftover socket from a previous run would make bind fail
                if path.exists() {
                    debug!(path = %path.display(), "removing stale socket file");
                    std::fs::remove_file(path)?;
                }
                let listener = UnixListener::bind(path)?;
                Ok(Listener::Unix {
                    listener,
                    path: path.clone(),
                })
            }
        }
    }

    pub async fn accept(&self) -> Result<Transport> {
        match self {
            Listener::Tcp { listener, no_delay } => {
                let (stream, _) = listener.accept().await?;
                tcp_transport(stream, *no_delay)
            }
            Listener::Unix { listener, path } => {
                let (stream, _) = listener.accept().await?;
                Ok(unix_transport(stream, path))
            }
        }
    }

    /// The address clients should connect to. Resolves port 0 to the port
    /// actually bound.
    pub fn local_address(&self) -> Result<BusAddress> {
        match self {
            Listener::Tcp { listener, .. } => {
                Ok(BusAddress::Tcp(listener.local_addr()?.to_string()))
            }
            Listener::Unix { path, .. } => Ok(BusAddress::Unix(path.clone())),
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if let Listener::Unix { path, .. } = self {
            if let Err(e) = std::fs::remove_file(&*path) {
                warn!(path = %path.display(), error = %e, "failed to remove socket file");
            }
        }
    }
}
