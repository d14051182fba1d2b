//! Stream socket wrappers for mio-based I/O.
//!
//! [`Stream`] and [`Listener`] put TCP and Unix domain sockets behind one
//! type so the dispatcher can treat every link the same way. Unix only; the
//! crate root refuses other targets.

use std::io::{self, Read, Write};
use std::os::fd::{AsFd, BorrowedFd};
use std::path::PathBuf;

use mio::event::Source;
use mio::net::{TcpListener, TcpStream, UnixListener, UnixStream};
use mio::{Interest, Registry, Token};
use rustix::io::Errno;

use super::Address;
use crate::trace::debug;

/// A non-blocking, connected (or connecting) byte stream.
pub(crate) enum Stream {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl Stream {
    /// Starts a non-blocking connect to `address`.
    ///
    /// The connection may still be in progress when this returns; poll for
    /// writability and check [`Stream::connect_status`].
    pub(crate) fn connect(address: &Address) -> io::Result<Self> {
        match address {
            Address::Tcp(addr) => {
                let stream = TcpStream::connect(*addr)?;
                Ok(Self::Tcp(stream))
            }
            Address::Ipc(path) => Ok(Self::Unix(UnixStream::connect(path)?)),
        }
    }

    /// Resolves a pending connect.
    ///
    /// Returns `Ok(true)` once connected, `Ok(false)` while still in progress.
    pub(crate) fn connect_status(&self) -> io::Result<bool> {
        let pending = match self {
            Self::Tcp(s) => s.take_error(),
            Self::Unix(s) => s.take_error(),
        }?;
        if let Some(err) = pending {
            return Err(err);
        }
        let peer = match self {
            Self::Tcp(s) => s.peer_addr().map(drop),
            Self::Unix(s) => s.peer_addr().map(drop),
        };
        match peer {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(false),
            Err(e) if e.raw_os_error() == Some(Errno::INPROGRESS.raw_os_error()) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Applies per-link socket options: `TCP_NODELAY` and, when requested,
    /// the kernel send/receive buffer sizes.
    pub(crate) fn configure(&self, kernel_buffer: Option<usize>) -> io::Result<()> {
        if let Self::Tcp(s) = self {
            s.set_nodelay(true)?;
        }
        if let Some(size) = kernel_buffer {
            // mio does not expose SO_SNDBUF/SO_RCVBUF
            rustix::net::sockopt::set_socket_send_buffer_size(self.as_fd(), size)?;
            rustix::net::sockopt::set_socket_recv_buffer_size(self.as_fd(), size)?;
        }
        Ok(())
    }
}

impl AsFd for Stream {
    fn as_fd(&self) -> BorrowedFd<'_> {
        match self {
            Self::Tcp(s) => s.as_fd(),
            Self::Unix(s) => s.as_fd(),
        }
    }
}

impl Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Tcp(s) => s.read(buf),
            Self::Unix(s) => s.read(buf),
        }
    }
}

impl Write for Stream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Tcp(s) => s.write(buf),
            Self::Unix(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Tcp(s) => s.flush(),
            Self::Unix(s) => s.flush(),
        }
    }
}

impl Source for Stream {
    fn register(
        &mut self,
        registry: &Registry,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        match self {
            Self::Tcp(s) => s.register(registry, token, interests),
            Self::Unix(s) => s.register(registry, token, interests),
        }
    }

    fn reregister(
        &mut self,
        registry: &Registry,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        match self {
            Self::Tcp(s) => s.reregister(registry, token, interests),
            Self::Unix(s) => s.reregister(registry, token, interests),
        }
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        match self {
            Self::Tcp(s) => s.deregister(registry),
            Self::Unix(s) => s.deregister(registry),
        }
    }
}

/// A non-blocking listening socket.
///
/// Unix listeners remove their socket file when dropped.
pub(crate) enum Listener {
    Tcp(TcpListener),
    Unix { inner: UnixListener, path: PathBuf },
}

impl Listener {
    /// Binds a listener to `address`.
    ///
    /// For Unix sockets, a leftover socket file that nothing is listening on
    /// any more is removed and the bind retried once.
    pub(crate) fn bind(address: &Address) -> io::Result<Self> {
        match address {
            Address::Tcp(addr) => Ok(Self::Tcp(TcpListener::bind(*addr)?)),
            Address::Ipc(path) => {
                let inner = match UnixListener::bind(path) {
                    Ok(inner) => inner,
                    Err(e) if e.kind() == io::ErrorKind::AddrInUse => {
                        if std::os::unix::net::UnixStream::connect(path).is_ok() {
                            return Err(e);
                        }
                        debug!(path = %path.display(), "removing stale socket file");
                        std::fs::remove_file(path)?;
                        UnixListener::bind(path)?
                    }
                    Err(e) => return Err(e),
                };
                Ok(Self::Unix {
                    inner,
                    path: path.clone(),
                })
            }
        }
    }

    /// Returns the bound address (with the OS-assigned port for port 0).
    pub(crate) fn local_address(&self) -> io::Result<Address> {
        match self {
            Self::Tcp(l) => l.local_addr().map(Address::Tcp),
            Self::Unix { path, .. } => Ok(Address::Ipc(path.clone())),
        }
    }

    /// Accepts one pending connection, or `WouldBlock` if none.
    pub(crate) fn accept(&self) -> io::Result<Stream> {
        match self {
            Self::Tcp(l) => l.accept().map(|(s, _)| Stream::Tcp(s)),
            Self::Unix { inner, .. } => inner.accept().map(|(s, _)| Stream::Unix(s)),
        }
    }
}

impl Source for Listener {
    fn register(
        &mut self,
        registry: &Registry,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        match self {
            Self::Tcp(l) => l.register(registry, token, interests),
            Self::Unix { inner, .. } => inner.register(registry, token, interests),
        }
    }

    fn reregister(
        &mut self,
        registry: &Registry,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        match self {
            Self::Tcp(l) => l.reregister(registry, token, interests),
            Self::Unix { inner, .. } => inner.reregister(registry, token, interests),
        }
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        match self {
            Self::Tcp(l) => l.deregister(registry),
            Self::Unix { inner, .. } => inner.deregister(registry),
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if let Self::Unix { path, .. } = self {
            let _ = std::fs::remove_file(path);
        }
    }
}
