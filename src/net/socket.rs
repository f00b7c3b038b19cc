//! An either `TcpStream`, `UnixStream` or TLS stream, which implements
//! `AsyncRead` and `AsyncWrite` transparently.
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;
use tokio_rustls::client::TlsStream;

pub struct Socket {
    kind: Kind,
}

enum Kind {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
    Tls(Box<TlsStream<TcpStream>>),
    /// In-memory stream, for exercising the protocol without a server.
    #[cfg(test)]
    Mem(tokio::io::DuplexStream),
}

impl Socket {
    pub async fn connect_tcp(host: &str, port: u16) -> io::Result<Socket> {
        let socket = TcpStream::connect((host, port)).await?;
        socket.set_nodelay(true)?;
        Ok(Socket {
            kind: Kind::Tcp(socket),
        })
    }

    #[cfg(unix)]
    pub async fn connect_unix(path: &str) -> io::Result<Socket> {
        let socket = UnixStream::connect(path).await?;
        Ok(Socket {
            kind: Kind::Unix(socket),
        })
    }

    #[cfg(not(unix))]
    pub async fn connect_unix(path: &str) -> io::Result<Socket> {
        let _ = path;
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "unix sockets are not supported on this platform",
        ))
    }

    pub(crate) fn from_tls(stream: TlsStream<TcpStream>) -> Socket {
        Socket {
            kind: Kind::Tls(Box::new(stream)),
        }
    }

    #[cfg(test)]
    pub fn mem(stream: tokio::io::DuplexStream) -> Socket {
        Socket {
            kind: Kind::Mem(stream),
        }
    }

    /// Take the plain TCP stream back out, for a TLS upgrade.
    ///
    /// Returns `Err(self)` for transports that cannot carry TLS.
    pub(crate) fn into_tcp(self) -> Result<TcpStream, Socket> {
        match self.kind {
            Kind::Tcp(tcp) => Ok(tcp),
            kind => Err(Socket { kind }),
        }
    }

    /// Whether this transport is TLS-wrapped.
    pub fn is_tls(&self) -> bool {
        matches!(self.kind, Kind::Tls(_))
    }
}

macro_rules! dispatch {
    ($me:expr, $stream:pat => $call:expr) => {
        match &mut $me.get_mut().kind {
            Kind::Tcp($stream) => $call,
            #[cfg(unix)]
            Kind::Unix($stream) => $call,
            Kind::Tls($stream) => $call,
            #[cfg(test)]
            Kind::Mem($stream) => $call,
        }
    };
}

impl AsyncRead for Socket {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        dispatch!(self, s => Pin::new(s).poll_read(cx, buf))
    }
}

impl AsyncWrite for Socket {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        dispatch!(self, s => Pin::new(s).poll_write(cx, buf))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        dispatch!(self, s => Pin::new(s).poll_flush(cx))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        dispatch!(self, s => Pin::new(s).poll_shutdown(cx))
    }

    fn is_write_vectored(&self) -> bool {
        match &self.kind {
            Kind::Tcp(s) => s.is_write_vectored(),
            #[cfg(unix)]
            Kind::Unix(s) => s.is_write_vectored(),
            Kind::Tls(s) => s.is_write_vectored(),
            #[cfg(test)]
            Kind::Mem(s) => s.is_write_vectored(),
        }
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        dispatch!(self, s => Pin::new(s).poll_write_vectored(cx, bufs))
    }
}

impl std::fmt::Debug for Socket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            Kind::Tcp(tcp) => std::fmt::Debug::fmt(tcp, f),
            #[cfg(unix)]
            Kind::Unix(unix) => std::fmt::Debug::fmt(unix, f),
            Kind::Tls(_) => f.write_str("TlsStream"),
            #[cfg(test)]
            Kind::Mem(_) => f.write_str("DuplexStream"),
        }
    }
}
