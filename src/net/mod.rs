//! Byte-stream transports: TCP, Unix sockets, and TLS-wrapped streams.
mod socket;
mod tls;

pub use socket::Socket;
pub(crate) use tls::upgrade;
