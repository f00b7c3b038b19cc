//! TLS session establishment over an already-connected socket.
use std::io;
use std::sync::Arc;

use rustls_pki_types::ServerName;
use tokio_rustls::TlsConnector;

use super::Socket;

/// Wrap `socket` in a TLS session using the prepared client configuration.
///
/// The caller has already sent SSLRequest and consumed the server's 'S'
/// answer, so the next bytes on the wire belong to the TLS handshake.
/// Only plain TCP transports can be upgraded.
pub(crate) async fn upgrade(
    socket: Socket,
    config: Arc<rustls::ClientConfig>,
    host: &str,
) -> io::Result<Socket> {
    let tcp = socket.into_tcp().map_err(|_| {
        io::Error::new(
            io::ErrorKind::Unsupported,
            "TLS requires a TCP transport",
        )
    })?;

    let server_name = ServerName::try_from(host.to_owned())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

    let connector = TlsConnector::from(config);
    let stream = connector.connect(server_name, tcp).await?;
    Ok(Socket::from_tls(stream))
}
