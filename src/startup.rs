//! Session establishment: dialing, TLS negotiation, startup handshake,
//! authentication, and fallback endpoints.
use std::io;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::config::{Config, Endpoint};
use crate::connection::{PgConnection, SessionInfo, TxStatus};
use crate::error::{ConnectError, Error, Result};
use crate::net::Socket;
use crate::postgres::backend::Authentication;
use crate::postgres::{BackendMessage, Notice, PgError, ProtocolError, frontend};
use crate::sasl::{SCRAM_SHA_256, ScramClient};
use crate::stream::BufStream;

/// Establish a session, trying each endpoint in order until one passes
/// startup and the configured validators. Per-endpoint causes are
/// collected into the composite connect error.
pub(crate) async fn connect(config: Config) -> Result<PgConnection> {
    let endpoints = config.endpoints();
    let mut failure = ConnectError::new();

    for endpoint in &endpoints {
        let mut conn = match connect_endpoint(&config, endpoint).await {
            Ok(conn) => conn,
            Err(e) => {
                failure.push(endpoint.describe(), e);
                continue;
            }
        };

        if let Some(validate) = config.validate_connect.clone() {
            if let Err(e) = validate(&mut conn).await {
                let _ = conn.close().await;
                failure.push(endpoint.describe(), e);
                continue;
            }
        }

        if let Some(after) = config.after_connect.clone() {
            if let Err(e) = after(&mut conn).await {
                let _ = conn.close().await;
                return Err(e);
            }
        }

        return Ok(conn);
    }

    Err(Error::connect(failure))
}

async fn connect_endpoint(config: &Config, endpoint: &Endpoint) -> Result<PgConnection> {
    let socket = match &config.dial {
        Some(dial) => dial(&endpoint.host, endpoint.port).await?,
        None => default_dial(&endpoint.host, endpoint.port).await?,
    };
    let socket = negotiate_tls(socket, endpoint).await?;

    let mut stream = BufStream::new(socket);
    let session = handshake(&mut stream, config).await?;
    Ok(PgConnection::new(stream, config.clone(), endpoint, session))
}

/// TCP, or a Unix socket when the host is an absolute directory path.
pub(crate) async fn default_dial(host: &str, port: u16) -> io::Result<Socket> {
    if host.starts_with('/') {
        Socket::connect_unix(&format!("{host}/.s.PGSQL.{port}")).await
    } else {
        Socket::connect_tcp(host, port).await
    }
}

/// Send SSLRequest and act on the server's one-byte answer, per the
/// endpoint's TLS mode.
async fn negotiate_tls(mut socket: Socket, endpoint: &Endpoint) -> Result<Socket> {
    if !endpoint.tls_mode.requests_tls() {
        return Ok(socket);
    }
    let Some(tls_config) = endpoint.tls_config.clone() else {
        if endpoint.tls_mode.requires_tls() {
            return Err(Error::other("TLS required but no TLS configuration supplied"));
        }
        return Ok(socket);
    };

    let mut buf = BytesMut::new();
    frontend::SslRequest.write(&mut buf);
    socket.write_all(&buf).await.map_err(Error::write)?;

    let mut answer = [0u8; 1];
    socket.read_exact(&mut answer).await?;
    match answer[0] {
        b'S' => Ok(crate::net::upgrade(socket, tls_config, &endpoint.host).await?),
        b'N' => {
            if endpoint.tls_mode.requires_tls() {
                Err(Error::other("server refused TLS"))
            } else {
                // tolerated: continue the startup in plaintext
                Ok(socket)
            }
        }
        _ => Err(ProtocolError::malformed("SSLRequest answer").into()),
    }
}

/// Drive the startup message, the authentication exchange, and the
/// parameter/key-data ingestion up to the first ReadyForQuery.
pub(crate) async fn handshake(stream: &mut BufStream, config: &Config) -> Result<SessionInfo> {
    stream.send_startup(frontend::Startup {
        user: &config.user,
        database: config.database.as_deref(),
        params: &config.runtime_params,
    });
    stream.flush().await?;

    loop {
        match stream.recv().await? {
            BackendMessage::Authentication(auth) => match auth {
                Authentication::Ok => break,
                Authentication::CleartextPassword => {
                    stream.send(frontend::PasswordMessage {
                        password: &config.password,
                    });
                    stream.flush().await?;
                }
                Authentication::MD5Password { salt } => {
                    let hashed = md5_password(&config.user, &config.password, salt);
                    stream.send(frontend::PasswordMessage { password: &hashed });
                    stream.flush().await?;
                }
                Authentication::SASL { mechanisms } => {
                    sasl_auth(stream, config, &mechanisms).await?;
                }
                other => return Err(Error::unsupported_auth(auth_name(&other))),
            },
            BackendMessage::ErrorResponse(err) => return Err(PgError::parse(err.body)?.into()),
            BackendMessage::NoticeResponse(notice) => dispatch_notice(config, notice.body)?,
            BackendMessage::NegotiateProtocolVersion(_) => continue,
            other => {
                return Err(
                    ProtocolError::unexpected_phase(other.msgtype(), "authentication").into(),
                );
            }
        }
    }

    // the backend process is starting; collect its parameters and
    // cancellation key until it reports ready
    let mut session = SessionInfo::default();
    loop {
        match stream.recv().await? {
            BackendMessage::ParameterStatus(ps) => {
                session.parameters.insert(ps.name, ps.value);
            }
            BackendMessage::BackendKeyData(kd) => {
                session.process_id = kd.process_id;
                session.secret_key = kd.secret_key;
            }
            BackendMessage::NoticeResponse(notice) => dispatch_notice(config, notice.body)?,
            BackendMessage::ErrorResponse(err) => return Err(PgError::parse(err.body)?.into()),
            BackendMessage::ReadyForQuery(r) => {
                session.tx_status = TxStatus::from_byte(r.tx_status);
                break;
            }
            BackendMessage::NegotiateProtocolVersion(_) => continue,
            other => {
                return Err(ProtocolError::unexpected_phase(other.msgtype(), "startup").into());
            }
        }
    }
    Ok(session)
}

fn dispatch_notice(config: &Config, body: Bytes) -> Result<()> {
    let notice = Notice::parse(body)?;
    if let Some(on_notice) = &config.on_notice {
        on_notice(&notice);
    }
    Ok(())
}

fn auth_name(auth: &Authentication) -> &'static str {
    match auth {
        Authentication::KerberosV5 => "KerberosV5",
        Authentication::GSS | Authentication::GSSContinue { .. } => "GSS",
        Authentication::SSPI => "SSPI",
        _ => "unknown",
    }
}

/// Run the SCRAM-SHA-256 exchange.
///
/// SCRAM-SHA-256-PLUS needs tls-server-end-point channel binding data the
/// prepared TLS configuration does not expose, so a server offering only
/// the PLUS variant is treated as an unsupported method.
async fn sasl_auth(stream: &mut BufStream, config: &Config, mechanisms: &Bytes) -> Result<()> {
    let names = Authentication::sasl_mechanisms(mechanisms);
    if !names.contains(&SCRAM_SHA_256) {
        let offered = names.join(", ");
        return Err(Error::unsupported_auth(if offered.is_empty() {
            "SASL".to_string()
        } else {
            offered
        }));
    }

    let mut scram = ScramClient::new(&config.password);
    let client_first = scram.client_first_message();
    stream.send(frontend::SaslInitialResponse {
        mechanism: SCRAM_SHA_256,
        data: client_first.as_bytes(),
    });
    stream.flush().await?;

    let data = match stream.recv().await? {
        BackendMessage::Authentication(Authentication::SASLContinue { data }) => data,
        BackendMessage::ErrorResponse(err) => return Err(PgError::parse(err.body)?.into()),
        other => {
            return Err(ProtocolError::unexpected_phase(other.msgtype(), "SASL exchange").into());
        }
    };

    let client_final = scram.process_server_first(&data)?;
    stream.send(frontend::SaslResponse {
        data: client_final.as_bytes(),
    });
    stream.flush().await?;

    match stream.recv().await? {
        BackendMessage::Authentication(Authentication::SASLFinal { data }) => {
            scram.verify_server_final(&data)?;
        }
        BackendMessage::ErrorResponse(err) => return Err(PgError::parse(err.body)?.into()),
        other => {
            return Err(ProtocolError::unexpected_phase(other.msgtype(), "SASL exchange").into());
        }
    }
    Ok(())
}

/// The MD5 password response: `md5` ‖ hex(md5(hex(md5(password ‖ user)) ‖ salt)).
fn md5_password(user: &str, password: &str, salt: [u8; 4]) -> String {
    let inner = md5_hex(format!("{password}{user}").as_bytes());
    let mut salted = Vec::with_capacity(inner.len() + salt.len());
    salted.extend_from_slice(inner.as_bytes());
    salted.extend_from_slice(&salt);
    format!("md5{}", md5_hex(&salted))
}

fn md5_hex(data: &[u8]) -> String {
    use md5::{Digest, Md5};
    use std::fmt::Write;

    let mut hasher = Md5::new();
    hasher.update(data);
    let mut out = String::with_capacity(32);
    for byte in hasher.finalize() {
        let _ = write!(out, "{byte:02x}");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    use crate::config::DialFunc;
    use crate::error::ErrorKind;
    use crate::testutil::{MockServer, rt};

    /// A dial function handing out pre-built sockets, one per attempt.
    fn scripted_dial(sockets: Vec<io::Result<Socket>>) -> DialFunc {
        let queue = Arc::new(Mutex::new(VecDeque::from(sockets)));
        Arc::new(move |_host, _port| {
            let next = queue.lock().unwrap().pop_front().expect("unexpected dial");
            Box::pin(async move { next })
        })
    }

    fn refused() -> io::Result<Socket> {
        Err(io::ErrorKind::ConnectionRefused.into())
    }

    #[test]
    fn connect_with_cleartext_password() {
        rt().block_on(async {
            let (socket, mut server) = MockServer::pair();
            let script = tokio::spawn(async move {
                let startup = server.read_untagged().await;
                // protocol 3.0, then name/value pairs
                assert_eq!(&startup[0..4], &196608i32.to_be_bytes());
                let pairs = &startup[4..];
                assert!(pairs.starts_with(b"user\0alice\0"));
                assert!(pairs.windows(12).any(|w| w == b"database\0db\0"));

                server.auth_cleartext().await;
                let (tag, body) = server.read_frame().await;
                assert_eq!(tag, b'p');
                assert_eq!(body, b"secret\0");

                server.auth_ok().await;
                server.parameter("server_version", "16.0").await;
                server.parameter("standard_conforming_strings", "on").await;
                server.key_data(7, 9).await;
                server.ready(b'I').await;
            });

            let mut config = crate::Config::new("alice");
            config.password = "secret".into();
            config.database = Some("db".into());
            config.dial = Some(scripted_dial(vec![Ok(socket)]));

            let conn = PgConnection::connect(config).await.unwrap();
            assert_eq!(conn.process_id(), 7);
            assert_eq!(conn.secret_key(), 9);
            assert_eq!(conn.parameter_status("server_version"), Some("16.0"));
            assert!(!conn.is_closed());
            script.await.unwrap();
        });
    }

    #[test]
    fn connect_md5_sends_hashed_password() {
        rt().block_on(async {
            let (socket, mut server) = MockServer::pair();
            let expect = md5_password("alice", "secret", *b"salt");
            let script = tokio::spawn(async move {
                server.read_untagged().await;
                server.auth_md5(*b"salt").await;
                let (tag, body) = server.read_frame().await;
                assert_eq!(tag, b'p');
                assert_eq!(body, [expect.as_bytes(), b"\0"].concat());
                server.auth_ok().await;
                server.key_data(1, 2).await;
                server.ready(b'I').await;
            });

            let mut config = crate::Config::new("alice");
            config.password = "secret".into();
            config.dial = Some(scripted_dial(vec![Ok(socket)]));
            PgConnection::connect(config).await.unwrap();
            script.await.unwrap();
        });
    }

    #[test]
    fn connect_auth_failure_is_a_pg_error() {
        rt().block_on(async {
            let (socket, mut server) = MockServer::pair();
            let script = tokio::spawn(async move {
                server.read_untagged().await;
                server
                    .error_response("28P01", "password authentication failed")
                    .await;
            });

            let mut config = crate::Config::new("alice");
            config.dial = Some(scripted_dial(vec![Ok(socket)]));

            let err = PgConnection::connect(config).await.unwrap_err();
            let ErrorKind::Connect(causes) = err.kind() else {
                panic!("expected a connect error, got {err:?}");
            };
            let (_, cause) = causes.attempts().next().unwrap();
            assert_eq!(cause.as_db().unwrap().code, "28P01");
            script.await.unwrap();
        });
    }

    #[test]
    fn connect_falls_back_to_the_next_endpoint() {
        rt().block_on(async {
            let (socket, mut server) = MockServer::pair();
            let script = tokio::spawn(async move {
                server.read_untagged().await;
                server.auth_ok().await;
                server.key_data(3, 4).await;
                server.ready(b'I').await;
            });

            // first dial is refused, the fallback endpoint succeeds
            let mut config = crate::Config::new("alice");
            config.dial = Some(scripted_dial(vec![refused(), Ok(socket)]));
            config.fallbacks.push(crate::Fallback {
                host: "standby".into(),
                port: 5433,
                tls_mode: crate::TlsMode::Disable,
                tls_config: None,
            });

            let conn = PgConnection::connect(config).await.unwrap();
            assert_eq!(conn.process_id(), 3);
            script.await.unwrap();
        });
    }

    #[test]
    fn connect_collects_all_endpoint_failures() {
        rt().block_on(async {
            let mut config = crate::Config::new("alice");
            config.dial = Some(scripted_dial(vec![refused(), refused()]));
            config.fallbacks.push(crate::Fallback {
                host: "standby".into(),
                port: 5433,
                tls_mode: crate::TlsMode::Disable,
                tls_config: None,
            });

            let err = PgConnection::connect(config).await.unwrap_err();
            let ErrorKind::Connect(causes) = err.kind() else {
                panic!("expected a connect error, got {err:?}");
            };
            assert_eq!(causes.attempts().count(), 2);
        });
    }

    #[test]
    fn validate_connect_rejection_tries_the_next_fallback() {
        rt().block_on(async {
            let mut sockets = vec![];
            let mut scripts = vec![];
            for pid in [1u32, 2] {
                let (socket, mut server) = MockServer::pair();
                sockets.push(Ok(socket));
                scripts.push(tokio::spawn(async move {
                    server.read_untagged().await;
                    server.auth_ok().await;
                    server.key_data(pid, 0).await;
                    server.ready(b'I').await;
                    // the rejected connection gets a Terminate
                    server
                }));
            }

            let mut config = crate::Config::new("alice");
            config.dial = Some(scripted_dial(sockets));
            config.fallbacks.push(crate::Fallback {
                host: "standby".into(),
                port: 5433,
                tls_mode: crate::TlsMode::Disable,
                tls_config: None,
            });
            config.validate_connect = Some(Arc::new(|conn: &mut PgConnection| {
                let reject = conn.process_id() == 1;
                Box::pin(async move {
                    if reject {
                        Err(crate::Error::other("reject first conn"))
                    } else {
                        Ok(())
                    }
                })
            }));

            let conn = PgConnection::connect(config).await.unwrap();
            assert_eq!(conn.process_id(), 2);
            for script in scripts {
                script.await.unwrap();
            }
        });
    }

    #[test]
    fn unsupported_auth_method_is_rejected() {
        rt().block_on(async {
            let (socket, mut server) = MockServer::pair();
            let script = tokio::spawn(async move {
                server.read_untagged().await;
                // Kerberos V5
                server.send(b'R', &2u32.to_be_bytes()).await;
            });

            let mut config = crate::Config::new("alice");
            config.dial = Some(scripted_dial(vec![Ok(socket)]));

            let err = PgConnection::connect(config).await.unwrap_err();
            let ErrorKind::Connect(causes) = err.kind() else {
                panic!("expected a connect error, got {err:?}");
            };
            let (_, cause) = causes.attempts().next().unwrap();
            assert!(matches!(cause.kind(), ErrorKind::UnsupportedAuth(_)));
            script.await.unwrap();
        });
    }

    #[test]
    fn scram_exchange_round_trips() {
        use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
        use hmac::{Hmac, Mac};
        use sha2::{Digest, Sha256};

        rt().block_on(async {
            let (socket, mut server) = MockServer::pair();
            let script = tokio::spawn(async move {
                server.read_untagged().await;

                // advertise SCRAM-SHA-256
                let mut body = Vec::from(&10u32.to_be_bytes()[..]);
                body.extend_from_slice(b"SCRAM-SHA-256\0\0");
                server.send(b'R', &body).await;

                // SASLInitialResponse: mechanism + length-prefixed payload
                let (tag, body) = server.read_frame().await;
                assert_eq!(tag, b'p');
                let nul = body.iter().position(|b| *b == 0).unwrap();
                assert_eq!(&body[..nul], b"SCRAM-SHA-256");
                let client_first = String::from_utf8(body[nul + 5..].to_vec()).unwrap();
                let client_nonce = client_first.strip_prefix("n,,n=,r=").unwrap().to_string();

                // server-first-message
                let salt = b"0123456789abcdef";
                let iterations = 1024u32;
                let server_first = format!(
                    "r={client_nonce}SRV,s={},i={iterations}",
                    BASE64.encode(salt)
                );
                let mut body = Vec::from(&11u32.to_be_bytes()[..]);
                body.extend_from_slice(server_first.as_bytes());
                server.send(b'R', &body).await;

                // client-final-message with proof
                let (tag, body) = server.read_frame().await;
                assert_eq!(tag, b'p');
                let client_final = String::from_utf8(body).unwrap();
                let without_proof = client_final.rsplit_once(",p=").unwrap().0.to_string();
                assert!(without_proof.starts_with(&format!("c=biws,r={client_nonce}SRV")));

                // compute the server signature the way the server would
                let mut salted = [0u8; 32];
                pbkdf2::pbkdf2::<Hmac<Sha256>>(b"pencil", salt, iterations, &mut salted)
                    .unwrap();
                let auth_message =
                    format!("n=,r={client_nonce},{server_first},{without_proof}");
                let mut mac = Hmac::<Sha256>::new_from_slice(&salted).unwrap();
                mac.update(b"Server Key");
                let server_key = mac.finalize().into_bytes();
                let mut mac = Hmac::<Sha256>::new_from_slice(&server_key).unwrap();
                mac.update(auth_message.as_bytes());
                let signature = mac.finalize().into_bytes();

                // server-final-message
                let server_final = format!("v={}", BASE64.encode(signature));
                let mut body = Vec::from(&12u32.to_be_bytes()[..]);
                body.extend_from_slice(server_final.as_bytes());
                server.send(b'R', &body).await;

                server.auth_ok().await;
                server.key_data(1, 2).await;
                server.ready(b'I').await;

                // sanity: the client proof must verify against StoredKey
                let mut mac = Hmac::<Sha256>::new_from_slice(&salted).unwrap();
                mac.update(b"Client Key");
                let client_key = mac.finalize().into_bytes();
                let stored_key = Sha256::digest(client_key);
                let mut mac = Hmac::<Sha256>::new_from_slice(&stored_key).unwrap();
                mac.update(auth_message.as_bytes());
                let client_signature = mac.finalize().into_bytes();
                let proof_b64 = client_final.rsplit_once(",p=").unwrap().1.to_string();
                let proof = BASE64.decode(proof_b64).unwrap();
                let recovered_key: Vec<u8> = proof
                    .iter()
                    .zip(client_signature.iter())
                    .map(|(p, s)| p ^ s)
                    .collect();
                assert_eq!(recovered_key, client_key.to_vec());
            });

            let mut config = crate::Config::new("alice");
            config.password = "pencil".into();
            config.dial = Some(scripted_dial(vec![Ok(socket)]));

            let conn = PgConnection::connect(config).await.unwrap();
            assert_eq!(conn.process_id(), 1);
            script.await.unwrap();
        });
    }

    #[test]
    fn sasl_without_scram_sha_256_is_unsupported() {
        rt().block_on(async {
            let (socket, mut server) = MockServer::pair();
            let script = tokio::spawn(async move {
                server.read_untagged().await;
                let mut body = Vec::from(&10u32.to_be_bytes()[..]);
                body.extend_from_slice(b"SCRAM-SHA-256-PLUS\0\0");
                server.send(b'R', &body).await;
            });

            let mut config = crate::Config::new("alice");
            config.dial = Some(scripted_dial(vec![Ok(socket)]));

            let err = PgConnection::connect(config).await.unwrap_err();
            let ErrorKind::Connect(causes) = err.kind() else {
                panic!("expected a connect error, got {err:?}");
            };
            let (_, cause) = causes.attempts().next().unwrap();
            assert!(matches!(cause.kind(), ErrorKind::UnsupportedAuth(_)));
            script.await.unwrap();
        });
    }

    #[test]
    fn md5_password_shape() {
        let hashed = md5_password("alice", "secret", *b"salt");
        assert!(hashed.starts_with("md5"));
        assert_eq!(hashed.len(), 3 + 32);
        assert!(hashed[3..].bytes().all(|b| b.is_ascii_hexdigit()));

        // deterministic, and sensitive to every input
        assert_eq!(hashed, md5_password("alice", "secret", *b"salt"));
        assert_ne!(hashed, md5_password("alice", "secret", *b"tlas"));
        assert_ne!(hashed, md5_password("alice", "terces", *b"salt"));
        assert_ne!(hashed, md5_password("bob", "secret", *b"salt"));
    }

    #[test]
    fn md5_hex_known_vectors() {
        assert_eq!(md5_hex(b""), "d41d8cd98f00b204e9800998ecf8427e");
        assert_eq!(md5_hex(b"abc"), "900150983cd24fb0d6963f7d28e17f72");
    }
}
