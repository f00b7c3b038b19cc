//! Resolved connection configuration.
//!
//! This crate does not parse connection strings; a `Config` is the already
//! resolved output of whatever layer does (URL parser, environment reader,
//! service files). Every field is public and plain data, save for the
//! callback hooks.
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;

use crate::connection::{Notification, PgConnection};
use crate::error::Result;
use crate::net::Socket;
use crate::postgres::Notice;

/// Future returned by the callback hooks.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Opens a byte-stream transport to `(host, port)`.
///
/// The default dials TCP, or a Unix socket when the host is an absolute
/// path. Supplying one lets the caller route through proxies, in-memory
/// transports, or custom name resolution.
pub type DialFunc =
    Arc<dyn Fn(&str, u16) -> Pin<Box<dyn Future<Output = io::Result<Socket>> + Send>> + Send + Sync>;

/// Invoked for every NoticeResponse the server sends.
pub type NoticeCallback = Arc<dyn Fn(&Notice) + Send + Sync>;

/// Invoked for every NotificationResponse the server sends.
pub type NotificationCallback = Arc<dyn Fn(&Notification) + Send + Sync>;

/// Invoked after startup completes on an endpoint; an error abandons that
/// endpoint and moves on to the next fallback.
pub type ValidateConnect =
    Arc<dyn for<'a> Fn(&'a mut PgConnection) -> BoxFuture<'a, Result<()>> + Send + Sync>;

/// Invoked once on the connection that won.
pub type AfterConnect = ValidateConnect;

/// How eagerly to negotiate TLS, mirroring the `sslmode` levels.
///
/// Certificate and hostname verification differences between `Require`,
/// `VerifyCa` and `VerifyFull` live in the prepared [`rustls::ClientConfig`];
/// this enum only decides whether an SSLRequest is sent and whether the
/// server declining it is fatal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TlsMode {
    /// Never attempt TLS.
    #[default]
    Disable,
    /// Attempt TLS, accept plaintext when the server declines.
    Allow,
    /// Attempt TLS, accept plaintext when the server declines.
    Prefer,
    /// TLS or nothing.
    Require,
    /// TLS or nothing, with CA verification in the TLS config.
    VerifyCa,
    /// TLS or nothing, with full hostname verification in the TLS config.
    VerifyFull,
}

impl TlsMode {
    /// Whether an SSLRequest should be sent at all.
    pub(crate) fn requests_tls(&self) -> bool {
        !matches!(self, TlsMode::Disable)
    }

    /// Whether the server answering 'N' to the SSLRequest is fatal.
    pub(crate) fn requires_tls(&self) -> bool {
        matches!(self, TlsMode::Require | TlsMode::VerifyCa | TlsMode::VerifyFull)
    }
}

/// An alternate endpoint tried, in order, when the one before it fails.
#[derive(Clone)]
pub struct Fallback {
    pub host: String,
    pub port: u16,
    pub tls_mode: TlsMode,
    pub tls_config: Option<Arc<rustls::ClientConfig>>,
}

/// Resolved session configuration.
#[derive(Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: Option<String>,
    /// Additional name/value pairs for the startup message, applied as
    /// session defaults.
    pub runtime_params: Vec<(String, String)>,
    pub tls_mode: TlsMode,
    /// Prepared TLS configuration; required whenever `tls_mode` can end up
    /// negotiating TLS.
    pub tls_config: Option<Arc<rustls::ClientConfig>>,
    pub dial: Option<DialFunc>,
    pub validate_connect: Option<ValidateConnect>,
    pub after_connect: Option<AfterConnect>,
    pub on_notice: Option<NoticeCallback>,
    pub on_notification: Option<NotificationCallback>,
    pub fallbacks: Vec<Fallback>,
}

impl Config {
    /// A configuration for `user` against localhost:5432, no TLS.
    pub fn new(user: impl Into<String>) -> Config {
        Config {
            host: "localhost".into(),
            port: 5432,
            user: user.into(),
            password: String::new(),
            database: None,
            runtime_params: vec![],
            tls_mode: TlsMode::default(),
            tls_config: None,
            dial: None,
            validate_connect: None,
            after_connect: None,
            on_notice: None,
            on_notification: None,
            fallbacks: vec![],
        }
    }

    /// The primary endpoint followed by the fallbacks, in attempt order.
    pub(crate) fn endpoints(&self) -> Vec<Endpoint> {
        let mut endpoints = vec![Endpoint {
            host: self.host.clone(),
            port: self.port,
            tls_mode: self.tls_mode,
            tls_config: self.tls_config.clone(),
        }];
        for fb in &self.fallbacks {
            endpoints.push(Endpoint {
                host: fb.host.clone(),
                port: fb.port,
                tls_mode: fb.tls_mode,
                tls_config: fb.tls_config.clone(),
            });
        }
        endpoints
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("database", &self.database)
            .field("tls_mode", &self.tls_mode)
            .field("fallbacks", &self.fallbacks.len())
            .finish_non_exhaustive()
    }
}

#[derive(Clone)]
pub(crate) struct Endpoint {
    pub host: String,
    pub port: u16,
    pub tls_mode: TlsMode,
    pub tls_config: Option<Arc<rustls::ClientConfig>>,
}

impl Endpoint {
    pub fn describe(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// A [`ValidateConnect`] hook that only accepts sessions where
/// `transaction_read_only` is off, for routing to a writable primary
/// among the fallbacks.
pub fn validate_connect_target_session_attrs_read_write() -> ValidateConnect {
    Arc::new(|conn: &mut PgConnection| {
        Box::pin(async move {
            let results = conn
                .exec(&crate::CancelToken::none(), "show transaction_read_only")
                .await?
                .read_all()
                .await?;

            let read_only = results
                .first()
                .and_then(|r| r.rows.first())
                .and_then(|row| row.first())
                .and_then(|v| v.as_deref())
                .map(|v| v == b"on")
                .unwrap_or(false);

            if read_only {
                Err(crate::error::Error::other("read only connection"))
            } else {
                Ok(())
            }
        })
    })
}
