//! A low-level PostgreSQL client speaking the frontend/backend wire
//! protocol, version 3.
//!
//! `postern` is the connection core underneath a driver: it establishes an
//! authenticated, optionally TLS-protected session, serializes commands
//! into protocol messages, pumps and dispatches server responses, and
//! exposes cursor-like readers over returned rows. It knows nothing about
//! connection strings, row decoding, or pooling; those belong to the
//! layers above.
//!
//! # Examples
//!
//! Simple query:
//!
//! ```no_run
//! use postern::{CancelToken, Config, PgConnection};
//!
//! # async fn app() -> postern::Result<()> {
//! let mut config = Config::new("postgres");
//! config.password = "secret".into();
//!
//! let mut conn = PgConnection::connect(config).await?;
//!
//! let results = conn
//!     .exec(&CancelToken::none(), "select 'Hello, world'")
//!     .await?
//!     .read_all()
//!     .await?;
//!
//! assert_eq!(results[0].rows[0][0].as_deref(), Some(&b"Hello, world"[..]));
//! # Ok(())
//! # }
//! ```
//!
//! Extended query with a parameter and a deadline:
//!
//! ```no_run
//! use std::time::Duration;
//! use postern::{CancelToken, PgConnection};
//!
//! # async fn app(conn: &mut PgConnection) -> postern::Result<()> {
//! let token = CancelToken::with_timeout(Duration::from_secs(5));
//! let result = conn
//!     .exec_params(&token, "select $1::text", &[Some(b"42")], &[], &[], &[])
//!     .await?
//!     .read()
//!     .await;
//! assert_eq!(result.command_tag.unwrap().as_str(), "SELECT 1");
//! # Ok(())
//! # }
//! ```
//!
//! Streaming rows:
//!
//! ```no_run
//! # use postern::{CancelToken, PgConnection};
//! # async fn app(conn: &mut PgConnection) -> postern::Result<()> {
//! let mut reader = conn
//!     .exec_params(&CancelToken::none(), "select generate_series(1,3)", &[], &[], &[], &[])
//!     .await?;
//! while reader.next_row().await {
//!     let value = reader.values()[0].as_ref();
//!     println!("{:?}", value);
//! }
//! let tag = reader.close().await?;
//! assert_eq!(tag.rows_affected(), 3);
//! # Ok(())
//! # }
//! ```

mod common;
mod ext;

// Protocol
pub mod postgres;

// Transport
mod net;
mod stream;

// Cancellation
mod ctxwatch;

// Authentication
mod sasl;
mod startup;

// Connection
mod config;
mod connection;
mod copy;
mod result;

mod error;

#[cfg(test)]
mod testutil;

pub use config::{
    AfterConnect, BoxFuture, Config, DialFunc, Fallback, NoticeCallback, NotificationCallback,
    TlsMode, ValidateConnect, validate_connect_target_session_attrs_read_write,
};
pub use connection::{Batch, Notification, PgConnection, TxStatus};
pub use ctxwatch::{CancelCause, CancelToken};
pub use error::{ConnectError, Error, ErrorKind, LockReason, Result};
pub use net::Socket;
pub use result::{
    CommandTag, MultiResultReader, ResultReader, StatementDescription, StatementResult,
};

#[doc(inline)]
pub use postgres::{BackendMessage, FieldDescription, Notice, Oid, PgError};
