//! Postgres Frontend and Backend Protocol
//!
//! Docs here mostly quoted from the official postgres documentation.
//!
//! ## Messaging Overview
//!
//! All communication is through a stream of messages. The first byte of a message identifies the message type,
//! and the next four bytes specify the length of the rest of the message (this length count includes itself,
//! but not the message-type byte). The remaining contents of the message are determined by the message type.
//!
//! ```text
//! ┏━━━━┳━━━━━━━━━━━━━━━━━━━┳━━━━━━┓
//! ┃ Ty ┃       Length      ┃ Body ┃
//! ┣━━━━╋━━━━━━━━━━━━━━━━━━━╋━━━━━━┫
//! ┃ u8 ┃        u32        ┃ [u8] ┃
//! ┗━━━━┻━━━━━━━━━━━━━━━━━━━┻━━━━━━┛
//! ```
//!
//! For historical reasons, the very first message sent by the client (the startup message)
//! has no initial message-type byte. The same applies to SSLRequest and CancelRequest,
//! which reuse the startup framing with a magic protocol code.
//!
//! <https://www.postgresql.org/docs/17/protocol-overview.html>

pub mod backend;
pub mod frontend;

mod error;

pub use backend::{BackendMessage, BackendProtocol, FieldDescription};
pub use error::{Notice, PgError, ProtocolError};
pub use frontend::FrontendProtocol;

/// Object ID of a postgres type, table, or other entity.
pub type Oid = u32;

/// The protocol version this crate speaks: 3.0.
///
/// The most significant 16 bits are the major version number,
/// the least significant 16 bits the minor version number.
pub const PROTOCOL_VERSION: i32 = 196608;

/// Magic "protocol version" of the SSLRequest message.
pub const SSL_REQUEST_CODE: i32 = 80877103;

/// Magic "protocol version" of the CancelRequest message.
pub const CANCEL_REQUEST_CODE: i32 = 80877102;

/// Postgres data transmission format.
///
/// As of PostgreSQL 7.4 the only supported formats are "text" and "binary".
/// Text has format code zero, and Binary has format code one.
///
/// Clients can specify a format code for each transmitted parameter value
/// and for each column of a query result.
///
/// <https://www.postgresql.org/docs/current/protocol-overview.html#PROTOCOL-FORMAT-CODES>
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PgFormat {
    /// Text has format code zero.
    ///
    /// There is no trailing null character in the transmitted representation;
    /// the text format does not allow embedded nulls.
    Text,
    /// Binary has format code one.
    ///
    /// Binary representations for integers use network byte order.
    Binary,
}

impl PgFormat {
    /// Return the wire format code for this format.
    pub fn format_code(&self) -> i16 {
        match self {
            PgFormat::Text => 0,
            PgFormat::Binary => 1,
        }
    }
}
