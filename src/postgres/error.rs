//! Protocol and server error types.
use std::fmt;

use bytes::{Buf, Bytes};

use super::BackendMessage;

/// An error translating buffers from postgres.
///
/// Receiving one of these means the byte stream is no longer trustworthy;
/// the connection that produced it is closed.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("{}", format_unexpected(*expect, *found, *phase))]
    Unexpected {
        expect: Option<u8>,
        found: u8,
        phase: Option<&'static str>,
    },
    #[error("unknown authentication method ({auth})")]
    UnknownAuth { auth: u32 },
    #[error("malformed {message} message")]
    Malformed { message: &'static str },
    #[error("postgres string is not nul terminated")]
    MissingNul,
    #[error("postgres string is not valid utf8")]
    InvalidUtf8,
    #[error("string contains embedded nul byte")]
    EmbeddedNul,
}

fn format_unexpected(expect: Option<u8>, found: u8, phase: Option<&'static str>) -> String {
    let mut msg = format!(
        "unexpected backend message {}",
        BackendMessage::message_name(found)
    );
    if let Some(expect) = expect {
        msg.push_str(", expecting ");
        msg.push_str(BackendMessage::message_name(expect));
    }
    if let Some(phase) = phase {
        msg.push_str(" in ");
        msg.push_str(phase);
    }
    msg
}

impl ProtocolError {
    pub(crate) fn unknown(found: u8) -> ProtocolError {
        Self::Unexpected {
            expect: None,
            found,
            phase: None,
        }
    }

    pub(crate) fn unexpected(expect: u8, found: u8) -> ProtocolError {
        Self::Unexpected {
            expect: Some(expect),
            found,
            phase: None,
        }
    }

    pub(crate) fn unexpected_phase(found: u8, phase: &'static str) -> ProtocolError {
        Self::Unexpected {
            expect: None,
            found,
            phase: Some(phase),
        }
    }

    pub(crate) fn unknown_auth(auth: u32) -> ProtocolError {
        Self::UnknownAuth { auth }
    }

    pub(crate) fn malformed(message: &'static str) -> ProtocolError {
        Self::Malformed { message }
    }

    pub(crate) fn missing_nul() -> ProtocolError {
        Self::MissingNul
    }

    pub(crate) fn invalid_utf8() -> ProtocolError {
        Self::InvalidUtf8
    }
}

/// An error reported by the server through an ErrorResponse message.
///
/// A statement-level error: the connection that produced it is still valid,
/// and has already been resynchronized to a ready state by the time the
/// error surfaces.
#[derive(Debug, Clone, Default)]
pub struct PgError {
    /// Severity as reported by the server: ERROR, FATAL, or PANIC
    /// (or WARNING, NOTICE, DEBUG, INFO, or LOG in a notice).
    pub severity: String,
    /// The SQLSTATE code. Always present, five characters.
    pub code: String,
    /// The primary human-readable error message.
    pub message: String,
    /// An optional secondary error message carrying more detail.
    pub detail: Option<String>,
    /// An optional suggestion what to do about the problem.
    pub hint: Option<String>,
    /// Error cursor position as an index into the original query string,
    /// measured in characters, starting from 1.
    pub position: Option<i32>,
    /// Cursor position into an internally generated command.
    pub internal_position: Option<i32>,
    /// The text of the failed internally-generated command.
    pub internal_query: Option<String>,
    /// Call stack context in which the error occurred.
    pub r#where: Option<String>,
    /// Schema name, when the error is associated with a specific object.
    pub schema_name: Option<String>,
    /// Table name, when the error is associated with a specific table.
    pub table_name: Option<String>,
    /// Column name, when the error is associated with a specific column.
    pub column_name: Option<String>,
    /// Data type name, when the error is associated with a specific type.
    pub data_type_name: Option<String>,
    /// Constraint name, when the error is associated with a specific constraint.
    pub constraint_name: Option<String>,
    /// Source-code file name where the error was reported.
    pub file: Option<String>,
    /// Source-code line number where the error was reported.
    pub line: Option<i32>,
    /// Source-code routine reporting the error.
    pub routine: Option<String>,
}

/// A server notice, delivered through a NoticeResponse message.
///
/// Carries the same field set as [`PgError`].
pub type Notice = PgError;

impl PgError {
    /// Parse the field list of an ErrorResponse or NoticeResponse body.
    ///
    /// Unrecognized field types are silently ignored, as the protocol requires.
    pub(crate) fn parse(mut body: Bytes) -> Result<PgError, ProtocolError> {
        use crate::ext::BytesExt;

        let mut err = PgError::default();
        loop {
            if !body.has_remaining() {
                return Err(ProtocolError::malformed("ErrorResponse"));
            }
            let field = body.get_u8();
            if field == 0 {
                break;
            }
            let value = body.get_nul_string()?;
            match field {
                b'S' => err.severity = value,
                b'C' => err.code = value,
                b'M' => err.message = value,
                b'D' => err.detail = Some(value),
                b'H' => err.hint = Some(value),
                b'P' => err.position = value.parse().ok(),
                b'p' => err.internal_position = value.parse().ok(),
                b'q' => err.internal_query = Some(value),
                b'W' => err.r#where = Some(value),
                b's' => err.schema_name = Some(value),
                b't' => err.table_name = Some(value),
                b'c' => err.column_name = Some(value),
                b'd' => err.data_type_name = Some(value),
                b'n' => err.constraint_name = Some(value),
                b'F' => err.file = Some(value),
                b'L' => err.line = value.parse().ok(),
                b'R' => err.routine = Some(value),
                _ => {}
            }
        }
        Ok(err)
    }
}

impl fmt::Display for PgError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {} (SQLSTATE {})", self.severity, self.message, self.code)
    }
}

impl std::error::Error for PgError {}
