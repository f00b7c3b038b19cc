//! Cursors over query results.
//!
//! Per-operation cursor state lives on the connection itself; the reader
//! types are mutably-borrowing views over it, so the type system enforces
//! that at most one reader is live per connection.
use bytes::Bytes;

use crate::connection::PgConnection;
use crate::error::{Error, Result};
use crate::postgres::{BackendMessage, FieldDescription, Oid};

/// The completion tag of a command, e.g. `SELECT 3` or `INSERT 0 5`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandTag(Bytes);

impl CommandTag {
    pub(crate) fn new(tag: Bytes) -> CommandTag {
        CommandTag(tag)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// The tag text. Tags are always ASCII.
    pub fn as_str(&self) -> &str {
        std::str::from_utf8(&self.0).unwrap_or_default()
    }

    /// The number of rows the command affected: the trailing
    /// whitespace-separated token of the tag, or 0 when the tag carries
    /// no numeric tail (`CREATE TABLE`, `LISTEN`, ...).
    pub fn rows_affected(&self) -> i64 {
        self.as_str()
            .split_ascii_whitespace()
            .last()
            .and_then(|token| token.parse().ok())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Display for CommandTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a prepared statement expects and produces, per Describe.
#[derive(Debug, Clone)]
pub struct StatementDescription {
    pub name: String,
    pub sql: String,
    pub param_oids: Vec<Oid>,
    pub fields: Vec<FieldDescription>,
}

/// A fully collected single-statement result.
#[derive(Debug, Default)]
pub struct StatementResult {
    /// The completion tag; absent when the statement failed.
    pub command_tag: Option<CommandTag>,
    pub fields: Vec<FieldDescription>,
    /// Row values; `None` is the SQL NULL.
    pub rows: Vec<Vec<Option<Bytes>>>,
    /// The statement-level error, when the statement failed.
    pub err: Option<Error>,
}

/// Per-operation cursor state, owned by the connection.
#[derive(Debug, Default)]
pub(crate) struct OpCursor {
    pub fields: Vec<FieldDescription>,
    pub values: Vec<Option<Bytes>>,
    pub tag: Option<CommandTag>,
    pub err: Option<Error>,
    pub done: bool,
}

impl OpCursor {
    /// A cursor with no result open: the between-results state of a
    /// multi-result operation.
    pub fn idle() -> OpCursor {
        OpCursor {
            done: true,
            ..Default::default()
        }
    }

    /// A cursor waiting for rows of a result with the given shape.
    pub fn with_fields(fields: Vec<FieldDescription>) -> OpCursor {
        OpCursor {
            fields,
            ..Default::default()
        }
    }

    /// A cursor for a rowless, already-completed result.
    pub fn completed(tag: CommandTag) -> OpCursor {
        OpCursor {
            tag: Some(tag),
            done: true,
            ..Default::default()
        }
    }

    /// A cursor for a result that failed before producing anything.
    pub fn failed(err: Error) -> OpCursor {
        OpCursor {
            err: Some(err),
            done: true,
            ..Default::default()
        }
    }
}

/// A lazy, single-consumer cursor over the rows of one result.
///
/// Returned by [`PgConnection::exec_params`] and
/// [`PgConnection::exec_prepared`], and borrowed out of a
/// [`MultiResultReader`] for each result of a simple query or batch.
///
/// Statement-level errors land in the reader's error slot and surface from
/// [`close`][ResultReader::close]; they leave the connection valid.
/// Transport-level errors close the connection.
#[derive(Debug)]
pub struct ResultReader<'c> {
    pub(crate) conn: &'c mut PgConnection,
    /// Whether this reader owns the whole operation: drain to ReadyForQuery
    /// and release the connection on close.
    pub(crate) standalone: bool,
}

impl ResultReader<'_> {
    /// The descriptions of the result's fields, fixed once the reader exists.
    pub fn field_descriptions(&self) -> &[FieldDescription] {
        &self.conn.cursor.fields
    }

    /// The values of the current row. `None` is the SQL NULL.
    ///
    /// Only valid after [`next_row`][ResultReader::next_row] returned `true`;
    /// the slices are invalidated by the next advance.
    pub fn values(&self) -> &[Option<Bytes>] {
        &self.conn.cursor.values
    }

    /// Advance to the next row. `false` means the result is finished,
    /// whether by completion or by error; the error surfaces from
    /// [`close`][ResultReader::close].
    pub async fn next_row(&mut self) -> bool {
        if self.conn.cursor.done {
            return false;
        }
        loop {
            match self.conn.receive().await {
                Ok(BackendMessage::DataRow(dr)) => match dr.values() {
                    Ok(values) => {
                        self.conn.cursor.values = values;
                        return true;
                    }
                    Err(proto) => {
                        self.conn.mark_closed();
                        self.conn.cursor.err = Some(proto.into());
                        self.conn.cursor.done = true;
                        return false;
                    }
                },
                Ok(BackendMessage::CommandComplete(ct)) => {
                    self.conn.cursor.tag = Some(CommandTag::new(ct.tag));
                    self.conn.cursor.done = true;
                    return false;
                }
                Ok(BackendMessage::EmptyQueryResponse(_))
                | Ok(BackendMessage::PortalSuspended(_)) => {
                    self.conn.cursor.done = true;
                    return false;
                }
                // ParseComplete, BindComplete, NoData, notifications, ...
                Ok(_) => continue,
                Err(e) => {
                    // statement errors keep the connection; everything else
                    // already closed it inside the pump
                    if self.conn.cursor.err.is_none() {
                        self.conn.cursor.err = Some(e);
                    }
                    self.conn.cursor.done = true;
                    return false;
                }
            }
        }
    }

    /// Drain the rest of the result and return its completion tag.
    ///
    /// For a standalone reader this also resynchronizes to ReadyForQuery
    /// and releases the connection for the next operation.
    pub async fn close(mut self) -> Result<CommandTag> {
        while self.next_row().await {}

        if self.standalone {
            // resynchronize: the trailing Sync always produces ReadyForQuery
            // unless the transport is already gone
            while !self.conn.is_closed() {
                match self.conn.receive().await {
                    Ok(BackendMessage::ReadyForQuery(_)) => break,
                    Ok(_) => continue,
                    Err(e) => {
                        // keep the first error; statement errors drain on,
                        // transport errors closed the connection and end
                        // the loop
                        if self.conn.cursor.err.is_none() {
                            self.conn.cursor.err = Some(e);
                        }
                    }
                }
            }
            self.conn.finish_op().await;
        }

        match self.conn.cursor.err.take() {
            Some(err) => Err(err),
            None => Ok(self.conn.cursor.tag.take().unwrap_or_default()),
        }
    }

    /// Collect the whole result.
    pub async fn read(mut self) -> StatementResult {
        let mut result = StatementResult::default();
        while self.next_row().await {
            result.rows.push(self.values().to_vec());
        }
        result.fields = self.conn.cursor.fields.clone();
        match self.close().await {
            Ok(tag) => result.command_tag = Some(tag),
            Err(err) => result.err = Some(err),
        }
        result
    }
}

/// A lazy, single-consumer cursor over the results of a simple query or
/// batch submission.
///
/// Exactly one [`ResultReader`] can be live at a time; advancing past a
/// result drains whatever of it was left unread. Closing drains everything
/// up to ReadyForQuery so the connection comes back reusable.
#[derive(Debug)]
pub struct MultiResultReader<'c> {
    pub(crate) conn: &'c mut PgConnection,
    pub(crate) finished: bool,
}

impl<'c> MultiResultReader<'c> {
    pub(crate) fn new(conn: &'c mut PgConnection) -> MultiResultReader<'c> {
        MultiResultReader {
            conn,
            finished: false,
        }
    }

    /// Advance to the next result. `false` means the response stream is
    /// drained and the connection has been released.
    pub async fn next_result(&mut self) -> Result<bool> {
        if self.finished {
            return Ok(false);
        }

        // drain whatever is left of the current result
        {
            let mut reader = ResultReader {
                conn: &mut *self.conn,
                standalone: false,
            };
            while reader.next_row().await {}
        }

        loop {
            match self.conn.receive().await {
                Ok(BackendMessage::RowDescription(rd)) => match rd.fields() {
                    Ok(fields) => {
                        self.conn.cursor = OpCursor::with_fields(fields);
                        return Ok(true);
                    }
                    Err(proto) => {
                        self.conn.mark_closed();
                        self.finished = true;
                        self.conn.finish_op().await;
                        return Err(proto.into());
                    }
                },
                // a rowless statement completes without a RowDescription
                Ok(BackendMessage::CommandComplete(ct)) => {
                    self.conn.cursor = OpCursor::completed(CommandTag::new(ct.tag));
                    return Ok(true);
                }
                // contributes no result
                Ok(BackendMessage::EmptyQueryResponse(_)) => continue,
                Ok(BackendMessage::ReadyForQuery(_)) => {
                    self.finished = true;
                    self.conn.finish_op().await;
                    return Ok(false);
                }
                Ok(_) => continue,
                Err(e) if e.is_db() => {
                    // the failed statement still yields a result, carrying
                    // the error; the stream drains on towards ReadyForQuery
                    self.conn.cursor = OpCursor::failed(e);
                    return Ok(true);
                }
                Err(e) => {
                    self.finished = true;
                    self.conn.finish_op().await;
                    return Err(e);
                }
            }
        }
    }

    /// The reader over the current result.
    pub fn result_reader(&mut self) -> ResultReader<'_> {
        ResultReader {
            conn: &mut *self.conn,
            standalone: false,
        }
    }

    /// Drain all remaining results and surface the first error any of
    /// them carried.
    pub async fn close(mut self) -> Result<()> {
        let mut first_err: Option<Error> = None;
        loop {
            match self.next_result().await {
                Ok(true) => {
                    let result = self.result_reader().read().await;
                    if first_err.is_none() {
                        first_err = result.err;
                    }
                }
                Ok(false) => break,
                Err(e) => {
                    if first_err.is_none() {
                        first_err = Some(e);
                    }
                    break;
                }
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Collect every result. Statement-level errors are recorded on the
    /// result they belong to; transport-level errors abort the collection.
    pub async fn read_all(mut self) -> Result<Vec<StatementResult>> {
        let mut results = vec![];
        while self.next_result().await? {
            results.push(self.result_reader().read().await);
        }
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tag(s: &str) -> CommandTag {
        CommandTag::new(Bytes::copy_from_slice(s.as_bytes()))
    }

    #[test]
    fn command_tag_rows_affected() {
        let cases = [
            ("INSERT 0 5", 5),
            ("UPDATE 0", 0),
            ("UPDATE 1", 1),
            ("DELETE 0", 0),
            ("DELETE 1", 1),
            ("SELECT 3", 3),
            ("CREATE TABLE", 0),
            ("ALTER TABLE", 0),
            ("DROP TABLE", 0),
            ("LISTEN", 0),
            ("", 0),
        ];
        for (text, rows) in cases {
            assert_eq!(tag(text).rows_affected(), rows, "{text:?}");
        }
    }

    #[test]
    fn command_tag_display() {
        assert_eq!(tag("SELECT 1").to_string(), "SELECT 1");
        assert!(CommandTag::default().is_empty());
    }
}
