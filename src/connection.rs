//! The connection core: session state machine, response pump, and query
//! operations.
use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};

use bytes::BytesMut;

use crate::config::{Config, DialFunc, Endpoint};
use crate::ctxwatch::{CancelToken, CancelWatcher};
use crate::error::{Error, Result};
use crate::postgres::{BackendMessage, Notice, Oid, PgError, ProtocolError, frontend};
use crate::result::{MultiResultReader, OpCursor, ResultReader, StatementDescription};
use crate::stream::BufStream;

/// The extended protocol transmits parameter counts as two bytes.
const MAX_PARAMS: usize = u16::MAX as usize;

const STATUS_IDLE: u8 = 0;
const STATUS_BUSY: u8 = 1;
const STATUS_CLOSED: u8 = 2;

/// Backend transaction status, as carried by ReadyForQuery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TxStatus {
    /// Not in a transaction block.
    #[default]
    Idle,
    /// In a transaction block.
    InTransaction,
    /// In a failed transaction block; statements are rejected until
    /// the block ends.
    InFailedTransaction,
}

impl TxStatus {
    pub(crate) fn from_byte(byte: u8) -> TxStatus {
        match byte {
            b'T' => TxStatus::InTransaction,
            b'E' => TxStatus::InFailedTransaction,
            _ => TxStatus::Idle,
        }
    }
}

/// An asynchronous notification delivered by LISTEN/NOTIFY.
#[derive(Debug, Clone)]
pub struct Notification {
    /// The process ID of the notifying backend.
    pub process_id: u32,
    /// The channel the notify was raised on.
    pub channel: String,
    /// The payload string passed by the notifying process.
    pub payload: String,
}

/// Where CancelRequest connections go.
struct CancelTarget {
    host: String,
    port: u16,
    dial: Option<DialFunc>,
}

/// One postgres session.
///
/// A connection is strictly single-owner: one operation at a time owns the
/// wire, enforced both by the borrow checker (readers borrow the connection
/// mutably) and by a busy-status word for the paths the borrow checker
/// cannot see, such as a reader dropped without being closed.
///
/// After any operation error, either the error's
/// [`no_bytes_sent`][Error::no_bytes_sent] marker is set and the connection
/// is still usable, or the connection has transitioned to closed.
pub struct PgConnection {
    stream: BufStream,
    status: AtomicU8,
    watcher: CancelWatcher,
    process_id: u32,
    secret_key: u32,
    parameters: HashMap<String, String>,
    tx_status: TxStatus,
    config: Config,
    cancel_target: CancelTarget,
    pub(crate) cursor: OpCursor,
}

/// What the startup phase learned about the session.
#[derive(Debug, Default)]
pub(crate) struct SessionInfo {
    pub process_id: u32,
    pub secret_key: u32,
    pub parameters: HashMap<String, String>,
    pub tx_status: TxStatus,
}

impl PgConnection {
    /// Establish an authenticated session per `config`, trying fallback
    /// endpoints in order until one succeeds.
    pub async fn connect(config: Config) -> Result<PgConnection> {
        crate::startup::connect(config).await
    }

    pub(crate) fn new(
        stream: BufStream,
        config: Config,
        endpoint: &Endpoint,
        session: SessionInfo,
    ) -> PgConnection {
        let expire = stream.deadline();
        let clear = stream.deadline();
        let watcher = CancelWatcher::new(
            move |cause| expire.expire(cause),
            move || clear.clear(),
        );
        let cancel_target = CancelTarget {
            host: endpoint.host.clone(),
            port: endpoint.port,
            dial: config.dial.clone(),
        };
        PgConnection {
            stream,
            status: AtomicU8::new(STATUS_IDLE),
            watcher,
            process_id: session.process_id,
            secret_key: session.secret_key,
            parameters: session.parameters,
            tx_status: session.tx_status,
            config,
            cancel_target,
            cursor: OpCursor::idle(),
        }
    }

    // ---- observable state ----

    /// Whether the connection has transitioned to closed.
    pub fn is_closed(&self) -> bool {
        self.status.load(Ordering::Acquire) == STATUS_CLOSED
    }

    /// Whether an operation currently owns the wire.
    pub fn is_busy(&self) -> bool {
        self.status.load(Ordering::Acquire) == STATUS_BUSY
    }

    /// Transaction status per the server's last ReadyForQuery.
    pub fn tx_status(&self) -> TxStatus {
        self.tx_status
    }

    /// The current value of a frontend-visible server parameter, as
    /// accumulated from ParameterStatus messages.
    pub fn parameter_status(&self, name: &str) -> Option<&str> {
        self.parameters.get(name).map(String::as_str)
    }

    /// The backend process ID, for CancelRequest.
    pub fn process_id(&self) -> u32 {
        self.process_id
    }

    /// The backend secret key, for CancelRequest.
    pub fn secret_key(&self) -> u32 {
        self.secret_key
    }

    /// Whether the transport is TLS-wrapped.
    pub fn is_tls(&self) -> bool {
        self.stream.is_tls()
    }

    /// Escape a string for inclusion inside single quotes in SQL: every
    /// `'` is doubled. Strings with embedded NUL bytes are rejected, as
    /// the protocol cannot carry them.
    pub fn escape_string(&self, s: &str) -> Result<String> {
        if s.contains('\0') {
            return Err(ProtocolError::EmbeddedNul.into());
        }
        Ok(s.replace('\'', "''"))
    }

    // ---- state machine ----

    pub(crate) fn stream_mut(&mut self) -> &mut BufStream {
        &mut self.stream
    }

    /// Acquire the wire for one operation. Fails fast, before any bytes
    /// are written, when the connection is busy or closed, or when the
    /// caller's token has already fired.
    pub(crate) fn lock(&mut self, token: &CancelToken) -> Result<()> {
        match self.status.compare_exchange(
            STATUS_IDLE,
            STATUS_BUSY,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {}
            Err(STATUS_CLOSED) => return Err(Error::closed()),
            Err(_) => return Err(Error::busy()),
        }

        if let Some(cause) = token.fired() {
            self.status.store(STATUS_IDLE, Ordering::Release);
            return Err(Error::pre_canceled(cause));
        }

        self.watcher.watch(token);
        Ok(())
    }

    /// Release the wire: stop watching the token and, unless the
    /// connection died, return to idle.
    pub(crate) async fn finish_op(&mut self) {
        self.watcher.unwatch().await;
        let _ = self.status.compare_exchange(
            STATUS_BUSY,
            STATUS_IDLE,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    pub(crate) fn mark_closed(&mut self) {
        self.status.store(STATUS_CLOSED, Ordering::Release);
    }

    /// Flush buffered request bytes; a failed write poisons the connection.
    pub(crate) async fn flush_or_close(&mut self) -> Result<()> {
        match self.stream.flush().await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.mark_closed();
                self.finish_op().await;
                Err(e)
            }
        }
    }

    // ---- response pump ----

    /// Receive one backend message, transparently dispatching the
    /// side channels: ParameterStatus updates the parameter map,
    /// NoticeResponse and NotificationResponse go to their callbacks,
    /// ReadyForQuery updates the transaction status (and is returned),
    /// ErrorResponse converts to a statement-level error.
    ///
    /// This is the only place backend messages are decoded once a session
    /// is up, so side-channel messages can never be missed by a reader.
    pub(crate) async fn receive(&mut self) -> Result<BackendMessage> {
        loop {
            if self.is_closed() {
                return Err(Error::closed_mid_operation());
            }
            let msg = match self.stream.recv().await {
                Ok(msg) => msg,
                Err(e) => {
                    self.mark_closed();
                    return Err(e);
                }
            };
            if let Some(msg) = self.dispatch(msg)? {
                return Ok(msg);
            }
        }
    }

    /// Like [`receive`][PgConnection::receive], but never suspends: yields
    /// `None` when no complete message is on the wire yet.
    pub(crate) async fn try_receive(&mut self) -> Result<Option<BackendMessage>> {
        loop {
            if self.is_closed() {
                return Err(Error::closed_mid_operation());
            }
            match self.stream.try_recv().await {
                Ok(None) => return Ok(None),
                Ok(Some(msg)) => {
                    if let Some(msg) = self.dispatch(msg)? {
                        return Ok(Some(msg));
                    }
                }
                Err(e) => {
                    self.mark_closed();
                    return Err(e);
                }
            }
        }
    }

    fn dispatch(&mut self, msg: BackendMessage) -> Result<Option<BackendMessage>> {
        match msg {
            BackendMessage::ParameterStatus(ps) => {
                self.parameters.insert(ps.name, ps.value);
                Ok(None)
            }
            BackendMessage::NoticeResponse(notice) => {
                let notice = match Notice::parse(notice.body) {
                    Ok(notice) => notice,
                    Err(proto) => {
                        self.mark_closed();
                        return Err(proto.into());
                    }
                };
                if let Some(on_notice) = &self.config.on_notice {
                    on_notice(&notice);
                }
                Ok(None)
            }
            BackendMessage::NotificationResponse(n) => {
                if let Some(on_notification) = &self.config.on_notification {
                    on_notification(&Notification {
                        process_id: n.process_id,
                        channel: n.channel.clone(),
                        payload: n.payload.clone(),
                    });
                }
                Ok(Some(BackendMessage::NotificationResponse(n)))
            }
            BackendMessage::ErrorResponse(err) => {
                let err = match PgError::parse(err.body) {
                    Ok(err) => err,
                    Err(proto) => {
                        self.mark_closed();
                        return Err(proto.into());
                    }
                };
                Err(err.into())
            }
            BackendMessage::ReadyForQuery(r) => {
                self.tx_status = TxStatus::from_byte(r.tx_status);
                Ok(Some(BackendMessage::ReadyForQuery(r)))
            }
            other => Ok(Some(other)),
        }
    }

    // ---- simple query ----

    /// Submit `sql` as a simple query. The statement text may contain
    /// multiple statements separated by semicolons; the returned reader
    /// yields one result per statement.
    pub async fn exec(&mut self, token: &CancelToken, sql: &str) -> Result<MultiResultReader<'_>> {
        self.lock(token)?;
        self.cursor = OpCursor::idle();
        self.stream.send(frontend::Query { sql });
        self.flush_or_close().await?;
        Ok(MultiResultReader::new(self))
    }

    // ---- extended query ----

    /// Parse, bind and execute `sql` in one round trip using the unnamed
    /// prepared statement. Parameter values are raw bytes in the format
    /// given by `param_formats` (empty = all text).
    pub async fn exec_params(
        &mut self,
        token: &CancelToken,
        sql: &str,
        params: &[Option<&[u8]>],
        param_oids: &[Oid],
        param_formats: &[i16],
        result_formats: &[i16],
    ) -> Result<ResultReader<'_>> {
        self.lock(token)?;
        if params.len() > MAX_PARAMS {
            self.finish_op().await;
            return Err(Error::too_many_params());
        }

        self.stream.send(frontend::Parse {
            name: "",
            sql,
            param_oids,
        });
        self.send_bind_execute("", params, param_formats, result_formats);
        self.stream.send(frontend::Sync);
        self.flush_or_close().await?;

        self.read_result_preamble().await
    }

    /// Create a named prepared statement and describe its parameters
    /// and result shape.
    pub async fn prepare(
        &mut self,
        token: &CancelToken,
        name: &str,
        sql: &str,
        param_oids: &[Oid],
    ) -> Result<StatementDescription> {
        self.lock(token)?;
        if param_oids.len() > MAX_PARAMS {
            self.finish_op().await;
            return Err(Error::too_many_params());
        }

        self.stream.send(frontend::Parse {
            name,
            sql,
            param_oids,
        });
        self.stream.send(frontend::Describe { kind: b'S', name });
        self.stream.send(frontend::Sync);
        self.flush_or_close().await?;

        let mut description = StatementDescription {
            name: name.to_owned(),
            sql: sql.to_owned(),
            param_oids: param_oids.to_vec(),
            fields: vec![],
        };
        let mut first_err: Option<Error> = None;

        while !self.is_closed() {
            match self.receive().await {
                Ok(BackendMessage::ParameterDescription(pd)) => match pd.oids() {
                    Ok(oids) => description.param_oids = oids,
                    Err(proto) => {
                        self.mark_closed();
                        first_err.get_or_insert(proto.into());
                    }
                },
                Ok(BackendMessage::RowDescription(rd)) => match rd.fields() {
                    Ok(fields) => description.fields = fields,
                    Err(proto) => {
                        self.mark_closed();
                        first_err.get_or_insert(proto.into());
                    }
                },
                Ok(BackendMessage::ReadyForQuery(_)) => break,
                // ParseComplete, NoData
                Ok(_) => continue,
                Err(e) => {
                    // a statement error still drains to ReadyForQuery;
                    // a transport error closed the connection
                    if first_err.is_none() {
                        first_err = Some(e);
                    }
                }
            }
        }
        self.finish_op().await;

        match first_err {
            Some(err) => Err(err),
            None => Ok(description),
        }
    }

    /// Bind and execute a previously prepared statement.
    pub async fn exec_prepared(
        &mut self,
        token: &CancelToken,
        statement: &str,
        params: &[Option<&[u8]>],
        param_formats: &[i16],
        result_formats: &[i16],
    ) -> Result<ResultReader<'_>> {
        self.lock(token)?;
        if params.len() > MAX_PARAMS {
            self.finish_op().await;
            return Err(Error::too_many_params());
        }

        self.send_bind_execute(statement, params, param_formats, result_formats);
        self.stream.send(frontend::Sync);
        self.flush_or_close().await?;

        self.read_result_preamble().await
    }

    fn send_bind_execute(
        &mut self,
        statement: &str,
        params: &[Option<&[u8]>],
        param_formats: &[i16],
        result_formats: &[i16],
    ) {
        self.stream.send(frontend::Bind {
            portal: "",
            statement,
            param_formats,
            params,
            result_formats,
        });
        self.stream.send(frontend::Describe { kind: b'P', name: "" });
        self.stream.send(frontend::Execute {
            portal: "",
            max_rows: 0,
        });
    }

    /// Consume responses up to the result shape (RowDescription or NoData),
    /// leaving rows for the returned reader.
    async fn read_result_preamble(&mut self) -> Result<ResultReader<'_>> {
        self.cursor = OpCursor::default();
        loop {
            match self.receive().await {
                Ok(BackendMessage::RowDescription(rd)) => match rd.fields() {
                    Ok(fields) => {
                        self.cursor.fields = fields;
                        break;
                    }
                    Err(proto) => {
                        self.mark_closed();
                        self.finish_op().await;
                        return Err(proto.into());
                    }
                },
                Ok(BackendMessage::NoData(_)) => break,
                // ParseComplete, BindComplete
                Ok(_) => continue,
                Err(e) if e.is_db() => {
                    self.cursor.err = Some(e);
                    self.cursor.done = true;
                    break;
                }
                Err(e) => {
                    self.finish_op().await;
                    return Err(e);
                }
            }
        }
        Ok(ResultReader {
            conn: self,
            standalone: true,
        })
    }

    // ---- batch ----

    /// Submit a [`Batch`] of extended-query steps as one pipelined round
    /// trip terminated by a single Sync. The whole batch runs as one
    /// implicit transaction: an error on any step discards the remaining
    /// steps and rolls back the batch's effects.
    ///
    /// Writing and reading are interleaved, so a batch larger than the
    /// server's receive window cannot deadlock.
    pub async fn exec_batch(
        &mut self,
        token: &CancelToken,
        batch: &Batch,
    ) -> Result<MultiResultReader<'_>> {
        self.lock(token)?;
        for step in &batch.steps {
            if step.param_count() > MAX_PARAMS {
                self.finish_op().await;
                return Err(Error::too_many_params());
            }
        }

        for step in &batch.steps {
            match step {
                BatchStep::Params {
                    sql,
                    params,
                    param_oids,
                    param_formats,
                    result_formats,
                } => {
                    self.stream.send(frontend::Parse {
                        name: "",
                        sql,
                        param_oids,
                    });
                    let params: Vec<Option<&[u8]>> =
                        params.iter().map(|p| p.as_deref()).collect();
                    self.send_bind_execute("", &params, param_formats, result_formats);
                }
                BatchStep::Prepared {
                    statement,
                    params,
                    param_formats,
                    result_formats,
                } => {
                    let params: Vec<Option<&[u8]>> =
                        params.iter().map(|p| p.as_deref()).collect();
                    self.send_bind_execute(statement, &params, param_formats, result_formats);
                }
            }
        }
        self.stream.send(frontend::Sync);

        self.cursor = OpCursor::idle();
        if let Err(e) = self.stream.flush_interleaved().await {
            self.mark_closed();
            self.finish_op().await;
            return Err(e);
        }
        Ok(MultiResultReader::new(self))
    }

    // ---- notifications ----

    /// Block until a NotificationResponse arrives and has been dispatched
    /// to the registered callback.
    pub async fn wait_for_notification(&mut self, token: &CancelToken) -> Result<()> {
        self.lock(token)?;
        let res = loop {
            match self.receive().await {
                Ok(BackendMessage::NotificationResponse(_)) => break Ok(()),
                Ok(_) => continue,
                Err(e) => break Err(e),
            }
        };
        self.finish_op().await;
        res
    }

    // ---- out-of-band cancellation ----

    /// Ask the server to cancel whatever this connection is running, over
    /// a second, throwaway connection to the same endpoint. Best effort:
    /// the server is free to ignore it.
    ///
    /// The canceled operation, if any, will observe a statement error with
    /// SQLSTATE 57014 on this connection.
    pub async fn cancel_request(&self) -> Result<()> {
        use tokio::io::AsyncWriteExt;

        let mut socket = match &self.cancel_target.dial {
            Some(dial) => dial(&self.cancel_target.host, self.cancel_target.port).await?,
            None => {
                crate::startup::default_dial(&self.cancel_target.host, self.cancel_target.port)
                    .await?
            }
        };

        let mut buf = BytesMut::new();
        frontend::CancelRequest {
            process_id: self.process_id,
            secret_key: self.secret_key,
        }
        .write(&mut buf);

        socket.write_all(&buf).await?;
        let _ = socket.shutdown().await;
        Ok(())
    }

    // ---- low-level escape hatch ----

    /// Write raw, pre-framed bytes to the wire.
    ///
    /// Bypasses the protocol framing but not the busy-status lock; the
    /// caller is responsible for keeping the protocol state coherent.
    pub async fn send_bytes(&mut self, token: &CancelToken, bytes: &[u8]) -> Result<()> {
        self.lock(token)?;
        self.stream.send_raw(bytes);
        let res = self.flush_or_close().await;
        if res.is_ok() {
            self.finish_op().await;
        }
        res
    }

    /// Receive a single decoded backend message.
    ///
    /// Side channels are dispatched as usual. A statement-level
    /// ErrorResponse surfaces as an error without closing the connection.
    pub async fn receive_message(&mut self, token: &CancelToken) -> Result<BackendMessage> {
        self.lock(token)?;
        let res = self.receive().await;
        self.finish_op().await;
        res
    }

    // ---- teardown ----

    /// Gracefully close the session: best-effort Terminate, then shut the
    /// transport down.
    pub async fn close(mut self) -> Result<()> {
        if self.status.swap(STATUS_CLOSED, Ordering::AcqRel) == STATUS_CLOSED {
            return Ok(());
        }
        self.stream.send(frontend::Terminate);
        let _ = self.stream.flush().await;
        let _ = self.stream.shutdown().await;
        Ok(())
    }
}

impl std::fmt::Debug for PgConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgConnection")
            .field("process_id", &self.process_id)
            .field("tx_status", &self.tx_status)
            .field("status", &self.status.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// A list of extended-query steps submitted as one pipelined round trip
/// by [`PgConnection::exec_batch`].
#[derive(Default)]
pub struct Batch {
    steps: Vec<BatchStep>,
}

enum BatchStep {
    Params {
        sql: String,
        params: Vec<Option<Vec<u8>>>,
        param_oids: Vec<Oid>,
        param_formats: Vec<i16>,
        result_formats: Vec<i16>,
    },
    Prepared {
        statement: String,
        params: Vec<Option<Vec<u8>>>,
        param_formats: Vec<i16>,
        result_formats: Vec<i16>,
    },
}

impl BatchStep {
    fn param_count(&self) -> usize {
        match self {
            BatchStep::Params { params, .. } => params.len(),
            BatchStep::Prepared { params, .. } => params.len(),
        }
    }
}

impl Batch {
    pub fn new() -> Batch {
        Batch::default()
    }

    /// Append a parse-bind-execute step on the unnamed statement.
    pub fn exec_params(
        &mut self,
        sql: impl Into<String>,
        params: Vec<Option<Vec<u8>>>,
        param_oids: Vec<Oid>,
        param_formats: Vec<i16>,
        result_formats: Vec<i16>,
    ) {
        self.steps.push(BatchStep::Params {
            sql: sql.into(),
            params,
            param_oids,
            param_formats,
            result_formats,
        });
    }

    /// Append a bind-execute step on a previously prepared statement.
    pub fn exec_prepared(
        &mut self,
        statement: impl Into<String>,
        params: Vec<Option<Vec<u8>>>,
        param_formats: Vec<i16>,
        result_formats: Vec<i16>,
    ) {
        self.steps.push(BatchStep::Prepared {
            statement: statement.into(),
            params,
            param_formats,
            result_formats,
        });
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}
