//! The COPY sub-protocol: streaming bulk data in and out.
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::connection::PgConnection;
use crate::ctxwatch::CancelToken;
use crate::error::{Error, Result};
use crate::postgres::{BackendMessage, frontend};
use crate::result::CommandTag;

const COPY_CHUNK: usize = 8 * 1024;

impl PgConnection {
    /// Run a `COPY ... TO STDOUT` statement, streaming the payload into
    /// `sink`. Returns the completion tag, whose
    /// [`rows_affected`][CommandTag::rows_affected] is the row count.
    ///
    /// A server error before any payload is produced surfaces as a
    /// statement error and leaves the connection valid.
    pub async fn copy_to<W>(
        &mut self,
        token: &CancelToken,
        sink: &mut W,
        sql: &str,
    ) -> Result<CommandTag>
    where
        W: AsyncWrite + Unpin,
    {
        self.lock(token)?;
        self.stream_mut().send(frontend::Query { sql });
        self.flush_or_close().await?;

        let mut tag = None;
        let mut first_err: Option<Error> = None;

        while !self.is_closed() {
            match self.receive().await {
                Ok(BackendMessage::CopyOutResponse(_)) => {}
                Ok(BackendMessage::CopyData(data)) => {
                    if first_err.is_none() {
                        if let Err(e) = sink.write_all(&data.data).await {
                            // keep draining; the server side is fine
                            first_err = Some(e.into());
                        }
                    }
                }
                Ok(BackendMessage::CopyDone(_)) => {}
                Ok(BackendMessage::CommandComplete(ct)) => {
                    tag = Some(CommandTag::new(ct.tag));
                }
                Ok(BackendMessage::ReadyForQuery(_)) => break,
                Ok(_) => continue,
                Err(e) => {
                    // a statement error drains on to ReadyForQuery; a
                    // transport error closed the connection
                    if first_err.is_none() {
                        first_err = Some(e);
                    }
                }
            }
        }
        self.finish_op().await;

        match first_err {
            Some(err) => Err(err),
            None => Ok(tag.unwrap_or_default()),
        }
    }

    /// Run a `COPY ... FROM STDIN` statement, streaming `source` out as
    /// the payload. Returns the completion tag.
    ///
    /// The socket is polled for server messages between chunks, so a
    /// mid-stream server error aborts sending promptly instead of after
    /// the source runs dry. A source read failure sends CopyFail, which
    /// makes the server abandon the copy.
    pub async fn copy_from<R>(
        &mut self,
        token: &CancelToken,
        source: &mut R,
        sql: &str,
    ) -> Result<CommandTag>
    where
        R: AsyncRead + Unpin,
    {
        self.lock(token)?;
        self.stream_mut().send(frontend::Query { sql });
        self.flush_or_close().await?;

        let mut tag = None;
        let mut first_err: Option<Error> = None;
        let mut accepted = false;
        let mut drained = false;

        // wait for the server to accept the copy
        while !self.is_closed() {
            match self.receive().await {
                Ok(BackendMessage::CopyInResponse(_)) => {
                    accepted = true;
                    break;
                }
                // the statement failed outright (syntax error, missing
                // table); its error is already recorded
                Ok(BackendMessage::ReadyForQuery(_)) => {
                    drained = true;
                    break;
                }
                Ok(_) => continue,
                Err(e) => {
                    if first_err.is_none() {
                        first_err = Some(e);
                    }
                }
            }
        }

        if accepted {
            let mut buf = vec![0u8; COPY_CHUNK];
            loop {
                // surface a mid-stream server abort before producing more
                match self.try_receive().await {
                    Ok(None) => {}
                    Ok(Some(BackendMessage::ReadyForQuery(_))) => {
                        drained = true;
                        break;
                    }
                    Ok(Some(_)) => continue,
                    Err(e) => {
                        if first_err.is_none() {
                            first_err = Some(e);
                        }
                        if self.is_closed() {
                            break;
                        }
                        // the server rejected a row; stop sending
                        self.abort_copy().await;
                        break;
                    }
                }

                let read = tokio::select! {
                    read = source.read(&mut buf) => read,
                    cause = token.cancelled() => {
                        // hard cancellation while blocked on the source;
                        // the wire is mid-copy and unusable
                        self.mark_closed();
                        if first_err.is_none() {
                            first_err = Some(Error::canceled(cause));
                        }
                        break;
                    }
                };

                match read {
                    Ok(0) => {
                        self.stream_mut().send(frontend::CopyDone);
                        if let Err(e) = self.stream_mut().flush().await {
                            self.mark_closed();
                            if first_err.is_none() {
                                first_err = Some(e);
                            }
                        }
                        break;
                    }
                    Ok(n) => {
                        self.stream_mut().send(frontend::CopyData { data: &buf[..n] });
                        if let Err(e) = self.stream_mut().flush().await {
                            self.mark_closed();
                            if first_err.is_none() {
                                first_err = Some(e);
                            }
                            break;
                        }
                    }
                    Err(e) => {
                        if first_err.is_none() {
                            first_err = Some(e.into());
                        }
                        self.abort_copy().await;
                        break;
                    }
                }
            }

            // drain to ReadyForQuery
            while !drained && !self.is_closed() {
                match self.receive().await {
                    Ok(BackendMessage::CommandComplete(ct)) => {
                        tag = Some(CommandTag::new(ct.tag));
                    }
                    Ok(BackendMessage::ReadyForQuery(_)) => break,
                    Ok(_) => continue,
                    Err(e) => {
                        if first_err.is_none() {
                            first_err = Some(e);
                        }
                    }
                }
            }
        }
        self.finish_op().await;

        match first_err {
            Some(err) => Err(err),
            None => Ok(tag.unwrap_or_default()),
        }
    }

    /// Tell the server the copy is abandoned.
    async fn abort_copy(&mut self) {
        self.stream_mut().send(frontend::CopyFail {
            message: "copy aborted",
        });
        if self.stream_mut().flush().await.is_err() {
            self.mark_closed();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ctxwatch::CancelCause;
    use crate::error::ErrorKind;
    use crate::testutil::{MockServer, rt};

    fn none() -> CancelToken {
        CancelToken::none()
    }

    #[test]
    fn copy_to_streams_payload_into_the_sink() {
        rt().block_on(async {
            let (mut conn, mut server) = MockServer::session();
            let script = tokio::spawn(async move {
                server.read_until(b'Q').await;
                server.copy_out_response(2).await;
                server.copy_data(b"0\t1\n").await;
                server.copy_data(b"2\t3\n").await;
                server.copy_done().await;
                server.command_complete("COPY 2").await;
                server.ready(b'I').await;
            });

            let mut sink = std::io::Cursor::new(Vec::new());
            let tag = conn
                .copy_to(&none(), &mut sink, "copy foo to stdout")
                .await
                .unwrap();

            assert_eq!(tag.rows_affected(), 2);
            assert_eq!(sink.into_inner(), b"0\t1\n2\t3\n");
            assert!(!conn.is_busy());
            script.await.unwrap();
        });
    }

    #[test]
    fn copy_to_query_error_keeps_the_connection() {
        rt().block_on(async {
            let (mut conn, mut server) = MockServer::session();
            let script = tokio::spawn(async move {
                server.read_until(b'Q').await;
                server.error_response("42601", "syntax error").await;
                server.ready(b'I').await;
            });

            let mut sink = std::io::Cursor::new(Vec::new());
            let err = conn
                .copy_to(&none(), &mut sink, "cropy foo to stdout")
                .await
                .unwrap_err();
            assert_eq!(err.as_db().unwrap().code, "42601");
            assert!(sink.get_ref().is_empty());
            assert!(!conn.is_closed());
            assert!(!conn.is_busy());
            script.await.unwrap();
        });
    }

    #[test]
    fn copy_from_streams_the_source_and_reports_the_tag() {
        rt().block_on(async {
            let (mut conn, mut server) = MockServer::session();
            let script = tokio::spawn(async move {
                server.read_until(b'Q').await;
                server.copy_in_response(2).await;

                // expect the payload as CopyData, then CopyDone
                let mut payload = Vec::new();
                loop {
                    let (tag, body) = server.read_frame().await;
                    match tag {
                        b'd' => payload.extend_from_slice(&body),
                        b'c' => break,
                        other => panic!("unexpected frontend message {other:?}"),
                    }
                }
                assert_eq!(payload, b"1,foo\n2,bar\n");

                server.command_complete("COPY 2").await;
                server.ready(b'I').await;
            });

            let mut source = &b"1,foo\n2,bar\n"[..];
            let tag = conn
                .copy_from(&none(), &mut source, "COPY foo FROM STDIN WITH (FORMAT csv)")
                .await
                .unwrap();

            assert_eq!(tag.rows_affected(), 2);
            assert!(!conn.is_busy());
            script.await.unwrap();
        });
    }

    #[test]
    fn copy_to_canceled_mid_stream_closes_the_connection() {
        rt().block_on(async {
            let (mut conn, mut server) = MockServer::session();

            let token = CancelToken::new();
            let cancel = token.clone();
            let script = tokio::spawn(async move {
                server.read_until(b'Q').await;
                server.copy_out_response(1).await;
                server.copy_data(b"0\n").await;
                // fire mid-transfer, with the rest of the payload never sent
                cancel.cancel();
                server
            });

            let mut sink = std::io::Cursor::new(Vec::new());
            let err = conn
                .copy_to(&token, &mut sink, "copy (select pg_sleep(0.01)) to stdout")
                .await
                .unwrap_err();

            assert!(matches!(
                err.kind(),
                ErrorKind::Canceled(CancelCause::Canceled)
            ));
            assert!(conn.is_closed());
            let _server = script.await.unwrap();
        });
    }

    #[test]
    fn copy_from_query_error_keeps_the_connection() {
        rt().block_on(async {
            let (mut conn, mut server) = MockServer::session();
            let script = tokio::spawn(async move {
                server.read_until(b'Q').await;
                server.error_response("42P01", "relation does not exist").await;
                server.ready(b'I').await;
            });

            let mut source = &b"1,foo\n"[..];
            let err = conn
                .copy_from(&none(), &mut source, "COPY nope FROM STDIN")
                .await
                .unwrap_err();
            assert_eq!(err.as_db().unwrap().code, "42P01");
            assert!(!conn.is_closed());
            assert!(!conn.is_busy());
            script.await.unwrap();
        });
    }

    #[test]
    fn copy_from_canceled_mid_stream_closes_the_connection() {
        rt().block_on(async {
            let (mut conn, mut server) = MockServer::session();

            let token = CancelToken::new();
            let cancel = token.clone();
            let script = tokio::spawn(async move {
                server.read_until(b'Q').await;
                server.copy_in_response(2).await;

                // fire once the first row is in flight
                let (tag, body) = server.read_frame().await;
                assert_eq!(tag, b'd');
                assert_eq!(body, b"1,foo\n");
                cancel.cancel();
                server
            });

            // a source that delivers one row and then stalls forever
            let (mut feed, mut source) = tokio::io::duplex(64);
            feed.write_all(b"1,foo\n").await.unwrap();

            let err = conn
                .copy_from(&token, &mut source, "COPY foo FROM STDIN WITH (FORMAT csv)")
                .await
                .unwrap_err();

            assert!(matches!(
                err.kind(),
                ErrorKind::Canceled(CancelCause::Canceled)
            ));
            assert!(conn.is_closed());
            drop(feed);
            let _server = script.await.unwrap();
        });
    }
}
