//! Buffered framed message stream over a [`Socket`].
use std::io;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker, ready};

use bytes::{Buf, BytesMut};

use crate::common::verbose;
use crate::ctxwatch::CancelCause;
use crate::error::{Error, Result};
use crate::net::Socket;
use crate::postgres::{BackendMessage, BackendProtocol, FrontendProtocol, frontend};

const DEFAULT_BUF_CAPACITY: usize = 1024;

/// A software read/write deadline shared between a connection and its
/// cancel watcher.
///
/// Expiring the deadline aborts any in-flight socket poll with a
/// timed-out I/O error, carrying the cancellation cause that triggered it.
/// This is how external cancellation interrupts blocking reads without a
/// watcher thread per connection.
#[derive(Debug)]
pub(crate) struct Deadline {
    // 0 = armed, otherwise the CancelCause discriminant + 1
    state: AtomicU8,
    waker: Mutex<Option<Waker>>,
}

const ARMED: u8 = 0;
const EXPIRED_CANCELED: u8 = 1;
const EXPIRED_DEADLINE: u8 = 2;

impl Deadline {
    pub fn new() -> Deadline {
        Deadline {
            state: AtomicU8::new(ARMED),
            waker: Mutex::new(None),
        }
    }

    /// Expire the deadline, waking any parked I/O poll.
    pub fn expire(&self, cause: CancelCause) {
        let state = match cause {
            CancelCause::Canceled => EXPIRED_CANCELED,
            CancelCause::DeadlineExceeded => EXPIRED_DEADLINE,
        };
        self.state.store(state, Ordering::Release);
        if let Some(waker) = self.waker.lock().unwrap().take() {
            waker.wake();
        }
    }

    /// Re-arm the deadline.
    pub fn clear(&self) {
        self.state.store(ARMED, Ordering::Release);
    }

    /// The cause the deadline expired with, if it has.
    pub fn cause(&self) -> Option<CancelCause> {
        match self.state.load(Ordering::Acquire) {
            EXPIRED_CANCELED => Some(CancelCause::Canceled),
            EXPIRED_DEADLINE => Some(CancelCause::DeadlineExceeded),
            _ => None,
        }
    }

    /// Check expiry, parking the current task's waker for [`expire`][Deadline::expire].
    fn poll_expired(&self, cx: &Context) -> bool {
        if self.cause().is_some() {
            return true;
        }
        *self.waker.lock().unwrap() = Some(cx.waker().clone());
        self.cause().is_some()
    }
}

/// A buffered stream which can send and receive framed postgres messages.
///
/// Writes accumulate in a buffer until flushed; a flush either writes the
/// whole buffer or fails. Reads accumulate into a chunked buffer and
/// complete messages are split off zero-copy.
#[derive(Debug)]
pub(crate) struct BufStream {
    socket: Socket,
    read_buf: BytesMut,
    write_buf: BytesMut,
    deadline: Arc<Deadline>,
}

impl BufStream {
    pub fn new(socket: Socket) -> BufStream {
        BufStream {
            socket,
            read_buf: BytesMut::with_capacity(DEFAULT_BUF_CAPACITY),
            write_buf: BytesMut::with_capacity(DEFAULT_BUF_CAPACITY),
            deadline: Arc::new(Deadline::new()),
        }
    }

    pub fn deadline(&self) -> Arc<Deadline> {
        self.deadline.clone()
    }

    /// Buffer a frontend message. Caller must flush afterwards.
    pub fn send<F: FrontendProtocol>(&mut self, message: F) {
        verbose!("(F) {:?}", char::from(F::MSGTYPE));
        frontend::write(message, &mut self.write_buf);
    }

    /// Buffer the startup message, which has no message-type byte.
    pub fn send_startup(&mut self, startup: frontend::Startup) {
        verbose!("(F) {startup:?}");
        startup.write(&mut self.write_buf);
    }

    /// Buffer raw, pre-framed bytes.
    pub fn send_raw(&mut self, bytes: &[u8]) {
        self.write_buf.extend_from_slice(bytes);
    }

    /// Translate a read-side I/O failure, folding an expired deadline back
    /// into its cancellation cause.
    fn read_error(&self, err: io::Error) -> Error {
        if err.kind() == io::ErrorKind::TimedOut {
            if let Some(cause) = self.deadline.cause() {
                return Error::canceled(cause);
            }
        }
        err.into()
    }

    fn write_error(&self, err: io::Error) -> Error {
        if err.kind() == io::ErrorKind::TimedOut {
            if let Some(cause) = self.deadline.cause() {
                return Error::canceled(cause);
            }
        }
        Error::write(err)
    }

    pub fn poll_flush(&mut self, cx: &mut Context) -> Poll<Result<()>> {
        if self.deadline.poll_expired(cx) {
            return Poll::Ready(Err(self
                .write_error(io::ErrorKind::TimedOut.into())));
        }
        match poll_write_all(&mut self.socket, &mut self.write_buf, cx) {
            Poll::Ready(Ok(())) => Poll::Ready(Ok(())),
            Poll::Ready(Err(e)) => Poll::Ready(Err(self.write_error(e))),
            Poll::Pending => Poll::Pending,
        }
    }

    /// Write out the whole send buffer.
    pub async fn flush(&mut self) -> Result<()> {
        std::future::poll_fn(|cx| self.poll_flush(cx)).await
    }

    /// Split the next complete frame off the read buffer, if one is in.
    fn take_frame(&mut self) -> Result<Option<(u8, bytes::Bytes)>> {
        let Some(mut header) = self.read_buf.get(..5) else {
            return Ok(None);
        };

        let msgtype = header.get_u8();
        let len = header.get_i32();
        if len < 4 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "frame length below protocol minimum",
            )
            .into());
        }
        let len = len as usize;

        if self.read_buf.len() - 1/*msgtype*/ < len {
            self.read_buf.reserve(1 + len - self.read_buf.len());
            return Ok(None);
        }

        self.read_buf.advance(5);
        let body = self.read_buf.split_to(len - 4).freeze();
        Ok(Some((msgtype, body)))
    }

    pub fn poll_recv(&mut self, cx: &mut Context) -> Poll<Result<BackendMessage>> {
        loop {
            if self.deadline.poll_expired(cx) {
                return Poll::Ready(Err(self.read_error(io::ErrorKind::TimedOut.into())));
            }

            if let Some((msgtype, body)) = self.take_frame()? {
                verbose!("(B) {}", BackendMessage::message_name(msgtype));
                return Poll::Ready(BackendMessage::decode(msgtype, body).map_err(Into::into));
            }

            self.read_buf.reserve(DEFAULT_BUF_CAPACITY);
            match ready!(poll_read(&mut self.socket, &mut self.read_buf, cx)) {
                Ok(0) => {
                    return Poll::Ready(Err(io::Error::from(io::ErrorKind::UnexpectedEof).into()));
                }
                Ok(_) => continue,
                Err(e) => return Poll::Ready(Err(self.read_error(e))),
            }
        }
    }

    /// Receive the next backend message.
    pub async fn recv(&mut self) -> Result<BackendMessage> {
        std::future::poll_fn(|cx| self.poll_recv(cx)).await
    }

    /// Receive a backend message only if one is already available, never
    /// suspending. Used to observe early server errors while producing an
    /// outbound stream.
    pub async fn try_recv(&mut self) -> Result<Option<BackendMessage>> {
        std::future::poll_fn(|cx| match self.poll_recv(cx) {
            Poll::Ready(r) => Poll::Ready(r.map(Some)),
            Poll::Pending => Poll::Ready(Ok(None)),
        })
        .await
    }

    /// Flush the whole send buffer while draining inbound bytes into the
    /// read buffer whenever the send path blocks.
    ///
    /// A large request can exceed the server's receive window before the
    /// server's own responses are consumed; pulling responses off the wire
    /// here keeps both sides making progress.
    pub async fn flush_interleaved(&mut self) -> Result<()> {
        std::future::poll_fn(|cx| {
            loop {
                if self.deadline.poll_expired(cx) {
                    return Poll::Ready(Err(self.write_error(io::ErrorKind::TimedOut.into())));
                }
                match poll_write_all(&mut self.socket, &mut self.write_buf, cx) {
                    Poll::Ready(Ok(())) => return Poll::Ready(Ok(())),
                    Poll::Ready(Err(e)) => return Poll::Ready(Err(self.write_error(e))),
                    Poll::Pending => {
                        self.read_buf.reserve(8 * 1024);
                        match poll_read(&mut self.socket, &mut self.read_buf, cx) {
                            Poll::Ready(Ok(0)) => {
                                return Poll::Ready(Err(io::Error::from(
                                    io::ErrorKind::UnexpectedEof,
                                )
                                .into()));
                            }
                            Poll::Ready(Ok(_)) => continue,
                            Poll::Ready(Err(e)) => return Poll::Ready(Err(self.read_error(e))),
                            Poll::Pending => return Poll::Pending,
                        }
                    }
                }
            }
        })
        .await
    }

    pub async fn shutdown(&mut self) -> io::Result<()> {
        use tokio::io::AsyncWriteExt;
        self.socket.shutdown().await
    }

    /// Whether the underlying transport is TLS-wrapped.
    pub fn is_tls(&self) -> bool {
        self.socket.is_tls()
    }
}

/// Read some bytes from `reader` into the uninitialized tail of `buf`.
fn poll_read<R, B>(reader: &mut R, buf: &mut B, cx: &mut Context) -> Poll<io::Result<usize>>
where
    R: tokio::io::AsyncRead + Unpin + ?Sized,
    B: bytes::BufMut + ?Sized,
{
    use std::pin::Pin;
    use tokio::io::ReadBuf;

    if !buf.has_remaining_mut() {
        return Poll::Ready(Ok(0));
    }

    let n = {
        let dst = buf.chunk_mut();
        let dst = unsafe { dst.as_uninit_slice_mut() };
        let mut buf = ReadBuf::uninit(dst);
        let ptr = buf.filled().as_ptr();
        ready!(Pin::new(reader).poll_read(cx, &mut buf)?);

        // Ensure the pointer does not change from under us
        assert_eq!(ptr, buf.filled().as_ptr());
        buf.filled().len()
    };

    // Safety: This is guaranteed to be the number of initialized (and read)
    // bytes due to the invariants provided by `ReadBuf::filled`.
    unsafe {
        buf.advance_mut(n);
    }

    Poll::Ready(Ok(n))
}

/// Write the whole of `buf` to `writer`, vectored when supported.
fn poll_write_all<W, B>(writer: &mut W, buf: &mut B, cx: &mut Context) -> Poll<io::Result<()>>
where
    W: tokio::io::AsyncWrite + Unpin + ?Sized,
    B: bytes::Buf + ?Sized,
{
    use std::io::IoSlice;
    use std::pin::Pin;

    const MAX_VECTOR_ELEMENTS: usize = 64;

    while buf.has_remaining() {
        let n = if writer.is_write_vectored() {
            let mut slices = [IoSlice::new(&[]); MAX_VECTOR_ELEMENTS];
            let cnt = buf.chunks_vectored(&mut slices);
            ready!(Pin::new(&mut *writer).poll_write_vectored(cx, &slices[..cnt]))?
        } else {
            ready!(Pin::new(&mut *writer).poll_write(cx, buf.chunk())?)
        };
        buf.advance(n);
        if n == 0 {
            return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
        }
    }

    Poll::Ready(Ok(()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::postgres::frontend::{Query, Sync};
    use tokio::io::AsyncWriteExt;

    fn rt() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap()
    }

    fn pair() -> (BufStream, tokio::io::DuplexStream) {
        let (client, server) = tokio::io::duplex(1 << 20);
        (BufStream::new(Socket::mem(client)), server)
    }

    #[test]
    fn flush_writes_all_buffered_messages() {
        rt().block_on(async {
            let (mut stream, mut server) = pair();
            stream.send(Query { sql: "SELECT 1" });
            stream.send(Sync);
            stream.flush().await.unwrap();

            use tokio::io::AsyncReadExt;
            let mut got = vec![0u8; 14 + 5];
            server.read_exact(&mut got).await.unwrap();
            assert_eq!(&got[..5], &[b'Q', 0, 0, 0, 13]);
            assert_eq!(&got[14..], &[b'S', 0, 0, 0, 4]);
        });
    }

    #[test]
    fn recv_reassembles_split_frames() {
        rt().block_on(async {
            let (mut stream, mut server) = pair();
            // ReadyForQuery split across two writes
            server.write_all(&[b'Z', 0, 0]).await.unwrap();
            server.flush().await.unwrap();

            let recv = stream.recv();
            tokio::pin!(recv);
            // incomplete header: must not resolve yet
            assert!(
                futures_poll_once(recv.as_mut()).await.is_none(),
                "recv resolved on a partial frame"
            );

            server.write_all(&[0, 5, b'I']).await.unwrap();
            match recv.await.unwrap() {
                BackendMessage::ReadyForQuery(r) => assert_eq!(r.tx_status, b'I'),
                other => panic!("unexpected message {other:?}"),
            }
        });
    }

    #[test]
    fn expired_deadline_aborts_pending_recv() {
        rt().block_on(async {
            let (mut stream, _server) = pair();
            let deadline = stream.deadline();

            tokio::spawn(async move {
                tokio::task::yield_now().await;
                deadline.expire(CancelCause::DeadlineExceeded);
            });

            let err = stream.recv().await.unwrap_err();
            match err.kind() {
                ErrorKind::Canceled(CancelCause::DeadlineExceeded) => {}
                other => panic!("unexpected error kind {other:?}"),
            }
        });
    }

    #[test]
    fn eof_is_a_read_error() {
        rt().block_on(async {
            let (mut stream, server) = pair();
            drop(server);
            let err = stream.recv().await.unwrap_err();
            assert!(matches!(err.kind(), ErrorKind::Io(_)));
        });
    }

    async fn futures_poll_once<F: std::future::Future>(
        fut: std::pin::Pin<&mut F>,
    ) -> Option<F::Output> {
        let mut fut = Some(fut);
        std::future::poll_fn(move |cx| {
            match fut.take().unwrap().poll(cx) {
                Poll::Ready(v) => Poll::Ready(Some(v)),
                Poll::Pending => Poll::Ready(None),
            }
        })
        .await
    }
}
