//! A scriptable in-memory backend for exercising the protocol without a
//! server.
use std::collections::HashMap;

use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

use crate::config::{Config, Endpoint, TlsMode};
use crate::connection::{PgConnection, SessionInfo, TxStatus};
use crate::net::Socket;
use crate::stream::BufStream;

/// The server half of an in-memory connection.
pub(crate) struct MockServer {
    io: DuplexStream,
}

impl MockServer {
    pub fn pair() -> (Socket, MockServer) {
        let (client, server) = tokio::io::duplex(1 << 20);
        (Socket::mem(client), MockServer { io: server })
    }

    /// An established connection wired to a mock server, skipping startup.
    pub fn session() -> (PgConnection, MockServer) {
        Self::session_with(Config::new("test"))
    }

    pub fn session_with(config: Config) -> (PgConnection, MockServer) {
        let (socket, server) = Self::pair();
        let endpoint = Endpoint {
            host: "mock".into(),
            port: 5432,
            tls_mode: TlsMode::Disable,
            tls_config: None,
        };
        let session = SessionInfo {
            process_id: 42,
            secret_key: 271828,
            parameters: HashMap::new(),
            tx_status: TxStatus::Idle,
        };
        let conn = PgConnection::new(BufStream::new(socket), config, &endpoint, session);
        (conn, server)
    }

    /// Read one tagged frontend frame.
    pub async fn read_frame(&mut self) -> (u8, Vec<u8>) {
        let mut header = [0u8; 5];
        self.io.read_exact(&mut header).await.unwrap();
        let len = i32::from_be_bytes(header[1..5].try_into().unwrap()) as usize;
        let mut body = vec![0u8; len - 4];
        self.io.read_exact(&mut body).await.unwrap();
        (header[0], body)
    }

    /// Read the untagged startup (or SSLRequest/CancelRequest) frame.
    pub async fn read_untagged(&mut self) -> Vec<u8> {
        let mut len = [0u8; 4];
        self.io.read_exact(&mut len).await.unwrap();
        let len = i32::from_be_bytes(len) as usize;
        let mut body = vec![0u8; len - 4];
        self.io.read_exact(&mut body).await.unwrap();
        body
    }

    /// Read tagged frames until one with tag `want` shows up.
    pub async fn read_until(&mut self, want: u8) -> Vec<u8> {
        loop {
            let (tag, body) = self.read_frame().await;
            if tag == want {
                return body;
            }
        }
    }

    pub async fn send(&mut self, tag: u8, body: &[u8]) {
        let mut frame = BytesMut::with_capacity(5 + body.len());
        frame.put_u8(tag);
        frame.put_i32(4 + body.len() as i32);
        frame.put_slice(body);
        self.io.write_all(&frame).await.unwrap();
    }

    pub async fn auth_ok(&mut self) {
        self.send(b'R', &0u32.to_be_bytes()).await;
    }

    pub async fn auth_cleartext(&mut self) {
        self.send(b'R', &3u32.to_be_bytes()).await;
    }

    pub async fn auth_md5(&mut self, salt: [u8; 4]) {
        let mut body = BytesMut::new();
        body.put_u32(5);
        body.put_slice(&salt);
        self.send(b'R', &body).await;
    }

    pub async fn parameter(&mut self, name: &str, value: &str) {
        let mut body = BytesMut::new();
        body.put_slice(name.as_bytes());
        body.put_u8(0);
        body.put_slice(value.as_bytes());
        body.put_u8(0);
        self.send(b'S', &body).await;
    }

    pub async fn key_data(&mut self, process_id: u32, secret_key: u32) {
        let mut body = BytesMut::new();
        body.put_u32(process_id);
        body.put_u32(secret_key);
        self.send(b'K', &body).await;
    }

    pub async fn ready(&mut self, tx_status: u8) {
        self.send(b'Z', &[tx_status]).await;
    }

    /// Text-format row description with the given column names.
    pub async fn row_description(&mut self, columns: &[&str]) {
        let mut body = BytesMut::new();
        body.put_u16(columns.len() as u16);
        for (i, name) in columns.iter().enumerate() {
            body.put_slice(name.as_bytes());
            body.put_u8(0);
            body.put_u32(0); // table oid
            body.put_u16(i as u16 + 1);
            body.put_u32(25); // text
            body.put_i16(-1);
            body.put_i32(-1);
            body.put_i16(0);
        }
        self.send(b'T', &body).await;
    }

    pub async fn data_row(&mut self, values: &[Option<&[u8]>]) {
        let mut body = BytesMut::new();
        body.put_u16(values.len() as u16);
        for value in values {
            match value {
                None => body.put_i32(-1),
                Some(v) => {
                    body.put_i32(v.len() as i32);
                    body.put_slice(v);
                }
            }
        }
        self.send(b'D', &body).await;
    }

    pub async fn command_complete(&mut self, tag: &str) {
        let mut body = BytesMut::new();
        body.put_slice(tag.as_bytes());
        body.put_u8(0);
        self.send(b'C', &body).await;
    }

    pub async fn empty_query(&mut self) {
        self.send(b'I', &[]).await;
    }

    pub async fn parse_complete(&mut self) {
        self.send(b'1', &[]).await;
    }

    pub async fn bind_complete(&mut self) {
        self.send(b'2', &[]).await;
    }

    pub async fn no_data(&mut self) {
        self.send(b'n', &[]).await;
    }

    pub async fn parameter_description(&mut self, oids: &[u32]) {
        let mut body = BytesMut::new();
        body.put_u16(oids.len() as u16);
        for oid in oids {
            body.put_u32(*oid);
        }
        self.send(b't', &body).await;
    }

    pub async fn error_response(&mut self, code: &str, message: &str) {
        let mut body = BytesMut::new();
        body.put_slice(b"SERROR\0");
        body.put_slice(b"C");
        body.put_slice(code.as_bytes());
        body.put_u8(0);
        body.put_slice(b"M");
        body.put_slice(message.as_bytes());
        body.put_u8(0);
        body.put_u8(0);
        self.send(b'E', &body).await;
    }

    pub async fn notice(&mut self, message: &str) {
        let mut body = BytesMut::new();
        body.put_slice(b"SNOTICE\0");
        body.put_slice(b"C01000\0");
        body.put_slice(b"M");
        body.put_slice(message.as_bytes());
        body.put_u8(0);
        body.put_u8(0);
        self.send(b'N', &body).await;
    }

    pub async fn notification(&mut self, process_id: u32, channel: &str, payload: &str) {
        let mut body = BytesMut::new();
        body.put_u32(process_id);
        body.put_slice(channel.as_bytes());
        body.put_u8(0);
        body.put_slice(payload.as_bytes());
        body.put_u8(0);
        self.send(b'A', &body).await;
    }

    pub async fn copy_out_response(&mut self, columns: u16) {
        let mut body = BytesMut::new();
        body.put_i8(0);
        body.put_u16(columns);
        for _ in 0..columns {
            body.put_i16(0);
        }
        self.send(b'H', &body).await;
    }

    pub async fn copy_in_response(&mut self, columns: u16) {
        let mut body = BytesMut::new();
        body.put_i8(0);
        body.put_u16(columns);
        for _ in 0..columns {
            body.put_i16(0);
        }
        self.send(b'G', &body).await;
    }

    pub async fn copy_data(&mut self, data: &[u8]) {
        self.send(b'd', data).await;
    }

    pub async fn copy_done(&mut self) {
        self.send(b'c', &[]).await;
    }
}

pub(crate) fn rt() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}
