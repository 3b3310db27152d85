//! A lightweight in-process RESP listener for driving the connection, router,
//! and retry layers against scripted replies without a real Valkey process.
//!
//! Each accepted connection gets a sequential `conn_id` (0, 1, 2, ...) so a
//! handler can script "first connection drops, second one behaves" without
//! any shared mutable state of its own.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use resp_cluster_client::codec::decode_value;
use resp_cluster_client::Value;

/// What the server does in response to one decoded command.
pub enum Reply {
    /// Write these raw RESP bytes back.
    Send(Vec<u8>),
    /// Decode the command but do not write anything (the caller's request
    /// stays pending forever, as for an unanswered blocking command).
    Silent,
    /// Close the connection without replying, as if the peer crashed.
    Close,
}

pub type Handler = Arc<dyn Fn(usize, &[Vec<u8>]) -> Reply + Send + Sync>;

pub struct MockServer {
    pub addr: SocketAddr,
}

impl MockServer {
    pub async fn start(handler: Handler) -> MockServer {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock server listener");
        let addr = listener.local_addr().expect("mock server local addr");

        tokio::spawn(async move {
            let next_conn_id = Arc::new(AtomicUsize::new(0));
            loop {
                let (stream, _) = match listener.accept().await {
                    Ok(pair) => pair,
                    Err(_) => return,
                };
                let conn_id = next_conn_id.fetch_add(1, Ordering::Relaxed);
                tokio::spawn(handle_connection(stream, conn_id, handler.clone()));
            }
        });

        MockServer { addr }
    }
}

async fn handle_connection(mut stream: TcpStream, conn_id: usize, handler: Handler) {
    let mut buf = BytesMut::with_capacity(4096);
    let mut chunk = [0u8; 4096];

    loop {
        match decode_value(&buf[..]) {
            Ok(Some((value, consumed))) => {
                buf.advance(consumed);
                if let Some(args) = command_args(value) {
                    match handler(conn_id, &args) {
                        Reply::Send(bytes) => {
                            if stream.write_all(&bytes).await.is_err() {
                                return;
                            }
                        }
                        Reply::Silent => {}
                        Reply::Close => return,
                    }
                }
                continue;
            }
            Ok(None) => {}
            Err(_) => return,
        }

        let n = match stream.read(&mut chunk).await {
            Ok(0) => return,
            Ok(n) => n,
            Err(_) => return,
        };
        buf.extend_from_slice(&chunk[..n]);
    }
}

fn command_args(value: Value) -> Option<Vec<Vec<u8>>> {
    match value {
        Value::Array(items) => {
            let mut args = Vec::with_capacity(items.len());
            for item in items {
                match item {
                    Value::Bulk(b) => args.push(b),
                    Value::SimpleString(s) => args.push(s.into_bytes()),
                    _ => return None,
                }
            }
            Some(args)
        }
        _ => None,
    }
}

pub fn ok() -> Vec<u8> {
    b"+OK\r\n".to_vec()
}

pub fn queued() -> Vec<u8> {
    b"+QUEUED\r\n".to_vec()
}

pub fn simple(s: &str) -> Vec<u8> {
    format!("+{s}\r\n").into_bytes()
}

pub fn bulk(s: &str) -> Vec<u8> {
    format!("${}\r\n{}\r\n", s.len(), s).into_bytes()
}

pub fn nil() -> Vec<u8> {
    b"$-1\r\n".to_vec()
}

pub fn int(n: i64) -> Vec<u8> {
    format!(":{n}\r\n").into_bytes()
}

pub fn error(kind: &str, message: &str) -> Vec<u8> {
    format!("-{kind} {message}\r\n").into_bytes()
}

/// Concatenates already-encoded reply fragments into one RESP array.
pub fn array(parts: &[Vec<u8>]) -> Vec<u8> {
    let mut out = format!("*{}\r\n", parts.len()).into_bytes();
    for part in parts {
        out.extend_from_slice(part);
    }
    out
}
