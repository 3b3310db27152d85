//! A single TCP connection to one node (C2): handshake, write pump, read
//! pump, and the `Connecting -> Ready -> Draining -> Broken` state machine
//! (spec §4.2).
//!
//! The socket is split into independent write and read halves, generalizing
//! `ActualConnection`/`PipelineSink` from the teacher's corpus (the
//! `JOT85-redis-rs` `aio` module): a write pump drains a bounded `mpsc`
//! channel of outgoing commands into the `Framed` sink, and a read pump
//! drains decoded frames from the `Framed` stream, matching each non-push
//! frame to the oldest outstanding waiter. Ordering between the two pumps is
//! kept correct not with a shared mutex-guarded deque but with a second,
//! unbounded channel (`order_tx`/`order_rx`) carrying the waiters themselves
//! in send order: the write pump enqueues a waiter only after the command has
//! been flushed, and the read pump consumes waiters in the same order it
//! consumes frames, so the two channels can never pair a reply with the
//! wrong request even though they are driven by independent tasks.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::codec::Framed;

use crate::auth::SharedAuthProvider;
use crate::cmd::{Command, CommandKind};
use crate::codec::RespCodec;
use crate::config::{ClientConfig, ProtocolVersion, SubscriptionMode};
use crate::error::{RedisCoreError, RedisCoreResult};
use crate::logging::{LogLevel, SharedLogger};
use crate::value::Value;

/// Outgoing send-queue depth before `send` starts applying backpressure to
/// its caller (spec §4.2 "bounded send queue").
const SEND_QUEUE_DEPTH: usize = 2048;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Ready,
    Draining,
    Broken,
}

impl ConnectionState {
    fn to_u8(self) -> u8 {
        match self {
            ConnectionState::Connecting => 0,
            ConnectionState::Ready => 1,
            ConnectionState::Draining => 2,
            ConnectionState::Broken => 3,
        }
    }

    fn from_u8(n: u8) -> Self {
        match n {
            0 => ConnectionState::Connecting,
            1 => ConnectionState::Ready,
            2 => ConnectionState::Draining,
            _ => ConnectionState::Broken,
        }
    }
}

struct WireRequest {
    command: Command,
    reply: oneshot::Sender<RedisCoreResult<Value>>,
}

/// A handle to one node connection. Cheap to clone: clones share the same
/// write-queue sender and state cell.
#[derive(Clone)]
pub struct Connection {
    addr: SocketAddr,
    sender: mpsc::Sender<WireRequest>,
    state: Arc<AtomicU8>,
    state_changes: watch::Receiver<ConnectionState>,
    is_replica: bool,
}

impl Connection {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn is_replica(&self) -> bool {
        self.is_replica
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(AtomicOrdering::Acquire))
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_changes.clone()
    }

    /// Marks the connection as no longer accepting new work; in-flight
    /// requests already queued still complete (spec §4.2/§4.5 "Draining").
    pub fn begin_drain(&self) {
        self.state.store(ConnectionState::Draining.to_u8(), AtomicOrdering::Release);
    }

    /// Enqueue one command and await its reply. Rejects immediately, without
    /// touching the wire, if the connection is `Draining` or `Broken` (spec
    /// §4.2: a draining connection admits no new work).
    pub async fn send(&self, command: Command) -> RedisCoreResult<Value> {
        match self.state() {
            ConnectionState::Draining | ConnectionState::Broken => {
                return Err(RedisCoreError::disconnect("connection is draining or broken"))
            }
            _ => {}
        }
        let (reply, rx) = oneshot::channel();
        self.sender
            .send(WireRequest { command, reply })
            .await
            .map_err(|_| RedisCoreError::disconnect("connection write pump has exited"))?;
        rx.await
            .map_err(|_| RedisCoreError::disconnect("connection read pump has exited"))?
    }

    /// Enqueue a whole batch of commands in order and await every reply, used
    /// by the pipeline executor (C8) for one node's sub-pipeline. Enqueuing
    /// is done in a single sequential loop (not concurrently) so the order
    /// commands are handed to the write pump is exactly the order given here,
    /// regardless of how the bounded channel happens to schedule waiters.
    pub async fn send_many(&self, commands: Vec<Command>) -> Vec<RedisCoreResult<Value>> {
        let mut receivers = Vec::with_capacity(commands.len());
        for command in commands {
            match self.state() {
                ConnectionState::Draining | ConnectionState::Broken => {
                    receivers.push(Err(RedisCoreError::disconnect("connection is draining or broken")));
                    continue;
                }
                _ => {}
            }
            let (reply, rx) = oneshot::channel();
            match self.sender.send(WireRequest { command, reply }).await {
                Ok(()) => receivers.push(Ok(rx)),
                Err(_) => receivers.push(Err(RedisCoreError::disconnect("connection write pump has exited"))),
            }
        }
        let mut results = Vec::with_capacity(receivers.len());
        for receiver in receivers {
            match receiver {
                Ok(rx) => results.push(
                    rx.await
                        .map_err(|_| RedisCoreError::disconnect("connection read pump has exited"))
                        .and_then(|r| r),
                ),
                Err(err) => results.push(Err(err)),
            }
        }
        results
    }

    /// Dial, handshake, and spawn the write/read pumps for a node connection.
    /// `push_tx` receives every RESP3 push frame the read pump observes
    /// (subscribe/unsubscribe acks included), for the pub/sub dispatcher
    /// (C10) to demultiplex.
    pub async fn connect(
        addr: SocketAddr,
        config: &ClientConfig,
        auth: &SharedAuthProvider,
        logger: SharedLogger,
        read_only: bool,
        push_tx: mpsc::UnboundedSender<(SocketAddr, Value)>,
    ) -> RedisCoreResult<Connection> {
        let stream = tokio::time::timeout(config.connection_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| RedisCoreError::disconnect(format!("connect to {addr} timed out")))??;
        stream.set_nodelay(true).ok();

        let mut framed = Framed::new(stream, RespCodec);
        handshake(&mut framed, config, auth, read_only, &logger).await?;

        let (tx, mut rx) = mpsc::channel::<WireRequest>(SEND_QUEUE_DEPTH);
        let (order_tx, mut order_rx) =
            mpsc::unbounded_channel::<oneshot::Sender<RedisCoreResult<Value>>>();
        let state = Arc::new(AtomicU8::new(ConnectionState::Ready.to_u8()));
        let (state_tx, state_rx) = watch::channel(ConnectionState::Ready);

        let (mut sink, mut stream) = framed.split();

        let write_state = state.clone();
        let write_state_tx = state_tx.clone();
        let write_logger = logger.clone();
        tokio::spawn(async move {
            while let Some(req) = rx.recv().await {
                match sink.send(req.command).await {
                    Ok(()) => {
                        // The oneshot is only enqueued after the bytes are
                        // flushed, so the read pump's FIFO consumption below
                        // can never get ahead of what was actually sent.
                        let _ = order_tx.send(req.reply);
                    }
                    Err(err) => {
                        write_logger.log(
                            LogLevel::Warn,
                            "connection.write",
                            &format!("write to {addr} failed: {err}"),
                        );
                        let _ = req.reply.send(Err(RedisCoreError::disconnect(err.to_string())));
                        break;
                    }
                }
            }
            write_state.store(ConnectionState::Broken.to_u8(), AtomicOrdering::Release);
            let _ = write_state_tx.send(ConnectionState::Broken);
        });

        let read_state = state.clone();
        let read_logger = logger;
        tokio::spawn(async move {
            loop {
                match stream.next().await {
                    Some(Ok(value)) if value.is_push() => {
                        let _ = push_tx.send((addr, value));
                    }
                    Some(Ok(value)) => match order_rx.recv().await {
                        Some(reply) => {
                            let _ = reply.send(value.into_result());
                        }
                        None => break,
                    },
                    Some(Err(err)) => {
                        read_logger.log(
                            LogLevel::Warn,
                            "connection.read",
                            &format!("decode error from {addr}: {err}"),
                        );
                        break;
                    }
                    None => {
                        read_logger.log(
                            LogLevel::Info,
                            "connection.read",
                            &format!("connection to {addr} closed by peer"),
                        );
                        break;
                    }
                }
            }
            read_state.store(ConnectionState::Broken.to_u8(), AtomicOrdering::Release);
            let _ = state_tx.send(ConnectionState::Broken);
            // Fail every waiter still queued: the peer will never answer them.
            while let Ok(reply) = order_rx.try_recv() {
                let _ = reply.send(Err(RedisCoreError::disconnect("connection closed")));
            }
        });

        Ok(Connection {
            addr,
            sender: tx,
            state,
            state_changes: state_rx,
            is_replica: read_only,
        })
    }
}

async fn handshake(
    framed: &mut Framed<TcpStream, RespCodec>,
    config: &ClientConfig,
    auth: &SharedAuthProvider,
    read_only: bool,
    logger: &SharedLogger,
) -> RedisCoreResult<()> {
    let credentials = auth.credentials().await?;

    if matches!(config.protocol, ProtocolVersion::Resp3) {
        let mut hello = Command::new(CommandKind::Admin).arg("HELLO").arg("3");
        if let Some(ref creds) = credentials {
            hello = hello
                .arg("AUTH")
                .arg(creds.username.clone().unwrap_or_else(|| "default".into()))
                .arg(creds.password.clone());
        }
        roundtrip(framed, hello).await?.into_result()?;
    } else if let Some(ref creds) = credentials {
        let mut auth_cmd = Command::new(CommandKind::Admin).arg("AUTH");
        if let Some(username) = creds.username.clone() {
            auth_cmd = auth_cmd.arg(username);
        }
        auth_cmd = auth_cmd.arg(creds.password.clone());
        roundtrip(framed, auth_cmd).await?.into_result()?;
    }

    if config.database_id != 0 {
        let select = Command::new(CommandKind::Admin)
            .arg("SELECT")
            .arg(config.database_id.to_string());
        roundtrip(framed, select).await?.into_result()?;
    }

    if let Some(ref name) = config.client_name {
        let setname = Command::new(CommandKind::Admin).arg("CLIENT").arg("SETNAME").arg(name.clone());
        roundtrip(framed, setname).await?.into_result()?;
    }

    for (field, value) in [("LIB-NAME", "resp-cluster-client"), ("LIB-VER", env!("CARGO_PKG_VERSION"))] {
        let setinfo = Command::new(CommandKind::Admin)
            .arg("CLIENT")
            .arg("SETINFO")
            .arg(field)
            .arg(value);
        if let Err(err) = roundtrip(framed, setinfo).await.and_then(Value::into_result) {
            logger.log(
                LogLevel::Debug,
                "connection.handshake",
                &format!("CLIENT SETINFO {field} ignored: {err}"),
            );
        }
    }

    if read_only {
        let readonly = Command::new(CommandKind::Admin).arg("READONLY");
        roundtrip(framed, readonly).await?.into_result()?;
    }

    for spec in &config.subscriptions {
        let verb = match spec.mode {
            SubscriptionMode::Exact => "SUBSCRIBE",
            SubscriptionMode::Pattern => "PSUBSCRIBE",
            SubscriptionMode::Sharded => "SSUBSCRIBE",
        };
        let subscribe = Command::new(CommandKind::Admin).arg(verb).arg(spec.channel.clone());
        // The ack arrives as a push frame, consumed by the pub/sub
        // dispatcher once the pumps are running, not here.
        framed
            .send(subscribe)
            .await
            .map_err(|err| RedisCoreError::disconnect(err.to_string()))?;
    }

    Ok(())
}

async fn roundtrip(framed: &mut Framed<TcpStream, RespCodec>, command: Command) -> RedisCoreResult<Value> {
    framed
        .send(command)
        .await
        .map_err(|err| RedisCoreError::disconnect(err.to_string()))?;
    match framed.next().await {
        Some(Ok(value)) => Ok(value),
        Some(Err(err)) => Err(err.into()),
        None => Err(RedisCoreError::disconnect("connection closed during handshake")),
    }
}

/// Exported for the connection pool's health-check ping (spec §4.5): a short
/// request/reply that does not go through the normal send queue, used before
/// handing a pooled connection back out.
pub async fn ping(connection: &Connection, timeout: Duration) -> RedisCoreResult<()> {
    let command = Command::new(CommandKind::Admin).arg("PING");
    match tokio::time::timeout(timeout, connection.send(command)).await {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(err)) => Err(err),
        Err(_) => Err(RedisCoreError::Timeout),
    }
}
