//! The connection engine.
//!
//! A [`Connection`] is a cheaply cloneable handle to a driver task that owns
//! the transport exclusively. Commands submitted while the link is down wait
//! in the offline queue; commands already written wait in the command queue
//! for their reply. Replies arrive strictly in write order, so demultiplexing
//! is a FIFO walk of the command queue. On transport loss the driver
//! reconnects with a configurable backoff, re-running the whole handshake
//! each time.

use std::collections::VecDeque;
use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{lookup_host, TcpStream};
#[cfg(unix)]
use tokio::net::UnixStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tokio_util::codec::Framed;
use tracing::{debug, trace, warn};

use crate::cmd::{cmd, Cmd};
use crate::connection::{ConnectionAddr, ConnectionInfo, IpFamily};
use crate::errors::{
    closed_connection_error, timeout_error, Error, ErrorKind, RedioxResult,
};
use crate::parser::ValueCodec;
use crate::reconnect::ReconnectPolicy;
use crate::types::{ProtocolVersion, PushKind, Value};

/// The lifecycle state of a connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, strum_macros::Display)]
#[strum(serialize_all = "snake_case")]
pub enum ConnectionStatus {
    /// Created, the driver has not started connecting yet.
    Wait,
    /// The transport is being established.
    Connecting,
    /// The transport is up, the handshake is running.
    Connect,
    /// Handshake complete, commands flow.
    Ready,
    /// A graceful shutdown was requested and is draining.
    Close,
    /// The transport was lost, a reconnect attempt is scheduled.
    Reconnecting,
    /// Terminal. No further transitions happen and every queued command has
    /// been rejected.
    End,
}

/// An out-of-band message pushed by the server outside the request/reply
/// cycle, e.g. a pub/sub message.
#[derive(Clone, Debug)]
pub struct PushMessage {
    /// What kind of push this is.
    pub kind: PushKind,
    /// The payload values after the kind marker.
    pub data: Vec<Value>,
}

/// Tunables for a single connection.
#[derive(Clone, Debug)]
pub struct ConnectionConfig {
    /// Backoff between reconnect attempts.
    pub reconnect: ReconnectPolicy,
    /// Ceiling for transport establishment plus handshake.
    pub connect_timeout: Duration,
    /// Probe the server with `PING` before declaring the connection ready.
    pub ready_check: bool,
    /// Buffer commands while the link is down instead of rejecting them.
    pub enable_offline_queue: bool,
    /// Cap on the offline queue; the oldest entries are failed when it
    /// overflows. `None` means unbounded.
    pub offline_queue_limit: Option<usize>,
    /// How often one command may be moved back to the offline queue before
    /// it is failed outright.
    pub max_retries_per_command: u32,
    /// Resend commands that were written but unacknowledged when the
    /// transport dropped. Off by default: such commands may already have
    /// executed, so resending trades at-most-once for at-least-once.
    pub resend_unacked: bool,
    /// Default deadline applied to commands that carry none.
    pub default_command_timeout: Option<Duration>,
    /// Disable Nagle's algorithm on TCP transports.
    pub tcp_nodelay: bool,
    /// TCP keep-alive probe interval, when set.
    pub tcp_keepalive: Option<Duration>,
    /// Receiver for out-of-band push messages.
    pub push_sender: Option<mpsc::UnboundedSender<PushMessage>>,
}

impl Default for ConnectionConfig {
    fn default() -> ConnectionConfig {
        ConnectionConfig {
            reconnect: ReconnectPolicy::default(),
            connect_timeout: Duration::from_secs(10),
            ready_check: true,
            enable_offline_queue: true,
            offline_queue_limit: None,
            max_retries_per_command: 20,
            resend_unacked: false,
            default_command_timeout: None,
            tcp_nodelay: true,
            tcp_keepalive: Some(Duration::from_secs(60)),
            push_sender: None,
        }
    }
}

pub(crate) struct PendingCommand {
    cmd: Cmd,
    tx: Option<oneshot::Sender<RedioxResult<Value>>>,
    retries: u32,
    deadline: Option<Instant>,
}

impl PendingCommand {
    fn settle(&mut self, result: RedioxResult<Value>) {
        match self.tx.take() {
            Some(tx) => {
                let _ = tx.send(result);
            }
            None => debug_assert!(false, "command settled twice"),
        }
    }
}

type BatchResult = RedioxResult<Vec<RedioxResult<Value>>>;

pub(crate) struct PendingBatch {
    cmds: Vec<Cmd>,
    tx: Option<oneshot::Sender<BatchResult>>,
    retries: u32,
    deadline: Option<Instant>,
    collected: Vec<RedioxResult<Value>>,
    no_retry: bool,
}

impl PendingBatch {
    fn settle(&mut self, result: BatchResult) {
        match self.tx.take() {
            Some(tx) => {
                let _ = tx.send(result);
            }
            None => debug_assert!(false, "batch settled twice"),
        }
    }
}

pub(crate) enum QueueUnit {
    Single(PendingCommand),
    Batch(PendingBatch),
}

impl QueueUnit {
    fn expected_replies(&self) -> usize {
        match self {
            QueueUnit::Single(_) => 1,
            QueueUnit::Batch(batch) => batch.cmds.len(),
        }
    }

    fn deadline(&self) -> Option<Instant> {
        match self {
            QueueUnit::Single(pc) => pc.deadline,
            QueueUnit::Batch(pb) => pb.deadline,
        }
    }

    fn settle_err(&mut self, err: Error) {
        match self {
            QueueUnit::Single(pc) => pc.settle(Err(err)),
            QueueUnit::Batch(pb) => pb.settle(Err(err)),
        }
    }
}

enum Op {
    Unit(QueueUnit),
    Terminate(ErrorKind),
    CloseGraceful,
}

/// A handle to one server connection.
///
/// Clones share the same driver task and interleave their commands at whole
/// command (or whole pipeline) boundaries. Dropping the last handle drains
/// in-flight commands and shuts the driver down.
#[derive(Clone)]
pub struct Connection {
    tx: mpsc::UnboundedSender<Op>,
    status_rx: watch::Receiver<ConnectionStatus>,
    addr: ConnectionAddr,
    default_timeout: Option<Duration>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Connection")
            .field("addr", &self.addr)
            .field("status", &self.status())
            .finish()
    }
}

impl Connection {
    /// Spawns the driver and starts connecting immediately.
    pub fn connect(info: ConnectionInfo, config: ConnectionConfig) -> Connection {
        let (tx, rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(ConnectionStatus::Wait);
        let addr = info.addr.clone();
        let default_timeout = config.default_command_timeout;
        let driver = Driver {
            info,
            config,
            rx,
            status: status_tx,
            offline: VecDeque::new(),
            in_flight: VecDeque::new(),
            retries: 0,
        };
        tokio::spawn(driver.run());
        Connection {
            tx,
            status_rx,
            addr,
            default_timeout,
        }
    }

    /// The address this connection points at.
    pub fn addr(&self) -> &ConnectionAddr {
        &self.addr
    }

    /// The current lifecycle status.
    pub fn status(&self) -> ConnectionStatus {
        *self.status_rx.borrow()
    }

    /// Waits until the connection is `Ready`, or fails when it reaches
    /// `End` first.
    pub async fn wait_ready(&self) -> RedioxResult<()> {
        let mut rx = self.status_rx.clone();
        loop {
            match *rx.borrow_and_update() {
                ConnectionStatus::Ready => return Ok(()),
                ConnectionStatus::End => return Err(closed_connection_error()),
                _ => {}
            }
            if rx.changed().await.is_err() {
                return Err(closed_connection_error());
            }
        }
    }

    /// Submits one command and awaits its reply.
    pub async fn send(&self, command: Cmd) -> RedioxResult<Value> {
        let timeout = command.deadline().or(self.default_timeout);
        let (tx, rx) = oneshot::channel();
        let unit = QueueUnit::Single(PendingCommand {
            deadline: timeout.map(|d| Instant::now() + d),
            cmd: command,
            tx: Some(tx),
            retries: 0,
        });
        self.tx
            .send(Op::Unit(unit))
            .map_err(|_| closed_connection_error())?;
        let reply = async move { rx.await.unwrap_or_else(|_| Err(closed_connection_error())) };
        match timeout {
            Some(duration) => match tokio::time::timeout(duration, reply).await {
                Ok(result) => result,
                Err(_) => Err(timeout_error()),
            },
            None => reply.await,
        }
    }

    /// Submits a batch that is written contiguously and whose replies are
    /// returned together, in submission order. The batch is retried or
    /// failed as a unit across reconnections, never split.
    pub async fn send_batch(
        &self,
        commands: Vec<Cmd>,
        timeout: Option<Duration>,
    ) -> BatchResult {
        if commands.is_empty() {
            return Ok(vec![]);
        }
        let timeout = timeout.or(self.default_timeout);
        let (tx, rx) = oneshot::channel();
        let unit = QueueUnit::Batch(PendingBatch {
            no_retry: commands.iter().any(|c| c.is_no_retry()),
            collected: Vec::with_capacity(commands.len()),
            deadline: timeout.map(|d| Instant::now() + d),
            cmds: commands,
            tx: Some(tx),
            retries: 0,
        });
        self.tx
            .send(Op::Unit(unit))
            .map_err(|_| closed_connection_error())?;
        let reply = async move { rx.await.unwrap_or_else(|_| Err(closed_connection_error())) };
        match timeout {
            Some(duration) => match tokio::time::timeout(duration, reply).await {
                Ok(result) => result,
                Err(_) => Err(timeout_error()),
            },
            None => reply.await,
        }
    }

    /// Fails every queued and in-flight command with the given error kind and
    /// moves the connection to `End`. Used by owners that know the target is
    /// no longer valid, e.g. after a sentinel-announced failover.
    pub fn terminate(&self, kind: ErrorKind) {
        let _ = self.tx.send(Op::Terminate(kind));
    }

    /// Requests a graceful shutdown: queued commands drain, then the driver
    /// exits.
    pub fn close(&self) {
        let _ = self.tx.send(Op::CloseGraceful);
    }
}

pub(crate) trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

type WireFramed = Framed<Box<dyn AsyncStream>, ValueCodec>;

struct InFlight {
    unit: QueueUnit,
    remaining: usize,
}

enum ServeExit {
    /// All handles are gone or a graceful close finished draining.
    Shutdown,
    /// An owner invalidated the connection.
    Terminated(ErrorKind),
    /// The transport failed.
    Disconnected(Error),
}

enum SleepExit {
    Elapsed,
    HandlesDropped,
    Terminated(ErrorKind),
}

struct Driver {
    info: ConnectionInfo,
    config: ConnectionConfig,
    rx: mpsc::UnboundedReceiver<Op>,
    status: watch::Sender<ConnectionStatus>,
    /// Commands waiting for a ready connection, in submission order.
    offline: VecDeque<QueueUnit>,
    /// Commands written to the socket, awaiting replies, in write order.
    in_flight: VecDeque<InFlight>,
    retries: u32,
}

impl Driver {
    async fn run(mut self) {
        loop {
            let established =
                tokio::time::timeout(self.config.connect_timeout, self.establish()).await;
            match established {
                Ok(Ok(mut framed)) => {
                    self.retries = 0;
                    debug!(addr = %self.info.addr, "connection ready");
                    self.set_status(ConnectionStatus::Ready);
                    match self.serve(&mut framed).await {
                        ServeExit::Shutdown => {
                            self.finish(closed_connection_error);
                            return;
                        }
                        ServeExit::Terminated(kind) => {
                            self.finish(move || {
                                Error::from((kind, "Connection invalidated by its owner"))
                            });
                            return;
                        }
                        ServeExit::Disconnected(err) => {
                            warn!(addr = %self.info.addr, error = %err, "connection lost");
                            self.on_disconnect();
                        }
                    }
                }
                Ok(Err(err)) => {
                    debug!(addr = %self.info.addr, error = %err, "connect failed");
                }
                Err(_) => {
                    debug!(addr = %self.info.addr, "connect timed out");
                }
            }

            self.set_status(ConnectionStatus::Reconnecting);
            self.retries += 1;
            match self.config.reconnect.delay_for(self.retries) {
                Some(delay) if delay > Duration::ZERO => {
                    trace!(attempt = self.retries, ?delay, "scheduling reconnect");
                    match self.sleep_accepting(delay).await {
                        SleepExit::Elapsed => {}
                        SleepExit::HandlesDropped => {
                            self.finish(closed_connection_error);
                            return;
                        }
                        SleepExit::Terminated(kind) => {
                            self.finish(move || {
                                Error::from((kind, "Connection invalidated by its owner"))
                            });
                            return;
                        }
                    }
                }
                _ => {
                    debug!(addr = %self.info.addr, "reconnect policy gave up");
                    self.finish(|| {
                        Error::from((
                            ErrorKind::ConnectionClosed,
                            "Reconnect attempts exhausted",
                        ))
                    });
                    return;
                }
            }
        }
    }

    fn set_status(&self, status: ConnectionStatus) {
        self.status.send_replace(status);
    }

    /// Rejects everything still queued and enters the terminal state.
    fn finish(&mut self, make_error: impl Fn() -> Error) {
        for mut inflight in self.in_flight.drain(..) {
            inflight.unit.settle_err(make_error());
        }
        for mut unit in self.offline.drain(..) {
            unit.settle_err(make_error());
        }
        while let Ok(op) = self.rx.try_recv() {
            if let Op::Unit(mut unit) = op {
                unit.settle_err(make_error());
            }
        }
        self.set_status(ConnectionStatus::End);
    }

    /// Applies the retry policy to every in-flight command after a transport
    /// loss. Unsent commands stay in the offline queue untouched and keep
    /// their relative order.
    fn on_disconnect(&mut self) {
        while let Some(inflight) = self.in_flight.pop_back() {
            let mut unit = inflight.unit;
            let (no_retry, retries) = match &mut unit {
                QueueUnit::Single(pc) => (pc.cmd.is_no_retry(), pc.retries),
                QueueUnit::Batch(pb) => {
                    // a partially-answered batch starts over from scratch
                    pb.collected.clear();
                    (pb.no_retry, pb.retries)
                }
            };
            if no_retry || !self.config.resend_unacked {
                unit.settle_err(closed_connection_error());
            } else if retries >= self.config.max_retries_per_command {
                unit.settle_err(Error::from((
                    ErrorKind::ConnectionClosed,
                    "Retries for this command exhausted",
                )));
            } else {
                match &mut unit {
                    QueueUnit::Single(pc) => pc.retries += 1,
                    QueueUnit::Batch(pb) => pb.retries += 1,
                }
                self.offline.push_front(unit);
            }
        }
    }

    fn enqueue_offline(&mut self, mut unit: QueueUnit) {
        if !self.config.enable_offline_queue {
            unit.settle_err(Error::from((
                ErrorKind::ConnectionClosed,
                "Connection is not ready and the offline queue is disabled",
            )));
            return;
        }
        if let Some(limit) = self.config.offline_queue_limit {
            while self.offline.len() >= limit.max(1) {
                if let Some(mut oldest) = self.offline.pop_front() {
                    oldest.settle_err(Error::from((
                        ErrorKind::QueueFull,
                        "Offline queue limit reached",
                    )));
                }
            }
        }
        self.offline.push_back(unit);
    }

    /// Buffers submissions while waiting out the reconnect delay.
    async fn sleep_accepting(&mut self, delay: Duration) -> SleepExit {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            let op = tokio::select! {
                _ = &mut sleep => return SleepExit::Elapsed,
                op = self.rx.recv() => op,
            };
            match op {
                None => return SleepExit::HandlesDropped,
                Some(Op::Unit(unit)) => self.enqueue_offline(unit),
                Some(Op::Terminate(kind)) => return SleepExit::Terminated(kind),
                Some(Op::CloseGraceful) => return SleepExit::HandlesDropped,
            }
        }
    }

    async fn establish(&mut self) -> RedioxResult<WireFramed> {
        self.set_status(ConnectionStatus::Connecting);
        let stream: Box<dyn AsyncStream> = match self.info.addr.clone() {
            ConnectionAddr::Tcp(host, port) => Box::new(self.tcp_connect(&host, port).await?),
            ConnectionAddr::TcpTls {
                host,
                port,
                insecure,
            } => {
                #[cfg(feature = "tls-rustls")]
                {
                    let tcp = self.tcp_connect(&host, port).await?;
                    Box::new(crate::tls::wrap_tls(&host, tcp, insecure).await?)
                }
                #[cfg(not(feature = "tls-rustls"))]
                {
                    let _ = (host, port, insecure);
                    fail!((
                        ErrorKind::InvalidClientConfig,
                        "TLS target configured but the tls-rustls feature is disabled"
                    ))
                }
            }
            ConnectionAddr::Unix(path) => {
                #[cfg(unix)]
                {
                    Box::new(UnixStream::connect(&path).await?)
                }
                #[cfg(not(unix))]
                {
                    let _ = path;
                    fail!((
                        ErrorKind::InvalidClientConfig,
                        "Unix socket targets are not supported on this platform"
                    ))
                }
            }
        };
        self.set_status(ConnectionStatus::Connect);
        let mut framed = Framed::new(stream, ValueCodec::default());
        self.handshake(&mut framed).await?;
        Ok(framed)
    }

    async fn tcp_connect(&self, host: &str, port: u16) -> RedioxResult<TcpStream> {
        let addrs: Vec<SocketAddr> = lookup_host((host, port))
            .await?
            .filter(|addr| match self.info.family {
                IpFamily::Any => true,
                IpFamily::V4 => addr.is_ipv4(),
                IpFamily::V6 => addr.is_ipv6(),
            })
            .collect();
        if addrs.is_empty() {
            fail!((
                ErrorKind::InvalidClientConfig,
                "Hostname resolved to no address of the preferred family",
                host.to_string()
            ));
        }
        let mut last_err = None;
        for addr in addrs {
            match TcpStream::connect(addr).await {
                Ok(stream) => {
                    if self.config.tcp_nodelay {
                        stream.set_nodelay(true)?;
                    }
                    if let Some(interval) = self.config.tcp_keepalive {
                        let sock = socket2::SockRef::from(&stream);
                        sock.set_tcp_keepalive(
                            &socket2::TcpKeepalive::new().with_time(interval),
                        )?;
                    }
                    return Ok(stream);
                }
                Err(err) => last_err = Some(err),
            }
        }
        Err(last_err
            .map(Error::from)
            .unwrap_or_else(closed_connection_error))
    }

    /// Runs the handshake: protocol negotiation / authentication, database
    /// selection, readiness probe. Any rejected step fails the attempt.
    async fn handshake(&mut self, framed: &mut WireFramed) -> RedioxResult<()> {
        match self.info.protocol {
            ProtocolVersion::Resp3 => {
                let mut hello = cmd("HELLO").arg(3);
                if let Some(password) = &self.info.password {
                    let username = self.info.username.as_deref().unwrap_or("default");
                    hello = hello.arg("AUTH").arg(username).arg(password.as_str());
                }
                handshake_roundtrip(framed, hello).await?;
            }
            ProtocolVersion::Resp2 => {
                if let Some(password) = &self.info.password {
                    let auth = match &self.info.username {
                        Some(username) => {
                            cmd("AUTH").arg(username.as_str()).arg(password.as_str())
                        }
                        None => cmd("AUTH").arg(password.as_str()),
                    };
                    handshake_roundtrip(framed, auth).await?;
                }
            }
        }
        if self.info.db != 0 {
            handshake_roundtrip(framed, cmd("SELECT").arg(self.info.db)).await?;
        }
        if self.config.ready_check {
            handshake_roundtrip(framed, cmd("PING")).await?;
        }
        Ok(())
    }

    async fn serve(&mut self, framed: &mut WireFramed) -> ServeExit {
        // flush what accumulated while we were away, in submission order
        while let Some(unit) = self.offline.pop_front() {
            match self.write_unit(framed, unit).await {
                Ok(()) => {}
                Err(exit) => return exit,
            }
        }

        let mut rx_open = true;
        let mut closing = false;
        loop {
            enum Event {
                Op(Option<Op>),
                Frame(Option<RedioxResult<Value>>),
            }
            let event = tokio::select! {
                biased;
                op = self.rx.recv(), if rx_open => Event::Op(op),
                item = framed.next() => Event::Frame(item),
            };
            match event {
                Event::Op(None) => {
                    rx_open = false;
                    closing = true;
                    if self.in_flight.is_empty() {
                        return ServeExit::Shutdown;
                    }
                }
                Event::Op(Some(Op::Unit(mut unit))) => {
                    if closing {
                        unit.settle_err(closed_connection_error());
                        continue;
                    }
                    match self.write_unit(framed, unit).await {
                        Ok(()) => {}
                        Err(exit) => return exit,
                    }
                }
                Event::Op(Some(Op::Terminate(kind))) => {
                    return ServeExit::Terminated(kind);
                }
                Event::Op(Some(Op::CloseGraceful)) => {
                    self.set_status(ConnectionStatus::Close);
                    closing = true;
                    if self.in_flight.is_empty() {
                        return ServeExit::Shutdown;
                    }
                }
                Event::Frame(Some(Ok(value))) => {
                    self.dispatch_reply(value);
                    if closing && self.in_flight.is_empty() {
                        return ServeExit::Shutdown;
                    }
                }
                Event::Frame(Some(Err(err))) => {
                    // a malformed frame poisons the whole reply stream
                    return ServeExit::Disconnected(err);
                }
                Event::Frame(None) => {
                    return ServeExit::Disconnected(closed_connection_error());
                }
            }
        }
    }

    /// Writes a unit to the socket and moves it to the command queue. A unit
    /// whose deadline already passed is rejected without touching the wire.
    async fn write_unit(
        &mut self,
        framed: &mut WireFramed,
        mut unit: QueueUnit,
    ) -> Result<(), ServeExit> {
        if let Some(deadline) = unit.deadline() {
            if Instant::now() >= deadline {
                unit.settle_err(timeout_error());
                return Ok(());
            }
        }
        let write_result = match &unit {
            QueueUnit::Single(pc) => framed.send(pc.cmd.pack()).await,
            QueueUnit::Batch(pb) => {
                // feed the whole batch, flush once: one contiguous write
                let mut result = Ok(());
                for command in &pb.cmds {
                    result = framed.feed(command.pack()).await;
                    if result.is_err() {
                        break;
                    }
                }
                if result.is_ok() {
                    result = framed.flush().await;
                }
                result
            }
        };
        match write_result {
            Ok(()) => {
                self.in_flight.push_back(InFlight {
                    remaining: unit.expected_replies(),
                    unit,
                });
                Ok(())
            }
            Err(err) => {
                // the write may have partially reached the wire; the unit is
                // subject to the same resend policy as in-flight commands
                self.in_flight.push_back(InFlight {
                    remaining: unit.expected_replies(),
                    unit,
                });
                Err(ServeExit::Disconnected(err))
            }
        }
    }

    fn dispatch_reply(&mut self, value: Value) {
        let value = match value {
            Value::Push { kind, data } => match kind {
                PushKind::Message | PushKind::PMessage | PushKind::SMessage => {
                    self.forward_push(PushMessage { kind, data });
                    return;
                }
                // subscription bookkeeping pushes answer the pending command
                // when one is waiting, otherwise they go out of band too
                _ if self.in_flight.is_empty() => {
                    self.forward_push(PushMessage { kind, data });
                    return;
                }
                _ => Value::Push { kind, data },
            },
            // out-of-band messages on the legacy protocol arrive as plain
            // arrays while nothing is awaiting a reply
            Value::Array(mut items) if self.in_flight.is_empty() && is_legacy_push(&items) => {
                let kind = match items.remove(0) {
                    Value::BulkString(kind) => {
                        PushKind::from_kind_str(&String::from_utf8_lossy(&kind))
                    }
                    _ => unreachable!("checked by is_legacy_push"),
                };
                self.forward_push(PushMessage { kind, data: items });
                return;
            }
            other => other,
        };
        if self.in_flight.is_empty() {
            warn!(addr = %self.info.addr, "dropping unsolicited reply");
            return;
        }
        self.complete_head(value.extract_error());
    }

    fn complete_head(&mut self, result: RedioxResult<Value>) {
        let finished = {
            let head = self.in_flight.front_mut().expect("checked non-empty");
            head.remaining -= 1;
            match &mut head.unit {
                QueueUnit::Single(pc) => {
                    pc.settle(result);
                }
                QueueUnit::Batch(pb) => {
                    pb.collected.push(result);
                }
            }
            head.remaining == 0
        };
        if finished {
            let mut head = self.in_flight.pop_front().expect("checked non-empty");
            if let QueueUnit::Batch(ref mut pb) = head.unit {
                let collected = std::mem::take(&mut pb.collected);
                pb.settle(Ok(collected));
            }
        }
    }

    fn forward_push(&self, message: PushMessage) {
        if let Some(sender) = &self.config.push_sender {
            let _ = sender.send(message);
        } else {
            trace!("push message dropped: no push sender configured");
        }
    }
}

fn is_legacy_push(items: &[Value]) -> bool {
    matches!(
        items.first(),
        Some(Value::BulkString(kind))
            if matches!(kind.as_slice(), b"message" | b"pmessage" | b"smessage")
    )
}

async fn handshake_roundtrip(framed: &mut WireFramed, command: Cmd) -> RedioxResult<Value> {
    framed.send(command.pack()).await?;
    loop {
        match framed.next().await {
            Some(Ok(Value::Push { .. })) => continue,
            Some(Ok(value)) => return value.extract_error(),
            Some(Err(err)) => return Err(err),
            None => return Err(closed_connection_error()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_has_wire_friendly_names() {
        assert_eq!(ConnectionStatus::Ready.to_string(), "ready");
        assert_eq!(ConnectionStatus::Reconnecting.to_string(), "reconnecting");
        assert_eq!(ConnectionStatus::End.to_string(), "end");
    }

    #[test]
    fn expected_replies_counts_batch_members() {
        let unit = QueueUnit::Batch(PendingBatch {
            cmds: vec![cmd("PING"), cmd("PING"), cmd("PING")],
            tx: None,
            retries: 0,
            deadline: None,
            collected: vec![],
            no_retry: false,
        });
        assert_eq!(unit.expected_replies(), 3);
    }
}
