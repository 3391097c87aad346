//! Testing helpers for the `rediox` crate.
//!
//! The centerpiece is [`MockServer`]: an in-process scripted RESP server.
//! Tests hand it a handler that maps each received command to a
//! [`ServerAction`]; the server takes care of accepting connections,
//! decoding command frames, and answering the handshake commands the client
//! sends on its own (`PING`, `AUTH`, `SELECT`, `HELLO`, `SUBSCRIBE`).
//!
//! ```rust,no_run
//! use rediox_test::{MockServer, ServerAction};
//! use rediox::Value;
//!
//! # async fn run() {
//! let server = MockServer::start(|_conn, args| match args[0].as_slice() {
//!     b"GET" => ServerAction::Reply(Value::BulkString(b"hello".to_vec())),
//!     _ => ServerAction::Reply(Value::Okay),
//! })
//! .await;
//! let url = server.url();
//! # }
//! ```

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use rediox::{encode_value, Value, ValueCodec};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tracing::trace;

/// What the scripted server does with one received command.
#[derive(Clone, Debug)]
pub enum ServerAction {
    /// Send the given reply.
    Reply(Value),
    /// Send pre-encoded bytes verbatim.
    RawReply(Vec<u8>),
    /// Send the reply, then drop the connection.
    ReplyThenHangup(Value),
    /// Drop the connection without replying.
    Hangup,
    /// Swallow the command; the client keeps waiting.
    Ignore,
}

type Handler = Arc<dyn Fn(usize, &[Vec<u8>]) -> ServerAction + Send + Sync>;

/// An in-process RESP server driven by a per-command handler.
///
/// The handler receives the zero-based index of the connection the command
/// arrived on, which makes scripting "fail the first connection, serve the
/// second" reconnection scenarios straightforward.
pub struct MockServer {
    addr: SocketAddr,
    accept_task: JoinHandle<()>,
    received: Arc<Mutex<Vec<Vec<Vec<u8>>>>>,
    connections: Arc<AtomicUsize>,
}

impl MockServer {
    /// Binds to an ephemeral localhost port and starts serving.
    pub async fn start<F>(handler: F) -> MockServer
    where
        F: Fn(usize, &[Vec<u8>]) -> ServerAction + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock server");
        let addr = listener.local_addr().expect("mock server address");
        let handler: Handler = Arc::new(handler);
        let received = Arc::new(Mutex::new(Vec::new()));
        let connections = Arc::new(AtomicUsize::new(0));

        let accept_received = received.clone();
        let accept_connections = connections.clone();
        let accept_task = tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let conn_index = accept_connections.fetch_add(1, Ordering::SeqCst);
                let handler = handler.clone();
                let received = accept_received.clone();
                tokio::spawn(async move {
                    serve_connection(stream, conn_index, handler, received).await;
                });
            }
        });

        MockServer {
            addr,
            accept_task,
            received,
            connections,
        }
    }

    /// The address the server listens on.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// A `redis://` URL pointing at the server.
    pub fn url(&self) -> String {
        format!("redis://{}", self.addr)
    }

    /// The `host:port` form of the address.
    pub fn host_port(&self) -> String {
        self.addr.to_string()
    }

    /// Every command received so far, excluding the auto-answered handshake
    /// commands, as raw argument lists.
    pub fn received(&self) -> Vec<Vec<Vec<u8>>> {
        self.received.lock().unwrap().clone()
    }

    /// The uppercased names of the received commands, in arrival order.
    pub fn received_names(&self) -> Vec<String> {
        self.received()
            .iter()
            .map(|args| String::from_utf8_lossy(&args[0]).to_ascii_uppercase())
            .collect()
    }

    /// How many connections have been accepted.
    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

fn encoded(value: &Value) -> Bytes {
    let mut out = Vec::new();
    encode_value(value, &mut out);
    Bytes::from(out)
}

/// Answers the commands every client sends as part of its handshake so test
/// handlers only script the traffic they care about.
fn handshake_reply(args: &[Vec<u8>]) -> Option<Value> {
    match args[0].to_ascii_uppercase().as_slice() {
        b"PING" => Some(Value::SimpleString("PONG".into())),
        b"AUTH" | b"SELECT" | b"READONLY" | b"RESET" => Some(Value::Okay),
        b"HELLO" => Some(Value::Map(vec![(
            Value::BulkString(b"proto".to_vec()),
            Value::Int(2),
        )])),
        b"SUBSCRIBE" => Some(Value::Array(vec![
            Value::BulkString(b"subscribe".to_vec()),
            Value::BulkString(args.get(1).cloned().unwrap_or_default()),
            Value::Int(1),
        ])),
        _ => None,
    }
}

async fn serve_connection(
    stream: TcpStream,
    conn_index: usize,
    handler: Handler,
    received: Arc<Mutex<Vec<Vec<Vec<u8>>>>>,
) {
    let mut framed = Framed::new(stream, ValueCodec::default());
    while let Some(item) = framed.next().await {
        let value = match item {
            Ok(value) => value,
            Err(_) => break,
        };
        let Some(args) = command_args(&value) else {
            break;
        };
        if let Some(reply) = handshake_reply(&args) {
            if framed.send(encoded(&reply)).await.is_err() {
                break;
            }
            continue;
        }
        trace!(conn = conn_index, cmd = %String::from_utf8_lossy(&args[0]), "mock received");
        received.lock().unwrap().push(args.clone());
        match handler(conn_index, &args) {
            ServerAction::Reply(value) => {
                if framed.send(encoded(&value)).await.is_err() {
                    break;
                }
            }
            ServerAction::RawReply(bytes) => {
                if framed.send(Bytes::from(bytes)).await.is_err() {
                    break;
                }
            }
            ServerAction::ReplyThenHangup(value) => {
                let _ = framed.send(encoded(&value)).await;
                break;
            }
            ServerAction::Hangup => break,
            ServerAction::Ignore => {}
        }
    }
}

/// A client command frame is an array of bulk strings.
fn command_args(value: &Value) -> Option<Vec<Vec<u8>>> {
    let items = match value {
        Value::Array(items) => items,
        _ => return None,
    };
    let mut args = Vec::with_capacity(items.len());
    for item in items {
        match item {
            Value::BulkString(bytes) => args.push(bytes.clone()),
            _ => return None,
        }
    }
    if args.is_empty() {
        None
    } else {
        Some(args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rediox::{cmd, Connection, ConnectionConfig};

    #[tokio::test]
    async fn serves_scripted_replies() {
        let server = MockServer::start(|_conn, args| match args[0].as_slice() {
            b"ECHO" => ServerAction::Reply(Value::BulkString(args[1].clone())),
            _ => ServerAction::Reply(Value::Okay),
        })
        .await;

        let info = rediox::parse_addr(&server.url()).unwrap();
        let conn = Connection::connect(info, ConnectionConfig::default());
        conn.wait_ready().await.unwrap();
        let reply = conn.send(cmd("ECHO").arg("hi")).await.unwrap();
        assert_eq!(reply, Value::BulkString(b"hi".to_vec()));
        assert_eq!(server.received_names(), vec!["ECHO".to_string()]);
    }
}
