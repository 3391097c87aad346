//! rediox is a Rust client library for the RESP wire protocol as spoken by
//! Redis- and Valkey-compatible key-value stores. It supports three
//! deployment topologies behind one command-execution contract: a single
//! server, a sentinel-supervised master/replica set with automatic failover
//! discovery, and a sharded cluster with slot-based routing and live
//! redirection.
//!
//! # Basic Operation
//!
//! The [`Client`] is the object callers interact with. Open one against a
//! URL, a `host:port` string, a unix socket path, or a structured
//! [`ConnectionInfo`]:
//!
//! ```rust,no_run
//! use rediox::{cmd, Client};
//!
//! # async fn run() -> rediox::RedioxResult<()> {
//! let client = Client::open("redis://127.0.0.1/").await?;
//! client.call(cmd("SET").arg("my_key").arg(42)).await?;
//! let value: i64 = client.query(cmd("GET").arg("my_key")).await?;
//! # Ok(()) }
//! ```
//!
//! ## Connection Handling
//!
//! Each [`Connection`] owns its transport exclusively and recovers from
//! transport loss on its own: commands issued while the link is down are
//! buffered in an offline queue and flushed after the reconnect handshake,
//! subject to bounded-backpressure limits. The reconnect schedule is a plain
//! function from the attempt counter to a delay — see
//! [`ReconnectPolicy`](crate::ReconnectPolicy).
//!
//! Commands written but unacknowledged when the link drops are *not* resent
//! by default, since the server may have executed them; set
//! [`ConnectionConfig::resend_unacked`] to opt into at-least-once resending.
//!
//! # Pipelining
//!
//! ```rust,no_run
//! use rediox::{cmd, pipe, Client};
//!
//! # async fn run() -> rediox::RedioxResult<()> {
//! # let client = Client::open("redis://127.0.0.1/").await?;
//! let results = client
//!     .exec_pipeline(
//!         &pipe()
//!             .add(cmd("SET").arg("key_1").arg(42))
//!             .add(cmd("GET").arg("key_1")),
//!     )
//!     .await?;
//! # Ok(()) }
//! ```
//!
//! Transactions are pipelines in `atomic` mode; see
//! [`Pipeline::atomic`] and [`ExecOutcome`].
//!
//! # Cluster
//!
//! The `cluster` feature adds [`cluster::ClusterConnection`]: slot-based
//! routing with `MOVED`/`ASK` redirection handling, wholesale topology
//! refresh, a NAT address-translation map, and optional replica reads. See
//! the [`cluster`] module docs.
//!
//! # Sentinel
//!
//! The `sentinel` feature adds [`sentinel::SentinelClient`], which resolves
//! the current master through a sentinel quorum, subscribes to failover
//! announcements, and fails in-flight commands with `MasterChanged` when the
//! master moves. See the [`sentinel`] module docs.
//!
//! # Optional Features
//!
//! * `cluster`: enables sharded cluster support (enabled by default)
//! * `sentinel`: enables sentinel support (enabled by default)
//! * `tls-rustls`: enables `rediss://` targets via rustls (enabled by default)
//! * `tls-rustls-insecure`: allows disabling certificate verification
//! * `tls-rustls-webpki-roots`: adds the webpki root store

#![deny(non_camel_case_types)]
#![warn(missing_docs)]
#![cfg_attr(docsrs, warn(rustdoc::broken_intra_doc_links))]

#[macro_use]
mod macros;

pub use crate::client::{Client, ClientOptions};
pub use crate::cmd::{cmd, Cmd};
pub use crate::conn::{
    Connection, ConnectionConfig, ConnectionStatus, PushMessage,
};
pub use crate::connection::{
    parse_addr, ConnectionAddr, ConnectionInfo, IntoConnectionInfo, IpFamily,
};
pub use crate::errors::{make_server_error, Error, ErrorKind, RedioxResult};
pub use crate::parser::{encode_value, parse_reply, ValueCodec};
pub use crate::pipeline::{pipe, ExecOutcome, Pipeline};
pub use crate::reconnect::ReconnectPolicy;

// preserve grouping and order
#[rustfmt::skip]
pub use crate::types::{
    // utility functions
    from_value,

    // conversion traits
    FromValue,
    ToArgs,

    // low level values
    Value,
    ServerError,
    ProtocolVersion,
    PushKind,
    VerbatimFormat,
};

#[cfg(feature = "cluster")]
#[cfg_attr(docsrs, doc(cfg(feature = "cluster")))]
pub mod cluster;

#[cfg(feature = "sentinel")]
#[cfg_attr(docsrs, doc(cfg(feature = "sentinel")))]
pub mod sentinel;

#[cfg(feature = "tls-rustls")]
mod tls;

mod client;
mod cmd;
mod conn;
mod connection;
mod errors;
mod parser;
mod pipeline;
mod reconnect;
mod types;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_send() {
        const fn assert_send<T: Send>() {}

        assert_send::<Connection>();
        assert_send::<Client>();
        #[cfg(feature = "cluster")]
        assert_send::<cluster::ClusterConnection>();
    }
}
