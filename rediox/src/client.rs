//! The caller-facing dispatcher.
//!
//! A [`Client`] picks one routing strategy at construction time — a direct
//! connection, a sentinel-resolved master, or a sharded cluster — and then
//! exposes one command-execution contract regardless of topology. The outer
//! retry policy for resolution-level failures lives here; transport-level
//! recovery belongs to the connection itself.

use std::time::Duration;

use tracing::trace;

use crate::cmd::Cmd;
#[cfg(feature = "cluster")]
use crate::cluster::{ClusterConnection, ClusterOptions};
use crate::conn::{Connection, ConnectionConfig, ConnectionStatus};
use crate::connection::IntoConnectionInfo;
use crate::errors::{ErrorKind, RedioxResult};
use crate::pipeline::{ExecOutcome, Pipeline};
#[cfg(feature = "sentinel")]
use crate::sentinel::{SentinelClient, SentinelOptions};
use crate::types::{from_value, FromValue, Value};

/// Dispatcher-level tuning, shared by every topology.
#[derive(Clone, Debug)]
pub struct ClientOptions {
    /// Convert binary strings in replies to UTF-8 strings. Off by default;
    /// replies then carry raw bytes.
    pub coerce_strings: bool,
    /// How often the dispatcher re-enters a command after a
    /// resolution-level failure (master changed, sentinels briefly
    /// unreachable, migrating slot).
    pub max_command_retries: u32,
    /// Pause between such re-entries.
    pub retry_delay: Duration,
}

impl Default for ClientOptions {
    fn default() -> ClientOptions {
        ClientOptions {
            coerce_strings: false,
            max_command_retries: 1,
            retry_delay: Duration::from_millis(50),
        }
    }
}

/// The closed set of routing strategies, chosen once from configuration.
#[derive(Clone)]
enum RoutingStrategy {
    Direct(Connection),
    #[cfg(feature = "sentinel")]
    Sentinel(SentinelClient),
    #[cfg(feature = "cluster")]
    Cluster(ClusterConnection),
}

/// The object callers interact with.
///
/// Cloning is cheap; clones share the underlying connections.
#[derive(Clone)]
pub struct Client {
    strategy: RoutingStrategy,
    options: ClientOptions,
}

impl Client {
    /// Connects directly to a single server.
    pub async fn open<T: IntoConnectionInfo>(target: T) -> RedioxResult<Client> {
        Client::open_with(target, ConnectionConfig::default(), ClientOptions::default()).await
    }

    /// Connects directly to a single server with explicit tuning.
    pub async fn open_with<T: IntoConnectionInfo>(
        target: T,
        connection: ConnectionConfig,
        options: ClientOptions,
    ) -> RedioxResult<Client> {
        let info = target.into_connection_info()?;
        let conn = Connection::connect(info, connection);
        conn.wait_ready().await?;
        Ok(Client {
            strategy: RoutingStrategy::Direct(conn),
            options,
        })
    }

    /// Connects through a sentinel quorum that tracks the master of a named
    /// service.
    #[cfg(feature = "sentinel")]
    pub async fn open_sentinel(
        sentinel: SentinelOptions,
        options: ClientOptions,
    ) -> RedioxResult<Client> {
        let client = SentinelClient::connect(sentinel).await?;
        Ok(Client {
            strategy: RoutingStrategy::Sentinel(client),
            options,
        })
    }

    /// Connects to a sharded cluster.
    #[cfg(feature = "cluster")]
    pub async fn open_cluster(
        cluster: ClusterOptions,
        options: ClientOptions,
    ) -> RedioxResult<Client> {
        let conn = ClusterConnection::connect(cluster).await?;
        Ok(Client {
            strategy: RoutingStrategy::Cluster(conn),
            options,
        })
    }

    /// Executes one command and returns its reply.
    pub async fn call(&self, command: Cmd) -> RedioxResult<Value> {
        let mut attempt = 0u32;
        loop {
            let result = match &self.strategy {
                RoutingStrategy::Direct(conn) => conn.send(command.clone()).await,
                #[cfg(feature = "sentinel")]
                RoutingStrategy::Sentinel(client) => client.call(command.clone()).await,
                #[cfg(feature = "cluster")]
                RoutingStrategy::Cluster(cluster) => cluster.call(command.clone()).await,
            };
            match result {
                Ok(value) => return Ok(self.convert(value)),
                Err(err)
                    if attempt < self.options.max_command_retries
                        && self.retryable_here(&err) =>
                {
                    attempt += 1;
                    trace!(attempt, error = %err, "dispatcher retrying command");
                    tokio::time::sleep(self.options.retry_delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Executes one command and converts the reply.
    pub async fn query<T: FromValue>(&self, command: Cmd) -> RedioxResult<T> {
        from_value(self.call(command).await?)
    }

    /// Starts an empty pipeline. Execute it with
    /// [`exec_pipeline`](Client::exec_pipeline) or
    /// [`exec_transaction`](Client::exec_transaction).
    pub fn pipeline(&self) -> Pipeline {
        Pipeline::new()
    }

    /// Executes a non-transactional pipeline, returning per-command results
    /// in submission order.
    pub async fn exec_pipeline(
        &self,
        pipeline: &Pipeline,
    ) -> RedioxResult<Vec<RedioxResult<Value>>> {
        let results = match &self.strategy {
            RoutingStrategy::Direct(conn) => pipeline.query(conn).await?,
            #[cfg(feature = "sentinel")]
            RoutingStrategy::Sentinel(client) => pipeline.query(&client.connection().await?).await?,
            #[cfg(feature = "cluster")]
            RoutingStrategy::Cluster(cluster) => cluster.execute_pipeline(pipeline).await?,
        };
        Ok(results
            .into_iter()
            .map(|result| result.map(|value| self.convert(value)))
            .collect())
    }

    /// Executes a pipeline as a MULTI/EXEC transaction.
    pub async fn exec_transaction(&self, pipeline: &Pipeline) -> RedioxResult<ExecOutcome> {
        let outcome = match &self.strategy {
            RoutingStrategy::Direct(conn) => pipeline.query_atomic(conn).await?,
            #[cfg(feature = "sentinel")]
            RoutingStrategy::Sentinel(client) => {
                pipeline.query_atomic(&client.connection().await?).await?
            }
            #[cfg(feature = "cluster")]
            RoutingStrategy::Cluster(cluster) => cluster.execute_transaction(pipeline).await?,
        };
        Ok(match outcome {
            ExecOutcome::Completed(results) => ExecOutcome::Completed(
                results
                    .into_iter()
                    .map(|result| result.map(|value| self.convert(value)))
                    .collect(),
            ),
            ExecOutcome::Aborted => ExecOutcome::Aborted,
        })
    }

    /// The status of the underlying connection, for topologies with a single
    /// active target.
    pub fn connection_status(&self) -> Option<ConnectionStatus> {
        match &self.strategy {
            RoutingStrategy::Direct(conn) => Some(conn.status()),
            #[cfg(feature = "sentinel")]
            RoutingStrategy::Sentinel(_) => None,
            #[cfg(feature = "cluster")]
            RoutingStrategy::Cluster(_) => None,
        }
    }

    /// Gracefully shuts the client down; queued commands drain first.
    pub fn close(&self) {
        match &self.strategy {
            RoutingStrategy::Direct(conn) => conn.close(),
            #[cfg(feature = "sentinel")]
            RoutingStrategy::Sentinel(client) => client.close(),
            #[cfg(feature = "cluster")]
            RoutingStrategy::Cluster(cluster) => cluster.close(),
        }
    }

    fn convert(&self, value: Value) -> Value {
        if self.options.coerce_strings {
            value.coerce_strings()
        } else {
            value
        }
    }

    /// Errors worth re-entering at the dispatcher level: the target moved or
    /// was briefly unresolvable, and the routing layer has fresh state now.
    fn retryable_here(&self, err: &crate::errors::Error) -> bool {
        match err.kind() {
            ErrorKind::MasterChanged
            | ErrorKind::NoSentinelsAvailable
            | ErrorKind::TryAgain => true,
            #[cfg(feature = "sentinel")]
            ErrorKind::ConnectionClosed | ErrorKind::Io
                if matches!(self.strategy, RoutingStrategy::Sentinel(_)) =>
            {
                // a fresh resolution round may point at the new master
                true
            }
            _ => false,
        }
    }
}
