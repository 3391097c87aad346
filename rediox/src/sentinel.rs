//! Sentinel support: discovering the current master of a supervised
//! master/replica set and following failovers.
//!
//! The resolver walks the configured sentinel endpoints, most recently
//! successful first, and asks each for the address of the named service's
//! master. The [`SentinelClient`] keeps its data connection pointed at the
//! resolved master; when a failover announcement or a re-resolution yields a
//! different address, the old connection is torn down and its in-flight
//! commands fail with `MasterChanged` rather than silently migrating.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;

use rand::seq::SliceRandom;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, trace, warn};

use crate::cmd::{cmd, Cmd};
use crate::conn::{Connection, ConnectionConfig, ConnectionStatus, PushMessage};
use crate::connection::{ConnectionAddr, ConnectionInfo, IntoConnectionInfo};
use crate::errors::{Error, ErrorKind, RedioxResult};
use crate::reconnect::ReconnectPolicy;
use crate::types::{ProtocolVersion, Value};

/// How long a single sentinel probe may take before the next endpoint is
/// tried.
const SENTINEL_TIMEOUT: Duration = Duration::from_secs(2);

/// Pause before the failover watcher tries the next sentinel endpoint.
const WATCHER_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Configuration for sentinel-backed resolution.
#[derive(Clone, Debug)]
pub struct SentinelOptions {
    /// The sentinel endpoints, tried in order.
    pub sentinels: Vec<ConnectionInfo>,
    /// The logical service name the sentinels track.
    pub service_name: String,
    /// Username presented to the sentinels themselves; distinct from the
    /// data-node credentials.
    pub sentinel_username: Option<String>,
    /// Password presented to the sentinels themselves.
    pub sentinel_password: Option<String>,
    /// Credentials and protocol settings for the data nodes. The address in
    /// here is ignored; resolution provides it.
    pub node_info: ConnectionInfo,
    /// Connection tuning for the data nodes.
    pub node_connection: ConnectionConfig,
    /// Merge sentinels discovered at runtime into the rotation.
    pub update_sentinels: bool,
    /// Also resolve the replica set and serve read-only commands from a
    /// random replica.
    pub read_from_replicas: bool,
}

impl SentinelOptions {
    /// Builds options from sentinel addresses and a service name.
    pub fn new<T: IntoConnectionInfo>(
        sentinels: Vec<T>,
        service_name: impl Into<String>,
    ) -> RedioxResult<SentinelOptions> {
        let sentinels = sentinels
            .into_iter()
            .map(IntoConnectionInfo::into_connection_info)
            .collect::<RedioxResult<Vec<_>>>()?;
        if sentinels.is_empty() {
            fail!((
                ErrorKind::InvalidClientConfig,
                "Sentinel configuration needs at least one sentinel endpoint"
            ));
        }
        Ok(SentinelOptions {
            sentinels,
            service_name: service_name.into(),
            sentinel_username: None,
            sentinel_password: None,
            node_info: ConnectionInfo::default(),
            node_connection: ConnectionConfig::default(),
            update_sentinels: true,
            read_from_replicas: false,
        })
    }
}

/// The outcome of a successful resolution.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedMaster {
    /// The address of the current master.
    pub master: ConnectionAddr,
    /// The healthy replicas, when replica reads are enabled.
    pub replicas: Vec<ConnectionAddr>,
}

/// Resolves the current master address through the sentinel quorum.
pub struct SentinelResolver {
    options: SentinelOptions,
    /// Rotation order; the most recently successful endpoint sits in front.
    sentinels: StdMutex<Vec<ConnectionInfo>>,
}

impl SentinelResolver {
    pub fn new(options: SentinelOptions) -> SentinelResolver {
        SentinelResolver {
            sentinels: StdMutex::new(options.sentinels.clone()),
            options,
        }
    }

    pub(crate) fn rotation(&self) -> Vec<ConnectionInfo> {
        self.sentinels.lock().unwrap().clone()
    }

    /// The current rotation order, most recently successful endpoint first.
    pub fn sentinels(&self) -> Vec<ConnectionInfo> {
        self.rotation()
    }

    /// Connection settings for short-lived sentinel probes: no reconnect,
    /// no offline queue, tight deadline.
    pub(crate) fn probe_config(&self) -> ConnectionConfig {
        ConnectionConfig {
            reconnect: ReconnectPolicy::none(),
            connect_timeout: SENTINEL_TIMEOUT,
            ready_check: false,
            enable_offline_queue: true,
            offline_queue_limit: None,
            default_command_timeout: Some(SENTINEL_TIMEOUT),
            ..ConnectionConfig::default()
        }
    }

    pub(crate) fn sentinel_info(&self, endpoint: &ConnectionInfo) -> ConnectionInfo {
        let mut info = endpoint.clone();
        info.db = 0;
        info.protocol = ProtocolVersion::Resp2;
        if info.username.is_none() {
            info.username = self.options.sentinel_username.clone();
        }
        if info.password.is_none() {
            info.password = self.options.sentinel_password.clone();
        }
        info
    }

    fn promote(&self, endpoint: &ConnectionInfo) {
        let mut sentinels = self.sentinels.lock().unwrap();
        if let Some(pos) = sentinels.iter().position(|s| s.addr == endpoint.addr) {
            let preferred = sentinels.remove(pos);
            sentinels.insert(0, preferred);
        }
    }

    fn merge_discovered(&self, discovered: Vec<ConnectionAddr>) {
        let mut sentinels = self.sentinels.lock().unwrap();
        for addr in discovered {
            if sentinels.iter().any(|s| s.addr == addr) {
                continue;
            }
            debug!(addr = %addr, "sentinel discovered at runtime");
            let mut info = ConnectionInfo::default();
            info.addr = addr;
            sentinels.push(info);
        }
    }

    /// Asks each sentinel in turn for the master of the configured service.
    /// The first answer wins and its sentinel moves to the front of the
    /// rotation.
    pub async fn resolve(&self) -> RedioxResult<ResolvedMaster> {
        let rotation = self.rotation();
        let mut last_err: Option<Error> = None;
        for endpoint in rotation {
            let conn =
                Connection::connect(self.sentinel_info(&endpoint), self.probe_config());
            let reply = conn
                .send(
                    cmd("SENTINEL")
                        .arg("get-master-addr-by-name")
                        .arg(self.options.service_name.as_str()),
                )
                .await;
            let master = match reply {
                Ok(Value::Nil) => {
                    last_err = Some(Error::from((
                        ErrorKind::NoSentinelsAvailable,
                        "Sentinel does not track the requested service",
                        self.options.service_name.clone(),
                    )));
                    continue;
                }
                Ok(value) => match parse_host_port(&value) {
                    Some((host, port)) => ConnectionAddr::Tcp(host, port),
                    None => {
                        last_err = Some(Error::from((
                            ErrorKind::ProtocolError,
                            "Sentinel returned a malformed master address",
                        )));
                        continue;
                    }
                },
                Err(err) => {
                    trace!(sentinel = %endpoint.addr, error = %err, "sentinel probe failed");
                    last_err = Some(err);
                    continue;
                }
            };
            self.promote(&endpoint);
            if self.options.update_sentinels {
                if let Ok(reply) = conn
                    .send(
                        cmd("SENTINEL")
                            .arg("sentinels")
                            .arg(self.options.service_name.as_str()),
                    )
                    .await
                {
                    self.merge_discovered(parse_instance_addrs(&reply, false));
                }
            }
            let replicas = if self.options.read_from_replicas {
                match conn
                    .send(
                        cmd("SENTINEL")
                            .arg("replicas")
                            .arg(self.options.service_name.as_str()),
                    )
                    .await
                {
                    Ok(reply) => parse_instance_addrs(&reply, true),
                    Err(_) => vec![],
                }
            } else {
                vec![]
            };
            conn.close();
            debug!(master = %master, "sentinel resolution succeeded");
            return Ok(ResolvedMaster { master, replicas });
        }
        Err(match last_err {
            Some(err) if err.kind() == ErrorKind::NoSentinelsAvailable => err,
            Some(err) => Error::from((
                ErrorKind::NoSentinelsAvailable,
                "No sentinel answered the resolution query",
                err.to_string(),
            )),
            None => Error::from((
                ErrorKind::NoSentinelsAvailable,
                "All sentinel endpoints are unreachable",
            )),
        })
    }
}

fn parse_host_port(value: &Value) -> Option<(String, u16)> {
    let items = value.as_sequence()?;
    if items.len() < 2 {
        return None;
    }
    let host = match &items[0] {
        Value::BulkString(bytes) => String::from_utf8_lossy(bytes).into_owned(),
        Value::SimpleString(s) => s.clone(),
        _ => return None,
    };
    let port = match &items[1] {
        Value::BulkString(bytes) => std::str::from_utf8(bytes).ok()?.parse().ok()?,
        Value::SimpleString(s) => s.parse().ok()?,
        Value::Int(n) => u16::try_from(*n).ok()?,
        _ => return None,
    };
    Some((host, port))
}

/// Extracts `(ip, port)` pairs from a `SENTINEL sentinels`/`replicas` reply:
/// an array of instances, each a flat array (or map) of field/value pairs.
/// Instances flagged as down or disconnected are skipped when
/// `filter_health` is set.
fn parse_instance_addrs(reply: &Value, filter_health: bool) -> Vec<ConnectionAddr> {
    let Some(instances) = reply.as_sequence() else {
        return vec![];
    };
    let mut out = vec![];
    for instance in instances {
        let fields: HashMap<String, String> = match instance {
            Value::Map(pairs) => pairs
                .iter()
                .filter_map(|(k, v)| Some((field_str(k)?, field_str(v)?)))
                .collect(),
            _ => match instance.as_sequence() {
                Some(items) => items
                    .chunks_exact(2)
                    .filter_map(|kv| Some((field_str(&kv[0])?, field_str(&kv[1])?)))
                    .collect(),
                None => continue,
            },
        };
        if filter_health {
            if let Some(flags) = fields.get("flags") {
                if flags.contains("s_down")
                    || flags.contains("o_down")
                    || flags.contains("disconnected")
                {
                    continue;
                }
            }
        }
        if let (Some(ip), Some(port)) = (fields.get("ip"), fields.get("port")) {
            if let Ok(port) = port.parse() {
                out.push(ConnectionAddr::Tcp(ip.clone(), port));
            }
        }
    }
    out
}

fn field_str(value: &Value) -> Option<String> {
    match value {
        Value::BulkString(bytes) => Some(String::from_utf8_lossy(bytes).into_owned()),
        Value::SimpleString(s) => Some(s.clone()),
        Value::Int(n) => Some(n.to_string()),
        _ => None,
    }
}

/// A client whose data connection follows the sentinel-resolved master.
#[derive(Clone)]
pub struct SentinelClient {
    inner: Arc<SentinelInner>,
}

struct SentinelInner {
    resolver: SentinelResolver,
    node_info: ConnectionInfo,
    node_connection: ConnectionConfig,
    read_from_replicas: bool,
    service_name: String,
    current: Mutex<Option<(ConnectionAddr, Connection)>>,
    replicas: StdMutex<Vec<ConnectionAddr>>,
    replica_pool: StdMutex<HashMap<String, Connection>>,
}

impl SentinelClient {
    /// Resolves the master and connects to it; also starts the background
    /// failover watcher.
    pub async fn connect(options: SentinelOptions) -> RedioxResult<SentinelClient> {
        let inner = Arc::new(SentinelInner {
            node_info: options.node_info.clone(),
            node_connection: options.node_connection.clone(),
            read_from_replicas: options.read_from_replicas,
            service_name: options.service_name.clone(),
            resolver: SentinelResolver::new(options),
            current: Mutex::new(None),
            replicas: StdMutex::new(vec![]),
            replica_pool: StdMutex::new(HashMap::new()),
        });
        inner.ensure_connection().await?;
        spawn_failover_watcher(Arc::downgrade(&inner));
        Ok(SentinelClient { inner })
    }

    /// Sends one command to the current master, or to a replica for
    /// read-only commands when replica reads are enabled.
    pub async fn call(&self, command: Cmd) -> RedioxResult<Value> {
        if self.inner.read_from_replicas && command.is_readonly() {
            if let Some(conn) = self.inner.replica_connection() {
                match conn.send(command.clone()).await {
                    Ok(value) => return Ok(value),
                    // replica gone: fall back to the master
                    Err(err) if err.is_connection_dropped() => {}
                    Err(err) => return Err(err),
                }
            }
        }
        let conn = self.inner.ensure_connection().await?;
        conn.send(command).await
    }

    /// The connection to the current master, resolving it first if needed.
    pub async fn connection(&self) -> RedioxResult<Connection> {
        self.inner.ensure_connection().await
    }

    /// The last resolved replica set.
    pub fn replicas(&self) -> Vec<ConnectionAddr> {
        self.inner.replicas.lock().unwrap().clone()
    }

    /// Forces a resolution round, repointing the data connection when the
    /// master moved.
    pub async fn reresolve(&self) -> RedioxResult<()> {
        self.inner.reresolve().await
    }

    /// Gracefully shuts down the data connection.
    pub fn close(&self) {
        if let Ok(current) = self.inner.current.try_lock() {
            if let Some((_, conn)) = current.as_ref() {
                conn.close();
            }
        }
        for (_, conn) in self.inner.replica_pool.lock().unwrap().drain() {
            conn.close();
        }
    }
}

impl SentinelInner {
    fn node_connection_to(&self, addr: &ConnectionAddr) -> Connection {
        let mut info = self.node_info.clone();
        info.addr = addr.clone();
        Connection::connect(info, self.node_connection.clone())
    }

    async fn ensure_connection(&self) -> RedioxResult<Connection> {
        let mut current = self.current.lock().await;
        if let Some((_, conn)) = current.as_ref() {
            if conn.status() != ConnectionStatus::End {
                return Ok(conn.clone());
            }
        }
        let resolved = self.resolver.resolve().await?;
        let conn = self.node_connection_to(&resolved.master);
        *self.replicas.lock().unwrap() = resolved.replicas;
        *current = Some((resolved.master, conn.clone()));
        Ok(conn)
    }

    /// Re-runs resolution. A changed master address invalidates the old
    /// connection: its in-flight commands fail with `MasterChanged`.
    async fn reresolve(&self) -> RedioxResult<()> {
        let resolved = self.resolver.resolve().await?;
        let mut current = self.current.lock().await;
        *self.replicas.lock().unwrap() = resolved.replicas.clone();
        match current.as_ref() {
            Some((addr, conn)) if *addr != resolved.master => {
                warn!(old = %addr, new = %resolved.master, "master changed, repointing");
                conn.terminate(ErrorKind::MasterChanged);
                let conn = self.node_connection_to(&resolved.master);
                *current = Some((resolved.master, conn));
            }
            None => {
                let conn = self.node_connection_to(&resolved.master);
                *current = Some((resolved.master, conn));
            }
            _ => {}
        }
        Ok(())
    }

    /// A connection to a random healthy replica, when one is known.
    fn replica_connection(&self) -> Option<Connection> {
        let addr = {
            let replicas = self.replicas.lock().unwrap();
            replicas.choose(&mut rand::thread_rng())?.clone()
        };
        let key = addr.to_string();
        let mut pool = self.replica_pool.lock().unwrap();
        if let Some(conn) = pool.get(&key) {
            if conn.status() != ConnectionStatus::End {
                return Some(conn.clone());
            }
        }
        let conn = self.node_connection_to(&addr);
        pool.insert(key, conn.clone());
        Some(conn)
    }
}

/// Subscribes to failover announcements on a sentinel channel so the master
/// switch is noticed immediately instead of at the next failed command.
fn spawn_failover_watcher(inner: Weak<SentinelInner>) {
    tokio::spawn(async move {
        let mut rotation_idx = 0usize;
        loop {
            let Some(strong) = inner.upgrade() else { return };
            let rotation = strong.resolver.rotation();
            if rotation.is_empty() {
                return;
            }
            let endpoint = rotation[rotation_idx % rotation.len()].clone();
            rotation_idx = rotation_idx.wrapping_add(1);
            let (push_tx, mut push_rx) = mpsc::unbounded_channel::<PushMessage>();
            let mut config = strong.resolver.probe_config();
            config.push_sender = Some(push_tx);
            let conn =
                Connection::connect(strong.resolver.sentinel_info(&endpoint), config);
            let service = strong.service_name.clone();
            let subscribed = conn.send(cmd("SUBSCRIBE").arg("+switch-master")).await;
            drop(strong);
            if subscribed.is_err() {
                tokio::time::sleep(WATCHER_RETRY_DELAY).await;
                continue;
            }
            trace!(sentinel = %endpoint.addr, "watching for failover announcements");
            loop {
                tokio::select! {
                    message = push_rx.recv() => match message {
                        Some(message) => {
                            if switch_master_matches(&message, &service) {
                                match inner.upgrade() {
                                    Some(strong) => {
                                        if let Err(err) = strong.reresolve().await {
                                            warn!(error = %err, "re-resolution after failover failed");
                                        }
                                    }
                                    None => return,
                                }
                            }
                        }
                        // the subscriber connection died, rotate to the next
                        // sentinel
                        None => break,
                    },
                    _ = tokio::time::sleep(Duration::from_secs(10)) => {
                        if inner.upgrade().is_none() {
                            return;
                        }
                    }
                }
            }
            tokio::time::sleep(WATCHER_RETRY_DELAY).await;
        }
    });
}

/// A `+switch-master` payload names the service first:
/// `<service> <old-ip> <old-port> <new-ip> <new-port>`.
fn switch_master_matches(message: &PushMessage, service: &str) -> bool {
    // data holds [channel, payload]
    let Some(payload) = message.data.get(1) else {
        return false;
    };
    let payload = match payload {
        Value::BulkString(bytes) => String::from_utf8_lossy(bytes).into_owned(),
        Value::SimpleString(s) => s.clone(),
        _ => return false,
    };
    payload.split_whitespace().next() == Some(service)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PushKind;

    #[test]
    fn parses_master_addr_reply() {
        let reply = Value::Array(vec![
            Value::BulkString(b"10.0.0.5".to_vec()),
            Value::BulkString(b"6381".to_vec()),
        ]);
        assert_eq!(
            parse_host_port(&reply),
            Some(("10.0.0.5".to_string(), 6381))
        );
        assert_eq!(parse_host_port(&Value::Nil), None);
    }

    #[test]
    fn parses_replica_instances_and_filters_unhealthy() {
        let instance = |ip: &str, flags: &str| {
            Value::Array(vec![
                Value::BulkString(b"ip".to_vec()),
                Value::BulkString(ip.as_bytes().to_vec()),
                Value::BulkString(b"port".to_vec()),
                Value::BulkString(b"6379".to_vec()),
                Value::BulkString(b"flags".to_vec()),
                Value::BulkString(flags.as_bytes().to_vec()),
            ])
        };
        let reply = Value::Array(vec![
            instance("10.0.0.1", "slave"),
            instance("10.0.0.2", "slave,s_down"),
            instance("10.0.0.3", "slave,disconnected"),
        ]);
        let addrs = parse_instance_addrs(&reply, true);
        assert_eq!(addrs, vec![ConnectionAddr::Tcp("10.0.0.1".into(), 6379)]);
        // without health filtering everything is kept
        assert_eq!(parse_instance_addrs(&reply, false).len(), 3);
    }

    #[test]
    fn switch_master_payload_is_matched_by_service() {
        let message = PushMessage {
            kind: PushKind::Message,
            data: vec![
                Value::BulkString(b"+switch-master".to_vec()),
                Value::BulkString(b"mymaster 10.0.0.1 6379 10.0.0.2 6379".to_vec()),
            ],
        };
        assert!(switch_master_matches(&message, "mymaster"));
        assert!(!switch_master_matches(&message, "other"));
    }
}
