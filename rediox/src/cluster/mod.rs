//! This module extends the library to support sharded clusters.
//!
//! A [`ClusterConnection`] hides the fact that the key space is spread over
//! many nodes: it keeps one connection per node, routes every command to the
//! node owning its slot, follows `MOVED`/`ASK` redirections within a bounded
//! budget, and rebuilds its slot table when the topology changes under it.
//!
//! # Example
//! ```rust,no_run
//! use rediox::cluster::{ClusterConnection, ClusterOptions};
//! use rediox::cmd;
//!
//! async fn fetch() -> rediox::RedioxResult<()> {
//!     let options = ClusterOptions::new(vec![
//!         "redis://127.0.0.1:7000",
//!         "redis://127.0.0.1:7001",
//!     ])?;
//!     let cluster = ClusterConnection::connect(options).await?;
//!     cluster.call(rediox::cmd("SET").arg("test").arg("test_data")).await?;
//!     let value = cluster.call(rediox::cmd("GET").arg("test")).await?;
//!     println!("{value:?}");
//!     Ok(())
//! }
//! ```

pub mod routing;
pub mod topology;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;

use arc_swap::ArcSwap;
use arcstr::ArcStr;
use dashmap::DashMap;
use rand::seq::SliceRandom;
use rand::Rng;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::cmd::{cmd, Cmd};
use crate::conn::{Connection, ConnectionConfig, ConnectionStatus};
use crate::connection::{ConnectionAddr, ConnectionInfo, IntoConnectionInfo};
use crate::errors::{Error, ErrorKind, RedioxResult};
use crate::pipeline::{interpret_exec, ExecOutcome, Pipeline};
use crate::types::Value;

use routing::{route_for_cmd, route_for_pipeline};
use topology::{NatMap, SlotTable};

/// Redirect-triggered refreshes closer together than this are coalesced
/// into the one already performed.
const REFRESH_DEBOUNCE: Duration = Duration::from_millis(1_000);

/// Pause before retrying a command that hit a transient cluster condition.
const TRANSIENT_RETRY_DELAY: Duration = Duration::from_millis(50);

/// Ceiling for one topology query against one node.
const REFRESH_TIMEOUT: Duration = Duration::from_secs(5);

/// Which nodes may serve read-only commands.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ReadFrom {
    /// Always read from the slot owner.
    #[default]
    Master,
    /// Read from a replica of the owning slot when one exists, trading
    /// consistency for load distribution. Writes always go to the master.
    Replica,
}

/// How a replica is picked when several are eligible.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum ReplicaSelection {
    #[default]
    Random,
    RoundRobin,
}

/// Cluster client configuration.
#[derive(Clone, Debug)]
pub struct ClusterOptions {
    /// Seed nodes used for bootstrap and as a fallback for topology
    /// queries. Credentials of the first seed apply to every discovered
    /// node.
    pub seeds: Vec<ConnectionInfo>,
    /// How many times one logical command may be transmitted before a
    /// redirect storm is reported as an error.
    pub max_redirections: u32,
    /// Periodic topology refresh. `None` refreshes only on startup and on
    /// redirection bursts.
    pub refresh_interval: Option<Duration>,
    /// Routing policy for read-only commands.
    pub read_from: ReadFrom,
    /// Replica selection policy when `read_from` allows replicas.
    pub replica_selection: ReplicaSelection,
    /// Address translation for advertised node addresses.
    pub nat_map: NatMap,
    /// Per-node connection tuning.
    pub connection: ConnectionConfig,
}

impl ClusterOptions {
    /// Builds options from seed addresses.
    pub fn new<T: IntoConnectionInfo>(seeds: Vec<T>) -> RedioxResult<ClusterOptions> {
        let seeds = seeds
            .into_iter()
            .map(IntoConnectionInfo::into_connection_info)
            .collect::<RedioxResult<Vec<_>>>()?;
        if seeds.is_empty() {
            fail!((
                ErrorKind::InvalidClientConfig,
                "Cluster configuration needs at least one seed node"
            ));
        }
        Ok(ClusterOptions {
            seeds,
            max_redirections: 16,
            refresh_interval: None,
            read_from: ReadFrom::default(),
            replica_selection: ReplicaSelection::default(),
            nat_map: NatMap::default(),
            connection: ConnectionConfig::default(),
        })
    }
}

fn cluster_down_error(attempts: u32) -> Error {
    Error::from((
        ErrorKind::ClusterDown,
        "Too many redirections for one command",
        format!("gave up after {attempts} attempts"),
    ))
}

/// A connection to a sharded cluster.
///
/// Cloning is cheap; clones share the node pool and the slot table.
#[derive(Clone)]
pub struct ClusterConnection {
    inner: Arc<ClusterInner>,
}

struct ClusterInner {
    options: ClusterOptions,
    /// Credentials and protocol settings applied to every node connection.
    template: ConnectionInfo,
    seed_addrs: Vec<ArcStr>,
    slots: ArcSwap<SlotTable>,
    pool: DashMap<ArcStr, Connection>,
    /// Serializes topology refreshes; concurrent requests coalesce.
    refresh_lock: Mutex<()>,
    last_refresh: StdMutex<Option<Instant>>,
    round_robin: AtomicUsize,
}

enum Redirect {
    Moved(ArcStr),
    Ask(ArcStr),
}

enum FailureAction {
    Redirect(Redirect),
    RetryAfterDelay,
    Retry,
    Fail,
}

impl ClusterConnection {
    /// Connects to the seed nodes and performs the initial topology
    /// discovery.
    pub async fn connect(options: ClusterOptions) -> RedioxResult<ClusterConnection> {
        let template = options.seeds[0].clone();
        let seed_addrs: Vec<ArcStr> = options
            .seeds
            .iter()
            .map(|info| ArcStr::from(info.addr.to_string()))
            .collect();
        let inner = Arc::new(ClusterInner {
            template,
            seed_addrs,
            slots: ArcSwap::from_pointee(SlotTable::empty()),
            pool: DashMap::new(),
            refresh_lock: Mutex::new(()),
            last_refresh: StdMutex::new(None),
            round_robin: AtomicUsize::new(0),
            options,
        });
        for (addr, info) in inner
            .seed_addrs
            .iter()
            .cloned()
            .zip(inner.options.seeds.iter().cloned())
        {
            let conn = Connection::connect(info, inner.options.connection.clone());
            inner.pool.insert(addr, conn);
        }
        inner.refresh_slots().await?;
        if let Some(interval) = inner.options.refresh_interval {
            spawn_interval_refresh(Arc::downgrade(&inner), interval);
        }
        Ok(ClusterConnection { inner })
    }

    /// Routes one command to the node owning its slot and returns the reply,
    /// following redirections within the configured budget.
    pub async fn call(&self, command: Cmd) -> RedioxResult<Value> {
        let slot = route_for_cmd(&command)?;
        let readonly = command.is_readonly();
        let max_attempts = self.inner.options.max_redirections.max(1);
        let mut redirect: Option<Redirect> = None;
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            if attempt > max_attempts {
                return Err(cluster_down_error(max_attempts));
            }
            let (addr, asking) = match &redirect {
                Some(Redirect::Moved(addr)) => (addr.clone(), false),
                Some(Redirect::Ask(addr)) => (addr.clone(), true),
                None => (self.inner.target_for(slot, readonly), false),
            };
            let conn = self.inner.connection_to(&addr);
            let result = if asking {
                match conn.send(cmd("ASKING")).await {
                    Ok(_) => conn.send(command.clone()).await,
                    Err(err) => Err(err),
                }
            } else {
                conn.send(command.clone()).await
            };
            match result {
                Ok(value) => return Ok(value),
                Err(err) => match classify_failure(&self.inner, &err) {
                    FailureAction::Redirect(next) => {
                        trace!(addr = %addr, "following redirection");
                        redirect = Some(next);
                    }
                    FailureAction::RetryAfterDelay => {
                        redirect = None;
                        tokio::time::sleep(TRANSIENT_RETRY_DELAY).await;
                    }
                    FailureAction::Retry => {
                        redirect = None;
                    }
                    FailureAction::Fail => return Err(err),
                },
            }
        }
    }

    /// Executes a non-transactional pipeline. Every member command must hash
    /// to the same slot; the batch is retried as a unit on redirection.
    pub async fn execute_pipeline(
        &self,
        pipeline: &Pipeline,
    ) -> RedioxResult<Vec<RedioxResult<Value>>> {
        let slot = route_for_pipeline(pipeline)?;
        let commands: Vec<Cmd> = pipeline.commands().to_vec();
        self.run_batch(slot, commands, pipeline.timeout_value())
            .await
    }

    /// Executes a transactional pipeline on the node owning the batch's
    /// slot.
    pub async fn execute_transaction(&self, pipeline: &Pipeline) -> RedioxResult<ExecOutcome> {
        let slot = route_for_pipeline(pipeline)?;
        if pipeline.is_empty() {
            return Ok(ExecOutcome::Completed(vec![]));
        }
        let mut wrapped = Vec::with_capacity(pipeline.len() + 2);
        wrapped.push(cmd("MULTI"));
        wrapped.extend(pipeline.commands().iter().cloned());
        wrapped.push(cmd("EXEC"));
        let raw = self
            .run_batch(slot, wrapped, pipeline.timeout_value())
            .await?;
        interpret_exec(raw, pipeline.len())
    }

    async fn run_batch(
        &self,
        slot: Option<u16>,
        commands: Vec<Cmd>,
        timeout: Option<Duration>,
    ) -> RedioxResult<Vec<RedioxResult<Value>>> {
        let max_attempts = self.inner.options.max_redirections.max(1);
        let mut redirect: Option<Redirect> = None;
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            if attempt > max_attempts {
                return Err(cluster_down_error(max_attempts));
            }
            let (addr, asking) = match &redirect {
                Some(Redirect::Moved(addr)) => (addr.clone(), false),
                Some(Redirect::Ask(addr)) => (addr.clone(), true),
                None => (self.inner.target_for(slot, false), false),
            };
            let conn = self.inner.connection_to(&addr);
            if asking {
                if let Err(err) = conn.send(cmd("ASKING")).await {
                    match classify_failure(&self.inner, &err) {
                        FailureAction::Fail => return Err(err),
                        _ => {
                            redirect = None;
                            continue;
                        }
                    }
                }
            }
            match conn.send_batch(commands.clone(), timeout).await {
                Ok(results) => match self.first_redirect(&results) {
                    Some(next) => redirect = Some(next),
                    None => return Ok(results),
                },
                Err(err) => match classify_failure(&self.inner, &err) {
                    FailureAction::Redirect(next) => redirect = Some(next),
                    FailureAction::RetryAfterDelay => {
                        redirect = None;
                        tokio::time::sleep(TRANSIENT_RETRY_DELAY).await;
                    }
                    FailureAction::Retry => redirect = None,
                    FailureAction::Fail => return Err(err),
                },
            }
        }
    }

    fn first_redirect(&self, results: &[RedioxResult<Value>]) -> Option<Redirect> {
        for result in results {
            if let Err(err) = result {
                if let FailureAction::Redirect(redirect) = classify_failure(&self.inner, err) {
                    return Some(redirect);
                }
            }
        }
        None
    }

    /// The current slot table snapshot.
    pub fn slot_table(&self) -> Arc<SlotTable> {
        self.inner.slots.load_full()
    }

    /// Queries any reachable node for the full slot mapping and replaces the
    /// table wholesale. Concurrent calls coalesce into one refresh.
    pub async fn refresh_slots(&self) -> RedioxResult<()> {
        self.inner.refresh_slots().await
    }

    /// Gracefully closes every node connection.
    pub fn close(&self) {
        for entry in self.inner.pool.iter() {
            entry.value().close();
        }
    }
}

/// Decides what to do about a failed attempt: follow a redirection, retry,
/// or surface the error.
fn classify_failure(inner: &Arc<ClusterInner>, err: &Error) -> FailureAction {
    if let Some((host, port)) = err.redirect_node() {
        let (host, port) = inner.options.nat_map.translate(host, port);
        let target = ArcStr::from(format!("{host}:{port}"));
        return match err.kind() {
            ErrorKind::Moved => {
                // the new owner is authoritative: repoint this one slot
                // now, let the coalesced refresh pick up the rest
                if let Some(slot) = err.redirect_slot() {
                    inner.repoint_slot(slot, target.clone());
                }
                schedule_refresh(inner);
                FailureAction::Redirect(Redirect::Moved(target))
            }
            _ => FailureAction::Redirect(Redirect::Ask(target)),
        };
    }
    match err.kind() {
        ErrorKind::TryAgain => FailureAction::RetryAfterDelay,
        ErrorKind::ClusterDown => {
            schedule_refresh(inner);
            FailureAction::RetryAfterDelay
        }
        _ if err.is_connection_dropped() || err.kind() == ErrorKind::Timeout => {
            schedule_refresh(inner);
            FailureAction::Retry
        }
        _ => FailureAction::Fail,
    }
}

impl ClusterInner {
    fn target_for(&self, slot: Option<u16>, readonly: bool) -> ArcStr {
        let table = self.slots.load();
        if let Some(slot) = slot {
            if let Some(nodes) = table.lookup(slot) {
                if readonly
                    && self.options.read_from == ReadFrom::Replica
                    && !nodes.replicas.is_empty()
                {
                    let idx = match self.options.replica_selection {
                        ReplicaSelection::Random => {
                            rand::thread_rng().gen_range(0..nodes.replicas.len())
                        }
                        ReplicaSelection::RoundRobin => {
                            self.round_robin.fetch_add(1, Ordering::Relaxed)
                                % nodes.replicas.len()
                        }
                    };
                    return nodes.replicas[idx].clone();
                }
                return nodes.master.clone();
            }
        }
        // lazy bootstrap: no table entry yet, ask any known node
        if let Some(addr) = table.random_node() {
            return addr;
        }
        let pooled: Vec<ArcStr> = self.pool.iter().map(|e| e.key().clone()).collect();
        pooled
            .choose(&mut rand::thread_rng())
            .cloned()
            .unwrap_or_else(|| self.seed_addrs[0].clone())
    }

    fn connection_to(&self, addr: &ArcStr) -> Connection {
        if let Some(existing) = self.pool.get(addr) {
            if existing.value().status() != ConnectionStatus::End {
                return existing.value().clone();
            }
        }
        let conn = Connection::connect(self.info_for(addr), self.options.connection.clone());
        self.pool.insert(addr.clone(), conn.clone());
        conn
    }

    fn info_for(&self, addr: &str) -> ConnectionInfo {
        let (host, port) = match addr.rsplit_once(':') {
            Some((host, port)) => (host.to_string(), port.parse().unwrap_or(6379)),
            None => (addr.to_string(), 6379),
        };
        let mut info = self.template.clone();
        info.addr = match &self.template.addr {
            ConnectionAddr::TcpTls { insecure, .. } => ConnectionAddr::TcpTls {
                host,
                port,
                insecure: *insecure,
            },
            _ => ConnectionAddr::Tcp(host, port),
        };
        info
    }

    fn repoint_slot(&self, slot: u16, addr: ArcStr) {
        self.slots
            .rcu(|table| table.with_slot_owner(slot, addr.clone()));
        debug!(slot, addr = %addr, "slot repointed after redirection");
    }

    async fn refresh_slots(&self) -> RedioxResult<()> {
        let _guard = match self.refresh_lock.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                // a refresh is in flight; wait for it instead of piling on
                let _ = self.refresh_lock.lock().await;
                return Ok(());
            }
        };
        let mut candidates: Vec<(ArcStr, Connection)> = self
            .pool
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        candidates.shuffle(&mut rand::thread_rng());
        let mut last_err: Option<Error> = None;
        for (addr, conn) in candidates {
            match conn
                .send(cmd("CLUSTER").arg("SLOTS").timeout(REFRESH_TIMEOUT))
                .await
            {
                Ok(reply) => {
                    let reporter_host = addr.rsplit_once(':').map(|(h, _)| h).unwrap_or(&addr);
                    match SlotTable::from_cluster_slots(
                        &reply,
                        &self.options.nat_map,
                        reporter_host,
                    ) {
                        Ok(table) if !table.is_empty() => {
                            self.apply_table(table);
                            *self.last_refresh.lock().unwrap() = Some(Instant::now());
                            debug!(via = %addr, "slot table refreshed");
                            return Ok(());
                        }
                        Ok(_) => {
                            last_err = Some(Error::from((
                                ErrorKind::ClusterDown,
                                "Node reported an empty slot table",
                            )));
                        }
                        Err(err) => last_err = Some(err),
                    }
                }
                Err(err) => {
                    warn!(addr = %addr, error = %err, "topology query failed");
                    last_err = Some(err);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| {
            Error::from((
                ErrorKind::ClusterDown,
                "No reachable node to refresh the topology from",
            ))
        }))
    }

    fn apply_table(&self, table: SlotTable) {
        let keep = table.node_addresses();
        self.slots.store(Arc::new(table));
        // nodes gone from the topology are closed gracefully so their
        // in-flight commands drain first
        self.pool.retain(|addr, conn| {
            if keep.contains(addr) || self.seed_addrs.contains(addr) {
                true
            } else {
                debug!(addr = %addr, "dropping connection to node no longer in topology");
                conn.close();
                false
            }
        });
    }
}

/// Kicks off a background refresh unless one just ran.
fn schedule_refresh(inner: &Arc<ClusterInner>) {
    {
        let last = inner.last_refresh.lock().unwrap();
        if let Some(last) = *last {
            if last.elapsed() < REFRESH_DEBOUNCE {
                return;
            }
        }
    }
    let inner = Arc::clone(inner);
    tokio::spawn(async move {
        if let Err(err) = inner.refresh_slots().await {
            warn!(error = %err, "background topology refresh failed");
        }
    });
}

fn spawn_interval_refresh(inner: Weak<ClusterInner>, interval: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await; // the first tick fires immediately
        loop {
            ticker.tick().await;
            match inner.upgrade() {
                Some(inner) => {
                    if let Err(err) = inner.refresh_slots().await {
                        warn!(error = %err, "periodic topology refresh failed");
                    }
                }
                None => break,
            }
        }
    });
}
