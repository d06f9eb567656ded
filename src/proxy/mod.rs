//! The multi-cluster supervisor.
//!
//! One `Proxy` owns every cluster of the process: it brings them up at
//! startup, runs one accept task per cluster, enforces the process-wide
//! connection cap, and polls the cluster config file to hot-swap live
//! clusters. Clusters are never removed; the registry only grows, which
//! keeps every cluster id stable for the life of the process.

pub mod cluster;
pub mod diff;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use log::{error, info, warn};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tokio::time::timeout;

use crate::config::{load_cluster_conf, ClusterConfig, Config};
use crate::core::{FrontConn, Listener, Stream};
use crate::error::{ProxyError, ProxyResult};
use crate::forwarder::ForwarderHandle;
use crate::handler;
use crate::protocol::codec_for;
use cluster::Cluster;

/// Hard cap on clusters per process; ids stay dense below it
pub const MAX_CLUSTERS: usize = 128;

/// I/O budget for writing an admission-reject response
const REJECT_IO_TIMEOUT: Duration = Duration::from_secs(1);

static CLUSTER_SN: AtomicI32 = AtomicI32::new(0);

/// Next config generation stamp; strictly increasing for the process
/// lifetime
pub(crate) fn next_sn() -> i32 {
    CLUSTER_SN.fetch_add(1, Ordering::SeqCst) + 1
}

/// Counter snapshot for an external metrics collector
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProxyStats {
    pub cluster_change_count: u64,
    pub cluster_conf_change_fail_cnt: u64,
    pub add_cluster_fail_cnt: u64,
    pub load_fail_cnt: u64,
    pub failed_due_to_removed_cnt: u64,
    pub conns: i32,
    pub cur_cluster_count: usize,
}

#[derive(Default)]
struct Counters {
    cluster_change: AtomicU64,
    conf_change_fail: AtomicU64,
    add_cluster_fail: AtomicU64,
    load_fail: AtomicU64,
    failed_due_to_removed: AtomicU64,
}

/// Process-wide supervisor of clusters
pub struct Proxy {
    conf: Config,
    cluster_conf_file: PathBuf,
    /// Append-only registry; a cluster's index is its id
    registry: Mutex<Vec<Arc<Cluster>>>,
    /// Mirror of the registry length for lock-free reads
    cur_clusters: AtomicUsize,
    /// Live client connections, process-wide
    conns: AtomicI32,
    started: AtomicBool,
    closed: AtomicBool,
    counters: Counters,
}

impl Proxy {
    pub fn new(conf: Config, cluster_conf_file: impl Into<PathBuf>) -> ProxyResult<Proxy> {
        conf.validate()?;
        Ok(Proxy {
            conf,
            cluster_conf_file: cluster_conf_file.into(),
            registry: Mutex::new(Vec::new()),
            cur_clusters: AtomicUsize::new(0),
            conns: AtomicI32::new(0),
            started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            counters: Counters::default(),
        })
    }

    /// Bring up the initial clusters and start the config watcher.
    ///
    /// Init-once: later calls return without effect. A failure during
    /// initial bring-up is fatal and propagates to the caller.
    pub async fn serve(self: &Arc<Self>, confs: Vec<ClusterConfig>) -> ProxyResult<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if confs.is_empty() {
            warn!("no cluster configured, the proxy will not listen on any port");
        }
        for conf in confs {
            self.add_cluster(conf).await?;
        }

        let proxy = Arc::clone(self);
        tokio::spawn(proxy.monitor_conf_change());
        Ok(())
    }

    /// Create a cluster for `conf`: assign its generation and dense id,
    /// build its forwarder, open its listener and start its accept task.
    /// Rolls back completely when the listener cannot be opened.
    pub async fn add_cluster(self: &Arc<Self>, mut conf: ClusterConfig) -> ProxyResult<()> {
        conf.sn = next_sn();

        let mut registry = self.registry.lock().await;
        if registry.len() >= MAX_CLUSTERS {
            return Err(ProxyError::TooManyClusters(MAX_CLUSTERS));
        }
        conf.id = registry.len() as i32;

        let forwarder = ForwarderHandle::build(conf.clone()).await?;

        let listener = match Listener::bind(conf.listen_proto, &conf.listen_addr).await {
            Ok(listener) => listener,
            Err(e) => {
                // the forwarder handle drops here, releasing its only
                // reference; no registry slot was taken
                error!(
                    "failed to listen on address {} for cluster({}): {e}",
                    conf.listen_addr, conf.name
                );
                return Err(e.into());
            }
        };

        let name = conf.name.clone();
        let addr = conf.listen_addr.clone();
        let cluster = Arc::new(Cluster::new(conf, forwarder));
        registry.push(Arc::clone(&cluster));
        self.cur_clusters.store(registry.len(), Ordering::SeqCst);
        drop(registry);

        tokio::spawn(Arc::clone(self).accept_loop(cluster, listener));
        info!("cluster({name}) listening on {addr}");
        Ok(())
    }

    /// Per-cluster accept task. Lives until the proxy closes; accept
    /// errors are logged and survived.
    async fn accept_loop(self: Arc<Self>, cluster: Arc<Cluster>, listener: Listener) {
        loop {
            let conf = cluster.get_conf();
            if self.closed.load(Ordering::SeqCst) {
                info!(
                    "cluster({}) on {} stops listening",
                    conf.name, conf.listen_addr
                );
                return;
            }

            let (stream, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!(
                        "cluster({}) on {} accept error: {e}",
                        conf.name, conf.listen_addr
                    );
                    continue;
                }
            };

            let max_conns = self.conf.proxy.max_connections;
            if max_conns > 0 && self.conns.load(Ordering::SeqCst) >= max_conns {
                self.reject_connection(&cluster, stream, &peer).await;
                continue;
            }

            self.conns.fetch_add(1, Ordering::SeqCst);
            let front = FrontConn::new(stream, peer, conf.read_timeout(), conf.write_timeout());
            if let Err(e) = cluster.add_connection(conf.sn, front.handle()) {
                // benign race: the config changed between accept and
                // admission; the client simply retries
                error!(
                    "cluster({}) dropped a connection accepted during a reload: {e}",
                    conf.name
                );
                self.conns.fetch_sub(1, Ordering::SeqCst);
                continue;
            }

            tokio::spawn(handler::handle(
                Arc::clone(&self),
                Arc::clone(&cluster),
                conf,
                front,
            ));
        }
    }

    /// Turn an over-cap connection away with an error in the client's
    /// own protocol, so it reads a reason instead of a bare hangup
    async fn reject_connection(&self, cluster: &Arc<Cluster>, mut stream: Stream, peer: &str) {
        let conf = cluster.get_conf();
        let codec = codec_for(conf.cache_type);
        let forwarder = cluster.get_forwarder();

        let mut response = BytesMut::new();
        codec.encode_error(&ProxyError::MoreMaxConns.to_string(), &mut response);
        let write = timeout(REJECT_IO_TIMEOUT, async {
            stream.write_all(&response).await?;
            stream.shutdown().await
        })
        .await;
        if let Ok(Err(e)) = write {
            warn!("failed to deliver reject response to {peer}: {e}");
        }
        drop(forwarder);

        warn!(
            "cluster({}) rejected connection from {peer}: {} live connections at cap {}",
            conf.name,
            self.conns.load(Ordering::SeqCst),
            self.conf.proxy.max_connections
        );
    }

    /// Config watch loop: poll the cluster file, feed the differ, apply
    /// its verdicts. Errors never escape; they are counted and logged.
    async fn monitor_conf_change(self: Arc<Self>) {
        let interval = self.conf.monitor_interval();
        loop {
            tokio::time::sleep(interval).await;
            if self.closed.load(Ordering::SeqCst) {
                return;
            }

            let new_confs = match load_cluster_conf(&self.cluster_conf_file) {
                Ok(confs) => confs,
                Err(e) => {
                    error!(
                        "failed to load cluster conf file {}: {e}",
                        self.cluster_conf_file.display()
                    );
                    self.counters.load_fail.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
            };

            self.apply_reload(new_confs).await;
        }
    }

    /// One reload round against a freshly loaded config set. Factored
    /// out of the watch loop so the reject and dispatch rules are
    /// drivable without the timer.
    pub async fn apply_reload(self: &Arc<Self>, new_confs: Vec<ClusterConfig>) {
        let (old_confs, clusters) = {
            let registry = self.registry.lock().await;
            let old_confs: Vec<ClusterConfig> = registry
                .iter()
                .map(|cluster| (*cluster.get_conf()).clone())
                .collect();
            (old_confs, registry.clone())
        };

        if diff::any_cluster_removed(&new_confs, &old_confs) {
            error!("a cluster was removed from the conf file, ignoring this reload");
            self.counters
                .failed_due_to_removed
                .fetch_add(1, Ordering::Relaxed);
            return;
        }

        let (changed, new_add) = diff::diff(&new_confs, &old_confs);

        if clusters.len() + new_add.len() > MAX_CLUSTERS {
            error!(
                "reload refused: {} clusters plus {} additions exceeds the cap of {}",
                clusters.len(),
                new_add.len(),
                MAX_CLUSTERS
            );
            return;
        }

        for conf in changed {
            let name = conf.name.clone();
            let id = conf.id;
            match clusters[id as usize].process_conf_change(conf).await {
                Ok(()) => {
                    self.counters.cluster_change.fetch_add(1, Ordering::Relaxed);
                    info!("changed conf of cluster({name}:{id})");
                }
                Err(e) => {
                    self.counters
                        .conf_change_fail
                        .fetch_add(1, Ordering::Relaxed);
                    error!("failed to change conf of cluster({name}): {e}");
                }
            }
        }

        for conf in new_add {
            let name = conf.name.clone();
            match self.add_cluster(conf).await {
                Ok(()) => info!("added new cluster({name})"),
                Err(e) => {
                    self.counters
                        .add_cluster_fail
                        .fetch_add(1, Ordering::Relaxed);
                    error!("failed to add new cluster({name}): {e}");
                }
            }
        }
    }

    /// Shut the proxy down: stop accepting, drain every cluster.
    /// Idempotent and terminal.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let registry = self.registry.lock().await;
        for cluster in registry.iter() {
            cluster.close();
        }
        info!("proxy closed, {} clusters drained", registry.len());
    }

    /// Called by a handler when its connection is fully torn down
    pub(crate) fn conn_done(&self) {
        self.conns.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn cur_cluster_count(&self) -> usize {
        self.cur_clusters.load(Ordering::SeqCst)
    }

    pub fn conns(&self) -> i32 {
        self.conns.load(Ordering::SeqCst)
    }

    /// The cluster registered under `id`
    pub async fn cluster(&self, id: usize) -> Option<Arc<Cluster>> {
        self.registry.lock().await.get(id).cloned()
    }

    pub fn stats(&self) -> ProxyStats {
        ProxyStats {
            cluster_change_count: self.counters.cluster_change.load(Ordering::Relaxed),
            cluster_conf_change_fail_cnt: self.counters.conf_change_fail.load(Ordering::Relaxed),
            add_cluster_fail_cnt: self.counters.add_cluster_fail.load(Ordering::Relaxed),
            load_fail_cnt: self.counters.load_fail.load(Ordering::Relaxed),
            failed_due_to_removed_cnt: self
                .counters
                .failed_due_to_removed
                .load(Ordering::Relaxed),
            conns: self.conns(),
            cur_cluster_count: self.cur_cluster_count(),
        }
    }
}
