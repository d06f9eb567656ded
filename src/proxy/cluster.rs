//! Runtime record for one logical tenant: its current config, its
//! current forwarder, and the set of live client connections.
//!
//! One mutex guards the three as a unit and is only ever held for O(1)
//! pointer/map work. Everything that can block (forwarder construction,
//! connection closing) happens outside of it.

use std::sync::{Arc, Mutex};

use fnv::FnvHashMap;
use log::warn;

use crate::config::ClusterConfig;
use crate::core::ConnHandle;
use crate::error::{ProxyError, ProxyResult};
use crate::forwarder::ForwarderHandle;
use crate::utils::lock;

use super::next_sn;

struct ClusterState {
    conf: Arc<ClusterConfig>,
    forwarder: ForwarderHandle,
    client_conns: FnvHashMap<i64, Arc<ConnHandle>>,
}

/// One listener's tenant: config, forwarder and live connections
pub struct Cluster {
    state: Mutex<ClusterState>,
}

impl Cluster {
    pub(crate) fn new(conf: ClusterConfig, forwarder: ForwarderHandle) -> Cluster {
        Cluster {
            state: Mutex::new(ClusterState {
                conf: Arc::new(conf),
                forwarder,
                client_conns: FnvHashMap::default(),
            }),
        }
    }

    /// Admit a connection accepted under config generation `sn`. Fails
    /// when a reload displaced that generation between accept and
    /// admission; the caller closes the connection and moves on.
    pub fn add_connection(&self, sn: i32, conn: Arc<ConnHandle>) -> ProxyResult<()> {
        let mut state = lock(&self.state);
        if sn != state.conf.sn {
            return Err(ProxyError::StaleGeneration {
                accepted: sn,
                current: state.conf.sn,
            });
        }
        state.client_conns.insert(conn.id(), conn);
        Ok(())
    }

    /// Forget a connection; idempotent
    pub fn remove_connection(&self, id: i64) {
        lock(&self.state).client_conns.remove(&id);
    }

    /// Extract a connection and close it, used by a handler tearing
    /// itself down
    pub fn close_and_remove_connection(&self, id: i64) {
        let conn = lock(&self.state).client_conns.remove(&id);
        if let Some(conn) = conn {
            conn.close();
        }
    }

    /// Swap the live set for an empty one, then close the extracted
    /// connections outside the lock
    pub fn close_all_connections(&self) {
        let old_conns = std::mem::take(&mut lock(&self.state).client_conns);
        for conn in old_conns.values() {
            conn.close();
        }
    }

    /// A counted reference to the current forwarder. The reference is
    /// taken under the lock, so a concurrent swap can never release the
    /// last count out from under the caller.
    pub fn get_forwarder(&self) -> ForwarderHandle {
        lock(&self.state).forwarder.clone_ref()
    }

    /// Snapshot of the current config
    pub fn get_conf(&self) -> Arc<ClusterConfig> {
        Arc::clone(&lock(&self.state).conf)
    }

    /// Replace this cluster's forwarder under a new config.
    ///
    /// The new forwarder is built outside the lock (it resolves and may
    /// dial); on failure the cluster is left untouched. On success the
    /// swap itself is O(1) under the lock, after which the displaced
    /// forwarder is closed and the cluster's own reference released;
    /// handlers still holding references keep it alive until they finish.
    pub async fn process_conf_change(&self, mut new_conf: ClusterConfig) -> ProxyResult<()> {
        let current = self.get_conf();
        new_conf.id = current.id;
        new_conf.sn = next_sn();
        if new_conf.cache_type != current.cache_type && !new_conf.close_when_change {
            warn!(
                "cluster({}) changes cache type {:?} -> {:?} without close_when_change, \
                 connected clients will see the old protocol",
                new_conf.name, current.cache_type, new_conf.cache_type
            );
        }

        let new_forwarder = ForwarderHandle::build(new_conf.clone()).await?;
        let close_when_change = new_conf.close_when_change;

        let (old_forwarder, old_conns) = {
            let mut state = lock(&self.state);
            // a concurrent change may have installed a later generation
            // while this forwarder was being built; never move sn backwards
            if state.conf.sn >= new_conf.sn {
                new_conf.sn = next_sn();
            }
            let old_forwarder =
                std::mem::replace(&mut state.forwarder, new_forwarder);
            let old_conns = if close_when_change {
                std::mem::take(&mut state.client_conns)
            } else {
                FnvHashMap::default()
            };
            state.conf = Arc::new(new_conf);
            (old_forwarder, old_conns)
        };

        old_forwarder.close();
        drop(old_forwarder);
        for conn in old_conns.values() {
            conn.close();
        }
        Ok(())
    }

    /// Terminal shutdown: drain the forwarder and drop every client
    pub fn close(&self) {
        lock(&self.state).forwarder.close();
        self.close_all_connections();
    }

    /// Number of live client connections
    pub fn conn_count(&self) -> usize {
        lock(&self.state).client_conns.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_cluster;
    use crate::core::connection::front_conn_pair;

    async fn cluster(name: &str) -> Cluster {
        let mut conf = test_cluster(name, "127.0.0.1:0");
        conf.sn = next_sn();
        let forwarder = ForwarderHandle::build(conf.clone()).await.unwrap();
        Cluster::new(conf, forwarder)
    }

    #[tokio::test]
    async fn test_add_connection_stale_sn() {
        let cluster = cluster("rd").await;
        let sn = cluster.get_conf().sn;
        let (conn, _client) = front_conn_pair().await;

        let err = cluster.add_connection(sn - 1, conn.handle()).unwrap_err();
        assert!(matches!(err, ProxyError::StaleGeneration { .. }));
        assert_eq!(cluster.conn_count(), 0);

        cluster.add_connection(sn, conn.handle()).unwrap();
        assert_eq!(cluster.conn_count(), 1);
    }

    #[tokio::test]
    async fn test_remove_connection_is_idempotent() {
        let cluster = cluster("rd").await;
        let sn = cluster.get_conf().sn;
        let (conn, _client) = front_conn_pair().await;
        cluster.add_connection(sn, conn.handle()).unwrap();

        cluster.remove_connection(conn.id());
        cluster.remove_connection(conn.id());
        assert_eq!(cluster.conn_count(), 0);
    }

    #[tokio::test]
    async fn test_close_and_remove_closes_once() {
        let cluster = cluster("rd").await;
        let sn = cluster.get_conf().sn;
        let (conn, _client) = front_conn_pair().await;
        let handle = conn.handle();
        cluster.add_connection(sn, handle.clone()).unwrap();

        cluster.close_and_remove_connection(conn.id());
        assert!(handle.is_closed());
        assert_eq!(cluster.conn_count(), 0);

        // second call finds nothing to do
        cluster.close_and_remove_connection(conn.id());
    }

    #[tokio::test]
    async fn test_close_all_connections() {
        let cluster = cluster("rd").await;
        let sn = cluster.get_conf().sn;
        let mut handles = Vec::new();
        let mut clients = Vec::new();
        for _ in 0..3 {
            let (conn, client) = front_conn_pair().await;
            cluster.add_connection(sn, conn.handle()).unwrap();
            handles.push(conn.handle());
            clients.push(client);
        }

        cluster.close_all_connections();
        assert_eq!(cluster.conn_count(), 0);
        for handle in handles {
            assert!(handle.is_closed());
        }
    }

    #[tokio::test]
    async fn test_process_conf_change_swaps_forwarder_and_sn() {
        let cluster = cluster("rd").await;
        let before = cluster.get_conf();

        let old_forwarder = cluster.get_forwarder();
        assert!(!old_forwarder.is_closed());

        let mut new_conf = test_cluster("rd", "127.0.0.1:0");
        new_conf.servers = vec!["127.0.0.1:6380".to_string()];
        cluster.process_conf_change(new_conf).await.unwrap();

        let after = cluster.get_conf();
        assert!(after.sn > before.sn, "sn must strictly increase");
        assert_eq!(after.id, before.id);
        assert_eq!(after.servers, vec!["127.0.0.1:6380".to_string()]);

        // the displaced forwarder is draining but still alive for the
        // reference this test holds
        assert!(old_forwarder.is_closed());
        assert_eq!(old_forwarder.ref_count(), 1);

        assert!(!cluster.get_forwarder().is_closed());
    }

    #[tokio::test]
    async fn test_process_conf_change_failure_leaves_cluster_unchanged() {
        let cluster = cluster("rd").await;
        let before = cluster.get_conf();

        let mut new_conf = test_cluster("rd", "127.0.0.1:0");
        new_conf.servers = vec!["no-such-host.invalid.zaguan:6379".to_string()];
        assert!(cluster.process_conf_change(new_conf).await.is_err());

        let after = cluster.get_conf();
        assert_eq!(after.sn, before.sn);
        assert!(!cluster.get_forwarder().is_closed());
    }

    #[tokio::test]
    async fn test_close_when_change_drains_connections() {
        let cluster = cluster("rd").await;
        let sn = cluster.get_conf().sn;
        let (conn, _client) = front_conn_pair().await;
        let handle = conn.handle();
        cluster.add_connection(sn, handle.clone()).unwrap();

        let mut new_conf = test_cluster("rd", "127.0.0.1:0");
        new_conf.close_when_change = true;
        cluster.process_conf_change(new_conf).await.unwrap();

        assert_eq!(cluster.conn_count(), 0);
        assert!(handle.is_closed());

        // a connection admitted under the old sn is now refused
        let (late, _client) = front_conn_pair().await;
        assert!(cluster.add_connection(sn, late.handle()).is_err());
    }

    #[tokio::test]
    async fn test_change_without_close_when_change_keeps_connections() {
        let cluster = cluster("rd").await;
        let sn = cluster.get_conf().sn;
        let (conn, _client) = front_conn_pair().await;
        let handle = conn.handle();
        cluster.add_connection(sn, handle.clone()).unwrap();

        cluster
            .process_conf_change(test_cluster("rd", "127.0.0.1:0"))
            .await
            .unwrap();

        assert_eq!(cluster.conn_count(), 1);
        assert!(!handle.is_closed());
    }

    /// Concurrent swaps against concurrent users: no dispatch may ever
    /// observe a freed forwarder, counts never go negative, and the
    /// cluster ends with exactly one live reference per holder.
    #[tokio::test]
    async fn test_concurrent_swap_and_use() {
        let cluster = Arc::new(cluster("rd").await);

        let mut tasks = Vec::new();
        for _ in 0..4 {
            let cluster = Arc::clone(&cluster);
            tasks.push(tokio::spawn(async move {
                for _ in 0..50 {
                    let forwarder = cluster.get_forwarder();
                    assert!(forwarder.ref_count() >= 1);
                    tokio::task::yield_now().await;
                    drop(forwarder);
                }
            }));
        }
        for _ in 0..2 {
            let cluster = Arc::clone(&cluster);
            tasks.push(tokio::spawn(async move {
                for _ in 0..10 {
                    let conf = test_cluster("rd", "127.0.0.1:0");
                    cluster.process_conf_change(conf).await.unwrap();
                    tokio::task::yield_now().await;
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        // only the cluster's own reference remains
        let forwarder = cluster.get_forwarder();
        assert_eq!(forwarder.ref_count(), 2);
        assert!(!forwarder.is_closed());
    }

    #[tokio::test]
    async fn test_cluster_close_is_terminal() {
        let cluster = cluster("rd").await;
        let sn = cluster.get_conf().sn;
        let (conn, _client) = front_conn_pair().await;
        cluster.add_connection(sn, conn.handle()).unwrap();

        cluster.close();
        assert_eq!(cluster.conn_count(), 0);
        assert!(cluster.get_forwarder().is_closed());
    }
}
