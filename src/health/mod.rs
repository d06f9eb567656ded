//! Backend liveness monitoring.
//!
//! Each forwarder with a `ping_fail_limit` runs one monitor task that
//! probes every node on a fixed interval with a protocol-level ping.
//! A node failing `ping_fail_limit` consecutive probes is ejected from
//! the ring when `ping_auto_eject` is set; the first succeeding probe
//! puts it back. The monitor stops as soon as its forwarder is closed or
//! gone.

use std::sync::Weak;
use std::time::Duration;

use log::{debug, info, warn};

use crate::forwarder::Forwarder;

/// Interval between probe rounds
pub const PING_INTERVAL: Duration = Duration::from_secs(1);

/// Per-forwarder node prober
pub(crate) struct PingMonitor {
    forwarder: Weak<Forwarder>,
    fails: Vec<u32>,
    ejected: Vec<bool>,
}

impl PingMonitor {
    pub(crate) fn new(forwarder: Weak<Forwarder>, nodes: usize) -> PingMonitor {
        PingMonitor {
            forwarder,
            fails: vec![0; nodes],
            ejected: vec![false; nodes],
        }
    }

    pub(crate) async fn run(mut self) {
        let mut interval = tokio::time::interval(PING_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            let forwarder = match self.forwarder.upgrade() {
                Some(forwarder) => forwarder,
                None => return,
            };
            if forwarder.is_closed() {
                debug!(
                    "ping monitor for cluster({}) stopping, forwarder closed",
                    forwarder.conf().name
                );
                return;
            }
            self.probe_all(&forwarder).await;
        }
    }

    pub(crate) async fn probe_all(&mut self, forwarder: &Forwarder) {
        for index in 0..self.fails.len() {
            let healthy = forwarder.probe_node(index).await;
            self.observe(forwarder, index, healthy);
        }
    }

    /// Account one probe outcome and apply eject/restore policy
    pub(crate) fn observe(&mut self, forwarder: &Forwarder, index: usize, healthy: bool) {
        let conf = forwarder.conf();
        if healthy {
            if self.ejected[index] {
                forwarder.restore_node(index);
                info!(
                    "cluster({}) node({}) recovered, restored to ring",
                    conf.name,
                    forwarder.node_addr(index)
                );
            }
            self.fails[index] = 0;
            self.ejected[index] = false;
            return;
        }

        self.fails[index] = self.fails[index].saturating_add(1);
        if self.fails[index] == conf.ping_fail_limit {
            warn!(
                "cluster({}) node({}) failed {} consecutive pings",
                conf.name,
                forwarder.node_addr(index),
                self.fails[index]
            );
            if conf.ping_auto_eject && !self.ejected[index] {
                forwarder.eject_node(index);
                self.ejected[index] = true;
                warn!(
                    "cluster({}) node({}) ejected from ring",
                    conf.name,
                    forwarder.node_addr(index)
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClusterConfig;
    use crate::forwarder::ForwarderHandle;
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn conf(servers: Vec<String>, fail_limit: u32, auto_eject: bool) -> ClusterConfig {
        let mut conf = crate::config::test_cluster("rd", "127.0.0.1:0");
        conf.servers = servers;
        conf.ping_fail_limit = fail_limit;
        conf.ping_auto_eject = auto_eject;
        conf
    }

    fn monitor_for(handle: &ForwarderHandle) -> PingMonitor {
        PingMonitor::new(
            Arc::downgrade(handle.inner()),
            handle.inner().node_count(),
        )
    }

    #[tokio::test]
    async fn test_eject_and_restore_policy() {
        let c = conf(
            vec!["127.0.0.1:6379".to_string(), "127.0.0.1:6380".to_string()],
            3,
            true,
        );
        let handle = ForwarderHandle::build(c).await.unwrap();
        // stop the monitor the build spawned; this test drives its own
        handle.close();
        let forwarder = Arc::clone(handle.inner());
        let mut monitor = monitor_for(&handle);

        monitor.observe(&forwarder, 1, false);
        monitor.observe(&forwarder, 1, false);
        assert!(forwarder.node_alive(1), "ejected before the fail limit");

        monitor.observe(&forwarder, 1, false);
        assert!(!forwarder.node_alive(1));
        assert!(forwarder.node_alive(0), "healthy node was disturbed");

        monitor.observe(&forwarder, 1, true);
        assert!(forwarder.node_alive(1));
        assert_eq!(monitor.fails[1], 0);
    }

    #[tokio::test]
    async fn test_no_eject_without_auto_eject() {
        let c = conf(vec!["127.0.0.1:6379".to_string()], 2, false);
        let handle = ForwarderHandle::build(c).await.unwrap();
        handle.close();
        let forwarder = Arc::clone(handle.inner());
        let mut monitor = monitor_for(&handle);

        for _ in 0..5 {
            monitor.observe(&forwarder, 0, false);
        }
        assert!(forwarder.node_alive(0));
        assert_eq!(monitor.fails[0], 5);
    }

    #[tokio::test]
    async fn test_probe_round_against_live_backend() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            loop {
                let (mut stream, _) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(_) => return,
                };
                let mut buf = [0u8; 64];
                let _ = stream.read(&mut buf).await;
                let _ = stream.write_all(b"+PONG\r\n").await;
            }
        });

        let handle = ForwarderHandle::build(conf(vec![addr], 0, true))
            .await
            .unwrap();
        let forwarder = Arc::clone(handle.inner());
        let mut monitor = monitor_for(&handle);

        monitor.probe_all(&forwarder).await;
        assert!(forwarder.node_alive(0));
        assert_eq!(monitor.fails[0], 0);
    }
}
