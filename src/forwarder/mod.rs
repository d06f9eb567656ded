//! The forwarder: owner of a cluster's backend connections.
//!
//! A forwarder is built on every cluster (re)load and handed around as a
//! reference-counted [`ForwarderHandle`]. The cluster keeps one reference
//! for as long as the forwarder is current; every request cycle takes its
//! own and releases it when done (handles release on drop). A hot swap
//! closes the displaced forwarder, which keeps serving its in-flight
//! holders and tears down its backend connections exactly once, when the
//! last holder lets go.

pub mod ring;

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex};

use bytes::{Bytes, BytesMut};
use log::debug;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::config::{parse_server, ClusterConfig};
use crate::error::{ProxyError, ProxyResult};
use crate::health::PingMonitor;
use crate::protocol::{codec_for, Codec};
use crate::utils::{extract_hash_tag, lock};
use ring::Ring;

/// One backend endpoint with its idle-connection pool
struct Node {
    addr: String,
    pool: Mutex<Vec<TcpStream>>,
}

impl Node {
    fn checkout(&self) -> Option<TcpStream> {
        lock(&self.pool).pop()
    }

    fn checkin(&self, conn: TcpStream, limit: usize) {
        let mut pool = lock(&self.pool);
        if pool.len() < limit {
            pool.push(conn);
        }
    }

    fn drain(&self) -> usize {
        let mut pool = lock(&self.pool);
        let drained = pool.len();
        pool.clear();
        drained
    }
}

/// Shared forwarder state; reachable only through a [`ForwarderHandle`]
pub struct Forwarder {
    conf: ClusterConfig,
    codec: &'static dyn Codec,
    ring: Mutex<Ring>,
    nodes: Vec<Node>,
    refs: AtomicI32,
    closed: AtomicBool,
}

impl Forwarder {
    pub(crate) fn conf(&self) -> &ClusterConfig {
        &self.conf
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub(crate) fn node_addr(&self, index: usize) -> &str {
        &self.nodes[index].addr
    }

    pub(crate) fn node_alive(&self, index: usize) -> bool {
        lock(&self.ring).is_alive(index)
    }

    pub(crate) fn eject_node(&self, index: usize) {
        lock(&self.ring).eject(index);
    }

    pub(crate) fn restore_node(&self, index: usize) {
        lock(&self.ring).restore(index);
    }

    fn add_ref(&self) -> i32 {
        self.refs.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn release(&self) -> i32 {
        let previous = self.refs.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(previous >= 1, "forwarder refcount went negative");
        previous - 1
    }

    /// Drop every pooled backend connection. Runs exactly once, on the
    /// release that takes the refcount to zero.
    fn teardown(&self) {
        let mut drained = 0;
        for node in &self.nodes {
            drained += node.drain();
        }
        debug!(
            "forwarder for cluster({}) torn down, dropped {drained} pooled backend connections",
            self.conf.name
        );
    }

    async fn dial(&self, node: &Node) -> ProxyResult<TcpStream> {
        let stream = timeout(self.conf.dial_timeout(), TcpStream::connect(&node.addr))
            .await
            .map_err(|_| ProxyError::timeout(format!("dial backend {}", node.addr)))?
            .map_err(|e| ProxyError::backend(format!("dial {}: {e}", node.addr)))?;
        stream.set_nodelay(true)?;
        let mut stream = stream;
        if self.conf.cache_type.is_redis() && !self.conf.redis_auth.is_empty() {
            self.authenticate(&mut stream, &node.addr).await?;
        }
        Ok(stream)
    }

    async fn authenticate(&self, conn: &mut TcpStream, addr: &str) -> ProxyResult<()> {
        let auth = &self.conf.redis_auth;
        let request = format!("*2\r\n$4\r\nAUTH\r\n${}\r\n{auth}\r\n", auth.len());
        let (response, _) = self.exchange(conn, request.as_bytes()).await?;
        if response.starts_with(b"-") {
            return Err(ProxyError::backend(format!(
                "backend {addr} rejected AUTH"
            )));
        }
        Ok(())
    }

    /// Write one framed request and read one framed response. The second
    /// value reports whether the stream is clean (no trailing bytes) and
    /// safe to pool.
    async fn exchange(&self, conn: &mut TcpStream, request: &[u8]) -> ProxyResult<(Bytes, bool)> {
        timeout(self.conf.write_timeout(), async {
            conn.write_all(request).await?;
            conn.flush().await
        })
        .await
        .map_err(|_| ProxyError::timeout("backend request write"))??;

        let mut buf = BytesMut::with_capacity(4096);
        loop {
            if !buf.is_empty() {
                if let Some(len) = self.codec.frame_response(&buf)? {
                    let clean = buf.len() == len;
                    return Ok((buf.split_to(len).freeze(), clean));
                }
            }
            let read = timeout(self.conf.read_timeout(), conn.read_buf(&mut buf))
                .await
                .map_err(|_| ProxyError::timeout("backend response read"))??;
            if read == 0 {
                return Err(ProxyError::backend("backend closed mid-response"));
            }
        }
    }

    async fn dispatch_to(&self, index: usize, request: &[u8]) -> ProxyResult<Bytes> {
        let node = &self.nodes[index];

        // a pooled connection may have gone stale while idle; fall back
        // to a fresh dial once before giving up
        if let Some(mut conn) = node.checkout() {
            match self.exchange(&mut conn, request).await {
                Ok((response, clean)) => {
                    if clean && !self.is_closed() {
                        node.checkin(conn, self.conf.node_connections);
                    }
                    return Ok(response);
                }
                Err(e) => {
                    debug!(
                        "pooled connection to {} failed ({e}), redialing",
                        node.addr
                    );
                }
            }
        }

        let mut conn = self.dial(node).await?;
        let (response, clean) = self.exchange(&mut conn, request).await?;
        if clean && !self.is_closed() {
            node.checkin(conn, self.conf.node_connections);
        }
        Ok(response)
    }

    /// Ping one node; used by the health monitor
    pub(crate) async fn probe_node(&self, index: usize) -> bool {
        let node = &self.nodes[index];
        let mut conn = match self.dial(node).await {
            Ok(conn) => conn,
            Err(_) => return false,
        };
        match self.exchange(&mut conn, self.codec.ping_request()).await {
            Ok((response, _)) => self.codec.is_pong(&response),
            Err(_) => false,
        }
    }
}

/// A counted reference to a [`Forwarder`].
///
/// Dropping the handle releases the reference; the release that reaches
/// zero tears the forwarder down.
pub struct ForwarderHandle {
    inner: Arc<Forwarder>,
}

impl ForwarderHandle {
    /// Build a forwarder for a cluster config. Resolves every configured
    /// server up front so a bad endpoint fails the (re)load instead of
    /// the first request, and starts the ping monitor when configured.
    pub async fn build(conf: ClusterConfig) -> ProxyResult<ForwarderHandle> {
        conf.ensure_valid()?;

        let mut nodes = Vec::with_capacity(conf.servers.len());
        let mut ring_nodes = Vec::with_capacity(conf.servers.len());
        for server in &conf.servers {
            let (addr, weight) =
                parse_server(server).map_err(|e| ProxyError::backend(format!("{server}: {e}")))?;
            tokio::net::lookup_host(addr)
                .await
                .map_err(|e| ProxyError::backend(format!("resolve {addr}: {e}")))?
                .next()
                .ok_or_else(|| ProxyError::backend(format!("{addr} resolves to no address")))?;
            nodes.push(Node {
                addr: addr.to_string(),
                pool: Mutex::new(Vec::new()),
            });
            ring_nodes.push((addr.to_string(), weight));
        }

        let ring = Ring::new(conf.hash_method, conf.hash_distribution, &ring_nodes);
        let codec = codec_for(conf.cache_type);
        let inner = Arc::new(Forwarder {
            conf,
            codec,
            ring: Mutex::new(ring),
            nodes,
            refs: AtomicI32::new(1),
            closed: AtomicBool::new(false),
        });

        if inner.conf.ping_fail_limit > 0 {
            let monitor = PingMonitor::new(Arc::downgrade(&inner), inner.node_count());
            tokio::spawn(monitor.run());
        }

        Ok(ForwarderHandle { inner })
    }

    /// Take an additional reference (AddRef)
    pub fn clone_ref(&self) -> ForwarderHandle {
        self.inner.add_ref();
        ForwarderHandle {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Mark the forwarder as draining: in-flight dispatches complete, new
    /// ones fail with [`ProxyError::ForwarderClosed`]
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// Current reference count; diagnostic only
    pub fn ref_count(&self) -> i32 {
        self.inner.refs.load(Ordering::SeqCst)
    }

    /// Forward one framed request to the node owning `key` and return the
    /// framed response
    pub async fn dispatch(&self, key: &[u8], request: &[u8]) -> ProxyResult<Bytes> {
        if self.inner.is_closed() {
            return Err(ProxyError::ForwarderClosed);
        }
        let routing = extract_hash_tag(key, self.inner.conf.hash_tag.as_bytes());
        let index = lock(&self.inner.ring)
            .select(routing)
            .ok_or(ProxyError::NoBackend)?;
        self.inner.dispatch_to(index, request).await
    }

    #[cfg(test)]
    pub(crate) fn inner(&self) -> &Arc<Forwarder> {
        &self.inner
    }
}

impl Drop for ForwarderHandle {
    fn drop(&mut self) {
        if self.inner.release() == 0 {
            self.inner.teardown();
        }
    }
}
