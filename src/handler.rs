//! The per-connection request loop.
//!
//! One task per admitted client. Each cycle reads one framed request,
//! takes a fresh forwarder reference from the cluster (so a hot swap is
//! picked up on the very next request), dispatches, and writes the
//! framed response back. Dispatch failures are answered in the client's
//! protocol; framing failures and forced closes end the connection.

use std::sync::Arc;

use bytes::BytesMut;
use log::{debug, error, warn};

use crate::config::ClusterConfig;
use crate::core::FrontConn;
use crate::protocol::codec_for;
use crate::proxy::cluster::Cluster;
use crate::proxy::Proxy;

pub(crate) async fn handle(
    proxy: Arc<Proxy>,
    cluster: Arc<Cluster>,
    conf: Arc<ClusterConfig>,
    mut front: FrontConn,
) {
    let codec = codec_for(conf.cache_type);
    let close_handle = front.handle();
    let peer = front.peer().to_string();
    let conn_id = front.id();
    debug!("cluster({}) new connection from {peer}", conf.name);

    loop {
        let request = tokio::select! {
            _ = close_handle.wait_closed() => {
                debug!("cluster({}) connection {peer} force-closed", conf.name);
                break;
            }
            request = front.read_frame(codec) => request,
        };

        let (data, frame) = match request {
            Ok(Some(request)) => request,
            Ok(None) => {
                debug!("cluster({}) connection {peer} closed by client", conf.name);
                break;
            }
            Err(e) => {
                warn!("cluster({}) connection {peer} read failed: {e}", conf.name);
                break;
            }
        };

        let key = frame.key.map(|range| &data[range]).unwrap_or_default();
        let forwarder = cluster.get_forwarder();
        let result = forwarder.dispatch(key, &data).await;
        drop(forwarder);

        let write = match result {
            Ok(response) => front.write_frame(&response).await,
            Err(e) if e.is_recoverable() => {
                warn!("cluster({}) dispatch for {peer} failed: {e}", conf.name);
                let mut response = BytesMut::new();
                codec.encode_error(&e.to_string(), &mut response);
                front.write_frame(&response).await
            }
            Err(e) => {
                error!("cluster({}) dispatch for {peer} failed: {e}", conf.name);
                break;
            }
        };
        if let Err(e) = write {
            warn!(
                "cluster({}) failed to write response to {peer}: {e}",
                conf.name
            );
            break;
        }
    }

    cluster.close_and_remove_connection(conn_id);
    proxy.conn_done();
    debug!("cluster({}) connection {peer} done", conf.name);
}
