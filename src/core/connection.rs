//! Listeners and front (client-side) connections.
//!
//! A `FrontConn` owns its stream; the cluster's live-connection registry
//! holds only the matching `ConnHandle`, whose close signal the handler's
//! read loop honors. This is how a reload can force-close connections it
//! does not own.

use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};
use tokio::sync::Notify;
use tokio::time::timeout;

use crate::config::ListenProto;
use crate::error::{ProxyError, ProxyResult};
use crate::protocol::{Codec, Frame};

static NEXT_CONN_ID: AtomicI64 = AtomicI64::new(1);

/// A bound listening socket, TCP or Unix domain
pub enum Listener {
    Tcp(TcpListener),
    Unix(UnixListener),
}

impl Listener {
    /// Bind a listener for the given transport. A stale Unix socket file
    /// left by a previous process is removed before binding.
    pub async fn bind(proto: ListenProto, addr: &str) -> io::Result<Listener> {
        match proto {
            ListenProto::Tcp => Ok(Listener::Tcp(TcpListener::bind(addr).await?)),
            ListenProto::Unix => {
                if let Err(e) = std::fs::remove_file(addr) {
                    if e.kind() != io::ErrorKind::NotFound {
                        return Err(e);
                    }
                }
                Ok(Listener::Unix(UnixListener::bind(addr)?))
            }
        }
    }

    /// Accept one connection; returns the stream and a peer label for logs
    pub async fn accept(&self) -> io::Result<(Stream, String)> {
        match self {
            Listener::Tcp(listener) => {
                let (stream, addr) = listener.accept().await?;
                stream.set_nodelay(true)?;
                Ok((Stream::Tcp(stream), addr.to_string()))
            }
            Listener::Unix(listener) => {
                let (stream, _) = listener.accept().await?;
                Ok((Stream::Unix(stream), "unix".to_string()))
            }
        }
    }

    /// The locally bound address, for tests and logs
    pub fn local_addr(&self) -> io::Result<String> {
        match self {
            Listener::Tcp(listener) => Ok(listener.local_addr()?.to_string()),
            Listener::Unix(listener) => Ok(listener
                .local_addr()?
                .as_pathname()
                .map(|p| p.display().to_string())
                .unwrap_or_default()),
        }
    }
}

/// An accepted client stream
pub enum Stream {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl AsyncRead for Stream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Stream::Tcp(stream) => Pin::new(stream).poll_read(cx, buf),
            Stream::Unix(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Stream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Stream::Tcp(stream) => Pin::new(stream).poll_write(cx, buf),
            Stream::Unix(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Stream::Tcp(stream) => Pin::new(stream).poll_flush(cx),
            Stream::Unix(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Stream::Tcp(stream) => Pin::new(stream).poll_shutdown(cx),
            Stream::Unix(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

/// The cluster-side handle to a live client connection.
///
/// `close` fires at most once; the handler task observes it through
/// `wait_closed` and tears the connection down.
pub struct ConnHandle {
    id: i64,
    peer: String,
    closed: AtomicBool,
    notify: Notify,
}

impl ConnHandle {
    fn new(id: i64, peer: String) -> ConnHandle {
        ConnHandle {
            id,
            peer,
            closed: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Request the owning handler to drop the connection. Returns whether
    /// this call performed the close.
    pub fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.notify.notify_waiters();
        true
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Resolve once `close` has been called, however long ago
    pub async fn wait_closed(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_closed() {
                return;
            }
            notified.await;
        }
    }
}

/// A framed client connection with per-operation timeouts
pub struct FrontConn {
    stream: Stream,
    buf: BytesMut,
    read_timeout: Duration,
    write_timeout: Duration,
    handle: Arc<ConnHandle>,
}

impl FrontConn {
    pub fn new(
        stream: Stream,
        peer: String,
        read_timeout: Duration,
        write_timeout: Duration,
    ) -> FrontConn {
        let id = NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed);
        FrontConn {
            stream,
            buf: BytesMut::with_capacity(4096),
            read_timeout,
            write_timeout,
            handle: Arc::new(ConnHandle::new(id, peer)),
        }
    }

    pub fn id(&self) -> i64 {
        self.handle.id
    }

    pub fn peer(&self) -> &str {
        &self.handle.peer
    }

    pub fn handle(&self) -> Arc<ConnHandle> {
        Arc::clone(&self.handle)
    }

    /// Read one complete request frame.
    ///
    /// Waiting for the first byte of a frame is untimed (idle clients are
    /// not disconnected); once a frame has started, every further read is
    /// bounded by the read timeout. `Ok(None)` is a clean EOF between
    /// frames.
    pub async fn read_frame(&mut self, codec: &dyn Codec) -> ProxyResult<Option<(Bytes, Frame)>> {
        loop {
            if !self.buf.is_empty() {
                if let Some(frame) = codec.frame_request(&self.buf)? {
                    let data = self.buf.split_to(frame.len).freeze();
                    return Ok(Some((data, frame)));
                }
            }

            let read = if self.buf.is_empty() {
                self.stream.read_buf(&mut self.buf).await?
            } else {
                timeout(self.read_timeout, self.stream.read_buf(&mut self.buf))
                    .await
                    .map_err(|_| ProxyError::timeout("client request read"))??
            };
            if read == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Err(ProxyError::protocol("connection closed mid-frame"));
            }
        }
    }

    /// Write a full response, bounded by the write timeout
    pub async fn write_frame(&mut self, data: &[u8]) -> ProxyResult<()> {
        timeout(self.write_timeout, async {
            self.stream.write_all(data).await?;
            self.stream.flush().await
        })
        .await
        .map_err(|_| ProxyError::timeout("client response write"))??;
        Ok(())
    }
}

/// A connected `FrontConn` plus its client-side stream, for tests across
/// the crate
#[cfg(test)]
pub(crate) async fn front_conn_pair() -> (FrontConn, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let client = TcpStream::connect(addr).await.unwrap();
    let (server, peer) = listener.accept().await.unwrap();
    let conn = FrontConn::new(
        Stream::Tcp(server),
        peer.to_string(),
        Duration::from_secs(1),
        Duration::from_secs(1),
    );
    (conn, client)
}
