// TCP transport configuration and framed connection primitives.
use anyhow::{Context, Result, anyhow};
use bytes::Bytes;
use comet_wire::{DEFAULT_MAX_FRAME_BYTES, FrameCodec, FrameError};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;

/// Transport-level configuration defaults.
///
/// ```
/// use comet_transport::TransportConfig;
///
/// let config = TransportConfig::default();
/// assert!(config.max_frame_bytes > 0);
/// ```
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub max_frame_bytes: usize,
    pub connect_timeout: Duration,
    pub nodelay: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            connect_timeout: Duration::from_secs(10),
            nodelay: true,
        }
    }
}

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique connection identifier used for registries and logging.
///
/// ```
/// use comet_transport::ConnectionId;
///
/// let a = ConnectionId::next();
/// let b = ConnectionId::next();
/// assert_ne!(a, b);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl ConnectionId {
    pub fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Metadata about a live TCP connection.
///
/// ```
/// use comet_transport::{ConnectionId, ConnectionInfo};
/// use std::net::SocketAddr;
///
/// let info = ConnectionInfo {
///     id: ConnectionId(42),
///     peer_addr: "127.0.0.1:8099".parse::<SocketAddr>().expect("addr"),
/// };
/// assert_eq!(info.id.0, 42);
/// ```
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub peer_addr: SocketAddr,
}

/// Listening side of the transport.
#[derive(Debug)]
pub struct TcpServer {
    listener: TcpListener,
    transport: TransportConfig,
}

impl TcpServer {
    pub async fn bind(addr: SocketAddr, transport: TransportConfig) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("bind TCP listener on {addr}"))?;
        Ok(Self {
            listener,
            transport,
        })
    }

    pub async fn accept(&self) -> Result<FramedConnection> {
        let (stream, peer_addr) = self
            .listener
            .accept()
            .await
            .context("accept TCP connection")?;
        FramedConnection::new(stream, peer_addr, &self.transport)
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .context("read TCP local address")
    }
}

/// Connecting side of the transport.
#[derive(Debug, Clone, Default)]
pub struct TcpClient {
    transport: TransportConfig,
}

impl TcpClient {
    pub fn new(transport: TransportConfig) -> Self {
        Self { transport }
    }

    pub async fn connect(&self, addr: SocketAddr) -> Result<FramedConnection> {
        let stream = tokio::time::timeout(self.transport.connect_timeout, TcpStream::connect(addr))
            .await
            .with_context(|| format!("connect to {addr} timed out"))?
            .with_context(|| format!("connect to {addr}"))?;
        FramedConnection::new(stream, addr, &self.transport)
    }
}

/// A TCP stream wrapped in the length-prefix frame codec.
///
/// ```no_run
/// use bytes::Bytes;
/// use comet_transport::TcpClient;
///
/// async fn ping() -> anyhow::Result<()> {
///     let client = TcpClient::default();
///     let mut conn = client.connect("127.0.0.1:8099".parse()?).await?;
///     conn.send(Bytes::from_static(b"<x role=\"test\"/>")).await?;
///     let _reply = conn.next_frame().await;
///     conn.close().await;
///     Ok(())
/// }
/// ```
#[derive(Debug)]
pub struct FramedConnection {
    framed: Framed<TcpStream, FrameCodec>,
    info: ConnectionInfo,
}

type FramedTcp = Framed<TcpStream, FrameCodec>;

impl FramedConnection {
    fn new(stream: TcpStream, peer_addr: SocketAddr, transport: &TransportConfig) -> Result<Self> {
        stream
            .set_nodelay(transport.nodelay)
            .context("set TCP_NODELAY")?;
        let info = ConnectionInfo {
            id: ConnectionId::next(),
            peer_addr,
        };
        Ok(Self {
            framed: Framed::new(stream, FrameCodec::new(transport.max_frame_bytes)),
            info,
        })
    }

    pub fn info(&self) -> &ConnectionInfo {
        &self.info
    }

    /// Writes one payload as a single length-prefixed frame and flushes it.
    pub async fn send(&mut self, payload: Bytes) -> Result<(), FrameError> {
        self.framed.send(payload).await
    }

    /// Next complete payload; `None` once the peer has closed cleanly.
    pub async fn next_frame(&mut self) -> Option<Result<Bytes, FrameError>> {
        self.framed.next().await
    }

    /// Graceful close: flush pending writes and shut down the write half.
    pub async fn close(mut self) {
        if let Err(err) = SinkExt::<Bytes>::close(&mut self.framed).await {
            tracing::debug!(conn = %self.info.id, error = %err, "error while closing connection");
        }
    }

    /// Abortive close: discard pending data and reset the connection.
    pub fn abort(self) {
        #[allow(deprecated)]
        if let Err(err) = self.framed.get_ref().set_linger(Some(Duration::ZERO)) {
            tracing::debug!(conn = %self.info.id, error = %err, "set SO_LINGER failed");
        }
        drop(self.framed);
    }

    /// Splits into halves that can be driven from different tasks. Rejoin
    /// them with [`FrameWriter::reunite`] to abort.
    pub fn split(self) -> (FrameWriter, FrameReader) {
        let (sink, stream) = self.framed.split();
        (
            FrameWriter {
                sink,
                info: self.info,
            },
            FrameReader { stream },
        )
    }
}

/// Read half of a split [`FramedConnection`].
#[derive(Debug)]
pub struct FrameReader {
    stream: SplitStream<FramedTcp>,
}

impl FrameReader {
    /// Next complete payload; `None` once the peer has closed cleanly.
    pub async fn next_frame(&mut self) -> Option<Result<Bytes, FrameError>> {
        self.stream.next().await
    }
}

/// Write half of a split [`FramedConnection`].
#[derive(Debug)]
pub struct FrameWriter {
    sink: SplitSink<FramedTcp, Bytes>,
    info: ConnectionInfo,
}

impl FrameWriter {
    pub fn info(&self) -> &ConnectionInfo {
        &self.info
    }

    /// Writes one payload as a single frame and flushes it.
    pub async fn send(&mut self, payload: Bytes) -> Result<(), FrameError> {
        self.sink.send(payload).await
    }

    /// Flushes pending writes and shuts down the write half.
    pub async fn close(mut self) {
        if let Err(err) = self.sink.close().await {
            tracing::debug!(conn = %self.info.id, error = %err, "error while closing connection");
        }
    }

    /// Rejoins the halves produced by [`FramedConnection::split`].
    pub fn reunite(self, reader: FrameReader) -> Result<FramedConnection> {
        let id = self.info.id;
        let framed = self
            .sink
            .reunite(reader.stream)
            .map_err(|_| anyhow!("frame halves of {id} belong to different connections"))?;
        Ok(FramedConnection {
            framed,
            info: self.info,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_transport_config() {
        let config = TransportConfig::default();
        assert_eq!(config.max_frame_bytes, DEFAULT_MAX_FRAME_BYTES);
        assert!(config.connect_timeout > Duration::ZERO);
    }

    #[test]
    fn connection_ids_are_unique_and_displayable() {
        let a = ConnectionId::next();
        let b = ConnectionId::next();
        assert!(b > a);
        assert_eq!(ConnectionId(7).to_string(), "conn-7");
    }

    #[tokio::test]
    async fn tcp_frame_smoke_test() -> Result<()> {
        let server = TcpServer::bind("127.0.0.1:0".parse()?, TransportConfig::default()).await?;
        let addr = server.local_addr()?;

        let server_task = tokio::spawn(async move {
            let mut conn = server.accept().await?;
            let payload = conn
                .next_frame()
                .await
                .context("peer closed early")??;
            conn.send(payload).await?;
            conn.close().await;
            Result::<()>::Ok(())
        });

        let client = TcpClient::default();
        let mut conn = client.connect(addr).await?;
        assert_eq!(conn.info().peer_addr, addr);
        conn.send(Bytes::from_static(b"ping")).await?;
        let echoed = conn.next_frame().await.context("no echo")??;
        assert_eq!(echoed, Bytes::from_static(b"ping"));
        assert!(conn.next_frame().await.is_none());

        server_task.await.context("server task join")??;
        Ok(())
    }

    #[tokio::test]
    async fn split_halves_work_concurrently_and_reunite() -> Result<()> {
        let server = TcpServer::bind("127.0.0.1:0".parse()?, TransportConfig::default()).await?;
        let addr = server.local_addr()?;
        let server_task = tokio::spawn(async move {
            let conn = server.accept().await?;
            let id = conn.info().id;
            let (mut writer, mut reader) = conn.split();
            assert_eq!(writer.info().id, id);
            let payload = reader.next_frame().await.context("peer closed early")??;
            writer.send(payload).await?;
            let conn = writer.reunite(reader)?;
            assert_eq!(conn.info().id, id);
            conn.close().await;
            Result::<()>::Ok(())
        });

        let mut conn = TcpClient::default().connect(addr).await?;
        conn.send(Bytes::from_static(b"split")).await?;
        let echoed = conn.next_frame().await.context("no echo")??;
        assert_eq!(echoed, Bytes::from_static(b"split"));
        assert!(conn.next_frame().await.is_none());
        server_task.await.context("server task join")??;
        Ok(())
    }

    #[tokio::test]
    async fn reunite_rejects_halves_of_different_connections() -> Result<()> {
        let server = TcpServer::bind("127.0.0.1:0".parse()?, TransportConfig::default()).await?;
        let addr = server.local_addr()?;
        let client = TcpClient::default();
        let _a = client.connect(addr).await?;
        let _b = client.connect(addr).await?;
        let (writer, _) = server.accept().await?.split();
        let (_, reader) = server.accept().await?.split();
        assert!(writer.reunite(reader).is_err());
        Ok(())
    }

    #[tokio::test]
    async fn abort_resets_the_peer() -> Result<()> {
        let server = TcpServer::bind("127.0.0.1:0".parse()?, TransportConfig::default()).await?;
        let addr = server.local_addr()?;
        let server_task = tokio::spawn(async move {
            let conn = server.accept().await?;
            conn.abort();
            Result::<()>::Ok(())
        });

        let mut conn = TcpClient::default().connect(addr).await?;
        server_task.await.context("server task join")??;
        // Either a reset error or end of stream; never a frame.
        match conn.next_frame().await {
            None | Some(Err(_)) => {}
            Some(Ok(frame)) => panic!("unexpected frame {frame:?}"),
        }
        Ok(())
    }
}
