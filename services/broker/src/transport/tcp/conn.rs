// Per-connection driver shared by all four protocol roles.
use bytes::Bytes;
use comet_transport::{ConnectionInfo, FrameWriter, FramedConnection};
use tokio::sync::mpsc;
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;

use super::errors::{ProtocolError, report};
use super::telemetry;

/// What the connection should do after a role has handled an input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    KeepOpen,
    /// Flush any reply, then shut the connection down gracefully.
    Close,
    /// Reset the connection without sending anything further.
    Abort,
}

/// Outcome of a role callback: at most one reply plus a disposition.
/// "No reply" is an ordinary outcome, not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reaction {
    pub reply: Option<Bytes>,
    pub disposition: Disposition,
}

impl Reaction {
    pub fn none() -> Self {
        Self {
            reply: None,
            disposition: Disposition::KeepOpen,
        }
    }

    pub fn reply(payload: Bytes) -> Self {
        Self {
            reply: Some(payload),
            disposition: Disposition::KeepOpen,
        }
    }

    pub fn close() -> Self {
        Self {
            reply: None,
            disposition: Disposition::Close,
        }
    }

    pub fn abort() -> Self {
        Self {
            reply: None,
            disposition: Disposition::Abort,
        }
    }

    pub fn then_close(mut self) -> Self {
        self.disposition = Disposition::Close;
        self
    }
}

/// Behaviour of one end of a connection.
///
/// Implementations are plain state machines: they never touch the socket.
/// The driver feeds them inputs in arrival order and carries out the
/// returned [`Reaction`].
pub trait ConnectionRole: Send {
    /// Out-of-band inputs delivered to the connection task (heartbeat ticks,
    /// broadcast events). Roles without any use `std::convert::Infallible`.
    type Command: Send + 'static;

    fn name(&self) -> &'static str;

    fn on_connect(&mut self, _info: &ConnectionInfo) -> Reaction {
        Reaction::none()
    }

    fn on_frame(&mut self, payload: Bytes) -> Reaction;

    fn on_command(&mut self, command: Self::Command) -> Reaction;

    /// Called exactly once when the connection ends, whatever the cause.
    fn on_disconnect(&mut self, _info: &ConnectionInfo) {}
}

/// Frames a connection may have queued for its writer before the peer is
/// treated as stalled and aborted.
pub const OUTBOUND_QUEUE_DEPTH: usize = 64;

#[derive(Debug, PartialEq, Eq)]
enum Ending {
    PeerClosed,
    Close,
    Abort,
    Failed,
    Cancelled,
}

/// Runs `role` over `conn` until either side ends the connection or
/// `cancel` fires. [`ConnectionRole::on_disconnect`] runs in every case.
///
/// Frames are written by a separate task fed through a bounded queue, so a
/// peer that stops reading never blocks frame handling or commands. A full
/// queue aborts the connection.
///
/// `commands` may be a receiver whose sender has already been dropped; it is
/// simply ignored once closed.
pub async fn drive<R: ConnectionRole>(
    conn: FramedConnection,
    role: &mut R,
    mut commands: mpsc::Receiver<R::Command>,
    cancel: CancellationToken,
) {
    let info = conn.info().clone();
    let name = role.name();
    tracing::debug!(conn_id = %info.id, peer = %info.peer_addr, role = name, "connection opened");

    let (writer, mut reader) = conn.split();
    let (outbound, queued) = mpsc::channel(OUTBOUND_QUEUE_DEPTH);
    let stop = CancellationToken::new();
    let mut writer_task = tokio::spawn(write_loop(writer, queued, stop.clone(), name));
    let mut writer_exited: Option<Result<FrameWriter, JoinError>> = None;

    let reaction = role.on_connect(&info);
    let mut pending = apply(&outbound, &info, name, reaction);
    let mut commands_open = true;

    let ending = loop {
        if let Some(ending) = pending.take() {
            break ending;
        }
        tokio::select! {
            _ = cancel.cancelled() => pending = Some(Ending::Cancelled),
            // The writer only exits on its own after a failed write.
            joined = &mut writer_task, if writer_exited.is_none() => {
                writer_exited = Some(joined);
                pending = Some(Ending::Failed);
            }
            frame = reader.next_frame() => {
                pending = match frame {
                    None => Some(Ending::PeerClosed),
                    Some(Err(err)) => {
                        report(Some(info.id), name, &ProtocolError::Frame(err));
                        Some(Ending::Failed)
                    }
                    Some(Ok(payload)) => {
                        telemetry::record_frame_in(name);
                        let reaction = role.on_frame(payload);
                        apply(&outbound, &info, name, reaction)
                    }
                };
            }
            command = commands.recv(), if commands_open => {
                match command {
                    Some(command) => {
                        let reaction = role.on_command(command);
                        pending = apply(&outbound, &info, name, reaction);
                    }
                    None => commands_open = false,
                }
            }
        }
    };

    // Graceful endings let the writer drain what is already queued.
    let graceful = matches!(ending, Ending::Close | Ending::PeerClosed);
    drop(outbound);
    if !graceful {
        stop.cancel();
    }
    let writer = match writer_exited {
        Some(joined) => joined.ok(),
        None => tokio::select! {
            joined = &mut writer_task => joined.ok(),
            _ = cancel.cancelled() => {
                stop.cancel();
                writer_task.await.ok()
            }
        },
    };

    match (&ending, writer) {
        (Ending::Close | Ending::PeerClosed, Some(writer)) => {
            tokio::select! {
                _ = writer.close() => {}
                _ = cancel.cancelled() => {}
            }
        }
        (Ending::Abort, Some(writer)) => match writer.reunite(reader) {
            Ok(conn) => conn.abort(),
            Err(err) => tracing::debug!(conn_id = %info.id, error = %err, "abort without reset"),
        },
        _ => {}
    }
    role.on_disconnect(&info);
    tracing::debug!(conn_id = %info.id, role = name, ending = ?ending, "connection closed");
}

/// Writes queued frames in order until the queue closes or `stop` fires,
/// then hands the write half back.
async fn write_loop(
    mut writer: FrameWriter,
    mut queued: mpsc::Receiver<Bytes>,
    stop: CancellationToken,
    name: &'static str,
) -> FrameWriter {
    loop {
        let payload = tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            payload = queued.recv() => match payload {
                Some(payload) => payload,
                None => break,
            },
        };
        let sent = tokio::select! {
            _ = stop.cancelled() => break,
            sent = writer.send(payload) => sent,
        };
        if let Err(err) = sent {
            report(Some(writer.info().id), name, &ProtocolError::Frame(err));
            break;
        }
        telemetry::record_frame_out(name);
    }
    writer
}

fn apply(
    outbound: &mpsc::Sender<Bytes>,
    info: &ConnectionInfo,
    name: &'static str,
    reaction: Reaction,
) -> Option<Ending> {
    if reaction.disposition == Disposition::Abort {
        return Some(Ending::Abort);
    }
    match reaction.reply {
        Some(reply) => match outbound.try_send(reply) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                report(
                    Some(info.id),
                    name,
                    &ProtocolError::Stalled {
                        queued: OUTBOUND_QUEUE_DEPTH,
                    },
                );
                return Some(Ending::Abort);
            }
            // The writer has already failed and reported why.
            Err(mpsc::error::TrySendError::Closed(_)) => return Some(Ending::Failed),
        },
        None => {
            tracing::trace!(conn_id = %info.id, role = name, "no reply to send");
        }
    }
    match reaction.disposition {
        Disposition::KeepOpen => None,
        Disposition::Close => Some(Ending::Close),
        Disposition::Abort => Some(Ending::Abort),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use comet_transport::{ConnectionId, TcpClient, TcpServer, TransportConfig};
    use std::convert::Infallible;
    use std::net::SocketAddr;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn info() -> ConnectionInfo {
        ConnectionInfo {
            id: ConnectionId(5),
            peer_addr: "127.0.0.1:9".parse::<SocketAddr>().expect("addr"),
        }
    }

    #[test]
    fn reaction_constructors() {
        assert_eq!(Reaction::none().reply, None);
        assert_eq!(Reaction::none().disposition, Disposition::KeepOpen);
        let reply = Reaction::reply(Bytes::from_static(b"<x/>")).then_close();
        assert_eq!(reply.reply.as_deref(), Some(&b"<x/>"[..]));
        assert_eq!(reply.disposition, Disposition::Close);
        assert_eq!(Reaction::abort().disposition, Disposition::Abort);
        assert_eq!(Reaction::close().reply, None);
    }

    #[test]
    fn replies_are_queued_for_the_writer() {
        let (tx, mut rx) = mpsc::channel(2);
        let reply = Bytes::from_static(b"<ack/>");
        assert_eq!(apply(&tx, &info(), "test", Reaction::reply(reply.clone())), None);
        assert_eq!(
            apply(&tx, &info(), "test", Reaction::none().then_close()),
            Some(Ending::Close)
        );
        assert_eq!(rx.try_recv().expect("queued"), reply);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn full_outbound_queue_aborts() {
        let (tx, _rx) = mpsc::channel(1);
        let reply = || Reaction::reply(Bytes::from_static(b"<e/>"));
        assert_eq!(apply(&tx, &info(), "test", reply()), None);
        assert_eq!(apply(&tx, &info(), "test", reply()), Some(Ending::Abort));
    }

    #[test]
    fn closed_outbound_queue_fails() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let reaction = Reaction::reply(Bytes::from_static(b"<e/>"));
        assert_eq!(apply(&tx, &info(), "test", reaction), Some(Ending::Failed));
    }

    struct Counting {
        disconnects: Arc<AtomicUsize>,
    }

    impl ConnectionRole for Counting {
        type Command = Infallible;

        fn name(&self) -> &'static str {
            "test"
        }

        fn on_frame(&mut self, _payload: Bytes) -> Reaction {
            Reaction::none()
        }

        fn on_command(&mut self, command: Infallible) -> Reaction {
            match command {}
        }

        fn on_disconnect(&mut self, _info: &ConnectionInfo) {
            self.disconnects.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn cancellation_still_runs_disconnect() -> anyhow::Result<()> {
        let server = TcpServer::bind("127.0.0.1:0".parse()?, TransportConfig::default()).await?;
        let _client = TcpClient::default().connect(server.local_addr()?).await?;
        let conn = server.accept().await?;

        let disconnects = Arc::new(AtomicUsize::new(0));
        let mut role = Counting {
            disconnects: Arc::clone(&disconnects),
        };
        let cancel = CancellationToken::new();
        let (_tx, rx) = mpsc::channel(1);
        let task = tokio::spawn({
            let cancel = cancel.clone();
            async move { drive(conn, &mut role, rx, cancel).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(disconnects.load(Ordering::SeqCst), 0);
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), task).await??;
        assert_eq!(disconnects.load(Ordering::SeqCst), 1);
        Ok(())
    }
}
