// Accept loops and client flows binding the roles to TCP connections.
use anyhow::Result;
use bytes::Bytes;
use comet_transport::{TcpClient, TcpServer, TransportConfig};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::handlers::publisher::PublisherRole;
use super::handlers::receiver::ReceiverRole;
use super::handlers::sender::SenderRole;
use super::handlers::subscriber::SubscriberRole;
use super::reconnect::{ReconnectEvent, ReconnectPolicy, Reconnector};
use super::{
    PUBLISHER_QUEUE_DEPTH, ProtocolMode, RegistryHandle, SharedHandler, drive, no_commands,
    telemetry,
};

pub use super::handlers::sender::SendOutcome;

/// Pause after a failed accept (for example EMFILE) before trying again.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Waits out [`ACCEPT_RETRY_DELAY`]; false when `cancel` fired first.
async fn accept_backoff(cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(ACCEPT_RETRY_DELAY) => true,
    }
}

/// Accepts subscriber connections and serves each as a publisher until
/// `cancel` fires.
pub async fn serve_publisher(
    server: Arc<TcpServer>,
    registry: RegistryHandle,
    local_ivorn: String,
    mode: ProtocolMode,
    cancel: CancellationToken,
) -> Result<()> {
    loop {
        let conn = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            conn = server.accept() => conn,
        };
        let conn = match conn {
            Ok(conn) => conn,
            Err(err) => {
                tracing::warn!(error = %err, "publisher accept failed");
                if !accept_backoff(&cancel).await {
                    return Ok(());
                }
                continue;
            }
        };
        let (tx, rx) = mpsc::channel(PUBLISHER_QUEUE_DEPTH);
        let mut role = PublisherRole::new(local_ivorn.clone(), registry.clone(), tx, mode);
        let cancel = cancel.clone();
        tokio::spawn(async move { drive(conn, &mut role, rx, cancel).await });
    }
}

/// Accepts one-shot senders; each connection delivers a single event.
pub async fn serve_receiver(
    server: Arc<TcpServer>,
    local_ivorn: String,
    handler: SharedHandler,
    cancel: CancellationToken,
) -> Result<()> {
    loop {
        let conn = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            conn = server.accept() => conn,
        };
        let conn = match conn {
            Ok(conn) => conn,
            Err(err) => {
                tracing::warn!(error = %err, "receiver accept failed");
                if !accept_backoff(&cancel).await {
                    return Ok(());
                }
                continue;
            }
        };
        let mut role = ReceiverRole::new(local_ivorn.clone(), Arc::clone(&handler));
        let cancel = cancel.clone();
        tokio::spawn(async move { drive(conn, &mut role, no_commands(), cancel).await });
    }
}

/// Keeps a subscription to `addr` alive, reconnecting with backoff whenever
/// the connection fails or is lost. Returns once `cancel` fires.
pub async fn run_subscriber(
    addr: SocketAddr,
    local_ivorn: String,
    handler: SharedHandler,
    policy: ReconnectPolicy,
    transport: TransportConfig,
    mode: ProtocolMode,
    cancel: CancellationToken,
) {
    let client = TcpClient::new(transport);
    let mut reconnector = Reconnector::new(policy);
    loop {
        reconnector.transition(ReconnectEvent::Start);
        telemetry::record_reconnect_attempt();
        let attempt = tokio::select! {
            _ = cancel.cancelled() => break,
            attempt = client.connect(addr) => attempt,
        };
        let (_, delay) = match attempt {
            Ok(conn) => {
                reconnector.transition(ReconnectEvent::Connected);
                let mut role =
                    SubscriberRole::new(local_ivorn.clone(), Arc::clone(&handler), mode);
                drive(conn, &mut role, no_commands(), cancel.clone()).await;
                if cancel.is_cancelled() {
                    break;
                }
                reconnector.transition(ReconnectEvent::ConnectionLost)
            }
            Err(err) => {
                tracing::warn!(remote = %addr, error = %err, "subscription connect failed");
                reconnector.transition(ReconnectEvent::ConnectFailed)
            }
        };
        let delay = reconnector.policy().jittered(delay.unwrap_or_default());
        tracing::info!(
            remote = %addr,
            delay_ms = delay.as_millis() as u64,
            retries = reconnector.retries(),
            state = ?reconnector.state(),
            "reconnect scheduled"
        );
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }
    reconnector.transition(ReconnectEvent::Stop);
    tracing::debug!(remote = %addr, "subscriber stopped");
}

/// Delivers one event to a remote receiver and waits for its single reply.
/// Never retries.
pub async fn send_event(
    addr: SocketAddr,
    event: Bytes,
    transport: TransportConfig,
) -> Result<SendOutcome> {
    let conn = TcpClient::new(transport).connect(addr).await?;
    let mut role = SenderRole::new(event);
    drive(conn, &mut role, no_commands(), CancellationToken::new()).await;
    let outcome = role.into_outcome();
    match &outcome {
        SendOutcome::Acknowledged => tracing::info!(remote = %addr, "event acknowledged"),
        other => tracing::warn!(remote = %addr, outcome = ?other, "event not acknowledged"),
    }
    Ok(outcome)
}
