// Publisher role: server side of a subscriber connection.
use bytes::Bytes;
use comet_transport::{ConnectionId, ConnectionInfo};
use comet_wire::{Message, Role, TransportMessage};
use tokio::sync::mpsc;

use crate::transport::tcp::errors::{ProtocolError, report};
use crate::transport::tcp::{ConnectionRole, ProtocolMode, Reaction, RegistryHandle};

const ROLE: &str = "publisher";

/// Number of outstanding heartbeats tolerated before a peer is declared dead.
pub const MAX_OUTSTANDING_HEARTBEATS: i64 = 1;

/// Inputs delivered to a publisher connection by the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublisherCommand {
    Keepalive,
    Event(Bytes),
}

/// Tracks liveness of one subscriber and forwards broadcast events to it.
///
/// `alive_count` counts heartbeats sent minus responses received. It is not
/// clamped: unsolicited responses drive it negative.
pub struct PublisherRole {
    local_ivorn: String,
    registry: RegistryHandle,
    commands: Option<mpsc::Sender<PublisherCommand>>,
    mode: ProtocolMode,
    alive_count: i64,
    conn: Option<ConnectionId>,
}

impl PublisherRole {
    /// `commands` is the sending half of the queue this connection's task
    /// reads; it is handed to the registry on connect.
    pub fn new(
        local_ivorn: impl Into<String>,
        registry: RegistryHandle,
        commands: mpsc::Sender<PublisherCommand>,
        mode: ProtocolMode,
    ) -> Self {
        Self {
            local_ivorn: local_ivorn.into(),
            registry,
            commands: Some(commands),
            mode,
            alive_count: 0,
            conn: None,
        }
    }

    pub fn alive_count(&self) -> i64 {
        self.alive_count
    }

    /// Heartbeat tick: either emit `iamalive` or give up on the peer.
    pub fn send_keepalive(&mut self) -> Reaction {
        if self.alive_count > MAX_OUTSTANDING_HEARTBEATS {
            report(
                self.conn,
                ROLE,
                &ProtocolError::DeadPeer {
                    missed: self.alive_count,
                },
            );
            return Reaction::abort();
        }
        self.alive_count += 1;
        Reaction::reply(TransportMessage::iamalive(&self.local_ivorn).to_bytes())
    }

    pub fn send_event(&mut self, event: Bytes) -> Reaction {
        Reaction::reply(event)
    }
}

impl ConnectionRole for PublisherRole {
    type Command = PublisherCommand;

    fn name(&self) -> &'static str {
        ROLE
    }

    fn on_connect(&mut self, info: &ConnectionInfo) -> Reaction {
        self.conn = Some(info.id);
        self.alive_count = 0;
        if let Some(commands) = self.commands.take() {
            self.registry.register(info.id, info.peer_addr, commands);
        }
        tracing::info!(conn_id = %info.id, peer = %info.peer_addr, "subscriber connected");
        Reaction::none()
    }

    fn on_frame(&mut self, payload: Bytes) -> Reaction {
        let message = match Message::parse(payload) {
            Ok(message) => message,
            Err(err) => {
                report(self.conn, ROLE, &err.into());
                return self.mode.on_error();
            }
        };
        match message.role() {
            Role::IAmAlive => {
                self.alive_count -= 1;
                tracing::debug!(alive_count = self.alive_count, "iamalive response received");
                Reaction::none()
            }
            other => {
                report(
                    self.conn,
                    ROLE,
                    &ProtocolError::violation(other.as_str(), "unexpected role"),
                );
                self.mode.on_error()
            }
        }
    }

    fn on_command(&mut self, command: PublisherCommand) -> Reaction {
        match command {
            PublisherCommand::Keepalive => self.send_keepalive(),
            PublisherCommand::Event(event) => self.send_event(event),
        }
    }

    fn on_disconnect(&mut self, info: &ConnectionInfo) {
        self.registry.deregister(info.id);
        tracing::info!(conn_id = %info.id, peer = %info.peer_addr, "subscriber disconnected");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::tcp::{Disposition, RegistryCommand};
    use std::net::SocketAddr;

    const LOCAL: &str = "ivo://comet.broker/pub";

    fn role() -> (
        PublisherRole,
        tokio::sync::mpsc::UnboundedReceiver<RegistryCommand>,
    ) {
        let (registry, inbox) = RegistryHandle::detached();
        let (tx, _rx) = mpsc::channel(4);
        (
            PublisherRole::new(LOCAL, registry, tx, ProtocolMode::Lenient),
            inbox,
        )
    }

    fn info() -> ConnectionInfo {
        ConnectionInfo {
            id: ConnectionId(11),
            peer_addr: "127.0.0.1:9".parse::<SocketAddr>().expect("addr"),
        }
    }

    fn response() -> Bytes {
        TransportMessage::iamalive_response("ivo://sub/x", LOCAL).to_bytes()
    }

    #[test]
    fn two_unanswered_heartbeats_abort_before_a_third() {
        let (mut role, _inbox) = role();
        role.on_connect(&info());
        let first = role.send_keepalive();
        assert!(first.reply.is_some());
        assert_eq!(role.alive_count(), 1);
        let second = role.send_keepalive();
        assert!(second.reply.is_some());
        assert_eq!(role.alive_count(), 2);
        let third = role.send_keepalive();
        assert_eq!(third.reply, None);
        assert_eq!(third.disposition, Disposition::Abort);
    }

    #[test]
    fn one_response_decrements_exactly_once() {
        let (mut role, _inbox) = role();
        role.on_connect(&info());
        role.send_keepalive();
        role.send_keepalive();
        assert_eq!(role.on_frame(response()), Reaction::none());
        assert_eq!(role.alive_count(), 1);
        // Answered peers keep receiving heartbeats.
        assert!(role.send_keepalive().reply.is_some());
    }

    #[test]
    fn heartbeat_payload_names_local_identifier() {
        let (mut role, _inbox) = role();
        let reply = role.send_keepalive().reply.expect("iamalive");
        let message = Message::parse(reply).expect("parse");
        assert_eq!(message.role(), &Role::IAmAlive);
        assert_eq!(message.origin(), Some(LOCAL));
    }

    #[test]
    fn other_roles_are_violations_without_reply() {
        let (mut role, _inbox) = role();
        let ack = TransportMessage::ack("ivo://sub/x", "ivo://x.y/z#1").to_bytes();
        assert_eq!(role.on_frame(ack), Reaction::none());
        assert_eq!(role.on_frame(Bytes::from_static(b"<<")), Reaction::none());
        assert_eq!(role.alive_count(), 0);
    }

    #[test]
    fn events_are_forwarded_verbatim() {
        let (mut role, _inbox) = role();
        let event = Bytes::from_static(br#"<VOEvent role="test" ivorn="ivo://x.y/z#2"/>"#);
        let reaction = role.on_command(PublisherCommand::Event(event.clone()));
        assert_eq!(reaction, Reaction::reply(event));
    }

    #[test]
    fn registration_follows_connection_lifetime() {
        let (mut role, mut inbox) = role();
        role.on_connect(&info());
        role.on_disconnect(&info());
        assert!(matches!(
            inbox.try_recv(),
            Ok(RegistryCommand::Register { id: ConnectionId(11), .. })
        ));
        assert!(matches!(
            inbox.try_recv(),
            Ok(RegistryCommand::Deregister { id: ConnectionId(11) })
        ));
    }
}
