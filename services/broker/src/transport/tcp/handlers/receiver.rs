// Receiver role: one-shot server side accepting a single event.
use bytes::Bytes;
use comet_transport::{ConnectionId, ConnectionInfo};
use comet_wire::{Message, TransportMessage};
use std::convert::Infallible;

use crate::transport::tcp::errors::{ProtocolError, report};
use crate::transport::tcp::telemetry;
use crate::transport::tcp::{ConnectionRole, Reaction, SharedHandler};

const ROLE: &str = "receiver";

/// Acknowledges and hands off one event, then closes whatever arrived.
pub struct ReceiverRole {
    local_ivorn: String,
    handler: SharedHandler,
    conn: Option<ConnectionId>,
}

impl ReceiverRole {
    pub fn new(local_ivorn: impl Into<String>, handler: SharedHandler) -> Self {
        Self {
            local_ivorn: local_ivorn.into(),
            handler,
            conn: None,
        }
    }
}

impl ConnectionRole for ReceiverRole {
    type Command = Infallible;

    fn name(&self) -> &'static str {
        ROLE
    }

    fn on_connect(&mut self, info: &ConnectionInfo) -> Reaction {
        self.conn = Some(info.id);
        tracing::debug!(conn_id = %info.id, peer = %info.peer_addr, "sender connected");
        Reaction::none()
    }

    fn on_frame(&mut self, payload: Bytes) -> Reaction {
        let message = match Message::parse(payload) {
            Ok(message) => message,
            Err(err) => {
                report(self.conn, ROLE, &err.into());
                return Reaction::close();
            }
        };
        let role = message.role();
        if !role.is_event() {
            report(
                self.conn,
                ROLE,
                &ProtocolError::violation(role.as_str(), "unexpected role"),
            );
            return Reaction::close();
        }
        let Some(ivorn) = message.ivorn() else {
            report(
                self.conn,
                ROLE,
                &ProtocolError::violation(role.as_str(), "event without ivorn"),
            );
            return Reaction::close();
        };
        tracing::info!(ivorn, role = %role, "event received");
        telemetry::record_event_received(ROLE);
        let ack = TransportMessage::ack(&self.local_ivorn, ivorn).to_bytes();
        self.handler.handle(&message);
        Reaction::reply(ack).then_close()
    }

    fn on_command(&mut self, command: Infallible) -> Reaction {
        match command {}
    }
}
