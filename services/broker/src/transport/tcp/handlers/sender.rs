// Sender role: one-shot client that delivers a single event.
use bytes::Bytes;
use comet_transport::{ConnectionId, ConnectionInfo};
use comet_wire::{Message, Role};
use std::convert::Infallible;

use crate::transport::tcp::errors::{ProtocolError, report};
use crate::transport::tcp::{ConnectionRole, Reaction};

const ROLE: &str = "sender";

/// Result of a one-shot delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// The receiver acknowledged the event.
    Acknowledged,
    /// The receiver replied with something other than an ack.
    Rejected { role: String },
    /// The reply could not be parsed.
    Unparsable,
    /// The connection ended before any reply arrived.
    NoReply,
}

/// Sends the event on connect, then closes after exactly one reply.
pub struct SenderRole {
    event: Option<Bytes>,
    outcome: SendOutcome,
    conn: Option<ConnectionId>,
}

impl SenderRole {
    pub fn new(event: Bytes) -> Self {
        Self {
            event: Some(event),
            outcome: SendOutcome::NoReply,
            conn: None,
        }
    }

    pub fn outcome(&self) -> &SendOutcome {
        &self.outcome
    }

    pub fn into_outcome(self) -> SendOutcome {
        self.outcome
    }
}

impl ConnectionRole for SenderRole {
    type Command = Infallible;

    fn name(&self) -> &'static str {
        ROLE
    }

    fn on_connect(&mut self, info: &ConnectionInfo) -> Reaction {
        self.conn = Some(info.id);
        match self.event.take() {
            Some(event) => Reaction::reply(event),
            None => Reaction::close(),
        }
    }

    fn on_frame(&mut self, payload: Bytes) -> Reaction {
        self.outcome = match Message::parse(payload) {
            Ok(message) if message.role() == &Role::Ack => {
                tracing::info!(
                    origin = message.origin().unwrap_or_default(),
                    "acknowledgement received"
                );
                SendOutcome::Acknowledged
            }
            Ok(message) => {
                let role = message.role().as_str().to_string();
                report(
                    self.conn,
                    ROLE,
                    &ProtocolError::violation(role.clone(), "expected ack"),
                );
                SendOutcome::Rejected { role }
            }
            Err(err) => {
                report(self.conn, ROLE, &err.into());
                SendOutcome::Unparsable
            }
        };
        Reaction::close()
    }

    fn on_command(&mut self, command: Infallible) -> Reaction {
        match command {}
    }
}
