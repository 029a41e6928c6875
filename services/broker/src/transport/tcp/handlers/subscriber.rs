// Subscriber role: a long-lived client receiving events from a remote publisher.
use bytes::Bytes;
use comet_transport::ConnectionId;
use comet_wire::{Message, Role, TransportMessage};
use std::convert::Infallible;

use crate::transport::tcp::errors::{ProtocolError, report};
use crate::transport::tcp::telemetry;
use crate::transport::tcp::{ConnectionRole, ProtocolMode, Reaction, SharedHandler};

const ROLE: &str = "subscriber";

/// Answers heartbeats, acknowledges and forwards events.
///
/// Exactly one reply per classified message; nothing for anything else.
pub struct SubscriberRole {
    local_ivorn: String,
    handler: SharedHandler,
    mode: ProtocolMode,
    conn: Option<ConnectionId>,
}

impl SubscriberRole {
    pub fn new(local_ivorn: impl Into<String>, handler: SharedHandler, mode: ProtocolMode) -> Self {
        Self {
            local_ivorn: local_ivorn.into(),
            handler,
            mode,
            conn: None,
        }
    }

    fn fail(&self, err: ProtocolError) -> Reaction {
        report(self.conn, ROLE, &err);
        self.mode.on_error()
    }
}

impl ConnectionRole for SubscriberRole {
    type Command = Infallible;

    fn name(&self) -> &'static str {
        ROLE
    }

    fn on_connect(&mut self, info: &comet_transport::ConnectionInfo) -> Reaction {
        self.conn = Some(info.id);
        tracing::info!(conn_id = %info.id, peer = %info.peer_addr, "subscribed to remote publisher");
        Reaction::none()
    }

    fn on_frame(&mut self, payload: Bytes) -> Reaction {
        let message = match Message::parse(payload) {
            Ok(message) => message,
            Err(err) => return self.fail(err.into()),
        };
        match message.role() {
            Role::IAmAlive => match message.origin() {
                Some(origin) => {
                    tracing::debug!(origin, "iamalive received");
                    Reaction::reply(
                        TransportMessage::iamalive_response(&self.local_ivorn, origin).to_bytes(),
                    )
                }
                None => self.fail(ProtocolError::violation(
                    message.role().as_str(),
                    "heartbeat without Origin",
                )),
            },
            role if role.is_event() => {
                let Some(ivorn) = message.ivorn() else {
                    return self.fail(ProtocolError::violation(role.as_str(), "event without ivorn"));
                };
                tracing::info!(ivorn, role = %role, "event received");
                telemetry::record_event_received(ROLE);
                let ack = TransportMessage::ack(&self.local_ivorn, ivorn).to_bytes();
                self.handler.handle(&message);
                Reaction::reply(ack)
            }
            other => self.fail(ProtocolError::violation(other.as_str(), "unexpected role")),
        }
    }

    fn on_command(&mut self, command: Infallible) -> Reaction {
        match command {}
    }

    fn on_disconnect(&mut self, info: &comet_transport::ConnectionInfo) {
        tracing::info!(conn_id = %info.id, peer = %info.peer_addr, "subscription connection lost");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::tcp::Disposition;
    use std::sync::{Arc, Mutex};

    const LOCAL: &str = "ivo://comet.broker/sub";

    fn recording() -> (SharedHandler, Arc<Mutex<Vec<String>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let handler: SharedHandler = Arc::new(move |event: &Message| {
            sink.lock()
                .expect("lock")
                .push(event.ivorn().unwrap_or_default().to_string());
        });
        (handler, seen)
    }

    fn frame(xml: &str) -> Bytes {
        Bytes::copy_from_slice(xml.as_bytes())
    }

    #[test]
    fn event_is_acked_and_handled_once() {
        let (handler, seen) = recording();
        let mut role = SubscriberRole::new(LOCAL, handler, ProtocolMode::Lenient);
        let reaction =
            role.on_frame(frame(r#"<VOEvent role="observation" ivorn="ivo://x.y/z#1"/>"#));
        let reply = Message::parse(reaction.reply.expect("ack")).expect("parse ack");
        assert_eq!(reply.role(), &Role::Ack);
        assert_eq!(reply.origin(), Some("ivo://x.y/z#1"));
        assert_eq!(reaction.disposition, Disposition::KeepOpen);
        assert_eq!(*seen.lock().expect("lock"), vec!["ivo://x.y/z#1".to_string()]);
    }

    #[test]
    fn heartbeat_gets_a_response_and_no_callback() {
        let (handler, seen) = recording();
        let mut role = SubscriberRole::new(LOCAL, handler, ProtocolMode::Lenient);
        let ping = TransportMessage::iamalive("ivo://remote.broker/pub").to_bytes();
        let reply = role.on_frame(ping).reply.expect("response");
        let reply = Message::parse(reply).expect("parse");
        assert_eq!(reply.role(), &Role::IAmAlive);
        assert_eq!(reply.origin(), Some("ivo://remote.broker/pub"));
        assert!(seen.lock().expect("lock").is_empty());
    }

    #[test]
    fn garbage_and_unknown_roles_get_no_reply() {
        let (handler, seen) = recording();
        let mut role = SubscriberRole::new(LOCAL, handler, ProtocolMode::Lenient);
        for input in [
            "<<<not xml",
            r#"<T role="bogus"/>"#,
            r#"<T role="ack"><Origin>x</Origin></T>"#,
            r#"<T role="iamalive"/>"#,
            r#"<VOEvent role="test"/>"#,
        ] {
            let reaction = role.on_frame(frame(input));
            assert_eq!(reaction, Reaction::none(), "{input}");
        }
        assert!(seen.lock().expect("lock").is_empty());
    }

    #[test]
    fn strict_mode_closes_on_bad_input() {
        let (handler, _) = recording();
        let mut role = SubscriberRole::new(LOCAL, handler, ProtocolMode::Strict);
        let reaction = role.on_frame(frame("<<<"));
        assert_eq!(reaction.reply, None);
        assert_eq!(reaction.disposition, Disposition::Close);
    }
}
