// Entry point and shared types for the broker TCP transport adapter.
//! VOEvent transport over TCP: role state machines, the publisher registry,
//! the keepalive scheduler and the reconnecting subscriber client.

mod conn;
mod errors;
mod keepalive;
mod reconnect;
mod registry;
mod server;
mod telemetry;

pub mod handlers {
    pub mod publisher;
    pub mod receiver;
    pub mod sender;
    pub mod subscriber;
}

use comet_wire::Message;
use std::sync::Arc;
use tokio::sync::mpsc;

pub use conn::{ConnectionRole, Disposition, OUTBOUND_QUEUE_DEPTH, Reaction, drive};
pub use errors::ProtocolError;
pub use keepalive::KeepaliveScheduler;
pub use reconnect::{ReconnectEvent, ReconnectPolicy, ReconnectState, Reconnector};
pub use registry::{PublisherRegistry, RegistryCommand, RegistryHandle, spawn_registry};
pub use server::{SendOutcome, run_subscriber, send_event, serve_publisher, serve_receiver};

/// Per-connection queue depth for commands fanned out by the registry.
pub(crate) const PUBLISHER_QUEUE_DEPTH: usize = 1024;

/// How persistent roles (subscriber, publisher) treat unparsable or
/// incomprehensible input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProtocolMode {
    /// Log and keep the connection open.
    #[default]
    Lenient,
    /// Log and close the connection.
    Strict,
}

impl ProtocolMode {
    pub fn from_strict(strict: bool) -> Self {
        if strict {
            ProtocolMode::Strict
        } else {
            ProtocolMode::Lenient
        }
    }

    pub(crate) fn on_error(self) -> Reaction {
        match self {
            ProtocolMode::Lenient => Reaction::none(),
            ProtocolMode::Strict => Reaction::close(),
        }
    }
}

/// Callback invoked with every event accepted by a subscriber or receiver.
///
/// ```
/// use broker::transport::tcp::EventHandler;
/// use comet_wire::Message;
///
/// let handler = |event: &Message| println!("{:?}", event.ivorn());
/// fn takes(_: &dyn EventHandler) {}
/// takes(&handler);
/// ```
pub trait EventHandler: Send + Sync {
    fn handle(&self, event: &Message);
}

impl<F> EventHandler for F
where
    F: Fn(&Message) + Send + Sync,
{
    fn handle(&self, event: &Message) {
        self(event)
    }
}

pub type SharedHandler = Arc<dyn EventHandler>;

/// A command receiver that never yields, for roles without commands.
pub(crate) fn no_commands<T>() -> mpsc::Receiver<T> {
    let (_tx, rx) = mpsc::channel(1);
    rx
}
