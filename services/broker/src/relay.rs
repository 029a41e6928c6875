// Event relay: forwards accepted events to every local subscriber.
use comet_common::validate_ivorn;
use comet_wire::Message;

use crate::transport::tcp::{EventHandler, RegistryHandle};

/// Broadcasts each accepted event through the publisher registry.
/// Events with an invalid IVORN are logged and dropped.
#[derive(Debug, Clone)]
pub struct RelayHandler {
    registry: RegistryHandle,
}

impl RelayHandler {
    pub fn new(registry: RegistryHandle) -> Self {
        Self { registry }
    }
}

impl EventHandler for RelayHandler {
    fn handle(&self, event: &Message) {
        let ivorn = event.ivorn().unwrap_or_default();
        match validate_ivorn(ivorn) {
            Ok(_) => {
                tracing::debug!(ivorn, "relaying event");
                self.registry.broadcast(event.payload().clone());
            }
            Err(err) => {
                tracing::warn!(ivorn, error = %err, "not relaying event with invalid ivorn");
            }
        }
    }
}
