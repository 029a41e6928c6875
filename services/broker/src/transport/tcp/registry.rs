// Publisher registry: the set of live subscriber connections, owned by one task.
use bytes::Bytes;
use comet_transport::ConnectionId;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::handlers::publisher::PublisherCommand;
use super::telemetry;

#[derive(Debug)]
pub enum RegistryCommand {
    Register {
        id: ConnectionId,
        peer_addr: SocketAddr,
        commands: mpsc::Sender<PublisherCommand>,
    },
    Deregister {
        id: ConnectionId,
    },
    Broadcast(Bytes),
    Heartbeat,
    Members(oneshot::Sender<Vec<ConnectionId>>),
}

#[derive(Debug)]
struct Member {
    peer_addr: SocketAddr,
    commands: mpsc::Sender<PublisherCommand>,
}

/// Live publisher connections keyed by connection id.
///
/// Members whose command queue has closed are pruned on the next fan-out,
/// so an entry never outlives its connection for long even if a deregister
/// is still in flight.
#[derive(Debug, Default)]
pub struct PublisherRegistry {
    members: BTreeMap<ConnectionId, Member>,
}

impl PublisherRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        id: ConnectionId,
        peer_addr: SocketAddr,
        commands: mpsc::Sender<PublisherCommand>,
    ) {
        self.members.insert(id, Member { peer_addr, commands });
    }

    /// Idempotent; returns whether `id` was present.
    pub fn deregister(&mut self, id: ConnectionId) -> bool {
        self.members.remove(&id).is_some()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn ids(&self) -> Vec<ConnectionId> {
        self.members.keys().copied().collect()
    }

    /// Queues `command` on every member in id order; returns how many
    /// accepted it.
    pub fn fan_out(&mut self, command: PublisherCommand) -> usize {
        let mut delivered = 0;
        let mut gone = Vec::new();
        for (id, member) in &self.members {
            match member.commands.try_send(command.clone()) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::warn!(conn_id = %id, peer = %member.peer_addr, "publisher queue full; dropping command");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => gone.push(*id),
            }
        }
        for id in gone {
            self.members.remove(&id);
        }
        delivered
    }

    fn apply(&mut self, command: RegistryCommand) {
        match command {
            RegistryCommand::Register {
                id,
                peer_addr,
                commands,
            } => self.register(id, peer_addr, commands),
            RegistryCommand::Deregister { id } => {
                self.deregister(id);
            }
            RegistryCommand::Broadcast(event) => {
                let delivered = self.fan_out(PublisherCommand::Event(event));
                tracing::debug!(delivered, "event broadcast");
            }
            RegistryCommand::Heartbeat => {
                self.fan_out(PublisherCommand::Keepalive);
            }
            RegistryCommand::Members(reply) => {
                let _ = reply.send(self.ids());
            }
        }
        telemetry::set_publisher_connections(self.len());
    }
}

/// Cloneable front end to the registry task.
#[derive(Debug, Clone)]
pub struct RegistryHandle {
    tx: mpsc::UnboundedSender<RegistryCommand>,
}

impl RegistryHandle {
    /// A handle with no task behind it; commands land in the returned
    /// receiver.
    pub fn detached() -> (Self, mpsc::UnboundedReceiver<RegistryCommand>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn submit(&self, command: RegistryCommand) {
        if self.tx.send(command).is_err() {
            tracing::debug!("publisher registry stopped; command dropped");
        }
    }

    pub fn register(
        &self,
        id: ConnectionId,
        peer_addr: SocketAddr,
        commands: mpsc::Sender<PublisherCommand>,
    ) {
        self.submit(RegistryCommand::Register {
            id,
            peer_addr,
            commands,
        });
    }

    pub fn deregister(&self, id: ConnectionId) {
        self.submit(RegistryCommand::Deregister { id });
    }

    /// Sends `event` to every current subscriber.
    pub fn broadcast(&self, event: Bytes) {
        self.submit(RegistryCommand::Broadcast(event));
    }

    pub fn heartbeat(&self) {
        self.submit(RegistryCommand::Heartbeat);
    }

    pub async fn members(&self) -> Vec<ConnectionId> {
        let (tx, rx) = oneshot::channel();
        self.submit(RegistryCommand::Members(tx));
        rx.await.unwrap_or_default()
    }
}

/// Starts the task owning the registry. It runs until `cancel` fires or
/// every handle has been dropped.
pub fn spawn_registry(cancel: CancellationToken) -> (RegistryHandle, JoinHandle<()>) {
    let (handle, mut rx) = RegistryHandle::detached();
    let task = tokio::spawn(async move {
        let mut registry = PublisherRegistry::new();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                command = rx.recv() => match command {
                    Some(command) => registry.apply(command),
                    None => break,
                },
            }
        }
        tracing::debug!(members = registry.len(), "publisher registry stopped");
    });
    (handle, task)
}
