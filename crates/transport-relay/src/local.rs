use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use groupcall_core::{ChannelError, ClientFrame, PeerId, RelayEvent, SignalingChannel};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::mpsc;
use uuid::Uuid;

struct Client {
    events: mpsc::UnboundedSender<RelayEvent>,
    name: Option<String>,
}

/// In-memory rendezvous relay for tests and single-process deployments.
#[derive(Default)]
pub struct LocalRelay {
    clients: RwLock<HashMap<PeerId, Client>>,
}

impl LocalRelay {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Join under a fresh random id.
    pub fn connect(self: &Arc<Self>) -> LocalRelayChannel {
        loop {
            let id = PeerId::new(Uuid::new_v4().to_string());
            if let Ok(channel) = self.connect_as(id) {
                return channel;
            }
        }
    }

    pub fn connect_as(
        self: &Arc<Self>,
        id: impl Into<PeerId>,
    ) -> Result<LocalRelayChannel, ChannelError> {
        let id = id.into();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        {
            let mut clients = self.clients.write();
            if clients.contains_key(&id) {
                return Err(ChannelError::Setup(format!("id {id} already connected")));
            }
            clients.insert(
                id.clone(),
                Client {
                    events: events_tx,
                    name: None,
                },
            );
        }
        tracing::debug!(client = %id, "relay client connected");
        Ok(LocalRelayChannel {
            id,
            relay: Arc::clone(self),
            events: Mutex::new(Some(events_rx)),
            connected: AtomicBool::new(true),
        })
    }

    pub fn clients(&self) -> Vec<PeerId> {
        let mut ids: Vec<PeerId> = self.clients.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Name announced by `id`, once it has announced readiness.
    pub fn name_of(&self, id: &PeerId) -> Option<String> {
        self.clients.read().get(id).and_then(|client| client.name.clone())
    }

    fn deliver(&self, from: &PeerId, frame: ClientFrame) -> Result<(), ChannelError> {
        match frame {
            ClientFrame::RequestIdentity => {
                self.reply(from, RelayEvent::IdentityAssigned(from.clone()))
            }
            ClientFrame::AnnounceReady { name } => {
                if let Some(client) = self.clients.write().get_mut(from) {
                    client.name = Some(name);
                }
                self.reply(from, RelayEvent::ReadyAck(from.clone()))
            }
            ClientFrame::Message(value) => {
                self.route(from, value);
                Ok(())
            }
        }
    }

    fn reply(&self, to: &PeerId, event: RelayEvent) -> Result<(), ChannelError> {
        let clients = self.clients.read();
        let client = clients.get(to).ok_or(ChannelError::Closed)?;
        client.events.send(event).map_err(|_| ChannelError::Closed)
    }

    fn route(&self, from: &PeerId, mut value: Value) {
        let Some(object) = value.as_object_mut() else {
            tracing::debug!(from = %from, "dropping non-object message");
            return;
        };
        let Some(to) = object.get("to").and_then(Value::as_str).map(PeerId::from) else {
            tracing::debug!(from = %from, "dropping message without recipient");
            return;
        };
        object.insert("from".into(), Value::String(from.to_string()));

        let clients = self.clients.read();
        match clients.get(&to) {
            Some(client) => {
                if client.events.send(RelayEvent::Message(value)).is_err() {
                    tracing::debug!(from = %from, to = %to, "recipient stopped listening");
                }
            }
            None => {
                tracing::debug!(from = %from, to = %to, "dropping message for unknown recipient")
            }
        }
    }

    fn remove(&self, id: &PeerId) {
        if self.clients.write().remove(id).is_some() {
            tracing::debug!(client = %id, "relay client disconnected");
        }
    }
}

/// One participant's connection to a [`LocalRelay`].
pub struct LocalRelayChannel {
    id: PeerId,
    relay: Arc<LocalRelay>,
    events: Mutex<Option<mpsc::UnboundedReceiver<RelayEvent>>>,
    connected: AtomicBool,
}

impl LocalRelayChannel {
    /// Id the relay assigned to this connection.
    pub fn id(&self) -> &PeerId {
        &self.id
    }
}

impl SignalingChannel for LocalRelayChannel {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn send(&self, frame: ClientFrame) -> Result<(), ChannelError> {
        if !self.is_connected() {
            return Err(ChannelError::Closed);
        }
        self.relay.deliver(&self.id, frame)
    }

    fn events(&self) -> Result<mpsc::UnboundedReceiver<RelayEvent>, ChannelError> {
        self.events.lock().take().ok_or(ChannelError::EventsTaken)
    }

    fn disconnect(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            self.relay.remove(&self.id);
        }
    }
}

impl Drop for LocalRelayChannel {
    fn drop(&mut self) {
        self.disconnect();
    }
}
