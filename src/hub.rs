//! Top-level bus plus the registry of live connections.

use std::{
    collections::HashMap,
    sync::{Arc, Weak},
};

use parking_lot::Mutex;
use tokio::sync::mpsc::UnboundedSender;
use tracing::info;

use crate::{
    bus::{Bus, Envelope, EventType, Handler, Payload},
    connection::{Connection, TransportId},
    error::RelayError,
};

/// Owns the relay-wide bus. Features listen here for `Connected` to attach
/// their per-connection handlers.
#[derive(Debug)]
pub struct Hub {
    bus: Arc<Bus>,
    registry: Mutex<Registry>,
}

#[derive(Debug, Default)]
struct Registry {
    connections: HashMap<TransportId, Arc<Connection>>,
    /// Set by [`Hub::disconnect_all`]; no registration succeeds afterwards.
    closed: bool,
}

impl Hub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            bus: Arc::new(Bus::new()),
            registry: Mutex::new(Registry::default()),
        })
    }

    pub fn bus(&self) -> &Arc<Bus> {
        &self.bus
    }

    /// Register a new connection for `transport` and bring it live.
    ///
    /// Returns `None`, after emitting `Error` on the hub bus, when the
    /// transport is already registered or the hub has been shut down.
    pub fn register(
        self: &Arc<Self>,
        transport: TransportId,
        outbox: UnboundedSender<String>,
    ) -> Option<Arc<Connection>> {
        let registered = {
            let mut registry = self.registry.lock();
            if registry.closed {
                Err(RelayError::HubClosed(transport.to_string()))
            } else if registry.connections.contains_key(&transport) {
                Err(RelayError::DuplicateConnection(transport.to_string()))
            } else {
                let conn = Connection::new(transport, outbox);
                registry.connections.insert(transport, Arc::clone(&conn));
                Ok(conn)
            }
        };
        let conn = match registered {
            Ok(conn) => conn,
            Err(err) => {
                self.bus.emit_payload(Payload::Error(err));
                return None;
            }
        };

        let hub: Weak<Hub> = Arc::downgrade(self);
        let deregister: Handler = Arc::new(move |_: &mut Envelope| {
            if let Some(hub) = hub.upgrade() {
                hub.registry.lock().connections.remove(&transport);
            }
        });
        conn.attach(vec![(EventType::Disconnect, deregister)]);

        self.bus.emit_payload(Payload::Connected(Arc::clone(&conn)));
        conn.connect();
        info!(%transport, "connection opened");
        Some(conn)
    }

    pub fn connection(&self, transport: TransportId) -> Option<Arc<Connection>> {
        self.registry.lock().connections.get(&transport).cloned()
    }

    pub fn len(&self) -> usize {
        self.registry.lock().connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Close the hub to new registrations, disconnect every registered
    /// connection, then emit `Shutdown`.
    pub fn disconnect_all(&self) {
        let connections: Vec<Arc<Connection>> = {
            let mut registry = self.registry.lock();
            registry.closed = true;
            registry.connections.values().cloned().collect()
        };
        for conn in connections {
            conn.disconnect();
        }
        // connections torn down while still pending never emit Disconnect
        self.registry.lock().connections.clear();
        self.bus.emit_payload(Payload::Shutdown);
    }
}
