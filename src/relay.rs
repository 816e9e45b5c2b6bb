//! Relay-wide state and the hub the protocol pipeline is installed on.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{
    bus::Payload, config::Settings, deletion::Deletions, hub::Hub, pipeline, storage::Store,
};

/// NIP-11 relay information document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InfoDocument {
    pub name: String,
    pub description: String,
    /// Always "strand".
    pub software: String,
    pub version: String,
    /// Filled in by each feature when the document is requested.
    pub supported_nips: Vec<u32>,
}

/// Store and deletion bookkeeping. They are mutated together under one lock
/// so that a tombstone and the matching purge are never observed apart.
#[derive(Debug, Default)]
pub struct RelayState {
    pub store: Store,
    pub deletions: Deletions,
}

#[derive(Debug)]
pub struct Relay {
    hub: Arc<Hub>,
    state: Arc<Mutex<RelayState>>,
    name: String,
    description: String,
    verify_sig: bool,
}

impl Relay {
    /// Build a relay and install the protocol pipeline on its hub.
    pub fn new(settings: &Settings) -> Arc<Self> {
        let relay = Arc::new(Self {
            hub: Hub::new(),
            state: Arc::new(Mutex::new(RelayState::default())),
            name: settings.relay_name.clone(),
            description: settings.relay_description.clone(),
            verify_sig: settings.verify_sig,
        });
        pipeline::install(&relay.hub, Arc::clone(&relay.state), relay.verify_sig);
        relay
    }

    pub fn hub(&self) -> &Arc<Hub> {
        &self.hub
    }

    pub fn state(&self) -> &Arc<Mutex<RelayState>> {
        &self.state
    }

    pub fn verify_sig(&self) -> bool {
        self.verify_sig
    }

    /// Assemble the information document, letting every feature on the hub
    /// append the NIPs it implements.
    pub fn info_document(&self) -> InfoDocument {
        let base = InfoDocument {
            name: self.name.clone(),
            description: self.description.clone(),
            software: env!("CARGO_PKG_NAME").into(),
            version: env!("CARGO_PKG_VERSION").into(),
            supported_nips: Vec::new(),
        };
        let envelope = self.hub.bus().emit_payload(Payload::RelayInfo(base.clone()));
        let mut doc = match envelope.into_payload() {
            Payload::RelayInfo(doc) => doc,
            _ => base,
        };
        doc.supported_nips.sort_unstable();
        doc.supported_nips.dedup();
        doc
    }

    /// Disconnect every client.
    pub fn shutdown(&self) {
        info!(connections = self.hub.len(), "shutting down relay");
        self.hub.disconnect_all();
    }
}
