use std::time::Duration;

use crate::presence::PresenceRegistry;
use crate::store::StoreHandle;
use crate::transport::TransportHandle;

/// Timing and batching knobs consumed by the delivery engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliverySettings {
    /// Bound on a single live acknowledgement round trip.
    pub ack_timeout: Duration,
    pub flush_batch_size: usize,
    pub flush_ack_timeout: Duration,
}

impl Default for DeliverySettings {
    fn default() -> Self {
        Self {
            ack_timeout: Duration::from_millis(2000),
            flush_batch_size: 10,
            flush_ack_timeout: Duration::from_millis(2000),
        }
    }
}

/// Shared handle to the delivery engine.
///
/// Cheap to clone; every clone sees the same presence registry, transport
/// and store. Operations live in the `delivery`, `outbox`, `contact`,
/// `reconcile`, `channels`, `messages` and `handlers` modules.
#[derive(Clone)]
pub struct Courier {
    presence: PresenceRegistry,
    transport: TransportHandle,
    store: StoreHandle,
    settings: DeliverySettings,
}

impl Courier {
    pub fn new(transport: TransportHandle, store: StoreHandle, settings: DeliverySettings) -> Self {
        Self {
            presence: PresenceRegistry::new(),
            transport,
            store,
            settings,
        }
    }

    pub fn presence(&self) -> &PresenceRegistry {
        &self.presence
    }

    pub fn transport(&self) -> &TransportHandle {
        &self.transport
    }

    pub fn store(&self) -> &StoreHandle {
        &self.store
    }

    pub fn settings(&self) -> &DeliverySettings {
        &self.settings
    }
}
