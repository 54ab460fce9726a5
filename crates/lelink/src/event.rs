//! Client-facing events
//!
//! Results of asynchronous operations reach the Kernel and App clients as
//! [`BleEvent`]s pushed through an [`EventSink`].

use crate::error::BtResult;
use crate::gap::{BondingId, BtDeviceAddress, ClientId, LinkEventReason};
use crate::gatt::types::{CharacteristicRef, SubscriptionType};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::Mutex;

/// Event delivered to one client
#[derive(Debug, Clone, PartialEq)]
pub enum BleEvent {
    /// Virtual connection state change for an intent the client owns
    Connection {
        device: BtDeviceAddress,
        bonding_id: Option<BondingId>,
        connected: bool,
        reason: LinkEventReason,
    },
    /// Terminal event of a discovery job, or a database-changed notice
    ServiceDiscovery {
        device: BtDeviceAddress,
        status: BtResult<()>,
    },
    /// Outcome of a subscribe/unsubscribe request
    Subscription {
        characteristic: CharacteristicRef,
        subscription_type: SubscriptionType,
        error: Option<crate::error::BtError>,
    },
    /// The client's notification buffer went from empty to non-empty
    NotificationsAvailable,
}

/// Delivers events into a client's queue; must never block
pub trait EventSink: Send + Sync {
    fn send(&self, client: ClientId, event: BleEvent);
}

/// Receiving ends of a [`ChannelEventSink`]
pub struct ClientReceivers {
    pub kernel: Receiver<BleEvent>,
    pub app: Receiver<BleEvent>,
}

impl ClientReceivers {
    pub fn for_client(&self, client: ClientId) -> &Receiver<BleEvent> {
        match client {
            ClientId::Kernel => &self.kernel,
            ClientId::App => &self.app,
        }
    }
}

/// One unbounded mpsc queue per client
pub struct ChannelEventSink {
    senders: Mutex<[Sender<BleEvent>; 2]>,
}

impl ChannelEventSink {
    pub fn new() -> (Self, ClientReceivers) {
        let (kernel_tx, kernel) = channel();
        let (app_tx, app) = channel();
        (
            Self {
                senders: Mutex::new([kernel_tx, app_tx]),
            },
            ClientReceivers { kernel, app },
        )
    }
}

impl EventSink for ChannelEventSink {
    fn send(&self, client: ClientId, event: BleEvent) {
        let senders = self
            .senders
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if senders[client.index()].send(event).is_err() {
            log::trace!("{:?} event queue closed, dropping event", client);
        }
    }
}
