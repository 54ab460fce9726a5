//! The per-link connection record
//!
//! One [`GapLeConnection`] exists per connected remote device. It owns every
//! piece of GATT client state for that link (discovered services, discovery
//! jobs, subscriptions, Service Changed bookkeeping), so tearing the record
//! down releases all of it at once.

use crate::driver::ConnectionCompleteEvent;
use crate::gap::{BondingId, BtDeviceAddress, ClientSet, LinkRole};
use crate::gatt::discovery::DiscoveryState;
use crate::gatt::service_changed::ServiceChangedState;
use crate::gatt::subscriptions::Subscription;
use crate::gatt::types::{Characteristic, CharacteristicRef, Service};
use std::fmt;

/// Controller-assigned handle of a link, doubling as the GATT session id
pub type ConnectionHandle = u16;

/// Stack-assigned identity of one connection lifetime
///
/// Never reused, unlike controller handles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u32);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

/// A service tagged with the discovery generation that produced it
#[derive(Debug, Clone)]
pub(crate) struct DiscoveredService {
    pub generation: u32,
    pub service: Service,
}

/// State of one established LE link
#[derive(Debug)]
pub struct GapLeConnection {
    pub(crate) id: ConnectionId,
    pub(crate) handle: ConnectionHandle,
    pub(crate) device: BtDeviceAddress,
    pub(crate) role: LinkRole,
    pub(crate) bonding_id: Option<BondingId>,
    pub(crate) is_encrypted: bool,

    pub(crate) services: Vec<DiscoveredService>,
    pub(crate) discovery_generation: u32,
    pub(crate) discovery: DiscoveryState,
    pub(crate) subscriptions: Vec<Subscription>,
    pub(crate) service_changed: ServiceChangedState,

    /// Clients owed a "cancel connect" disconnection once the controller confirms the drop
    pub(crate) cancel_notice: ClientSet,
}

impl GapLeConnection {
    pub(crate) fn new(
        id: ConnectionId,
        event: &ConnectionCompleteEvent,
        bonding_id: Option<BondingId>,
    ) -> Self {
        Self {
            id,
            handle: event.handle,
            device: event.device,
            role: event.role,
            bonding_id,
            is_encrypted: false,
            services: Vec::new(),
            discovery_generation: 0,
            discovery: DiscoveryState::default(),
            subscriptions: Vec::new(),
            service_changed: ServiceChangedState::default(),
            cancel_notice: ClientSet::empty(),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn handle(&self) -> ConnectionHandle {
        self.handle
    }

    pub fn device(&self) -> &BtDeviceAddress {
        &self.device
    }

    pub fn role(&self) -> LinkRole {
        self.role
    }

    pub fn bonding_id(&self) -> Option<BondingId> {
        self.bonding_id
    }

    pub fn is_encrypted(&self) -> bool {
        self.is_encrypted
    }

    /// Services of the current discovery generation
    pub(crate) fn current_services(&self) -> impl Iterator<Item = &Service> {
        let generation = self.discovery_generation;
        self.services
            .iter()
            .filter(move |s| s.generation == generation)
            .map(|s| &s.service)
    }

    /// Resolves a characteristic reference against the cached services
    pub(crate) fn resolve_characteristic(
        &self,
        characteristic: &CharacteristicRef,
    ) -> Option<&Characteristic> {
        if characteristic.connection != self.id
            || characteristic.generation != self.discovery_generation
        {
            return None;
        }
        self.current_services()
            .flat_map(|s| s.characteristics.iter())
            .find(|c| c.value_handle == characteristic.value_handle)
    }

    pub(crate) fn characteristic_ref(&self, value_handle: u16) -> CharacteristicRef {
        CharacteristicRef {
            connection: self.id,
            generation: self.discovery_generation,
            value_handle,
        }
    }
}

/// All live connections
#[derive(Debug, Default)]
pub(crate) struct ConnectionTable {
    connections: Vec<GapLeConnection>,
    next_id: u32,
}

impl ConnectionTable {
    pub fn allocate_id(&mut self) -> ConnectionId {
        self.next_id = self.next_id.wrapping_add(1);
        ConnectionId(self.next_id)
    }

    pub fn insert(&mut self, connection: GapLeConnection) {
        self.connections.push(connection);
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &GapLeConnection> {
        self.connections.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut GapLeConnection> {
        self.connections.iter_mut()
    }

    pub fn find_by_device(&self, device: &BtDeviceAddress) -> Option<&GapLeConnection> {
        self.connections.iter().find(|c| c.device == *device)
    }

    pub fn find_by_device_mut(&mut self, device: &BtDeviceAddress) -> Option<&mut GapLeConnection> {
        self.connections.iter_mut().find(|c| c.device == *device)
    }

    pub fn find_by_handle_mut(&mut self, handle: ConnectionHandle) -> Option<&mut GapLeConnection> {
        self.connections.iter_mut().find(|c| c.handle == handle)
    }

    pub fn find_by_handle(&self, handle: ConnectionHandle) -> Option<&GapLeConnection> {
        self.connections.iter().find(|c| c.handle == handle)
    }

    pub fn find_by_id_mut(&mut self, id: ConnectionId) -> Option<&mut GapLeConnection> {
        self.connections.iter_mut().find(|c| c.id == id)
    }

    pub fn find_by_id(&self, id: ConnectionId) -> Option<&GapLeConnection> {
        self.connections.iter().find(|c| c.id == id)
    }

    pub fn find_by_bonding(&self, bonding_id: BondingId) -> Option<&GapLeConnection> {
        self.connections
            .iter()
            .find(|c| c.bonding_id == Some(bonding_id))
    }

    pub fn remove_by_handle(&mut self, handle: ConnectionHandle) -> Option<GapLeConnection> {
        let index = self.connections.iter().position(|c| c.handle == handle)?;
        Some(self.connections.remove(index))
    }

    pub fn drain(&mut self) -> Vec<GapLeConnection> {
        std::mem::take(&mut self.connections)
    }
}
