//! Seams to the vendor controller driver and the persistent bonding store
//!
//! The controller is an untrusted, asynchronous event source. Every request
//! the stack makes is fire-and-forget; outcomes come back later as one of the
//! [`ControllerEvent`]s fed into [`BleStack::handle_controller_event`].
//!
//! [`BleStack::handle_controller_event`]: crate::BleStack::handle_controller_event

use crate::connection::ConnectionHandle;
use crate::error::BtResult;
use crate::gap::{BondingId, BtDeviceAddress, LinkRole};
use crate::gatt::types::{AttHandleRange, Service};

/// Requests the stack issues to the controller
pub trait Controller: Send + Sync {
    /// Adds a device to the connection whitelist
    fn whitelist_add(&self, device: &BtDeviceAddress) -> BtResult<()>;

    /// Removes a device from the connection whitelist
    fn whitelist_remove(&self, device: &BtDeviceAddress) -> BtResult<()>;

    /// Starts initiating connections to any whitelisted device
    fn create_connection(&self) -> BtResult<()>;

    /// Stops initiating. The controller confirms with a failed connection-complete.
    fn cancel_create_connection(&self) -> BtResult<()>;

    /// Terminates a link
    fn disconnect(&self, handle: ConnectionHandle, reason: u8) -> BtResult<()>;

    /// Starts discovering services within `range`
    fn start_discovery(&self, handle: ConnectionHandle, range: AttHandleRange) -> BtResult<()>;

    /// Stops the running discovery. Success means no completion will follow.
    fn stop_discovery(&self, handle: ConnectionHandle) -> BtResult<()>;

    /// Writes a Client Characteristic Configuration Descriptor
    fn write_cccd(&self, handle: ConnectionHandle, cccd_handle: u16, value: u16) -> BtResult<()>;

    /// Sends the local Service Changed indication covering `range`
    fn send_service_changed_indication(
        &self,
        handle: ConnectionHandle,
        range: AttHandleRange,
    ) -> BtResult<()>;
}

/// Read side of the persistent bonding store
pub trait BondingStore: Send + Sync {
    /// Identity address to whitelist for a bonding, `None` if the id is unknown
    fn device_for_bonding(&self, bonding_id: BondingId) -> Option<BtDeviceAddress>;

    /// Bonding a connected (possibly resolved) address belongs to
    fn bonding_for_device(&self, device: &BtDeviceAddress) -> Option<BondingId>;
}

/// LE Connection Complete
#[derive(Debug, Clone)]
pub struct ConnectionCompleteEvent {
    pub status: u8,
    pub handle: ConnectionHandle,
    pub device: BtDeviceAddress,
    pub role: LinkRole,
}

/// Disconnection Complete
#[derive(Debug, Clone)]
pub struct DisconnectionCompleteEvent {
    pub handle: ConnectionHandle,
    pub reason: u8,
}

/// Encryption Change
#[derive(Debug, Clone)]
pub struct EncryptionChangeEvent {
    pub handle: ConnectionHandle,
    pub status: u8,
    pub encrypted: bool,
}

/// Everything the controller driver reports to the stack
#[derive(Debug, Clone)]
pub enum ControllerEvent {
    ConnectionComplete(ConnectionCompleteEvent),
    DisconnectionComplete(DisconnectionCompleteEvent),
    EncryptionChange(EncryptionChangeEvent),
    /// One service (with its characteristics and descriptors) found by the running discovery
    ServiceDiscovered {
        handle: ConnectionHandle,
        service: Service,
    },
    /// The running discovery finished, `status` 0 on success
    ServiceDiscoveryComplete {
        handle: ConnectionHandle,
        status: i32,
    },
    /// Response to a CCCD write, `status` 0 on success
    CccdWriteResponse {
        handle: ConnectionHandle,
        cccd_handle: u16,
        status: i32,
    },
    /// The remote subscribed to our Service Changed characteristic
    ServiceChangedSubscribed { handle: ConnectionHandle },
    /// Inbound notification or indication
    HandleValue {
        handle: ConnectionHandle,
        att_handle: u16,
        value: Vec<u8>,
    },
}
