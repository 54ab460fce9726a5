use crate::gap::constants::*;
use bitflags::bitflags;
use std::fmt;

/// 48-bit Bluetooth device address, stored little-endian as on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct BdAddr {
    pub bytes: [u8; 6],
}

impl BdAddr {
    pub fn new(bytes: [u8; 6]) -> Self {
        Self { bytes }
    }

    /// The all-zero address never identifies a peer
    pub fn is_zero(&self) -> bool {
        self.bytes == [0u8; 6]
    }
}

impl fmt::Display for BdAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            self.bytes[5],
            self.bytes[4],
            self.bytes[3],
            self.bytes[2],
            self.bytes[1],
            self.bytes[0]
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum AddressType {
    #[default]
    Public,
    Random,
    PublicIdentity,
    RandomIdentity,
}

/// A remote device: address plus address type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct BtDeviceAddress {
    pub address: BdAddr,
    pub address_type: AddressType,
}

impl BtDeviceAddress {
    pub fn new(address: BdAddr, address_type: AddressType) -> Self {
        Self {
            address,
            address_type,
        }
    }

    pub fn public(bytes: [u8; 6]) -> Self {
        Self::new(BdAddr::new(bytes), AddressType::Public)
    }

    pub fn random(bytes: [u8; 6]) -> Self {
        Self::new(BdAddr::new(bytes), AddressType::Random)
    }

    /// A zeroed address is the "no device" value and is rejected by every API
    pub fn is_valid(&self) -> bool {
        !self.address.is_zero()
    }
}

impl fmt::Display for BtDeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({:?})", self.address, self.address_type)
    }
}

/// Local role on a link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkRole {
    /// We initiated the connection
    Master,
    /// The remote initiated the connection
    Slave,
}

/// The two logical clients that can independently own intents and subscriptions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientId {
    Kernel,
    App,
}

impl ClientId {
    pub const ALL: [ClientId; GAP_LE_CLIENT_COUNT] = [ClientId::Kernel, ClientId::App];

    pub fn index(self) -> usize {
        match self {
            ClientId::Kernel => 0,
            ClientId::App => 1,
        }
    }
}

bitflags! {
    /// Owner set of a co-owned record
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ClientSet: u8 {
        const KERNEL = 1 << 0;
        const APP = 1 << 1;
    }
}

impl ClientSet {
    pub fn has(self, client: ClientId) -> bool {
        self.contains(ClientSet::from(client))
    }

    pub fn add(&mut self, client: ClientId) {
        self.insert(ClientSet::from(client));
    }

    pub fn discard(&mut self, client: ClientId) {
        self.remove(ClientSet::from(client));
    }

    pub fn clients(self) -> impl Iterator<Item = ClientId> {
        ClientId::ALL.into_iter().filter(move |c| self.has(*c))
    }
}

impl From<ClientId> for ClientSet {
    fn from(client: ClientId) -> Self {
        match client {
            ClientId::Kernel => ClientSet::KERNEL,
            ClientId::App => ClientSet::APP,
        }
    }
}

/// Opaque key of a record in the persistent bonding store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BondingId(pub u16);

impl fmt::Display for BondingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bonding#{}", self.0)
    }
}

/// Change reported by the bonding store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BondingChangeOp {
    Added,
    Updated,
    /// The bonding is about to be deleted
    WillDelete,
}

/// Reason carried by virtual connection/disconnection events
///
/// Either an HCI status straight from the controller or one of the
/// stack-internal extension reasons.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEventReason {
    Hci(u8),
    AirPlaneMode,
    CancelConnect,
    UserRemovedBonding,
}

impl LinkEventReason {
    pub const SUCCESS: LinkEventReason = LinkEventReason::Hci(HCI_ERROR_CODE_SUCCESS);
}
