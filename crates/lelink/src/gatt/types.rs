//! Common types for GATT client operations

use crate::connection::ConnectionId;
use crate::gatt::constants::*;
use crate::uuid::Uuid;
use bitflags::bitflags;
use std::fmt;

/// Inclusive range of ATT handles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AttHandleRange {
    pub start: u16,
    pub end: u16,
}

impl AttHandleRange {
    /// The whole attribute database
    pub const FULL: AttHandleRange = AttHandleRange {
        start: ATT_HANDLE_MIN,
        end: ATT_HANDLE_MAX,
    };

    /// Returns `None` when `start` is 0 or lies past `end`
    pub fn new(start: u16, end: u16) -> Option<Self> {
        if start == 0 || start > end {
            None
        } else {
            Some(Self { start, end })
        }
    }

    pub fn contains(&self, handle: u16) -> bool {
        handle >= self.start && handle <= self.end
    }

    pub fn overlaps(&self, other: &AttHandleRange) -> bool {
        self.start <= other.end && other.start <= self.end
    }
}

impl fmt::Display for AttHandleRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:04X}..=0x{:04X}", self.start, self.end)
    }
}

bitflags! {
    /// Characteristic properties as declared by the server
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct CharacteristicProperties: u8 {
        const BROADCAST = 0x01;
        const READ = 0x02;
        const WRITE_WITHOUT_RESPONSE = 0x04;
        const WRITE = 0x08;
        const NOTIFY = 0x10;
        const INDICATE = 0x20;
        const AUTHENTICATED_SIGNED_WRITES = 0x40;
        const EXTENDED_PROPERTIES = 0x80;
    }
}

impl CharacteristicProperties {
    /// Whether the characteristic advertises support for `subscription_type`
    pub fn supports(&self, subscription_type: SubscriptionType) -> bool {
        match subscription_type {
            SubscriptionType::None => true,
            SubscriptionType::Notifications => self.contains(Self::NOTIFY),
            SubscriptionType::Indications => self.contains(Self::INDICATE),
        }
    }
}

/// What a client wants pushed for a characteristic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SubscriptionType {
    #[default]
    None,
    Notifications,
    Indications,
}

impl SubscriptionType {
    /// CCCD bits realising this subscription
    pub fn cccd_value(self) -> u16 {
        match self {
            SubscriptionType::None => CCCD_NONE,
            SubscriptionType::Notifications => CCCD_NOTIFICATIONS,
            SubscriptionType::Indications => CCCD_INDICATIONS,
        }
    }
}

/// Characteristic descriptor found during discovery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Descriptor {
    pub uuid: Uuid,
    pub handle: u16,
}

/// Characteristic found during discovery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Characteristic {
    pub uuid: Uuid,
    /// Value handle, the handle notifications arrive on
    pub value_handle: u16,
    pub properties: CharacteristicProperties,
    pub descriptors: Vec<Descriptor>,
}

impl Characteristic {
    /// Handle of the Client Characteristic Configuration Descriptor, if the server exposes one
    pub fn cccd_handle(&self) -> Option<u16> {
        self.descriptors
            .iter()
            .find(|d| d.uuid == CLIENT_CHAR_CONFIG_UUID)
            .map(|d| d.handle)
    }
}

/// Service found during discovery, a read-only snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Service {
    pub uuid: Uuid,
    pub handle_range: AttHandleRange,
    /// Start handles of included services
    pub included_services: Vec<u16>,
    pub characteristics: Vec<Characteristic>,
}

impl Service {
    pub fn characteristic(&self, uuid: &Uuid) -> Option<&Characteristic> {
        self.characteristics.iter().find(|c| c.uuid == *uuid)
    }
}

/// Reference to a characteristic discovered on a specific connection
///
/// The reference dies with the discovery generation that produced it: after a
/// full rediscovery or a disconnection it no longer resolves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CharacteristicRef {
    pub connection: ConnectionId,
    pub generation: u32,
    pub value_handle: u16,
}
