//! GATT constants

// Attribute handle bounds
pub const ATT_HANDLE_MIN: u16 = 0x0001;
pub const ATT_HANDLE_MAX: u16 = 0xFFFF;

/// Longest attribute value a peer may send
pub const GATT_MAX_ATTRIBUTE_VALUE_LEN: usize = 512;

// SIG-assigned 16-bit UUIDs
pub const GATT_PROFILE_SERVICE_UUID: u16 = 0x1801;
pub const SERVICE_CHANGED_CHARACTERISTIC_UUID: u16 = 0x2A05;
pub const CLIENT_CHAR_CONFIG_UUID: u16 = 0x2902;

// Client Characteristic Configuration Descriptor values
pub const CCCD_NONE: u16 = 0x0000;
pub const CCCD_NOTIFICATIONS: u16 = 0x0001;
pub const CCCD_INDICATIONS: u16 = 0x0002;

/// Watchdog firings tolerated per discovery job
pub const GATT_CLIENT_DISCOVERY_MAX_RETRY: u8 = 3;

/// Service Changed payload: start and end handle, little-endian
pub const SERVICE_CHANGED_VALUE_LEN: usize = 4;

/// Service Changed indications sent to one peer before giving up
pub const SERVICE_CHANGED_MAX_INDICATIONS: u8 = 3;
