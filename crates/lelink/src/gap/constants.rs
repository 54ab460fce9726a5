//! GAP / HCI constants

// HCI status and disconnection reason codes
pub const HCI_ERROR_CODE_SUCCESS: u8 = 0x00;
pub const HCI_ERROR_CODE_AUTHENTICATION_FAILURE: u8 = 0x05;
pub const HCI_ERROR_CODE_CONNECTION_TIMEOUT: u8 = 0x08;
pub const HCI_ERROR_CODE_REMOTE_USER_TERMINATED_CONNECTION: u8 = 0x13;
pub const HCI_ERROR_CODE_CONNECTION_TERMINATED_BY_LOCAL_HOST: u8 = 0x16;
pub const HCI_ERROR_CODE_CONNECTION_FAILED_TO_BE_ESTABLISHED: u8 = 0x3E;

/// Maximum number of connection intents registered at the same time
pub const GAP_LE_CONNECT_MASTER_MAX_CONNECTION_INTENTS: usize = 4;

/// Number of logical clients ([`ClientId`](super::ClientId) variants)
pub const GAP_LE_CLIENT_COUNT: usize = 2;
