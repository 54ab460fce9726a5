//! Stack configuration
//!
//! Tunables for the connection intent registry, the discovery watchdog, the
//! notification buffers and the Service Changed server.

use crate::gap::constants::GAP_LE_CONNECT_MASTER_MAX_CONNECTION_INTENTS;
use crate::gatt::constants::{
    GATT_CLIENT_DISCOVERY_MAX_RETRY, GATT_MAX_ATTRIBUTE_VALUE_LEN,
    SERVICE_CHANGED_MAX_INDICATIONS,
};
use crate::gatt::notification_buffer::NOTIFICATION_HEADER_SIZE;
use std::time::Duration;

/// Configuration for a [`BleStack`](crate::BleStack)
#[derive(Debug, Clone)]
pub struct StackConfig {
    /// Maximum number of simultaneous connection intents
    pub max_connection_intents: usize,
    /// How long a single discovery job may run before the watchdog fires
    pub discovery_watchdog_timeout: Duration,
    /// Watchdog firings tolerated per job before discovery fails with a timeout
    pub discovery_max_retries: u8,
    /// Maximum subscription records per connection
    pub max_subscriptions_per_connection: usize,
    /// Byte capacity of each client's notification buffer
    pub notification_buffer_size: usize,
    /// How long an inbound notification waits for buffer space before being dropped
    pub notification_backpressure_timeout: Duration,
    /// Delay between a Service Changed CCCD subscribe and the indication
    pub service_changed_indication_delay: Duration,
    /// Maximum Service Changed indications sent to one peer across reconnections
    pub service_changed_max_indications: u8,
}

impl Default for StackConfig {
    fn default() -> Self {
        Self {
            max_connection_intents: GAP_LE_CONNECT_MASTER_MAX_CONNECTION_INTENTS,
            discovery_watchdog_timeout: Duration::from_secs(5),
            discovery_max_retries: GATT_CLIENT_DISCOVERY_MAX_RETRY,
            max_subscriptions_per_connection: 16,
            notification_buffer_size: GATT_MAX_ATTRIBUTE_VALUE_LEN + NOTIFICATION_HEADER_SIZE,
            notification_backpressure_timeout: Duration::from_secs(1),
            service_changed_indication_delay: Duration::from_secs(3),
            service_changed_max_indications: SERVICE_CHANGED_MAX_INDICATIONS,
        }
    }
}
