//! lelink - A Rust library for the Bluetooth LE connection and GATT client layers
//!
//! This library sits between a Bluetooth controller driver and two logical
//! clients (the kernel and an app). It tracks which devices the clients want
//! to be connected to, discovers the services of connected devices, manages
//! characteristic subscriptions with per-client notification buffering, and
//! handles the GATT Service Changed characteristic in both directions.
//!
//! All state lives in a [`BleStack`]. Driver callbacks are fed in with
//! [`BleStack::handle_controller_event`]; results reach the clients as
//! [`BleEvent`]s.

pub mod config;
pub mod connection;
pub mod driver;
pub mod error;
pub mod event;
pub mod gap;
pub mod gatt;
pub mod stack;
pub mod timer;
pub mod uuid;

#[cfg(test)]
mod test_support;

// Re-export common types for convenience
pub use config::StackConfig;
pub use connection::{ConnectionHandle, ConnectionId};
pub use driver::{
    BondingStore, ConnectionCompleteEvent, Controller, ControllerEvent,
    DisconnectionCompleteEvent, EncryptionChangeEvent,
};
pub use error::{BtError, BtResult};
pub use event::{BleEvent, ChannelEventSink, ClientReceivers, EventSink};
pub use gap::{
    AddressType, BdAddr, BondingChangeOp, BondingId, BtDeviceAddress, ClientId, ClientSet,
    IntentKey, LinkEventReason, LinkRole,
};
pub use gatt::{
    AttHandleRange, Characteristic, CharacteristicProperties, CharacteristicRef,
    ConsumedNotification, Descriptor, NotificationHeader, Service, SubscriptionType,
};
pub use stack::{BackgroundWorker, BleStack};
pub use timer::{ManualTimerService, ThreadTimerService, TimerId, TimerService};
pub use uuid::Uuid;
