//! GATT (Generic Attribute Profile) client machinery
//!
//! Service discovery, characteristic subscriptions with per-client
//! notification buffering, and the Service Changed client and server.

pub mod constants;
pub mod discovery;
pub mod notification_buffer;
pub mod service_changed;
pub mod subscriptions;
pub mod types;


pub use notification_buffer::{ConsumedNotification, NotificationHeader};
pub use types::{
    AttHandleRange, Characteristic, CharacteristicProperties, CharacteristicRef, Descriptor,
    Service, SubscriptionType,
};
