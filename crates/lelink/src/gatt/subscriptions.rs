//! Characteristic subscriptions
//!
//! Both clients may subscribe to the same characteristic. The stack keeps one
//! record per characteristic holding each client's requested type and writes
//! the bitwise union of those requests into the peer's CCCD. Only one CCCD
//! write per characteristic is ever in flight; clients whose request does not
//! change the union ride along with it and hear back when it is confirmed.
//!
//! Inbound values are copied into the buffer of every subscribed client and
//! pulled out with [`BleStack::consume_notification`].

use crate::connection::{ConnectionHandle, GapLeConnection};
use crate::error::{BtError, BtResult};
use crate::event::BleEvent;
use crate::gap::constants::GAP_LE_CLIENT_COUNT;
use crate::gap::{BtDeviceAddress, ClientId, ClientSet};
use crate::gatt::constants::{
    CCCD_NONE, GATT_MAX_ATTRIBUTE_VALUE_LEN, SERVICE_CHANGED_CHARACTERISTIC_UUID,
};
use crate::gatt::notification_buffer::{ConsumedNotification, NotificationHeader, PushOutcome};
use crate::gatt::types::{AttHandleRange, CharacteristicRef, SubscriptionType};
use crate::stack::BleStack;
use log::{debug, info, trace, warn};

/// Subscription state of one characteristic on one connection
#[derive(Debug, Clone)]
pub(crate) struct Subscription {
    pub characteristic: CharacteristicRef,
    pub cccd_handle: u16,
    requested: [SubscriptionType; GAP_LE_CLIENT_COUNT],
    /// CCCD value the peer last acknowledged
    confirmed_value: u16,
    /// CCCD value of the write in flight
    pending_value: Option<u16>,
    /// Clients answered when the write in flight is confirmed
    notify_on_confirm: ClientSet,
}

impl Subscription {
    fn new(characteristic: CharacteristicRef, cccd_handle: u16) -> Self {
        Self {
            characteristic,
            cccd_handle,
            requested: [SubscriptionType::None; GAP_LE_CLIENT_COUNT],
            confirmed_value: CCCD_NONE,
            pending_value: None,
            notify_on_confirm: ClientSet::empty(),
        }
    }

    pub fn owners(&self) -> ClientSet {
        ClientId::ALL
            .into_iter()
            .filter(|c| self.requested[c.index()] != SubscriptionType::None)
            .fold(ClientSet::empty(), |acc, c| acc | ClientSet::from(c))
    }

    pub fn requested(&self, client: ClientId) -> SubscriptionType {
        self.requested[client.index()]
    }

    fn union_value(requested: &[SubscriptionType; GAP_LE_CLIENT_COUNT]) -> u16 {
        requested
            .iter()
            .fold(CCCD_NONE, |acc, t| acc | t.cccd_value())
    }

    /// Value the peer holds once any write in flight lands
    fn effective_value(&self) -> u16 {
        self.pending_value.unwrap_or(self.confirmed_value)
    }

    fn is_idle(&self) -> bool {
        self.owners().is_empty() && self.pending_value.is_none()
    }
}

impl BleStack {
    /// Changes `client`'s subscription to `characteristic`
    ///
    /// `SubscriptionType::None` unsubscribes. The outcome arrives as a
    /// [`BleEvent::Subscription`], immediately when no CCCD write is needed.
    pub fn subscribe(
        &self,
        characteristic: &CharacteristicRef,
        subscription_type: SubscriptionType,
        client: ClientId,
    ) -> BtResult<()> {
        let mut guard = self.lock();
        let connection = guard
            .connections
            .find_by_id_mut(characteristic.connection)
            .ok_or(BtError::InvalidParameter)?;
        let found = connection
            .resolve_characteristic(characteristic)
            .ok_or(BtError::InvalidParameter)?;
        // Service Changed is subscribed by the stack itself
        if found.uuid == SERVICE_CHANGED_CHARACTERISTIC_UUID {
            return Err(BtError::InvalidParameter);
        }
        let cccd_handle = found.cccd_handle().ok_or(BtError::InvalidParameter)?;
        if !found.properties.supports(subscription_type) {
            return Err(BtError::InvalidParameter);
        }

        let index = connection
            .subscriptions
            .iter()
            .position(|s| s.characteristic == *characteristic);

        let current = index.map_or(SubscriptionType::None, |i| {
            connection.subscriptions[i].requested(client)
        });
        if current == subscription_type {
            // Unsubscribing a non-owner, or repeating an active subscription
            return Err(BtError::InvalidState);
        }

        let mut requested = index.map_or([SubscriptionType::None; GAP_LE_CLIENT_COUNT], |i| {
            connection.subscriptions[i].requested
        });
        requested[client.index()] = subscription_type;
        let target = Subscription::union_value(&requested);

        if let Some(pending) = index.and_then(|i| connection.subscriptions[i].pending_value) {
            if pending != target {
                return Err(BtError::InvalidState);
            }
        }

        let index = match index {
            Some(index) => index,
            None => {
                if connection.subscriptions.len() >= self.config.max_subscriptions_per_connection {
                    return Err(BtError::NotEnoughResources);
                }
                connection
                    .subscriptions
                    .try_reserve(1)
                    .map_err(|_| BtError::NotEnoughResources)?;
                connection.subscriptions.len()
            }
        };
        let allocated = subscription_type != SubscriptionType::None
            && self.notifications.buffer(client).allocate()?;
        if allocated {
            debug!("Allocated notification buffer for {:?}", client);
        }

        let handle = connection.handle;
        if index == connection.subscriptions.len() {
            connection
                .subscriptions
                .push(Subscription::new(*characteristic, cccd_handle));
        }
        let subscription = &mut connection.subscriptions[index];

        if target != subscription.effective_value() {
            if let Err(e) = self.controller.write_cccd(handle, cccd_handle, target) {
                warn!("CCCD write to 0x{:04X} failed: {}", cccd_handle, e);
                if subscription.is_idle() {
                    connection.subscriptions.remove(index);
                }
                if allocated {
                    self.notifications.buffer(client).release();
                }
                return Err(e);
            }
            subscription.pending_value = Some(target);
            subscription.requested = requested;
            subscription.notify_on_confirm.add(client);
            info!(
                "{:?} subscribing to 0x{:04X} with {:?}, writing CCCD 0x{:04X}",
                client, characteristic.value_handle, subscription_type, target
            );
            return Ok(());
        }

        subscription.requested = requested;
        if subscription.pending_value.is_some() {
            subscription.notify_on_confirm.add(client);
        } else {
            self.emit_subscription_event(client.into(), characteristic, subscription_type, None);
        }
        debug!(
            "{:?} joined subscription to 0x{:04X} with {:?}, CCCD unchanged",
            client, characteristic.value_handle, subscription_type
        );
        if subscription.is_idle() {
            connection.subscriptions.remove(index);
        }
        Ok(())
    }

    /// Type `client` is currently subscribed with
    pub fn subscription_type(
        &self,
        characteristic: &CharacteristicRef,
        client: ClientId,
    ) -> SubscriptionType {
        let guard = self.lock();
        guard
            .connections
            .find_by_id(characteristic.connection)
            .and_then(|c| {
                c.subscriptions
                    .iter()
                    .find(|s| s.characteristic == *characteristic)
            })
            .map_or(SubscriptionType::None, |s| s.requested(client))
    }

    pub(crate) fn handle_write_cccd_response(
        &self,
        handle: ConnectionHandle,
        cccd_handle: u16,
        status: i32,
    ) {
        let mut guard = self.lock();
        let Some(connection) = guard.connections.find_by_handle_mut(handle) else {
            debug!("CCCD response on unknown handle {}", handle);
            return;
        };
        if connection.service_changed.cccd_handle == Some(cccd_handle) {
            self.handle_service_changed_cccd_response(connection, status);
            return;
        }
        let Some(index) = connection
            .subscriptions
            .iter()
            .position(|s| s.cccd_handle == cccd_handle && s.pending_value.is_some())
        else {
            debug!(
                "CCCD response for 0x{:04X} without a pending write on {}",
                cccd_handle, connection.device
            );
            return;
        };

        let subscription = &mut connection.subscriptions[index];
        let characteristic = subscription.characteristic;
        let clients = std::mem::take(&mut subscription.notify_on_confirm);

        match BtError::from_driver_status(status) {
            Ok(()) => {
                subscription.confirmed_value = subscription.effective_value();
                subscription.pending_value = None;
                info!(
                    "CCCD 0x{:04X} on {} confirmed as 0x{:04X}",
                    cccd_handle, connection.device, subscription.confirmed_value
                );
                // Owners may have left while the write was in flight
                let target = Subscription::union_value(&subscription.requested);
                if target != subscription.confirmed_value {
                    match self.controller.write_cccd(handle, cccd_handle, target) {
                        Ok(()) => {
                            debug!(
                                "Rewriting CCCD 0x{:04X} on {} as 0x{:04X}",
                                cccd_handle, connection.device, target
                            );
                            subscription.pending_value = Some(target);
                        }
                        Err(e) => warn!(
                            "CCCD write to 0x{:04X} on {} failed: {}",
                            cccd_handle, connection.device, e
                        ),
                    }
                }
                let confirmed = subscription.clone();
                for client in clients.clients() {
                    self.emit_subscription_event(
                        client.into(),
                        &characteristic,
                        confirmed.requested(client),
                        None,
                    );
                }
                if confirmed.is_idle() {
                    connection.subscriptions.remove(index);
                }
            }
            Err(e) => {
                warn!(
                    "CCCD write 0x{:04X} on {} failed: {}",
                    cccd_handle, connection.device, e
                );
                let removed = connection.subscriptions.remove(index);
                self.emit_subscription_event(
                    clients | removed.owners(),
                    &characteristic,
                    SubscriptionType::None,
                    Some(e),
                );
            }
        }
    }

    /// Buffers an inbound value for every client subscribed to `att_handle`
    ///
    /// May block for the backpressure timeout when a client's buffer is full.
    pub(crate) fn handle_server_notification(
        &self,
        handle: ConnectionHandle,
        att_handle: u16,
        value: &[u8],
    ) {
        if value.len() > GATT_MAX_ATTRIBUTE_VALUE_LEN {
            warn!("Dropping oversized value ({} bytes) on 0x{:04X}", value.len(), att_handle);
            return;
        }

        let (characteristic, owners) = {
            let guard = self.lock();
            let Some(subscription) = guard.connections.find_by_handle(handle).and_then(|c| {
                c.subscriptions
                    .iter()
                    .find(|s| s.characteristic.value_handle == att_handle)
            }) else {
                trace!("Value on 0x{:04X} with no subscribers", att_handle);
                return;
            };
            (subscription.characteristic, subscription.owners())
        };

        // The bt lock is not held while waiting for buffer space
        let header = NotificationHeader {
            characteristic,
            value_length: value.len(),
        };
        for client in owners.clients() {
            let outcome = self.notifications.buffer(client).push(
                &header,
                value,
                self.config.notification_backpressure_timeout,
            );
            if let PushOutcome::Stored { raise_event: true } = outcome {
                self.emit(client.into(), BleEvent::NotificationsAvailable);
            }
        }
    }

    /// Peeks at `client`'s next buffered notification
    pub fn get_notification_header(&self, client: ClientId) -> Option<NotificationHeader> {
        self.notifications.buffer(client).peek_header()
    }

    /// Pops `client`'s next buffered notification into `value`
    ///
    /// The record is removed even when `value` is too short for it; size the
    /// buffer from [`get_notification_header`](Self::get_notification_header).
    pub fn consume_notification(&self, client: ClientId, value: &mut [u8]) -> ConsumedNotification {
        self.notifications.buffer(client).consume(value)
    }

    /// Drops every subscription `client` holds, e.g. when the client shuts down
    pub fn cleanup_subscriptions_by_client(&self, client: ClientId) {
        let mut guard = self.lock();
        for connection in guard.connections.iter_mut() {
            let handle = connection.handle;
            for subscription in connection.subscriptions.iter_mut() {
                subscription.notify_on_confirm.discard(client);
                if subscription.requested(client) == SubscriptionType::None {
                    continue;
                }
                subscription.requested[client.index()] = SubscriptionType::None;
                let target = Subscription::union_value(&subscription.requested);
                if subscription.pending_value.is_none() && target != subscription.confirmed_value {
                    match self
                        .controller
                        .write_cccd(handle, subscription.cccd_handle, target)
                    {
                        Ok(()) => subscription.pending_value = Some(target),
                        Err(e) => warn!(
                            "CCCD write to 0x{:04X} failed: {}",
                            subscription.cccd_handle, e
                        ),
                    }
                }
            }
            connection.subscriptions.retain(|s| !s.is_idle());
        }
        drop(guard);

        self.notifications.buffer(client).release();
        info!("Released all subscriptions of {:?}", client);
    }

    /// Drops every subscription on the connection to `device`
    pub fn cleanup_subscriptions_by_connection(
        &self,
        device: &BtDeviceAddress,
        should_unsubscribe: bool,
    ) -> BtResult<()> {
        let mut guard = self.lock();
        let connection = guard
            .connections
            .find_by_device_mut(device)
            .ok_or(BtError::InvalidParameter)?;
        self.cleanup_subscriptions_for_connection(connection, should_unsubscribe);
        Ok(())
    }

    pub(crate) fn cleanup_subscriptions_for_connection(
        &self,
        connection: &mut GapLeConnection,
        should_unsubscribe: bool,
    ) {
        for subscription in connection.subscriptions.drain(..) {
            if should_unsubscribe && subscription.effective_value() != CCCD_NONE {
                if let Err(e) =
                    self.controller
                        .write_cccd(connection.handle, subscription.cccd_handle, CCCD_NONE)
                {
                    debug!(
                        "Unsubscribe write to 0x{:04X} failed: {}",
                        subscription.cccd_handle, e
                    );
                }
            }
        }
    }

    /// Drops subscriptions whose value handle lies in `range`, returning how many
    pub(crate) fn cleanup_subscriptions_by_att_handle_range(
        &self,
        connection: &mut GapLeConnection,
        range: AttHandleRange,
    ) -> usize {
        let before = connection.subscriptions.len();
        connection
            .subscriptions
            .retain(|s| !range.contains(s.characteristic.value_handle));
        before - connection.subscriptions.len()
    }

    fn emit_subscription_event(
        &self,
        clients: ClientSet,
        characteristic: &CharacteristicRef,
        subscription_type: SubscriptionType,
        error: Option<BtError>,
    ) {
        self.emit(
            clients,
            BleEvent::Subscription {
                characteristic: *characteristic,
                subscription_type,
                error,
            },
        );
    }
}
