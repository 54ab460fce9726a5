//! Connection intent registry
//!
//! An intent records that one or both clients want a link to a device, keyed
//! either by literal address or by bonding. Intents are co-owned: a second
//! client registering for the same key joins the owner set instead of creating
//! a duplicate, and the intent only goes away once the owner set is empty.
//!
//! Address-keyed and bonding-keyed intents for what is physically the same
//! device are kept apart. A bonding can be reached through many resolvable
//! addresses, so the two keys are not interchangeable.
//!
//! The registry drives the controller's whitelist and its single outstanding
//! "create connection" request, and turns real link events into virtual
//! connect/disconnect events for the owners of each matching intent.

use crate::connection::{ConnectionTable, GapLeConnection};
use crate::driver::{ConnectionCompleteEvent, DisconnectionCompleteEvent, EncryptionChangeEvent};
use crate::error::{BtError, BtResult};
use crate::event::BleEvent;
use crate::gap::constants::*;
use crate::gap::types::*;
use crate::stack::{BleStack, StackState};
use log::{debug, info, warn};

/// How an intent identifies its device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IntentKey {
    Address(BtDeviceAddress),
    Bonding(BondingId),
}

impl IntentKey {
    pub(crate) fn matches(&self, connection: &GapLeConnection) -> bool {
        match self {
            IntentKey::Address(device) => connection.device == *device,
            IntentKey::Bonding(bonding_id) => connection.bonding_id == Some(*bonding_id),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct ClientIntentFlags {
    auto_reconnect: bool,
    is_pairing_required: bool,
}

#[derive(Debug)]
pub(crate) struct ConnectionIntent {
    key: IntentKey,
    /// Address handed to the controller whitelist
    whitelist_device: BtDeviceAddress,
    owners: ClientSet,
    flags: [ClientIntentFlags; GAP_LE_CLIENT_COUNT],
    /// Owners that have been sent a virtual connect event for the current link
    notified: ClientSet,
}

impl ConnectionIntent {
    fn new(key: IntentKey, whitelist_device: BtDeviceAddress) -> Self {
        Self {
            key,
            whitelist_device,
            owners: ClientSet::empty(),
            flags: [ClientIntentFlags::default(); GAP_LE_CLIENT_COUNT],
            notified: ClientSet::empty(),
        }
    }

    fn matches(&self, connection: &GapLeConnection) -> bool {
        self.key.matches(connection)
    }

    fn is_pairing_required(&self) -> bool {
        self.owners
            .clients()
            .any(|c| self.flags[c.index()].is_pairing_required)
    }

    /// Connect events wait for encryption when any owner asked for pairing
    fn may_notify(&self, connection: &GapLeConnection) -> bool {
        !self.is_pairing_required() || connection.is_encrypted
    }
}

#[derive(Debug, Default)]
pub(crate) struct IntentRegistry {
    intents: Vec<ConnectionIntent>,
    pending_create_connection: bool,
    cancel_create_requested: bool,
}

impl IntentRegistry {
    fn position(&self, key: &IntentKey) -> Option<usize> {
        self.intents.iter().position(|i| i.key == *key)
    }

    fn find(&self, key: &IntentKey) -> Option<&ConnectionIntent> {
        self.intents.iter().find(|i| i.key == *key)
    }

    fn is_whitelisted(&self, device: &BtDeviceAddress) -> bool {
        self.intents.iter().any(|i| i.whitelist_device == *device)
    }

    /// Whether any intent with owners matches the link
    pub fn wanted(&self, connection: &GapLeConnection) -> bool {
        self.intents
            .iter()
            .any(|i| !i.owners.is_empty() && i.matches(connection))
    }

    /// Clients that should hear about GATT activity on a link
    ///
    /// Links nobody registered an intent for (e.g. a phone connecting to us)
    /// belong to the kernel.
    pub fn interested_clients(&self, connection: &GapLeConnection) -> ClientSet {
        let clients = self
            .intents
            .iter()
            .filter(|i| i.matches(connection))
            .fold(ClientSet::empty(), |acc, i| acc | i.owners);
        if clients.is_empty() {
            ClientSet::KERNEL
        } else {
            clients
        }
    }

    /// Drops owner-less intents, returning whitelist entries nobody needs anymore
    fn remove_empty(&mut self) -> Vec<BtDeviceAddress> {
        let mut released = Vec::new();
        self.intents.retain(|i| {
            if i.owners.is_empty() {
                released.push(i.whitelist_device);
                false
            } else {
                true
            }
        });
        released.retain(|d| !self.is_whitelisted(d));
        released.dedup();
        released
    }
}

impl BleStack {
    /// Registers `client`'s wish to be connected to `device`
    pub fn connect(
        &self,
        device: &BtDeviceAddress,
        auto_reconnect: bool,
        is_pairing_required: bool,
        client: ClientId,
    ) -> BtResult<()> {
        if !device.is_valid() {
            return Err(BtError::InvalidParameter);
        }
        self.register_intent(
            IntentKey::Address(*device),
            *device,
            auto_reconnect,
            is_pairing_required,
            client,
        )
    }

    /// Registers `client`'s wish to be connected to whatever device holds `bonding_id`
    pub fn connect_by_bonding(
        &self,
        bonding_id: BondingId,
        auto_reconnect: bool,
        is_pairing_required: bool,
        client: ClientId,
    ) -> BtResult<()> {
        let device = self
            .bonding_store
            .device_for_bonding(bonding_id)
            .filter(|d| d.is_valid())
            .ok_or(BtError::InvalidParameter)?;
        self.register_intent(
            IntentKey::Bonding(bonding_id),
            device,
            auto_reconnect,
            is_pairing_required,
            client,
        )
    }

    /// Removes `client` from the owners of the address-keyed intent for `device`
    pub fn cancel(&self, device: &BtDeviceAddress, client: ClientId) -> BtResult<()> {
        self.cancel_intent(IntentKey::Address(*device), client)
    }

    /// Removes `client` from the owners of the intent for `bonding_id`
    pub fn cancel_by_bonding(&self, bonding_id: BondingId, client: ClientId) -> BtResult<()> {
        self.cancel_intent(IntentKey::Bonding(bonding_id), client)
    }

    /// Removes `client` from every intent
    pub fn cancel_all(&self, client: ClientId) {
        let mut guard = self.lock();
        let StackState {
            connections,
            intents,
            ..
        } = &mut *guard;

        let keys: Vec<IntentKey> = intents
            .intents
            .iter()
            .filter(|i| i.owners.has(client))
            .map(|i| i.key)
            .collect();
        for key in keys {
            self.remove_intent_owner(connections, intents, key, client);
        }
        debug!("Cancelled all connection intents of {:?}", client);
        self.update_create_connection(connections, intents);
    }

    pub fn has_connection_intent(&self, device: &BtDeviceAddress, client: ClientId) -> bool {
        self.lock()
            .intents
            .find(&IntentKey::Address(*device))
            .is_some_and(|i| i.owners.has(client))
    }

    pub fn has_connection_intent_for_bonding(&self, bonding_id: BondingId, client: ClientId) -> bool {
        self.lock()
            .intents
            .find(&IntentKey::Bonding(bonding_id))
            .is_some_and(|i| i.owners.has(client))
    }

    pub fn connection_intents_count(&self) -> usize {
        self.lock().intents.intents.len()
    }

    pub fn has_pending_create_connection(&self) -> bool {
        self.lock().intents.pending_create_connection
    }

    /// Reacts to a change in the persistent bonding store
    pub fn handle_bonding_change(&self, bonding_id: BondingId, op: BondingChangeOp) {
        let mut guard = self.lock();
        let StackState {
            connections,
            intents,
            service_changed_server,
            ..
        } = &mut *guard;

        match op {
            BondingChangeOp::Added | BondingChangeOp::Updated => {
                for connection in connections.iter_mut().filter(|c| c.bonding_id.is_none()) {
                    connection.bonding_id = self.bonding_store.bonding_for_device(&connection.device);
                }
                for connection in connections.iter() {
                    self.notify_connected(connection, intents);
                }
            }
            BondingChangeOp::WillDelete => {
                info!("{} is being deleted, tearing down its intents", bonding_id);
                service_changed_server.forget_bonding(bonding_id);
                let handle = connections.find_by_bonding(bonding_id).map(|c| c.handle);
                if let Some(connection) = handle.and_then(|h| connections.remove_by_handle(h)) {
                    let handle = connection.handle;
                    self.tear_down_connection(
                        intents,
                        connection,
                        LinkEventReason::UserRemovedBonding,
                    );
                    if let Err(e) = self
                        .controller
                        .disconnect(handle, HCI_ERROR_CODE_REMOTE_USER_TERMINATED_CONNECTION)
                    {
                        warn!("Disconnect of handle {} failed: {}", handle, e);
                    }
                }
                for intent in intents
                    .intents
                    .iter_mut()
                    .filter(|i| i.key == IntentKey::Bonding(bonding_id))
                {
                    intent.owners = ClientSet::empty();
                }
                let released = intents.remove_empty();
                self.release_whitelist(&released);
            }
        }
        self.update_create_connection(connections, intents);
    }

    pub(crate) fn handle_connection_complete(&self, event: &ConnectionCompleteEvent) {
        let mut guard = self.lock();
        let StackState {
            connections,
            intents,
            ..
        } = &mut *guard;

        if event.role == LinkRole::Master || event.status != HCI_ERROR_CODE_SUCCESS {
            intents.pending_create_connection = false;
            intents.cancel_create_requested = false;
        }

        if event.status != HCI_ERROR_CODE_SUCCESS {
            info!(
                "Connection attempt ended without a link, status {:#04x}",
                event.status
            );
            self.update_create_connection(connections, intents);
            return;
        }

        if connections.find_by_handle(event.handle).is_some()
            || connections.find_by_device(&event.device).is_some()
        {
            warn!(
                "Duplicate connection complete for {} (handle {})",
                event.device, event.handle
            );
            return;
        }

        let bonding_id = self.bonding_store.bonding_for_device(&event.device);
        let id = connections.allocate_id();
        connections.insert(GapLeConnection::new(id, event, bonding_id));
        info!(
            "Connected to {} as {:?}, handle {} ({})",
            event.device, event.role, event.handle, id
        );

        if let Some(connection) = connections.find_by_id(id) {
            if connection.role == LinkRole::Master && !intents.wanted(connection) {
                // Intent was cancelled while the controller was already connecting
                info!("No intent left for {}, disconnecting", connection.device);
                if let Err(e) = self.controller.disconnect(
                    connection.handle,
                    HCI_ERROR_CODE_REMOTE_USER_TERMINATED_CONNECTION,
                ) {
                    warn!("Disconnect of handle {} failed: {}", connection.handle, e);
                }
            }
            self.notify_connected(connection, intents);
        }
        self.update_create_connection(connections, intents);
    }

    pub(crate) fn handle_disconnection_complete(&self, event: &DisconnectionCompleteEvent) {
        let mut guard = self.lock();
        let StackState {
            connections,
            intents,
            ..
        } = &mut *guard;

        let Some(connection) = connections.remove_by_handle(event.handle) else {
            debug!(
                "Disconnection of unknown or already torn down handle {}",
                event.handle
            );
            return;
        };
        info!(
            "Disconnected from {} (handle {}), reason {:#04x}",
            connection.device, event.handle, event.reason
        );
        self.tear_down_connection(intents, connection, LinkEventReason::Hci(event.reason));
        self.update_create_connection(connections, intents);
    }

    pub(crate) fn handle_encryption_change(&self, event: &EncryptionChangeEvent) {
        let mut guard = self.lock();
        let StackState {
            connections,
            intents,
            ..
        } = &mut *guard;

        let Some(connection) = connections.find_by_handle_mut(event.handle) else {
            warn!("Encryption change for unknown handle {}", event.handle);
            return;
        };
        if event.status != HCI_ERROR_CODE_SUCCESS || !event.encrypted {
            debug!(
                "Encryption of {} not established, status {:#04x}",
                connection.device, event.status
            );
            return;
        }

        connection.is_encrypted = true;
        if connection.bonding_id.is_none() {
            // Pairing may have just created the bonding
            connection.bonding_id = self.bonding_store.bonding_for_device(&connection.device);
        }
        debug!("Link to {} encrypted", connection.device);

        let connection = &*connection;
        self.notify_connected(connection, intents);
        self.update_create_connection(connections, intents);
    }

    /// Tears down every link, e.g. when the radio is switched off
    ///
    /// Clients receive disconnection events with [`LinkEventReason::AirPlaneMode`];
    /// auto-reconnect intents survive for [`handle_stack_restart`](Self::handle_stack_restart).
    pub fn handle_stack_shutdown(&self) {
        let mut guard = self.lock();
        let StackState {
            connections,
            intents,
            deferred,
            ..
        } = &mut *guard;

        info!("Stack shutting down, dropping {} link(s)", connections.len());
        for connection in connections.drain() {
            self.tear_down_connection(intents, connection, LinkEventReason::AirPlaneMode);
        }
        intents.pending_create_connection = false;
        intents.cancel_create_requested = false;
        deferred.clear();
    }

    /// Repopulates the whitelist from surviving intents and resumes connecting
    pub fn handle_stack_restart(&self) {
        let mut guard = self.lock();
        let StackState {
            connections,
            intents,
            ..
        } = &mut *guard;

        let mut devices: Vec<BtDeviceAddress> =
            intents.intents.iter().map(|i| i.whitelist_device).collect();
        devices.dedup();
        for device in devices {
            if let Err(e) = self.controller.whitelist_add(&device) {
                warn!("Whitelisting {} failed: {}", device, e);
            }
        }
        info!("Stack restarted with {} intent(s)", intents.intents.len());
        self.update_create_connection(connections, intents);
    }

    /// Releases everything hanging off a link that is gone
    ///
    /// Discovery and subscriptions are torn down, owners that were told about
    /// the link get a virtual disconnection, and owners that did not ask for
    /// auto-reconnect are dropped from their intents.
    pub(crate) fn tear_down_connection(
        &self,
        intents: &mut IntentRegistry,
        mut connection: GapLeConnection,
        reason: LinkEventReason,
    ) {
        let clients = intents.interested_clients(&connection);
        self.abort_discovery(&mut connection, clients);
        self.cancel_service_changed_timer(&mut connection);
        self.cleanup_subscriptions_for_connection(&mut connection, false);

        let pairing_reason = match reason {
            LinkEventReason::Hci(_) => LinkEventReason::Hci(HCI_ERROR_CODE_AUTHENTICATION_FAILURE),
            other => other,
        };

        for intent in intents.intents.iter_mut().filter(|i| i.matches(&connection)) {
            self.emit_link_event(&connection, intent.notified, false, reason);
            if !connection.is_encrypted && intent.is_pairing_required() {
                // Owners that were still waiting for pairing to complete
                let waiting = intent.owners - intent.notified;
                self.emit_link_event(&connection, waiting, false, pairing_reason);
            }
            intent.notified = ClientSet::empty();

            for client in intent.owners.clients() {
                if !intent.flags[client.index()].auto_reconnect {
                    intent.owners.discard(client);
                }
            }
        }
        self.emit_link_event(
            &connection,
            connection.cancel_notice,
            false,
            LinkEventReason::CancelConnect,
        );

        let released = intents.remove_empty();
        self.release_whitelist(&released);
    }

    fn register_intent(
        &self,
        key: IntentKey,
        whitelist_device: BtDeviceAddress,
        auto_reconnect: bool,
        is_pairing_required: bool,
        client: ClientId,
    ) -> BtResult<()> {
        let mut guard = self.lock();
        let StackState {
            connections,
            intents,
            ..
        } = &mut *guard;

        let flags = ClientIntentFlags {
            auto_reconnect,
            is_pairing_required,
        };

        let index = match intents.position(&key) {
            Some(index) => {
                let intent = &mut intents.intents[index];
                if intent.owners.has(client) {
                    return Err(BtError::InvalidState);
                }
                intent.owners.add(client);
                intent.flags[client.index()] = flags;
                index
            }
            None => {
                if intents.intents.len() >= self.config.max_connection_intents {
                    return Err(BtError::NotEnoughResources);
                }
                intents
                    .intents
                    .try_reserve(1)
                    .map_err(|_| BtError::NotEnoughResources)?;
                if !intents.is_whitelisted(&whitelist_device) {
                    if let Err(e) = self.controller.whitelist_add(&whitelist_device) {
                        warn!("Whitelisting {} failed: {}", whitelist_device, e);
                    }
                }
                let mut intent = ConnectionIntent::new(key, whitelist_device);
                intent.owners.add(client);
                intent.flags[client.index()] = flags;
                intents.intents.push(intent);
                intents.intents.len() - 1
            }
        };
        info!(
            "{:?} registered connection intent for {:?} (auto_reconnect: {}, pairing: {})",
            client, key, auto_reconnect, is_pairing_required
        );

        // Only the newly registered client hears about an existing link
        let intent = &mut intents.intents[index];
        if let Some(connection) = connections.iter().find(|c| intent.matches(c)) {
            if intent.may_notify(connection) {
                intent.notified.add(client);
                self.emit_link_event(connection, client.into(), true, LinkEventReason::SUCCESS);
            }
        }

        self.update_create_connection(connections, intents);
        Ok(())
    }

    fn cancel_intent(&self, key: IntentKey, client: ClientId) -> BtResult<()> {
        let mut guard = self.lock();
        let StackState {
            connections,
            intents,
            ..
        } = &mut *guard;

        let intent = intents.find(&key).ok_or(BtError::InvalidParameter)?;
        if !intent.owners.has(client) {
            return Err(BtError::InvalidParameter);
        }
        self.remove_intent_owner(connections, intents, key, client);
        info!("{:?} cancelled connection intent for {:?}", client, key);
        self.update_create_connection(connections, intents);
        Ok(())
    }

    fn remove_intent_owner(
        &self,
        connections: &mut ConnectionTable,
        intents: &mut IntentRegistry,
        key: IntentKey,
        client: ClientId,
    ) {
        let Some(index) = intents.position(&key) else {
            return;
        };
        let intent = &mut intents.intents[index];
        intent.owners.discard(client);
        let was_notified = intent.notified.has(client);
        intent.notified.discard(client);

        let released = intents.remove_empty();
        self.release_whitelist(&released);

        let Some(connection) = connections.iter_mut().find(|c| key.matches(c)) else {
            return;
        };
        let still_wanted = intents.wanted(connection);
        if !still_wanted && connection.role == LinkRole::Master {
            match self.controller.disconnect(
                connection.handle,
                HCI_ERROR_CODE_REMOTE_USER_TERMINATED_CONNECTION,
            ) {
                Ok(()) => {
                    if was_notified {
                        // Delivered once the controller confirms the disconnection
                        connection.cancel_notice.add(client);
                    }
                }
                Err(e) => {
                    warn!("Disconnect of handle {} failed: {}", connection.handle, e);
                    if was_notified {
                        self.emit_link_event(
                            connection,
                            client.into(),
                            false,
                            LinkEventReason::CancelConnect,
                        );
                    }
                }
            }
        } else if was_notified {
            self.emit_link_event(
                connection,
                client.into(),
                false,
                LinkEventReason::CancelConnect,
            );
        }
    }

    /// Sends deferred connect events for every intent the link now satisfies
    fn notify_connected(&self, connection: &GapLeConnection, intents: &mut IntentRegistry) {
        for intent in intents.intents.iter_mut().filter(|i| i.matches(connection)) {
            if !intent.may_notify(connection) {
                debug!(
                    "Holding connect event for {:?} until the link is encrypted",
                    intent.key
                );
                continue;
            }
            let pending = intent.owners - intent.notified;
            self.emit_link_event(connection, pending, true, LinkEventReason::SUCCESS);
            intent.notified |= pending;
        }
    }

    fn emit_link_event(
        &self,
        connection: &GapLeConnection,
        clients: ClientSet,
        connected: bool,
        reason: LinkEventReason,
    ) {
        if clients.is_empty() {
            return;
        }
        self.emit(
            clients,
            BleEvent::Connection {
                device: connection.device,
                bonding_id: connection.bonding_id,
                connected,
                reason,
            },
        );
    }

    fn release_whitelist(&self, devices: &[BtDeviceAddress]) {
        for device in devices {
            if let Err(e) = self.controller.whitelist_remove(device) {
                warn!("Removing {} from whitelist failed: {}", device, e);
            }
        }
    }

    /// Keeps exactly one create-connection outstanding while any intent is unsatisfied
    fn update_create_connection(&self, connections: &ConnectionTable, intents: &mut IntentRegistry) {
        let wants_link = intents
            .intents
            .iter()
            .any(|i| !i.owners.is_empty() && !connections.iter().any(|c| i.matches(c)));

        if wants_link {
            if !intents.pending_create_connection {
                match self.controller.create_connection() {
                    Ok(()) => {
                        debug!("Create connection started");
                        intents.pending_create_connection = true;
                        intents.cancel_create_requested = false;
                    }
                    Err(e) => warn!("Create connection failed to start: {}", e),
                }
            }
        } else if intents.pending_create_connection && !intents.cancel_create_requested {
            match self.controller.cancel_create_connection() {
                Ok(()) => {
                    debug!("Create connection cancel requested");
                    intents.cancel_create_requested = true;
                }
                Err(e) => warn!("Cancelling create connection failed: {}", e),
            }
        }
    }
}
