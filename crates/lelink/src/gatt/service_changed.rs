//! Service Changed handling
//!
//! Client side: when discovery finds the remote GATT Profile Service, its
//! Service Changed characteristic is subscribed for indications behind the
//! clients' backs. An indication names the range of handles the peer changed;
//! that range is rediscovered from the background context.
//!
//! Server side: after a firmware update our own database may have moved, so a
//! peer that subscribes to our Service Changed characteristic gets told, a
//! bounded number of times per peer, after a short delay.

use crate::connection::{ConnectionHandle, ConnectionId, GapLeConnection};
use crate::gap::BondingId;
use crate::gatt::constants::*;
use crate::gatt::types::{AttHandleRange, Service};
use crate::stack::{BleStack, DeferredWork, StackState};
use crate::timer::TimerId;
use byteorder::{ByteOrder, LittleEndian};
use log::{debug, info, warn};
use std::collections::HashMap;

/// Service Changed bookkeeping of one connection
#[derive(Debug, Default)]
pub(crate) struct ServiceChangedState {
    /// Value handle of the peer's Service Changed characteristic
    pub att_handle: Option<u16>,
    pub cccd_handle: Option<u16>,
    /// Our own indication to this peer is waiting on its timer
    pub indication_pending: bool,
    /// Indications scheduled for an unbonded peer on this link
    pub indications_sent: u8,
}

impl ServiceChangedState {
    pub fn reset_client(&mut self) {
        self.att_handle = None;
        self.cccd_handle = None;
    }
}

/// Indication budget across reconnections, kept only for bonded peers
///
/// An unbonded peer has no identity that outlives its link, so its budget
/// lives in the connection's [`ServiceChangedState`] instead.
#[derive(Debug, Default)]
pub(crate) struct ServiceChangedServer {
    fw_updated: bool,
    indications_sent: HashMap<BondingId, u8>,
}

impl ServiceChangedServer {
    pub fn forget_bonding(&mut self, bonding_id: BondingId) {
        self.indications_sent.remove(&bonding_id);
    }
}

impl BleStack {
    /// Inspects a freshly discovered service for the peer's Service Changed characteristic
    pub(crate) fn service_changed_on_discovered(
        &self,
        connection: &mut GapLeConnection,
        service: &Service,
    ) {
        if service.uuid != GATT_PROFILE_SERVICE_UUID {
            return;
        }
        let Some(characteristic) = service
            .characteristics
            .iter()
            .find(|c| c.uuid == SERVICE_CHANGED_CHARACTERISTIC_UUID)
        else {
            debug!("GATT Profile Service on {} has no Service Changed", connection.device);
            return;
        };

        let state = &mut connection.service_changed;
        state.att_handle = Some(characteristic.value_handle);
        state.cccd_handle = characteristic.cccd_handle();

        let Some(cccd_handle) = state.cccd_handle else {
            debug!("Service Changed on {} has no CCCD", connection.device);
            return;
        };
        match self
            .controller
            .write_cccd(connection.handle, cccd_handle, CCCD_INDICATIONS)
        {
            Ok(()) => debug!(
                "Subscribing to Service Changed 0x{:04X} on {}",
                characteristic.value_handle, connection.device
            ),
            Err(e) => warn!(
                "Service Changed subscription on {} failed: {}",
                connection.device, e
            ),
        }
    }

    pub(crate) fn handle_service_changed_cccd_response(
        &self,
        connection: &GapLeConnection,
        status: i32,
    ) {
        if status == 0 {
            info!("Subscribed to Service Changed on {}", connection.device);
        } else {
            warn!(
                "Service Changed subscription on {} rejected, status {}",
                connection.device, status
            );
        }
    }

    /// Handles a value on the peer's Service Changed characteristic
    ///
    /// Returns false when `att_handle` is something else. Malformed payloads
    /// are swallowed.
    pub(crate) fn handle_service_changed_indication(
        &self,
        handle: ConnectionHandle,
        att_handle: u16,
        value: &[u8],
    ) -> bool {
        let mut guard = self.lock();
        let Some(connection) = guard.connections.find_by_handle(handle) else {
            return false;
        };
        if connection.service_changed.att_handle != Some(att_handle) {
            return false;
        }

        if value.len() != SERVICE_CHANGED_VALUE_LEN {
            warn!(
                "Malformed Service Changed from {}: {}",
                connection.device,
                hex::encode(value)
            );
            return true;
        }
        let start = LittleEndian::read_u16(&value[0..2]);
        let end = LittleEndian::read_u16(&value[2..4]);
        let Some(range) = AttHandleRange::new(start, end) else {
            warn!(
                "Service Changed from {} with bad range 0x{:04X}..0x{:04X}",
                connection.device, start, end
            );
            return true;
        };

        info!("{} changed its database in {}", connection.device, range);
        let work = DeferredWork::DiscoverRange {
            connection: connection.id,
            range,
        };
        guard.deferred.push_back(work);
        drop(guard);
        self.worker.schedule();
        true
    }

    /// Marks the local database as changed by a firmware update
    pub fn handle_fw_update(&self) {
        let mut guard = self.lock();
        let server = &mut guard.service_changed_server;
        server.fw_updated = true;
        server.indications_sent.clear();
        for connection in guard.connections.iter_mut() {
            connection.service_changed.indications_sent = 0;
        }
        info!("Firmware updated, peers will be sent Service Changed");
    }

    /// A peer subscribed to our Service Changed characteristic
    pub(crate) fn handle_service_changed_subscribe(&self, handle: ConnectionHandle) {
        let mut guard = self.lock();
        let StackState {
            connections,
            service_changed_server: server,
            ..
        } = &mut *guard;

        let Some(connection) = connections.find_by_handle_mut(handle) else {
            warn!("Service Changed subscribe on unknown handle {}", handle);
            return;
        };
        if !server.fw_updated {
            return;
        }
        if connection.service_changed.indication_pending {
            debug!("Service Changed to {} already pending", connection.device);
            return;
        }

        let sent = match connection.bonding_id {
            Some(bonding_id) => server.indications_sent.entry(bonding_id).or_insert(0),
            None => &mut connection.service_changed.indications_sent,
        };
        if *sent >= self.config.service_changed_max_indications {
            debug!(
                "Service Changed limit reached for {}, not indicating",
                connection.device
            );
            return;
        }
        *sent += 1;
        let sent = *sent;

        connection.service_changed.indication_pending = true;
        self.timers.schedule(
            TimerId::ServiceChangedIndication(connection.id),
            self.config.service_changed_indication_delay,
        );
        debug!(
            "Service Changed to {} scheduled (#{})",
            connection.device, sent
        );
    }

    pub(crate) fn handle_service_changed_timer(&self, connection_id: ConnectionId) {
        let mut guard = self.lock();
        let Some(connection) = guard.connections.find_by_id_mut(connection_id) else {
            debug!("Service Changed timer for gone {}", connection_id);
            return;
        };
        if !connection.service_changed.indication_pending {
            return;
        }
        connection.service_changed.indication_pending = false;

        match self
            .controller
            .send_service_changed_indication(connection.handle, AttHandleRange::FULL)
        {
            Ok(()) => info!("Sent Service Changed to {}", connection.device),
            Err(e) => warn!(
                "Sending Service Changed to {} failed: {}",
                connection.device, e
            ),
        }
    }

    pub(crate) fn cancel_service_changed_timer(&self, connection: &mut GapLeConnection) {
        if connection.service_changed.indication_pending {
            self.timers
                .cancel(TimerId::ServiceChangedIndication(connection.id));
            connection.service_changed.indication_pending = false;
        }
    }
}
