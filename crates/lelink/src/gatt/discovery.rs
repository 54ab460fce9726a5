//! GATT service discovery engine
//!
//! The controller can only run one discovery per connection at a time, so each
//! connection keeps a running job plus a FIFO of queued ones. Every job a
//! client (or the Service Changed client) starts ends in exactly one
//! [`BleEvent::ServiceDiscovery`], including when the link drops or the
//! watchdog gives up.

use crate::connection::{ConnectionId, DiscoveredService, GapLeConnection};
use crate::error::{BtError, BtResult};
use crate::event::BleEvent;
use crate::gap::{BtDeviceAddress, ClientSet};
use crate::gatt::types::{AttHandleRange, CharacteristicRef, Service};
use crate::stack::{BleStack, StackState};
use crate::timer::TimerId;
use crate::uuid::Uuid;
use log::{debug, info, warn};
use std::collections::VecDeque;

/// Discovery of one handle range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct DiscoveryJob {
    pub range: AttHandleRange,
}

#[derive(Debug, Default)]
pub(crate) struct DiscoveryState {
    /// Job currently outstanding against the controller
    pub running: Option<DiscoveryJob>,
    pub queued: VecDeque<DiscoveryJob>,
    /// Watchdog firings for the running job
    pub retries: u8,
    /// A full discovery finished and nothing has invalidated it since
    pub has_completed: bool,
}

impl DiscoveryState {
    pub fn is_busy(&self) -> bool {
        self.running.is_some() || !self.queued.is_empty()
    }

    /// Number of jobs still owed a terminal event
    fn outstanding(&self) -> usize {
        usize::from(self.running.is_some()) + self.queued.len()
    }
}

impl BleStack {
    /// Discovers every service on the connection to `device`
    ///
    /// Once a discovery has completed, further calls answer from the cache with
    /// an immediate completion event and no controller traffic.
    pub fn discover_all(&self, device: &BtDeviceAddress) -> BtResult<()> {
        let mut guard = self.lock();
        let StackState {
            connections,
            intents,
            ..
        } = &mut *guard;

        let connection = connections
            .find_by_device_mut(device)
            .ok_or(BtError::InvalidParameter)?;
        if connection.discovery.is_busy() {
            return Err(BtError::InvalidState);
        }
        let clients = intents.interested_clients(connection);

        if connection.discovery.has_completed {
            debug!("Services of {} already discovered, using cache", device);
            self.emit_discovery_event(connection, clients, Ok(()));
            return Ok(());
        }

        // Leftovers of a failed attempt
        connection.services.clear();
        self.start_discovery_job(connection, DiscoveryJob {
            range: AttHandleRange::FULL,
        })?;
        info!("Discovering all services of {}", device);
        Ok(())
    }

    /// Throws away everything known about the remote database and discovers it again
    pub fn rediscover_all(&self, device: &BtDeviceAddress) -> BtResult<()> {
        let mut guard = self.lock();
        let StackState {
            connections,
            intents,
            ..
        } = &mut *guard;

        let connection = connections
            .find_by_device_mut(device)
            .ok_or(BtError::InvalidParameter)?;
        let clients = intents.interested_clients(connection);

        if connection.discovery.running.is_some() {
            if let Err(e) = self.controller.stop_discovery(connection.handle) {
                debug!("Stopping superseded discovery failed: {}", e);
            }
        }
        self.timers.cancel(TimerId::DiscoveryWatchdog(connection.id));
        connection.discovery = DiscoveryState::default();

        connection.services.clear();
        self.cleanup_subscriptions_for_connection(connection, false);
        connection.service_changed.reset_client();
        connection.discovery_generation = connection.discovery_generation.wrapping_add(1);
        info!(
            "Rediscovering all services of {}, generation {}",
            device, connection.discovery_generation
        );
        self.emit_discovery_event(
            connection,
            clients,
            Err(BtError::ServiceDiscoveryDatabaseChanged),
        );

        let job = DiscoveryJob {
            range: AttHandleRange::FULL,
        };
        if let Err(e) = self.start_discovery_job(connection, job) {
            self.emit_discovery_event(connection, clients, Err(e));
            return Err(e);
        }
        Ok(())
    }

    /// Discovers `range` again, queueing behind a running job
    ///
    /// Used for ranges a peer reported as changed. Identical queued ranges are
    /// kept as separate jobs.
    pub(crate) fn discover_range(
        &self,
        connection_id: ConnectionId,
        range: AttHandleRange,
    ) -> BtResult<()> {
        let mut guard = self.lock();
        let StackState {
            connections,
            intents,
            ..
        } = &mut *guard;

        let connection = connections
            .find_by_id_mut(connection_id)
            .ok_or(BtError::InvalidParameter)?;
        let job = DiscoveryJob { range };

        if connection.discovery.is_busy() {
            connection
                .discovery
                .queued
                .try_reserve(1)
                .map_err(|_| BtError::NotEnoughResources)?;
            connection.discovery.queued.push_back(job);
            debug!(
                "Queued discovery of {} on {} ({} waiting)",
                range,
                connection.device,
                connection.discovery.queued.len()
            );
            return Ok(());
        }

        let clients = intents.interested_clients(connection);
        self.invalidate_range(connection, clients, range);
        if let Err(e) = self.start_discovery_job(connection, job) {
            self.emit_discovery_event(connection, clients, Err(e));
            return Err(e);
        }
        Ok(())
    }

    pub(crate) fn handle_service_discovered(&self, handle: u16, service: Service) {
        let mut guard = self.lock();
        let Some(connection) = guard.connections.find_by_handle_mut(handle) else {
            warn!("Service discovered on unknown handle {}", handle);
            return;
        };
        if connection.discovery.running.is_none() {
            warn!(
                "Service {} reported with no discovery running on {}",
                service.uuid, connection.device
            );
            return;
        }

        debug!(
            "Discovered service {} at {} on {}",
            service.uuid, service.handle_range, connection.device
        );
        self.service_changed_on_discovered(connection, &service);

        if connection.services.try_reserve(1).is_err() {
            warn!("Out of memory caching service {}", service.uuid);
            return;
        }
        let generation = connection.discovery_generation;
        connection
            .services
            .push(DiscoveredService { generation, service });
    }

    pub(crate) fn handle_service_discovery_complete(&self, handle: u16, status: i32) {
        let mut guard = self.lock();
        let StackState {
            connections,
            intents,
            ..
        } = &mut *guard;

        let Some(connection) = connections.find_by_handle_mut(handle) else {
            warn!("Discovery complete on unknown handle {}", handle);
            return;
        };
        let Some(job) = connection.discovery.running.take() else {
            debug!("Discovery complete with no job running on {}", connection.device);
            return;
        };
        self.timers.cancel(TimerId::DiscoveryWatchdog(connection.id));
        connection.discovery.retries = 0;
        let clients = intents.interested_clients(connection);

        if let Err(e) = BtError::from_driver_status(status) {
            warn!(
                "Discovery of {} on {} failed: {}",
                job.range, connection.device, e
            );
            connection.discovery = DiscoveryState::default();
            self.emit_discovery_event(connection, clients, Err(e));
            return;
        }

        info!(
            "Discovery of {} on {} complete, {} service(s) cached",
            job.range,
            connection.device,
            connection.current_services().count()
        );
        self.emit_discovery_event(connection, clients, Ok(()));

        let Some(next) = connection.discovery.queued.pop_front() else {
            connection.discovery.has_completed = true;
            return;
        };
        self.invalidate_range(connection, clients, next.range);
        if let Err(e) = self.start_discovery_job(connection, next) {
            warn!("Starting queued discovery of {} failed: {}", next.range, e);
            let dropped = connection.discovery.queued.len();
            connection.discovery = DiscoveryState::default();
            self.emit_discovery_event(connection, clients, Err(e));
            if dropped > 0 {
                debug!("Dropped {} queued discovery job(s)", dropped);
            }
        }
    }

    pub(crate) fn handle_discovery_watchdog(&self, connection_id: ConnectionId) {
        let mut guard = self.lock();
        let StackState {
            connections,
            intents,
            ..
        } = &mut *guard;

        let Some(connection) = connections.find_by_id_mut(connection_id) else {
            debug!("Discovery watchdog for gone {}", connection_id);
            return;
        };
        let Some(job) = connection.discovery.running else {
            debug!("Discovery watchdog with no job running on {}", connection.device);
            return;
        };

        if let Err(e) = self.controller.stop_discovery(connection.handle) {
            // Completion or disconnection is already on its way
            debug!("Watchdog could not stop discovery on {}: {}", connection.device, e);
            return;
        }

        connection.discovery.retries += 1;
        let clients = intents.interested_clients(connection);
        if connection.discovery.retries >= self.config.discovery_max_retries {
            warn!(
                "Discovery of {} on {} timed out after {} attempt(s)",
                job.range, connection.device, connection.discovery.retries
            );
            self.fail_discovery(connection, clients, BtError::ServiceDiscoveryTimeout);
            return;
        }

        warn!(
            "Discovery of {} on {} stalled, retry {}",
            job.range, connection.device, connection.discovery.retries
        );
        connection
            .services
            .retain(|s| !s.service.handle_range.overlaps(&job.range));
        match self.controller.start_discovery(connection.handle, job.range) {
            Ok(()) => self.timers.schedule(
                TimerId::DiscoveryWatchdog(connection.id),
                self.config.discovery_watchdog_timeout,
            ),
            Err(e) => {
                warn!("Restarting discovery on {} failed: {}", connection.device, e);
                self.fail_discovery(connection, clients, e);
            }
        }
    }

    /// Resolves every outstanding job of a dropped link with a disconnected error
    pub(crate) fn abort_discovery(&self, connection: &mut GapLeConnection, clients: ClientSet) {
        self.timers.cancel(TimerId::DiscoveryWatchdog(connection.id));
        let outstanding = connection.discovery.outstanding();
        connection.discovery = DiscoveryState::default();
        for _ in 0..outstanding {
            self.emit_discovery_event(
                connection,
                clients,
                Err(BtError::ServiceDiscoveryDisconnected),
            );
        }
    }

    /// Snapshot of the services cached for `device`
    pub fn discovered_services(&self, device: &BtDeviceAddress) -> Vec<Service> {
        self.lock()
            .connections
            .find_by_device(device)
            .map(|c| c.current_services().cloned().collect())
            .unwrap_or_default()
    }

    pub fn discovered_service_count(&self, device: &BtDeviceAddress) -> usize {
        self.lock()
            .connections
            .find_by_device(device)
            .map_or(0, |c| c.current_services().count())
    }

    pub fn is_discovery_in_progress(&self, device: &BtDeviceAddress) -> bool {
        self.lock()
            .connections
            .find_by_device(device)
            .is_some_and(|c| c.discovery.is_busy())
    }

    /// First cached characteristic with `uuid` on `device`
    pub fn find_characteristic(
        &self,
        device: &BtDeviceAddress,
        uuid: &Uuid,
    ) -> Option<CharacteristicRef> {
        let guard = self.lock();
        let connection = guard.connections.find_by_device(device)?;
        let value_handle = connection
            .current_services()
            .flat_map(|s| s.characteristics.iter())
            .find(|c| c.uuid == *uuid)?
            .value_handle;
        Some(connection.characteristic_ref(value_handle))
    }

    fn start_discovery_job(&self, connection: &mut GapLeConnection, job: DiscoveryJob) -> BtResult<()> {
        self.controller.start_discovery(connection.handle, job.range)?;
        connection.discovery.running = Some(job);
        connection.discovery.has_completed = false;
        self.timers.schedule(
            TimerId::DiscoveryWatchdog(connection.id),
            self.config.discovery_watchdog_timeout,
        );
        Ok(())
    }

    /// Drops cached state inside `range` ahead of rediscovering it
    fn invalidate_range(
        &self,
        connection: &mut GapLeConnection,
        clients: ClientSet,
        range: AttHandleRange,
    ) {
        let before = connection.services.len();
        connection
            .services
            .retain(|s| !s.service.handle_range.overlaps(&range));
        let removed_services = before - connection.services.len();
        let removed_subscriptions = self.cleanup_subscriptions_by_att_handle_range(connection, range);

        let service_changed = &mut connection.service_changed;
        if service_changed.att_handle.is_some_and(|h| range.contains(h)) {
            service_changed.reset_client();
        }

        if removed_services > 0 || removed_subscriptions > 0 {
            debug!(
                "Invalidated {} service(s) and {} subscription(s) in {}",
                removed_services, removed_subscriptions, range
            );
            self.emit_discovery_event(
                connection,
                clients,
                Err(BtError::ServiceDiscoveryDatabaseChanged),
            );
        }
    }

    fn fail_discovery(&self, connection: &mut GapLeConnection, clients: ClientSet, error: BtError) {
        self.timers.cancel(TimerId::DiscoveryWatchdog(connection.id));
        connection.discovery = DiscoveryState::default();
        self.emit_discovery_event(connection, clients, Err(error));
    }

    fn emit_discovery_event(
        &self,
        connection: &GapLeConnection,
        clients: ClientSet,
        status: BtResult<()>,
    ) {
        self.emit(
            clients,
            BleEvent::ServiceDiscovery {
                device: connection.device,
                status,
            },
        );
    }
}
