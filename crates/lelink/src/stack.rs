//! The stack context
//!
//! [`BleStack`] owns every connection, intent and subscription table behind a
//! single mutex (the "bt lock"). Every public entry point and every controller
//! callback takes the lock on entry and releases it before returning. The only
//! wait that happens without the lock held is the notification backpressure
//! wait, which blocks on the consuming client's buffer instead.

use crate::config::StackConfig;
use crate::connection::{ConnectionHandle, ConnectionId, ConnectionTable};
use crate::driver::{BondingStore, Controller, ControllerEvent};
use crate::event::{BleEvent, EventSink};
use crate::gap::intents::IntentRegistry;
use crate::gap::{BtDeviceAddress, ClientSet};
use crate::gatt::notification_buffer::NotificationBuffers;
use crate::gatt::service_changed::ServiceChangedServer;
use crate::gatt::types::AttHandleRange;
use crate::timer::{TimerId, TimerService};
use log::{debug, trace};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Hook that wakes the background execution context
///
/// Work that must not run inside a controller callback is queued on the stack
/// and `schedule` is called; the background context then calls
/// [`BleStack::process_deferred_work`].
pub trait BackgroundWorker: Send + Sync {
    fn schedule(&self);
}

/// Work queued for the background context
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum DeferredWork {
    /// Rediscover a range the peer reported as changed
    DiscoverRange {
        connection: ConnectionId,
        range: AttHandleRange,
    },
}

/// Everything guarded by the bt lock
#[derive(Debug, Default)]
pub(crate) struct StackState {
    pub connections: ConnectionTable,
    pub intents: IntentRegistry,
    pub service_changed_server: ServiceChangedServer,
    pub deferred: VecDeque<DeferredWork>,
}

/// LE GAP/GATT client stack shared by the Kernel and App clients
pub struct BleStack {
    pub(crate) config: StackConfig,
    state: Mutex<StackState>,
    pub(crate) controller: Arc<dyn Controller>,
    pub(crate) bonding_store: Arc<dyn BondingStore>,
    pub(crate) timers: Arc<dyn TimerService>,
    pub(crate) events: Arc<dyn EventSink>,
    pub(crate) worker: Arc<dyn BackgroundWorker>,
    pub(crate) notifications: NotificationBuffers,
}

impl BleStack {
    /// Creates a stack with no connections and no intents
    pub fn new(
        config: StackConfig,
        controller: Arc<dyn Controller>,
        bonding_store: Arc<dyn BondingStore>,
        timers: Arc<dyn TimerService>,
        events: Arc<dyn EventSink>,
        worker: Arc<dyn BackgroundWorker>,
    ) -> Self {
        let notifications = NotificationBuffers::new(config.notification_buffer_size);
        Self {
            config,
            state: Mutex::new(StackState::default()),
            controller,
            bonding_store,
            timers,
            events,
            worker,
            notifications,
        }
    }

    pub fn config(&self) -> &StackConfig {
        &self.config
    }

    /// Takes the bt lock
    ///
    /// State is consistent between calls, so a panic in another thread does
    /// not invalidate it.
    pub(crate) fn lock(&self) -> MutexGuard<'_, StackState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sends a copy of `event` to every client in `clients`
    pub(crate) fn emit(&self, clients: ClientSet, event: BleEvent) {
        for client in clients.clients() {
            trace!("Event to {:?}: {:?}", client, event);
            self.events.send(client, event.clone());
        }
    }

    /// Routes one controller callback to its handler
    pub fn handle_controller_event(&self, event: ControllerEvent) {
        match event {
            ControllerEvent::ConnectionComplete(event) => self.handle_connection_complete(&event),
            ControllerEvent::DisconnectionComplete(event) => {
                self.handle_disconnection_complete(&event)
            }
            ControllerEvent::EncryptionChange(event) => self.handle_encryption_change(&event),
            ControllerEvent::ServiceDiscovered { handle, service } => {
                self.handle_service_discovered(handle, service)
            }
            ControllerEvent::ServiceDiscoveryComplete { handle, status } => {
                self.handle_service_discovery_complete(handle, status)
            }
            ControllerEvent::CccdWriteResponse {
                handle,
                cccd_handle,
                status,
            } => self.handle_write_cccd_response(handle, cccd_handle, status),
            ControllerEvent::ServiceChangedSubscribed { handle } => {
                self.handle_service_changed_subscribe(handle)
            }
            ControllerEvent::HandleValue {
                handle,
                att_handle,
                value,
            } => self.handle_handle_value(handle, att_handle, &value),
        }
    }

    /// Inbound notification or indication: Service Changed first, then subscribers
    pub fn handle_handle_value(&self, handle: ConnectionHandle, att_handle: u16, value: &[u8]) {
        if self.handle_service_changed_indication(handle, att_handle, value) {
            return;
        }
        self.handle_server_notification(handle, att_handle, value);
    }

    /// Dispatches an expired timer; stale timers are ignored
    pub fn handle_timer_expired(&self, timer: TimerId) {
        match timer {
            TimerId::DiscoveryWatchdog(connection) => self.handle_discovery_watchdog(connection),
            TimerId::ServiceChangedIndication(connection) => {
                self.handle_service_changed_timer(connection)
            }
        }
    }

    pub fn has_deferred_work(&self) -> bool {
        !self.lock().deferred.is_empty()
    }

    /// Runs queued background work; call from the background context
    pub fn process_deferred_work(&self) {
        loop {
            let work = self.lock().deferred.pop_front();
            let Some(work) = work else {
                break;
            };
            match work {
                DeferredWork::DiscoverRange { connection, range } => {
                    if let Err(e) = self.discover_range(connection, range) {
                        debug!(
                            "Deferred rediscovery of {} on {} not started: {}",
                            range, connection, e
                        );
                    }
                }
            }
        }
    }

    pub fn is_connected(&self, device: &BtDeviceAddress) -> bool {
        self.lock().connections.find_by_device(device).is_some()
    }

    pub fn connection_count(&self) -> usize {
        self.lock().connections.len()
    }
}
