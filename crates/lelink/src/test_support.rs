//! Fakes shared by the unit tests

use crate::config::StackConfig;
use crate::connection::ConnectionHandle;
use crate::driver::{
    BondingStore, ConnectionCompleteEvent, Controller, ControllerEvent,
    DisconnectionCompleteEvent, EncryptionChangeEvent,
};
use crate::error::{BtError, BtResult};
use crate::event::{BleEvent, ChannelEventSink, ClientReceivers};
use crate::gap::{BondingId, BtDeviceAddress, ClientId, LinkRole, HCI_ERROR_CODE_SUCCESS};
use crate::gatt::constants::*;
use crate::gatt::types::*;
use crate::stack::{BackgroundWorker, BleStack};
use crate::timer::ManualTimerService;
use crate::uuid::Uuid;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Every request the stack made, in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControllerCall {
    WhitelistAdd(BtDeviceAddress),
    WhitelistRemove(BtDeviceAddress),
    CreateConnection,
    CancelCreateConnection,
    Disconnect(ConnectionHandle, u8),
    StartDiscovery(ConnectionHandle, AttHandleRange),
    StopDiscovery(ConnectionHandle),
    WriteCccd(ConnectionHandle, u16, u16),
    ServiceChangedIndication(ConnectionHandle, AttHandleRange),
}

/// Recording controller with injectable failures
#[derive(Default)]
pub struct FakeController {
    calls: Mutex<Vec<ControllerCall>>,
    pub fail_stop_discovery: Mutex<Option<BtError>>,
    pub fail_start_discovery: Mutex<Option<BtError>>,
    pub fail_write_cccd: Mutex<Option<BtError>>,
    pub fail_disconnect: Mutex<Option<BtError>>,
}

impl FakeController {
    fn record(&self, call: ControllerCall, failure: &Mutex<Option<BtError>>) -> BtResult<()> {
        self.calls.lock().unwrap().push(call);
        match *failure.lock().unwrap() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub fn calls(&self) -> Vec<ControllerCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, matches: impl Fn(&ControllerCall) -> bool) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| matches(c)).count()
    }

    pub fn start_discovery_count(&self) -> usize {
        self.count(|c| matches!(c, ControllerCall::StartDiscovery(..)))
    }

    pub fn stop_discovery_count(&self) -> usize {
        self.count(|c| matches!(c, ControllerCall::StopDiscovery(..)))
    }

    pub fn write_cccd_count(&self) -> usize {
        self.count(|c| matches!(c, ControllerCall::WriteCccd(..)))
    }

    pub fn disconnects(&self) -> Vec<ConnectionHandle> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                ControllerCall::Disconnect(handle, _) => Some(handle),
                _ => None,
            })
            .collect()
    }

    pub fn clear(&self) {
        self.calls.lock().unwrap().clear();
    }
}

impl Controller for FakeController {
    fn whitelist_add(&self, device: &BtDeviceAddress) -> BtResult<()> {
        self.record(ControllerCall::WhitelistAdd(*device), &Mutex::new(None))
    }

    fn whitelist_remove(&self, device: &BtDeviceAddress) -> BtResult<()> {
        self.record(ControllerCall::WhitelistRemove(*device), &Mutex::new(None))
    }

    fn create_connection(&self) -> BtResult<()> {
        self.record(ControllerCall::CreateConnection, &Mutex::new(None))
    }

    fn cancel_create_connection(&self) -> BtResult<()> {
        self.record(ControllerCall::CancelCreateConnection, &Mutex::new(None))
    }

    fn disconnect(&self, handle: ConnectionHandle, reason: u8) -> BtResult<()> {
        self.record(
            ControllerCall::Disconnect(handle, reason),
            &self.fail_disconnect,
        )
    }

    fn start_discovery(&self, handle: ConnectionHandle, range: AttHandleRange) -> BtResult<()> {
        self.record(
            ControllerCall::StartDiscovery(handle, range),
            &self.fail_start_discovery,
        )
    }

    fn stop_discovery(&self, handle: ConnectionHandle) -> BtResult<()> {
        self.record(
            ControllerCall::StopDiscovery(handle),
            &self.fail_stop_discovery,
        )
    }

    fn write_cccd(&self, handle: ConnectionHandle, cccd_handle: u16, value: u16) -> BtResult<()> {
        self.record(
            ControllerCall::WriteCccd(handle, cccd_handle, value),
            &self.fail_write_cccd,
        )
    }

    fn send_service_changed_indication(
        &self,
        handle: ConnectionHandle,
        range: AttHandleRange,
    ) -> BtResult<()> {
        self.record(
            ControllerCall::ServiceChangedIndication(handle, range),
            &Mutex::new(None),
        )
    }
}

/// In-memory bonding store
#[derive(Default)]
pub struct FakeBondingStore {
    bondings: Mutex<HashMap<BondingId, BtDeviceAddress>>,
}

impl FakeBondingStore {
    pub fn add(&self, bonding_id: BondingId, device: BtDeviceAddress) {
        self.bondings.lock().unwrap().insert(bonding_id, device);
    }
}

impl BondingStore for FakeBondingStore {
    fn device_for_bonding(&self, bonding_id: BondingId) -> Option<BtDeviceAddress> {
        self.bondings.lock().unwrap().get(&bonding_id).copied()
    }

    fn bonding_for_device(&self, device: &BtDeviceAddress) -> Option<BondingId> {
        self.bondings
            .lock()
            .unwrap()
            .iter()
            .find(|(_, d)| *d == device)
            .map(|(id, _)| *id)
    }
}

/// Counts wake-ups; tests drain work themselves
#[derive(Default)]
pub struct CountingWorker {
    pub scheduled: AtomicUsize,
}

impl BackgroundWorker for CountingWorker {
    fn schedule(&self) {
        self.scheduled.fetch_add(1, Ordering::SeqCst);
    }
}

pub struct TestStack {
    pub stack: Arc<BleStack>,
    pub controller: Arc<FakeController>,
    pub bondings: Arc<FakeBondingStore>,
    pub timers: Arc<ManualTimerService>,
    pub worker: Arc<CountingWorker>,
    pub receivers: ClientReceivers,
}

impl TestStack {
    pub fn new() -> Self {
        Self::with_config(StackConfig::default())
    }

    pub fn with_config(config: StackConfig) -> Self {
        let controller = Arc::new(FakeController::default());
        let bondings = Arc::new(FakeBondingStore::default());
        let timers = Arc::new(ManualTimerService::new());
        let worker = Arc::new(CountingWorker::default());
        let (sink, receivers) = ChannelEventSink::new();
        let stack = Arc::new(BleStack::new(
            config,
            controller.clone(),
            bondings.clone(),
            timers.clone(),
            Arc::new(sink),
            worker.clone(),
        ));
        Self {
            stack,
            controller,
            bondings,
            timers,
            worker,
            receivers,
        }
    }

    /// Everything queued for `client` so far
    pub fn events(&self, client: ClientId) -> Vec<BleEvent> {
        self.receivers.for_client(client).try_iter().collect()
    }

    pub fn connect_link(&self, handle: ConnectionHandle, device: BtDeviceAddress, role: LinkRole) {
        self.stack
            .handle_controller_event(ControllerEvent::ConnectionComplete(
                ConnectionCompleteEvent {
                    status: HCI_ERROR_CODE_SUCCESS,
                    handle,
                    device,
                    role,
                },
            ));
    }

    pub fn encrypt_link(&self, handle: ConnectionHandle) {
        self.stack
            .handle_controller_event(ControllerEvent::EncryptionChange(EncryptionChangeEvent {
                handle,
                status: HCI_ERROR_CODE_SUCCESS,
                encrypted: true,
            }));
    }

    pub fn drop_link(&self, handle: ConnectionHandle, reason: u8) {
        self.stack
            .handle_controller_event(ControllerEvent::DisconnectionComplete(
                DisconnectionCompleteEvent { handle, reason },
            ));
    }

    pub fn discovered(&self, handle: ConnectionHandle, service: Service) {
        self.stack
            .handle_controller_event(ControllerEvent::ServiceDiscovered { handle, service });
    }

    pub fn discovery_complete(&self, handle: ConnectionHandle, status: i32) {
        self.stack
            .handle_controller_event(ControllerEvent::ServiceDiscoveryComplete { handle, status });
    }

    pub fn cccd_response(&self, handle: ConnectionHandle, cccd_handle: u16, status: i32) {
        self.stack.handle_controller_event(ControllerEvent::CccdWriteResponse {
            handle,
            cccd_handle,
            status,
        });
    }

    pub fn value(&self, handle: ConnectionHandle, att_handle: u16, value: &[u8]) {
        self.stack.handle_controller_event(ControllerEvent::HandleValue {
            handle,
            att_handle,
            value: value.to_vec(),
        });
    }

    /// Connects `device` (remote initiated) and runs a full discovery finding `services`
    pub fn connect_and_discover(
        &self,
        handle: ConnectionHandle,
        device: BtDeviceAddress,
        services: &[Service],
    ) {
        self.connect_link(handle, device, LinkRole::Slave);
        self.stack.discover_all(&device).unwrap();
        for service in services {
            self.discovered(handle, service.clone());
        }
        self.discovery_complete(handle, 0);
    }
}

pub fn device(last: u8) -> BtDeviceAddress {
    BtDeviceAddress::public([last, 0x22, 0x33, 0x44, 0x55, 0x66])
}

/// Custom service at 0x0010..=0x001F with one characteristic
///
/// Value handle 0x0012, CCCD 0x0013.
pub fn sensor_service(properties: CharacteristicProperties) -> Service {
    Service {
        uuid: Uuid::from_u16(0x180D),
        handle_range: AttHandleRange::new(0x0010, 0x001F).unwrap(),
        included_services: Vec::new(),
        characteristics: vec![Characteristic {
            uuid: Uuid::from_u16(0x2A37),
            value_handle: 0x0012,
            properties,
            descriptors: vec![Descriptor {
                uuid: Uuid::from_u16(CLIENT_CHAR_CONFIG_UUID),
                handle: 0x0013,
            }],
        }],
    }
}

/// GATT Profile Service at 0x0001..=0x0005, Service Changed value 0x0003, CCCD 0x0004
pub fn gatt_profile_service() -> Service {
    Service {
        uuid: Uuid::from_u16(GATT_PROFILE_SERVICE_UUID),
        handle_range: AttHandleRange::new(0x0001, 0x0005).unwrap(),
        included_services: Vec::new(),
        characteristics: vec![Characteristic {
            uuid: Uuid::from_u16(SERVICE_CHANGED_CHARACTERISTIC_UUID),
            value_handle: 0x0003,
            properties: CharacteristicProperties::INDICATE,
            descriptors: vec![Descriptor {
                uuid: Uuid::from_u16(CLIENT_CHAR_CONFIG_UUID),
                handle: 0x0004,
            }],
        }],
    }
}
