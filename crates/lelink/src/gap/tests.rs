//! Unit tests for the connection intent registry

use crate::driver::{ConnectionCompleteEvent, ControllerEvent};
use crate::error::BtError;
use crate::event::BleEvent;
use crate::gap::*;
use crate::test_support::*;

fn connection_event(connected: bool, reason: LinkEventReason) -> impl Fn(&BleEvent) -> bool {
    move |event: &BleEvent| {
        matches!(event, BleEvent::Connection { connected: c, reason: r, .. }
            if *c == connected && *r == reason)
    }
}

#[test]
fn test_intent_co_ownership() {
    let ts = TestStack::new();
    let dev = device(1);

    ts.stack.connect(&dev, false, false, ClientId::Kernel).unwrap();
    ts.stack.connect(&dev, false, false, ClientId::App).unwrap();

    assert_eq!(ts.stack.connection_intents_count(), 1);
    assert!(ts.stack.has_connection_intent(&dev, ClientId::Kernel));
    assert!(ts.stack.has_connection_intent(&dev, ClientId::App));
    assert_eq!(
        ts.controller
            .count(|c| *c == ControllerCall::WhitelistAdd(dev)),
        1
    );
    assert_eq!(
        ts.controller
            .count(|c| *c == ControllerCall::CreateConnection),
        1
    );

    ts.stack.cancel(&dev, ClientId::Kernel).unwrap();
    assert_eq!(ts.stack.connection_intents_count(), 1);
    assert!(!ts.stack.has_connection_intent(&dev, ClientId::Kernel));
    assert!(ts.stack.has_connection_intent(&dev, ClientId::App));
    assert_eq!(
        ts.controller
            .count(|c| *c == ControllerCall::WhitelistRemove(dev)),
        0
    );
}

#[test]
fn test_duplicate_registration_rejected() {
    let ts = TestStack::new();
    let dev = device(1);

    ts.stack.connect(&dev, false, false, ClientId::Kernel).unwrap();
    assert_eq!(
        ts.stack.connect(&dev, true, false, ClientId::Kernel),
        Err(BtError::InvalidState)
    );
    assert_eq!(ts.stack.connection_intents_count(), 1);
}

#[test]
fn test_null_device_rejected() {
    let ts = TestStack::new();
    assert_eq!(
        ts.stack
            .connect(&BtDeviceAddress::default(), false, false, ClientId::Kernel),
        Err(BtError::InvalidParameter)
    );
    assert_eq!(
        ts.stack
            .connect_by_bonding(BondingId(9), false, false, ClientId::Kernel),
        Err(BtError::InvalidParameter)
    );
    assert!(ts.controller.calls().is_empty());
}

#[test]
fn test_intent_resource_bound() {
    let ts = TestStack::new();

    for i in 0..GAP_LE_CONNECT_MASTER_MAX_CONNECTION_INTENTS {
        let dev = device(i as u8 + 1);
        assert_eq!(ts.stack.connect(&dev, false, false, ClientId::Kernel), Ok(()));
    }

    let extra = device(0xF0);
    assert_eq!(
        ts.stack.connect(&extra, false, false, ClientId::Kernel),
        Err(BtError::NotEnoughResources)
    );
    assert!(!ts.stack.has_connection_intent(&extra, ClientId::Kernel));
    assert_eq!(
        ts.stack.connection_intents_count(),
        GAP_LE_CONNECT_MASTER_MAX_CONNECTION_INTENTS
    );
    assert_eq!(
        ts.controller
            .count(|c| *c == ControllerCall::WhitelistAdd(extra)),
        0
    );

    // A second owner on an existing intent does not take a slot
    assert_eq!(
        ts.stack.connect(&device(1), false, false, ClientId::App),
        Ok(())
    );
}

#[test]
fn test_pairing_gating() {
    let ts = TestStack::new();
    let dev = device(1);

    ts.stack.connect(&dev, false, true, ClientId::Kernel).unwrap();
    ts.connect_link(1, dev, LinkRole::Master);
    assert!(ts.events(ClientId::Kernel).is_empty());

    ts.encrypt_link(1);
    let events = ts.events(ClientId::Kernel);
    assert_eq!(events.len(), 1);
    assert!(connection_event(true, LinkEventReason::SUCCESS)(&events[0]));
    assert!(ts.events(ClientId::App).is_empty());
}

#[test]
fn test_pairing_never_completed_reports_failure() {
    let ts = TestStack::new();
    let dev = device(1);

    ts.stack.connect(&dev, false, true, ClientId::App).unwrap();
    ts.connect_link(1, dev, LinkRole::Master);
    ts.drop_link(1, HCI_ERROR_CODE_CONNECTION_TIMEOUT);

    let events = ts.events(ClientId::App);
    assert_eq!(events.len(), 1);
    assert!(connection_event(
        false,
        LinkEventReason::Hci(HCI_ERROR_CODE_AUTHENTICATION_FAILURE)
    )(&events[0]));
}

#[test]
fn test_bonding_connect_encrypt_disconnect_reconnect() {
    let ts = TestStack::new();
    let dev = device(1);
    let bonding = BondingId(7);
    ts.bondings.add(bonding, dev);

    ts.stack
        .connect_by_bonding(bonding, true, false, ClientId::App)
        .unwrap();
    ts.connect_link(5, dev, LinkRole::Slave);
    ts.encrypt_link(5);

    let events = ts.events(ClientId::App);
    assert_eq!(events.len(), 1);
    assert_eq!(
        events[0],
        BleEvent::Connection {
            device: dev,
            bonding_id: Some(bonding),
            connected: true,
            reason: LinkEventReason::Hci(HCI_ERROR_CODE_SUCCESS),
        }
    );

    ts.drop_link(5, HCI_ERROR_CODE_CONNECTION_TERMINATED_BY_LOCAL_HOST);
    let events = ts.events(ClientId::App);
    assert_eq!(events.len(), 1);
    assert!(connection_event(
        false,
        LinkEventReason::Hci(HCI_ERROR_CODE_CONNECTION_TERMINATED_BY_LOCAL_HOST)
    )(&events[0]));

    // Auto-reconnect keeps the intent
    assert!(ts.stack.has_connection_intent_for_bonding(bonding, ClientId::App));
    ts.connect_link(6, dev, LinkRole::Slave);
    let events = ts.events(ClientId::App);
    assert_eq!(events.len(), 1);
    assert!(connection_event(true, LinkEventReason::SUCCESS)(&events[0]));
}

#[test]
fn test_non_auto_reconnect_intent_dropped_on_disconnect() {
    let ts = TestStack::new();
    let once = device(1);
    let sticky = device(2);

    ts.stack.connect(&once, false, false, ClientId::Kernel).unwrap();
    ts.stack.connect(&sticky, true, false, ClientId::Kernel).unwrap();
    ts.connect_link(1, once, LinkRole::Master);
    ts.connect_link(2, sticky, LinkRole::Master);
    ts.drop_link(1, HCI_ERROR_CODE_CONNECTION_TIMEOUT);
    ts.drop_link(2, HCI_ERROR_CODE_CONNECTION_TIMEOUT);

    assert!(!ts.stack.has_connection_intent(&once, ClientId::Kernel));
    assert!(ts.stack.has_connection_intent(&sticky, ClientId::Kernel));
    assert_eq!(
        ts.controller
            .count(|c| *c == ControllerCall::WhitelistRemove(once)),
        1
    );
    assert_eq!(
        ts.controller
            .count(|c| *c == ControllerCall::WhitelistRemove(sticky)),
        0
    );
    assert!(ts.stack.has_pending_create_connection());
}

#[test]
fn test_existing_link_notifies_only_new_owner() {
    let ts = TestStack::new();
    let dev = device(1);

    ts.stack.connect(&dev, false, false, ClientId::Kernel).unwrap();
    ts.connect_link(1, dev, LinkRole::Master);
    assert_eq!(ts.events(ClientId::Kernel).len(), 1);

    ts.stack.connect(&dev, false, false, ClientId::App).unwrap();
    assert!(ts.events(ClientId::Kernel).is_empty());
    let events = ts.events(ClientId::App);
    assert_eq!(events.len(), 1);
    assert!(connection_event(true, LinkEventReason::SUCCESS)(&events[0]));
}

#[test]
fn test_cancel_errors() {
    let ts = TestStack::new();
    let dev = device(1);

    assert_eq!(
        ts.stack.cancel(&dev, ClientId::Kernel),
        Err(BtError::InvalidParameter)
    );
    ts.stack.connect(&dev, false, false, ClientId::Kernel).unwrap();
    assert_eq!(
        ts.stack.cancel(&dev, ClientId::App),
        Err(BtError::InvalidParameter)
    );
    assert_eq!(
        ts.stack.cancel_by_bonding(BondingId(1), ClientId::Kernel),
        Err(BtError::InvalidParameter)
    );
}

#[test]
fn test_cancel_connected_link_waits_for_disconnection() {
    let ts = TestStack::new();
    let dev = device(1);

    ts.stack.connect(&dev, false, false, ClientId::Kernel).unwrap();
    ts.connect_link(1, dev, LinkRole::Master);
    ts.events(ClientId::Kernel);

    ts.stack.cancel(&dev, ClientId::Kernel).unwrap();
    assert_eq!(ts.stack.connection_intents_count(), 0);
    assert_eq!(ts.controller.disconnects(), vec![1]);
    assert!(ts.events(ClientId::Kernel).is_empty());

    ts.drop_link(1, HCI_ERROR_CODE_CONNECTION_TERMINATED_BY_LOCAL_HOST);
    let events = ts.events(ClientId::Kernel);
    assert_eq!(events.len(), 1);
    assert!(connection_event(false, LinkEventReason::CancelConnect)(&events[0]));
}

#[test]
fn test_cancel_keeps_link_for_remaining_owner() {
    let ts = TestStack::new();
    let dev = device(1);

    ts.stack.connect(&dev, false, false, ClientId::Kernel).unwrap();
    ts.stack.connect(&dev, false, false, ClientId::App).unwrap();
    ts.connect_link(1, dev, LinkRole::Master);
    ts.events(ClientId::Kernel);
    ts.events(ClientId::App);

    ts.stack.cancel(&dev, ClientId::Kernel).unwrap();
    assert!(ts.controller.disconnects().is_empty());
    let events = ts.events(ClientId::Kernel);
    assert_eq!(events.len(), 1);
    assert!(connection_event(false, LinkEventReason::CancelConnect)(&events[0]));
    assert!(ts.events(ClientId::App).is_empty());
}

#[test]
fn test_cancel_never_drops_remote_initiated_link() {
    let ts = TestStack::new();
    let dev = device(1);

    ts.stack.connect(&dev, false, false, ClientId::App).unwrap();
    ts.connect_link(1, dev, LinkRole::Slave);
    ts.events(ClientId::App);

    ts.stack.cancel(&dev, ClientId::App).unwrap();
    assert!(ts.controller.disconnects().is_empty());
    assert!(ts.stack.is_connected(&dev));
    assert_eq!(ts.events(ClientId::App).len(), 1);
}

#[test]
fn test_cancel_while_connecting_drops_late_link() {
    let ts = TestStack::new();
    let dev = device(1);

    ts.stack.connect(&dev, false, false, ClientId::Kernel).unwrap();
    assert!(ts.stack.has_pending_create_connection());
    ts.stack.cancel(&dev, ClientId::Kernel).unwrap();
    assert_eq!(
        ts.controller
            .count(|c| *c == ControllerCall::CancelCreateConnection),
        1
    );

    // The controller had already connected before the cancel landed
    ts.connect_link(1, dev, LinkRole::Master);
    assert!(!ts.stack.has_pending_create_connection());
    assert_eq!(ts.controller.disconnects(), vec![1]);
    assert!(ts.events(ClientId::Kernel).is_empty());
}

#[test]
fn test_cancel_all() {
    let ts = TestStack::new();

    ts.stack.connect(&device(1), true, false, ClientId::Kernel).unwrap();
    ts.stack.connect(&device(2), false, false, ClientId::Kernel).unwrap();
    ts.stack.connect(&device(2), false, false, ClientId::App).unwrap();

    ts.stack.cancel_all(ClientId::Kernel);
    assert_eq!(ts.stack.connection_intents_count(), 1);
    assert!(ts.stack.has_connection_intent(&device(2), ClientId::App));
    assert!(!ts.stack.has_connection_intent(&device(2), ClientId::Kernel));

    ts.stack.cancel_all(ClientId::Kernel);
    ts.stack.cancel_all(ClientId::App);
    assert_eq!(ts.stack.connection_intents_count(), 0);
    assert_eq!(
        ts.controller
            .count(|c| *c == ControllerCall::CancelCreateConnection),
        1
    );

    // Pending until the controller reports the cancelled attempt
    assert!(ts.stack.has_pending_create_connection());
    let creates = ts
        .controller
        .count(|c| *c == ControllerCall::CreateConnection);
    ts.stack
        .handle_controller_event(ControllerEvent::ConnectionComplete(ConnectionCompleteEvent {
            status: HCI_ERROR_CODE_CONNECTION_FAILED_TO_BE_ESTABLISHED,
            handle: 0,
            device: device(2),
            role: LinkRole::Master,
        }));
    assert!(!ts.stack.has_pending_create_connection());
    assert_eq!(
        ts.controller
            .count(|c| *c == ControllerCall::CreateConnection),
        creates
    );
}

#[test]
fn test_address_and_bonding_intents_tracked_apart() {
    let ts = TestStack::new();
    let dev = device(1);
    let bonding = BondingId(3);
    ts.bondings.add(bonding, dev);

    ts.stack.connect(&dev, false, false, ClientId::Kernel).unwrap();
    ts.stack
        .connect_by_bonding(bonding, false, false, ClientId::Kernel)
        .unwrap();
    assert_eq!(ts.stack.connection_intents_count(), 2);
    assert!(ts.stack.has_connection_intent(&dev, ClientId::Kernel));
    assert!(ts.stack.has_connection_intent_for_bonding(bonding, ClientId::Kernel));
    assert_eq!(
        ts.controller
            .count(|c| *c == ControllerCall::WhitelistAdd(dev)),
        1
    );

    ts.stack.cancel(&dev, ClientId::Kernel).unwrap();
    assert_eq!(
        ts.controller
            .count(|c| *c == ControllerCall::WhitelistRemove(dev)),
        0
    );
    ts.stack.cancel_by_bonding(bonding, ClientId::Kernel).unwrap();
    assert_eq!(
        ts.controller
            .count(|c| *c == ControllerCall::WhitelistRemove(dev)),
        1
    );
}

#[test]
fn test_bonding_added_after_connect() {
    let ts = TestStack::new();
    let dev = device(1);
    let bonding = BondingId(4);
    ts.bondings.add(bonding, dev);

    ts.stack
        .connect_by_bonding(bonding, true, false, ClientId::Kernel)
        .unwrap();
    // The link came up on an address the store could not resolve yet
    let resolved_later = device(2);
    ts.connect_link(1, resolved_later, LinkRole::Slave);
    assert!(ts.events(ClientId::Kernel).is_empty());

    ts.bondings.add(bonding, resolved_later);
    ts.stack.handle_bonding_change(bonding, BondingChangeOp::Added);
    let events = ts.events(ClientId::Kernel);
    assert_eq!(events.len(), 1);
    assert!(connection_event(true, LinkEventReason::SUCCESS)(&events[0]));
}

#[test]
fn test_bonding_will_delete_tears_down() {
    let ts = TestStack::new();
    let dev = device(1);
    let bonding = BondingId(2);
    ts.bondings.add(bonding, dev);

    ts.stack
        .connect_by_bonding(bonding, true, false, ClientId::App)
        .unwrap();
    ts.connect_link(3, dev, LinkRole::Master);
    ts.events(ClientId::App);

    ts.stack
        .handle_bonding_change(bonding, BondingChangeOp::WillDelete);
    let events = ts.events(ClientId::App);
    assert_eq!(events.len(), 1);
    assert!(connection_event(false, LinkEventReason::UserRemovedBonding)(&events[0]));
    assert_eq!(ts.controller.disconnects(), vec![3]);
    assert_eq!(ts.stack.connection_intents_count(), 0);
    assert!(!ts.stack.is_connected(&dev));

    // The controller's own confirmation arrives later and is ignored
    ts.drop_link(3, HCI_ERROR_CODE_CONNECTION_TERMINATED_BY_LOCAL_HOST);
    assert!(ts.events(ClientId::App).is_empty());
}

#[test]
fn test_stack_shutdown_and_restart() {
    let ts = TestStack::new();
    let dev = device(1);

    ts.stack.connect(&dev, true, false, ClientId::Kernel).unwrap();
    ts.connect_link(1, dev, LinkRole::Master);
    ts.events(ClientId::Kernel);

    ts.stack.handle_stack_shutdown();
    let events = ts.events(ClientId::Kernel);
    assert_eq!(events.len(), 1);
    assert!(connection_event(false, LinkEventReason::AirPlaneMode)(&events[0]));
    assert_eq!(ts.stack.connection_count(), 0);
    assert!(!ts.stack.has_pending_create_connection());
    assert!(ts.stack.has_connection_intent(&dev, ClientId::Kernel));

    ts.controller.clear();
    ts.stack.handle_stack_restart();
    assert_eq!(
        ts.controller.calls(),
        vec![
            ControllerCall::WhitelistAdd(dev),
            ControllerCall::CreateConnection
        ]
    );
    assert!(ts.stack.has_pending_create_connection());
}

#[test]
fn test_failed_connection_attempt_restarts_create() {
    let ts = TestStack::new();
    let dev = device(1);
    ts.stack.connect(&dev, false, false, ClientId::Kernel).unwrap();

    ts.stack
        .handle_controller_event(ControllerEvent::ConnectionComplete(ConnectionCompleteEvent {
            status: HCI_ERROR_CODE_CONNECTION_FAILED_TO_BE_ESTABLISHED,
            handle: 0,
            device: dev,
            role: LinkRole::Master,
        }));
    assert_eq!(
        ts.controller
            .count(|c| *c == ControllerCall::CreateConnection),
        2
    );
    assert!(ts.stack.has_pending_create_connection());
    assert!(ts.events(ClientId::Kernel).is_empty());
}
