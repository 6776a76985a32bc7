//! Unit tests for the HCI adapter

use super::constants::*;
use super::*;
use crate::address::{Address, AddressType, BdAddr};
use crate::transport::Transport;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Transport that records every packet the adapter writes.
#[derive(Clone, Default)]
struct MockTransport {
    writes: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl MockTransport {
    fn new() -> (Self, Arc<Mutex<Vec<Vec<u8>>>>) {
        let t = MockTransport::default();
        let log = t.writes.clone();
        (t, log)
    }
}

impl Transport for MockTransport {
    fn write(&mut self, packet: &[u8]) -> io::Result<()> {
        self.writes.lock().unwrap().push(packet.to_vec());
        Ok(())
    }
}

fn command_complete_packet(cmd_opcode: u16, status: u8, ret: &[u8]) -> Vec<u8> {
    let mut params = vec![1u8];
    params.extend_from_slice(&cmd_opcode.to_le_bytes());
    params.push(status);
    params.extend_from_slice(ret);
    let mut packet = vec![HCI_EVENT_PKT, EVT_CMD_COMPLETE, params.len() as u8];
    packet.extend_from_slice(&params);
    packet
}

fn connection_complete_packet(handle: u16, role: u8) -> Vec<u8> {
    let mut params = vec![EVT_LE_CONN_COMPLETE, 0x00];
    params.extend_from_slice(&handle.to_le_bytes());
    params.push(role);
    params.push(0x00); // peer address type
    params.extend_from_slice(&[0x11, 0x22, 0x33, 0x44, 0x55, 0x66]);
    params.extend_from_slice(&0x0018u16.to_le_bytes()); // interval
    params.extend_from_slice(&0x0000u16.to_le_bytes()); // latency
    params.extend_from_slice(&0x00C8u16.to_le_bytes()); // timeout
    params.push(0x00); // clock accuracy
    let mut packet = vec![HCI_EVENT_PKT, EVT_LE_META_EVENT, params.len() as u8];
    packet.extend_from_slice(&params);
    packet
}

fn disconnection_complete_packet(handle: u16, reason: u8) -> Vec<u8> {
    let mut params = vec![0x00];
    params.extend_from_slice(&handle.to_le_bytes());
    params.push(reason);
    let mut packet = vec![HCI_EVENT_PKT, EVT_DISCONN_COMPLETE, params.len() as u8];
    packet.extend_from_slice(&params);
    packet
}

fn completed_packets_packet(handle: u16, count: u16) -> Vec<u8> {
    let mut params = vec![1u8];
    params.extend_from_slice(&handle.to_le_bytes());
    params.extend_from_slice(&count.to_le_bytes());
    let mut packet = vec![
        HCI_EVENT_PKT,
        EVT_NUM_COMPLETED_PACKETS,
        params.len() as u8,
    ];
    packet.extend_from_slice(&params);
    packet
}

/// Brings up an adapter with known LE buffer settings and one connection.
fn connected_adapter(
    acl_mtu: u16,
    buffers: u8,
) -> (HciAdapter, Arc<Mutex<Vec<Vec<u8>>>>, u16) {
    let (transport, log) = MockTransport::new();
    let mut adapter = HciAdapter::new(Box::new(transport));

    adapter.le_read_buffer_size(Box::new(|_, _| {}));
    let mut ret = acl_mtu.to_le_bytes().to_vec();
    ret.push(buffers);
    adapter.handle_packet(&command_complete_packet(
        opcode(OGF_LE, OCF_LE_READ_BUFFER_SIZE),
        0,
        &ret,
    ));

    let handle = 0x0040;
    adapter.handle_packet(&connection_complete_packet(handle, 0x00));
    assert!(adapter.is_connected(handle));
    log.lock().unwrap().clear();
    (adapter, log, handle)
}

#[test]
fn one_command_in_flight() {
    let (transport, log) = MockTransport::new();
    let mut adapter = HciAdapter::new(Box::new(transport));

    let responses = Arc::new(AtomicUsize::new(0));
    let r1 = responses.clone();
    let r2 = responses.clone();
    adapter.reset(Box::new(move |status, _| {
        assert_eq!(status, 0);
        r1.fetch_add(1, Ordering::SeqCst);
    }));
    adapter.set_event_mask(0xFFFF, Box::new(move |_, _| {
        r2.fetch_add(1, Ordering::SeqCst);
    }));

    // Only the reset has hit the wire so far
    assert_eq!(log.lock().unwrap().len(), 1);
    assert_eq!(log.lock().unwrap()[0][1..3], opcode(OGF_HOST_CTL, OCF_RESET).to_le_bytes());

    adapter.handle_packet(&command_complete_packet(opcode(OGF_HOST_CTL, OCF_RESET), 0, &[]));
    assert_eq!(responses.load(Ordering::SeqCst), 1);
    // Completion released the queued command
    assert_eq!(log.lock().unwrap().len(), 2);
}

#[test]
fn foreign_command_responses_are_ignored() {
    let (transport, log) = MockTransport::new();
    let mut adapter = HciAdapter::new(Box::new(transport));

    let fired = Arc::new(AtomicUsize::new(0));
    let f = fired.clone();
    adapter.reset(Box::new(move |_, _| {
        f.fetch_add(1, Ordering::SeqCst);
    }));

    // A response for some other process's command must not consume ours
    adapter.handle_packet(&command_complete_packet(opcode(OGF_LE, OCF_LE_RAND), 0, &[]));
    assert_eq!(fired.load(Ordering::SeqCst), 0);

    adapter.handle_packet(&command_complete_packet(opcode(OGF_HOST_CTL, OCF_RESET), 0, &[]));
    assert_eq!(fired.load(Ordering::SeqCst), 1);
    drop(log);
}

#[test]
fn acl_credits_limit_writes() {
    let (mut adapter, log, handle) = connected_adapter(27, 2);

    let sent = Arc::new(AtomicUsize::new(0));
    let complete = Arc::new(AtomicUsize::new(0));
    let s = sent.clone();
    let c = complete.clone();
    // 60-byte ATT payload -> 64-byte L2CAP PDU -> fragments 27+27+10
    adapter
        .send_data(
            handle,
            4,
            &[0xAA; 60],
            Some(Box::new(move || {
                s.fetch_add(1, Ordering::SeqCst);
            })),
            Some(Box::new(move || {
                c.fetch_add(1, Ordering::SeqCst);
            })),
        )
        .unwrap();

    // Two credits -> two fragments on the wire, final fragment held back
    assert_eq!(log.lock().unwrap().len(), 2);
    assert_eq!(adapter.free_buffers(), 0);
    assert_eq!(sent.load(Ordering::SeqCst), 0);

    adapter.handle_packet(&completed_packets_packet(handle, 1));
    assert_eq!(log.lock().unwrap().len(), 3);
    // The last fragment carries the callbacks
    assert_eq!(sent.load(Ordering::SeqCst), 1);
    assert_eq!(complete.load(Ordering::SeqCst), 0);

    adapter.handle_packet(&completed_packets_packet(handle, 2));
    assert_eq!(complete.load(Ordering::SeqCst), 1);
    assert_eq!(adapter.free_buffers(), 2);
}

#[test]
fn first_fragment_has_start_flag() {
    let (mut adapter, log, handle) = connected_adapter(27, 3);
    adapter.send_data(handle, 4, &[1u8; 40], None, None).unwrap();

    let writes = log.lock().unwrap();
    assert_eq!(writes.len(), 2);
    let flags0 = u16::from_le_bytes([writes[0][1], writes[0][2]]);
    let flags1 = u16::from_le_bytes([writes[1][1], writes[1][2]]);
    assert_eq!((flags0 >> 12) & 0x3, ACL_PB_FIRST_NON_FLUSHABLE as u16);
    assert_eq!((flags1 >> 12) & 0x3, ACL_PB_CONTINUATION as u16);
}

#[test]
fn inbound_fragments_reassemble() {
    let (mut adapter, _log, handle) = connected_adapter(27, 2);

    // L2CAP PDU of 5 bytes on CID 4 split over two ACL fragments
    let mut first = vec![HCI_ACL_PKT];
    let hf = handle | ((ACL_PB_FIRST_FLUSHABLE as u16) << 12);
    first.extend_from_slice(&hf.to_le_bytes());
    first.extend_from_slice(&6u16.to_le_bytes());
    first.extend_from_slice(&[5, 0, 4, 0, 0x10, 0x20]);

    let mut second = vec![HCI_ACL_PKT];
    let hf = handle | ((ACL_PB_CONTINUATION as u16) << 12);
    second.extend_from_slice(&hf.to_le_bytes());
    second.extend_from_slice(&3u16.to_le_bytes());
    second.extend_from_slice(&[0x30, 0x40, 0x50]);

    assert!(adapter.handle_packet(&first).is_empty());
    let notifications = adapter.handle_packet(&second);
    assert_eq!(notifications.len(), 1);
    match &notifications[0] {
        HciNotification::AclData { handle: h, cid, pdu } => {
            assert_eq!(*h, handle);
            assert_eq!(*cid, 4);
            assert_eq!(pdu, &vec![0x10, 0x20, 0x30, 0x40, 0x50]);
        }
        other => panic!("unexpected notification {:?}", other),
    }
}

#[test]
fn disconnect_flushes_tagged_commands() {
    let (mut adapter, log, handle) = connected_adapter(27, 2);

    let version_fired = Arc::new(AtomicUsize::new(0));
    let updates_fired = Arc::new(AtomicUsize::new(0));
    let v = version_fired.clone();
    let u = updates_fired.clone();
    adapter.read_remote_version(handle, Box::new(move |_, _| {
        v.fetch_add(1, Ordering::SeqCst);
    }));
    adapter.le_connection_update(handle, 6, 12, 0, 200, Box::new(move |_, _| {
        u.fetch_add(1, Ordering::SeqCst);
    }));

    let notifications = adapter.handle_packet(&disconnection_complete_packet(handle, 0x13));
    assert!(matches!(
        notifications[0],
        HciNotification::DisconnectionComplete { reason: 0x13, .. }
    ));
    assert!(!adapter.is_connected(handle));

    // The pending command's response is ignored, the queued one was dropped
    adapter.handle_packet(&command_complete_packet(
        opcode(OGF_LINK_CTL, OCF_READ_REMOTE_VERSION),
        0,
        &[],
    ));
    assert_eq!(version_fired.load(Ordering::SeqCst), 0);
    assert_eq!(updates_fired.load(Ordering::SeqCst), 0);
    drop(log);
}

#[test]
fn disconnect_restores_outstanding_credits() {
    let (mut adapter, _log, handle) = connected_adapter(27, 2);
    adapter.send_data(handle, 4, &[0u8; 40], None, None).unwrap();
    assert_eq!(adapter.free_buffers(), 0);

    adapter.handle_packet(&disconnection_complete_packet(handle, 0x13));
    assert_eq!(adapter.free_buffers(), 2);
}

#[test]
fn hardware_error_clears_command_state() {
    let (transport, log) = MockTransport::new();
    let mut adapter = HciAdapter::new(Box::new(transport));

    let errors = Arc::new(Mutex::new(Vec::new()));
    let e = errors.clone();
    adapter.set_hardware_error_callback(move |code| e.lock().unwrap().push(code));

    adapter.reset(Box::new(|_, _| {}));
    adapter.le_rand(Box::new(|_, _| panic!("queued command must be dropped")));
    assert_eq!(log.lock().unwrap().len(), 1);

    let packet = vec![HCI_EVENT_PKT, EVT_HARDWARE_ERROR, 1, 0x42];
    let notifications = adapter.handle_packet(&packet);
    assert!(matches!(notifications[0], HciNotification::HardwareError(0x42)));
    assert_eq!(*errors.lock().unwrap(), vec![0x42]);

    // The old reset's response no longer dispatches anything
    adapter.handle_packet(&command_complete_packet(opcode(OGF_HOST_CTL, OCF_RESET), 0, &[]));
    assert_eq!(log.lock().unwrap().len(), 1);
}

#[test]
fn stop_makes_adapter_inert() {
    let (transport, log) = MockTransport::new();
    let mut adapter = HciAdapter::new(Box::new(transport));
    adapter.stop();
    adapter.reset(Box::new(|_, _| panic!("must not run after stop")));
    assert!(log.lock().unwrap().is_empty());
    assert!(adapter.handle_packet(&connection_complete_packet(1, 0)).is_empty());
}

#[test]
fn peripheral_connection_consumes_adv_slot() {
    let (transport, _log) = MockTransport::new();
    let mut adapter = HciAdapter::new(Box::new(transport));

    let hits = Arc::new(AtomicUsize::new(0));
    let h = hits.clone();
    adapter.set_advertising_connection_callback(Box::new(move |complete| {
        assert_eq!(complete.role, Role::Peripheral);
        h.fetch_add(1, Ordering::SeqCst);
    }));

    adapter.handle_packet(&connection_complete_packet(0x0041, 0x01));
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    // Slot is consumed: a second completion does not fire it again
    adapter.handle_packet(&connection_complete_packet(0x0042, 0x01));
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[test]
fn peer_address_is_recorded() {
    let (mut adapter, _log, handle) = connected_adapter(27, 2);
    let peer = adapter.connection_peer(handle).unwrap();
    assert_eq!(
        peer,
        Address::new(
            AddressType::Public,
            BdAddr::new([0x11, 0x22, 0x33, 0x44, 0x55, 0x66])
        )
    );
    assert_eq!(adapter.connection_role(handle), Some(Role::Central));
}
