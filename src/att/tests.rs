//! Unit tests for the ATT bearer, driving both sides of the engine over a
//! mock transport

use super::bearer::{AttBearer, AttContext, AttResponse, ServerInput};
use super::constants::*;
use super::error::{AttError, AttErrorCode};
use super::pdu::*;
use crate::address::{Address, AddressType, BdAddr};
use crate::gatt::server::GattServerDb;
use crate::gatt::types::{
    Characteristic, ConnectionRef, EncryptionLevel, Permission, Properties, Service,
};
use crate::hci::constants::{
    opcode, EVT_CMD_COMPLETE, EVT_LE_META_EVENT, HCI_EVENT_PKT, OCF_LE_READ_BUFFER_SIZE, OGF_LE,
};
use crate::hci::HciAdapter;
use crate::host::DeferQueue;
use crate::transport::Transport;
use crate::uuid::Uuid;
use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const CONN: u16 = 0x0040;

#[derive(Clone, Default)]
struct MockTransport {
    writes: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl Transport for MockTransport {
    fn write(&mut self, packet: &[u8]) -> io::Result<()> {
        self.writes.lock().unwrap().push(packet.to_vec());
        Ok(())
    }
}

struct Harness {
    adapter: HciAdapter,
    db: GattServerDb,
    bearer: AttBearer,
    defer: DeferQueue,
    writes: Arc<Mutex<Vec<Vec<u8>>>>,
    conn: ConnectionRef,
    level: EncryptionLevel,
    has_ltk: bool,
}

impl Harness {
    fn new() -> Self {
        let transport = MockTransport::default();
        let writes = transport.writes.clone();
        let mut adapter = HciAdapter::new(Box::new(transport));

        // Teach the adapter its buffer credits (251 bytes x 8)
        adapter.le_read_buffer_size(Box::new(|_, _| {}));
        let mut params = vec![1u8];
        params.extend_from_slice(&opcode(OGF_LE, OCF_LE_READ_BUFFER_SIZE).to_le_bytes());
        params.push(0x00);
        params.extend_from_slice(&251u16.to_le_bytes());
        params.push(8);
        let mut event = vec![HCI_EVENT_PKT, EVT_CMD_COMPLETE, params.len() as u8];
        event.extend_from_slice(&params);
        adapter.handle_packet(&event);

        // And a live connection
        let mut params = vec![0x01u8, 0x00];
        params.extend_from_slice(&CONN.to_le_bytes());
        params.push(0x00); // central
        params.push(0x00); // public
        params.extend_from_slice(&[0x11, 0x22, 0x33, 0x44, 0x55, 0x66]);
        params.extend_from_slice(&[0x18, 0x00, 0x00, 0x00, 0xC8, 0x00, 0x00]);
        let mut event = vec![HCI_EVENT_PKT, EVT_LE_META_EVENT, params.len() as u8];
        event.extend_from_slice(&params);
        adapter.handle_packet(&event);

        writes.lock().unwrap().clear();
        Self {
            adapter,
            db: GattServerDb::new(),
            bearer: AttBearer::new(CONN),
            defer: Arc::new(Mutex::new(VecDeque::new())),
            writes,
            conn: ConnectionRef {
                handle: CONN,
                peer: Address::new(AddressType::Public, BdAddr::new([1, 2, 3, 4, 5, 6])),
            },
            level: EncryptionLevel::default(),
            has_ltk: false,
        }
    }

    fn feed(&mut self, pdu: &[u8]) {
        let mut ctx = AttContext {
            adapter: &mut self.adapter,
            db: &mut self.db,
            conn: self.conn,
            level: self.level,
            has_ltk: self.has_ltk,
            bonded: false,
            defer: self.defer.clone(),
        };
        self.bearer.handle_pdu(&mut ctx, pdu);
    }

    fn complete(&mut self, generation: u64, input: ServerInput) {
        let mut ctx = AttContext {
            adapter: &mut self.adapter,
            db: &mut self.db,
            conn: self.conn,
            level: self.level,
            has_ltk: self.has_ltk,
            bonded: false,
            defer: self.defer.clone(),
        };
        self.bearer.attribute_response(&mut ctx, generation, input);
    }

    /// ATT PDUs written to the transport, in order.
    fn sent(&self) -> Vec<Vec<u8>> {
        self.writes
            .lock()
            .unwrap()
            .iter()
            .filter(|w| w[0] == 0x02)
            .map(|w| w[9..].to_vec())
            .collect()
    }

    fn clear_sent(&self) {
        self.writes.lock().unwrap().clear();
    }

    /// Adds a plain readable+writable characteristic, returning its value
    /// handle.
    fn add_char(&mut self, uuid: u16, value: Vec<u8>, max_length: usize) -> u16 {
        self.db
            .add_services(vec![Service::new(Uuid::from_u16(0xAA00)).characteristic(
                Characteristic::new(
                    Uuid::from_u16(uuid),
                    Properties::READ | Properties::WRITE,
                )
                .value(value)
                .max_length(max_length),
            )])
            .unwrap();
        // decl, value
        self.db
            .range_iter(1, 0xFFFF)
            .find(|(_, attr)| attr.uuid == uuid)
            .map(|(h, _)| h)
            .expect("characteristic value attribute exists")
    }
}

fn error_rsp(request: u8, handle: u16, code: AttErrorCode) -> Vec<u8> {
    ErrorResponse {
        request_opcode: request,
        handle,
        error_code: code.into(),
    }
    .serialize()
}

// --- Server side --------------------------------------------------------

#[test]
fn mtu_exchange_clamps_and_settles_once() {
    let mut h = Harness::new();
    h.feed(&ExchangeMtuRequest { mtu: 100 }.serialize());
    assert_eq!(h.sent(), vec![ExchangeMtuResponse { mtu: 517 }.serialize()]);
    assert_eq!(h.bearer.mtu(), 100);

    // The MTU changes at most once from 23
    h.clear_sent();
    h.feed(&ExchangeMtuRequest { mtu: 200 }.serialize());
    assert_eq!(h.sent(), vec![ExchangeMtuResponse { mtu: 517 }.serialize()]);
    assert_eq!(h.bearer.mtu(), 100);
}

#[test]
fn notifications_queued_during_mtu_exchange_flush_in_order() {
    let mut h = Harness::new();
    // We are also a client and have an MTU exchange in flight
    h.bearer
        .exchange_mtu(&mut h.adapter, 100, Box::new(|_| {}));
    // Three notifications on handle 0x10 get held back
    for payload in [[0x01u8], [0x02], [0x03]] {
        h.bearer
            .notify(&mut h.adapter, 0x10, &payload, None, None);
    }
    assert_eq!(h.sent().len(), 1, "only the MTU request is on the wire");

    h.feed(&ExchangeMtuResponse { mtu: 517 }.serialize());
    let sent = h.sent();
    assert_eq!(sent.len(), 4);
    assert_eq!(h.bearer.mtu(), 100);
    for (i, payload) in [[0x01u8], [0x02], [0x03]].iter().enumerate() {
        let expected = HandleValueNotification {
            handle: 0x10,
            value: payload.to_vec(),
        }
        .serialize();
        assert_eq!(sent[i + 1], expected);
    }
}

#[test]
fn read_and_blob_slice_at_mtu() {
    let mut h = Harness::new();
    let value: Vec<u8> = (0u8..30).collect();
    let handle = h.add_char(0xB001, value.clone(), 512);
    h.clear_sent();

    h.feed(&ReadRequest { handle }.serialize());
    assert_eq!(
        h.sent(),
        vec![ReadResponse {
            value: value[..22].to_vec()
        }
        .serialize()]
    );

    h.clear_sent();
    h.feed(&ReadBlobRequest { handle, offset: 22 }.serialize());
    assert_eq!(
        h.sent(),
        vec![ReadBlobResponse {
            value: value[22..].to_vec()
        }
        .serialize()]
    );

    // Offset beyond the value length is an error
    h.clear_sent();
    h.feed(&ReadBlobRequest { handle, offset: 31 }.serialize());
    assert_eq!(
        h.sent(),
        vec![error_rsp(ATT_READ_BLOB_REQ, handle, AttErrorCode::InvalidOffset)]
    );
}

#[test]
fn write_request_validates_length() {
    let mut h = Harness::new();
    let handle = h.add_char(0xB002, vec![0; 3], 5);
    h.clear_sent();

    h.feed(&WriteRequest {
        handle,
        value: vec![1; 6],
    }
    .serialize());
    assert_eq!(
        h.sent(),
        vec![error_rsp(
            ATT_WRITE_REQ,
            handle,
            AttErrorCode::InvalidAttributeValueLength
        )]
    );

    h.clear_sent();
    h.feed(&WriteRequest {
        handle,
        value: vec![7, 8, 9],
    }
    .serialize());
    assert_eq!(h.sent(), vec![WriteResponse.serialize()]);
}

#[test]
fn prepare_queue_saturates_at_128() {
    let mut h = Harness::new();
    let handle = h.add_char(0xB003, Vec::new(), 512);
    h.clear_sent();

    // Non-contiguous offsets so nothing coalesces
    for i in 0..128u16 {
        let request = PrepareWriteRequest {
            handle,
            offset: i * 2,
            value: vec![i as u8],
        };
        h.feed(&request.serialize());
        let rsp = PrepareWriteResponse {
            handle,
            offset: i * 2,
            value: vec![i as u8],
        };
        assert_eq!(h.sent().last().unwrap(), &rsp.serialize());
    }

    h.clear_sent();
    h.feed(&PrepareWriteRequest {
        handle,
        offset: 300,
        value: vec![0xFF],
    }
    .serialize());
    assert_eq!(
        h.sent(),
        vec![error_rsp(
            ATT_PREPARE_WRITE_REQ,
            handle,
            AttErrorCode::PrepareQueueFull
        )]
    );
}

#[test]
fn prepare_tail_coalesces_and_execute_commits() {
    let mut h = Harness::new();
    let handle = h.add_char(0xB004, Vec::new(), 512);
    h.clear_sent();

    h.feed(&PrepareWriteRequest {
        handle,
        offset: 0,
        value: b"abc".to_vec(),
    }
    .serialize());
    // Continues the tail directly: coalesced into one queue entry
    h.feed(&PrepareWriteRequest {
        handle,
        offset: 3,
        value: b"def".to_vec(),
    }
    .serialize());
    h.clear_sent();

    h.feed(&ExecuteWriteRequest {
        flags: ATT_EXEC_WRITE_COMMIT,
    }
    .serialize());
    assert_eq!(h.sent(), vec![ExecuteWriteResponse.serialize()]);

    h.clear_sent();
    h.feed(&ReadRequest { handle }.serialize());
    assert_eq!(
        h.sent(),
        vec![ReadResponse {
            value: b"abcdef".to_vec()
        }
        .serialize()]
    );
}

#[test]
fn execute_write_validates_offsets_before_committing() {
    let mut h = Harness::new();
    let handle = h.add_char(0xB005, vec![0xAA], 10);
    h.clear_sent();

    h.feed(&PrepareWriteRequest {
        handle,
        offset: 600,
        value: vec![1],
    }
    .serialize());
    h.clear_sent();
    h.feed(&ExecuteWriteRequest {
        flags: ATT_EXEC_WRITE_COMMIT,
    }
    .serialize());
    assert_eq!(
        h.sent(),
        vec![error_rsp(
            ATT_EXECUTE_WRITE_REQ,
            handle,
            AttErrorCode::InvalidOffset
        )]
    );

    // Nothing was committed
    h.clear_sent();
    h.feed(&ReadRequest { handle }.serialize());
    assert_eq!(h.sent(), vec![ReadResponse { value: vec![0xAA] }.serialize()]);
}

#[test]
fn execute_write_cancel_discards_queue() {
    let mut h = Harness::new();
    let handle = h.add_char(0xB006, vec![9], 16);
    h.feed(&PrepareWriteRequest {
        handle,
        offset: 0,
        value: vec![1, 2],
    }
    .serialize());
    h.clear_sent();

    h.feed(&ExecuteWriteRequest {
        flags: ATT_EXEC_WRITE_CANCEL,
    }
    .serialize());
    assert_eq!(h.sent(), vec![ExecuteWriteResponse.serialize()]);

    h.clear_sent();
    h.feed(&ReadRequest { handle }.serialize());
    assert_eq!(h.sent(), vec![ReadResponse { value: vec![9] }.serialize()]);
}

#[test]
fn read_by_group_type_lists_services() {
    let mut h = Harness::new();
    h.clear_sent();
    h.feed(
        &ReadByGroupTypeRequest {
            start_handle: 1,
            end_handle: 0xFFFF,
            group_type: Uuid::from_u16(PRIMARY_SERVICE_UUID),
        }
        .serialize(),
    );
    let expected = ReadByGroupTypeResponse {
        entries: vec![
            (1, 4, vec![0x01, 0x18]),
            (5, 9, vec![0x00, 0x18]),
        ],
    };
    assert_eq!(h.sent(), vec![expected.serialize()]);
}

#[test]
fn read_by_group_type_rejects_other_groups() {
    let mut h = Harness::new();
    h.clear_sent();
    h.feed(
        &ReadByGroupTypeRequest {
            start_handle: 1,
            end_handle: 0xFFFF,
            group_type: Uuid::from_u16(CHARACTERISTIC_UUID),
        }
        .serialize(),
    );
    assert_eq!(
        h.sent(),
        vec![error_rsp(
            ATT_READ_BY_GROUP_TYPE_REQ,
            1,
            AttErrorCode::UnsupportedGroupType
        )]
    );
}

#[test]
fn find_information_stops_at_format_change() {
    let mut h = Harness::new();
    let long: Uuid = "6e400002-b5a3-f393-e0a9-e50e24dcca9e".parse().unwrap();
    h.db
        .add_services(vec![Service::new(Uuid::from_u16(0xA100)).characteristic(
            Characteristic::new(long, Properties::READ),
        )])
        .unwrap();
    // decl at 11 (16-bit type), value at 12 (128-bit type)
    h.clear_sent();
    h.feed(
        &FindInformationRequest {
            start_handle: 10,
            end_handle: 12,
        }
        .serialize(),
    );
    let sent = h.sent();
    let rsp = FindInformationResponse::parse(&sent[0]).unwrap();
    assert_eq!(rsp.format, ATT_FIND_INFO_FORMAT_16BIT);
    assert_eq!(rsp.entries.len(), 2); // service decl + char decl, stops at 128-bit
    assert_eq!(rsp.entries[1].0, 11);

    h.clear_sent();
    h.feed(
        &FindInformationRequest {
            start_handle: 12,
            end_handle: 12,
        }
        .serialize(),
    );
    let sent = h.sent();
    let rsp = FindInformationResponse::parse(&sent[0]).unwrap();
    assert_eq!(rsp.format, ATT_FIND_INFO_FORMAT_128BIT);
    assert_eq!(rsp.entries, vec![(12, long)]);
}

#[test]
fn find_by_type_value_returns_group_ranges() {
    let mut h = Harness::new();
    h.clear_sent();
    h.feed(
        &FindByTypeValueRequest {
            start_handle: 1,
            end_handle: 0xFFFF,
            attribute_type: PRIMARY_SERVICE_UUID,
            value: vec![0x00, 0x18],
        }
        .serialize(),
    );
    assert_eq!(
        h.sent(),
        vec![FindByTypeValueResponse {
            handles: vec![(5, 9)]
        }
        .serialize()]
    );
}

#[test]
fn read_multiple_reports_highest_priority_error() {
    let mut h = Harness::new();
    // Write-only characteristic: read not permitted
    h.db
        .add_services(vec![Service::new(Uuid::from_u16(0xA200)).characteristic(
            Characteristic::new(Uuid::from_u16(0xC001), Properties::WRITE),
        )])
        .unwrap();
    let wo_handle = 11;
    // Encrypted characteristic: insufficient authentication without keys
    h.db
        .add_services(vec![Service::new(Uuid::from_u16(0xA201)).characteristic(
            Characteristic::new(Uuid::from_u16(0xC002), Properties::READ)
                .read_permission(Permission::Encrypted),
        )])
        .unwrap();
    let enc_handle = 14;
    h.clear_sent();

    h.feed(
        &ReadMultipleRequest {
            handles: vec![wo_handle, enc_handle],
        }
        .serialize(),
    );
    // Authentication outranks read-not-permitted, so the second handle is
    // the one named
    assert_eq!(
        h.sent(),
        vec![error_rsp(
            ATT_READ_MULTIPLE_REQ,
            enc_handle,
            AttErrorCode::InsufficientAuthentication
        )]
    );
}

#[test]
fn busy_server_drops_further_requests() {
    let mut h = Harness::new();
    let pending = Arc::new(AtomicUsize::new(0));
    let count = pending.clone();
    h.db
        .add_services(vec![Service::new(Uuid::from_u16(0xA300)).characteristic(
            Characteristic::new(Uuid::from_u16(0xC010), Properties::READ).on_read(
                move |_, responder| {
                    count.fetch_add(1, Ordering::SeqCst);
                    // Hold the responder: completion comes later
                    std::mem::forget(responder);
                },
            ),
        )])
        .unwrap();
    h.clear_sent();

    h.feed(&ReadRequest { handle: 11 }.serialize());
    assert_eq!(pending.load(Ordering::SeqCst), 1);
    assert!(h.sent().is_empty(), "response awaits the handler");

    // A second request while busy is dropped outright
    h.feed(&ReadRequest { handle: 11 }.serialize());
    assert_eq!(pending.load(Ordering::SeqCst), 1);
    assert!(h.sent().is_empty());

    // Completing the read releases the response
    h.complete(0, ServerInput::Read(Ok(vec![0x42])));
    assert_eq!(h.sent(), vec![ReadResponse { value: vec![0x42] }.serialize()]);
}

#[test]
fn stale_attribute_completions_are_ignored() {
    let mut h = Harness::new();
    let handle = h.add_char(0xB010, vec![1], 16);
    h.feed(&ReadRequest { handle }.serialize());
    h.clear_sent();

    // The op completed synchronously; its generation is spent
    h.complete(0, ServerInput::Read(Ok(vec![9])));
    assert!(h.sent().is_empty());
}

#[test]
fn unknown_request_gets_not_supported() {
    let mut h = Harness::new();
    h.clear_sent();
    h.feed(&[0x3A, 0x00]);
    assert_eq!(
        h.sent(),
        vec![error_rsp(0x3A, 0, AttErrorCode::RequestNotSupported)]
    );

    // Signed write is accepted but ignored
    h.clear_sent();
    h.feed(&[ATT_SIGNED_WRITE_CMD, 0x0B, 0x00, 0x01]);
    assert!(h.sent().is_empty());
}

// --- Client side --------------------------------------------------------

#[test]
fn client_requests_are_fifo_with_one_in_flight() {
    let mut h = Harness::new();
    let order = Arc::new(Mutex::new(Vec::new()));

    let log = order.clone();
    h.bearer.read(
        &mut h.adapter,
        0x10,
        Box::new(move |result| {
            log.lock().unwrap().push(("first", result.is_ok()));
        }),
    );
    let log = order.clone();
    h.bearer.read(
        &mut h.adapter,
        0x11,
        Box::new(move |result| {
            log.lock().unwrap().push(("second", result.is_ok()));
        }),
    );
    assert_eq!(h.sent().len(), 1, "second request queued behind the first");

    h.feed(&ReadResponse { value: vec![1] }.serialize());
    assert_eq!(*order.lock().unwrap(), vec![("first", true)]);
    assert_eq!(h.sent().len(), 2, "completion released the next request");

    h.feed(
        &ErrorResponse {
            request_opcode: ATT_READ_REQ,
            handle: 0x11,
            error_code: AttErrorCode::InvalidHandle.into(),
        }
        .serialize(),
    );
    assert_eq!(
        *order.lock().unwrap(),
        vec![("first", true), ("second", false)]
    );
}

#[test]
fn mismatched_responses_are_dropped() {
    let mut h = Harness::new();
    let fired = Arc::new(AtomicUsize::new(0));
    let count = fired.clone();
    h.bearer.read(
        &mut h.adapter,
        0x10,
        Box::new(move |_| {
            count.fetch_add(1, Ordering::SeqCst);
        }),
    );
    // A write response does not match a read request
    h.feed(&WriteResponse.serialize());
    assert_eq!(fired.load(Ordering::SeqCst), 0);
    // An error response for a different request opcode does not match
    h.feed(
        &ErrorResponse {
            request_opcode: ATT_WRITE_REQ,
            handle: 0x10,
            error_code: 0x01,
        }
        .serialize(),
    );
    assert_eq!(fired.load(Ordering::SeqCst), 0);

    h.feed(&ReadResponse { value: vec![] }.serialize());
    assert_eq!(fired.load(Ordering::SeqCst), 1);
}

#[test]
fn transaction_timeout_kills_the_bearer() {
    let mut h = Harness::new();
    let results = Arc::new(Mutex::new(Vec::new()));

    let log = results.clone();
    h.bearer.read(
        &mut h.adapter,
        0x10,
        Box::new(move |result| log.lock().unwrap().push(result)),
    );
    let deadline = h.bearer.next_deadline().expect("request armed the timer");

    assert!(!h.bearer.poll_timeout(deadline - Duration::from_secs(1)));
    assert!(h.bearer.poll_timeout(deadline + Duration::from_millis(1)));
    assert!(h.bearer.is_dead());
    assert!(matches!(
        results.lock().unwrap()[0],
        Err(AttError::Timeout)
    ));

    // Everything after the timeout is inert
    let log = results.clone();
    h.bearer.read(
        &mut h.adapter,
        0x11,
        Box::new(move |result| log.lock().unwrap().push(result)),
    );
    assert!(matches!(
        results.lock().unwrap()[1],
        Err(AttError::BearerDead)
    ));
    h.clear_sent();
    h.feed(&ReadRequest { handle: 1 }.serialize());
    assert!(h.sent().is_empty());
}

#[test]
fn parsed_client_responses_carry_structure() {
    let mut h = Harness::new();
    let got = Arc::new(Mutex::new(None));
    let slot = got.clone();
    h.bearer.read_by_group_type(
        &mut h.adapter,
        1,
        0xFFFF,
        Uuid::from_u16(PRIMARY_SERVICE_UUID),
        Box::new(move |result| {
            *slot.lock().unwrap() = Some(result);
        }),
    );
    h.feed(
        &ReadByGroupTypeResponse {
            entries: vec![(1, 7, vec![0x00, 0x18])],
        }
        .serialize(),
    );
    match got.lock().unwrap().take() {
        Some(Ok(AttResponse::ReadByGroupType(entries))) => {
            assert_eq!(entries, vec![(1, 7, vec![0x00, 0x18])]);
        }
        other => panic!("unexpected result {:?}", other),
    };
}

#[test]
fn malformed_response_leaves_request_pending() {
    let mut h = Harness::new();
    let fired = Arc::new(AtomicUsize::new(0));
    let count = fired.clone();
    h.bearer.find_information(
        &mut h.adapter,
        1,
        10,
        Box::new(move |_| {
            count.fetch_add(1, Ordering::SeqCst);
        }),
    );
    // Find Information response with a bogus format byte
    h.feed(&[ATT_FIND_INFO_RSP, 0x07, 1, 0, 0, 0]);
    assert_eq!(fired.load(Ordering::SeqCst), 0);
    assert!(h.bearer.next_deadline().is_some(), "the timer keeps running");
}

#[test]
fn indications_are_serialized_and_confirmed() {
    let mut h = Harness::new();
    let confirmations = Arc::new(AtomicUsize::new(0));

    for _ in 0..2 {
        let count = confirmations.clone();
        h.bearer.indicate(
            &mut h.adapter,
            0x20,
            &[0xEE],
            Box::new(move |result| {
                assert!(result.is_ok());
                count.fetch_add(1, Ordering::SeqCst);
            }),
        );
    }
    assert_eq!(h.sent().len(), 1, "one indication outstanding at a time");

    h.feed(&HandleValueConfirmation.serialize());
    assert_eq!(confirmations.load(Ordering::SeqCst), 1);
    assert_eq!(h.sent().len(), 2, "confirmation released the next one");

    h.feed(&HandleValueConfirmation.serialize());
    assert_eq!(confirmations.load(Ordering::SeqCst), 2);
    assert!(h.bearer.next_deadline().is_none());
}

#[test]
fn duplicate_inbound_indication_is_dropped_until_confirmed() {
    let mut h = Harness::new();
    let ind = HandleValueIndication {
        handle: 0x30,
        value: vec![1],
    }
    .serialize();
    h.feed(&ind);
    // One deferred delivery for the host
    assert_eq!(h.defer.lock().unwrap().len(), 1);

    // The peer violating the one-outstanding rule gets dropped
    h.feed(&ind);
    assert_eq!(h.defer.lock().unwrap().len(), 1);

    h.bearer.send_confirmation(&mut h.adapter);
    h.feed(&ind);
    assert_eq!(h.defer.lock().unwrap().len(), 2);
}
