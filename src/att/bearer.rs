//! Per-connection ATT engine
//!
//! Client side: a FIFO of requests with exactly one in flight and a 30 s
//! deadline; a timeout kills the bearer. Server side: request opcodes are
//! dispatched against the attribute database, one at a time, with the
//! multi-step handlers modeled as resumable tagged-state operations so
//! user callbacks can complete asynchronously.

use super::constants::*;
use super::error::{AttError, AttErrorCode};
use super::pdu::*;
use crate::gatt::server::{GattServerDb, ReadOutcome, WriteOutcome};
use crate::gatt::types::{ConnectionRef, EncryptionLevel};
use crate::hci::{DataCallback, HciAdapter};
use crate::host::DeferQueue;
use crate::uuid::Uuid;
use log::{debug, trace, warn};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Everything a PDU dispatch needs besides the bearer itself.
pub(crate) struct AttContext<'a> {
    pub adapter: &'a mut HciAdapter,
    pub db: &'a mut GattServerDb,
    pub conn: ConnectionRef,
    pub level: EncryptionLevel,
    pub has_ltk: bool,
    pub bonded: bool,
    pub defer: DeferQueue,
}

/// Parsed response delivered to a client-request callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum AttResponse {
    ExchangeMtu(u16),
    FindInformation(Vec<(u16, Uuid)>),
    FindByTypeValue(Vec<(u16, u16)>),
    ReadByType(Vec<(u16, Vec<u8>)>),
    Read(Vec<u8>),
    ReadBlob(Vec<u8>),
    ReadMultiple(Vec<u8>),
    ReadByGroupType(Vec<(u16, u16, Vec<u8>)>),
    Write,
    PrepareWrite {
        handle: u16,
        offset: u16,
        value: Vec<u8>,
    },
    ExecuteWrite,
}

pub(crate) type ResponseCallback = Box<dyn FnOnce(Result<AttResponse, AttError>) + Send>;
pub(crate) type IndicationCallback = Box<dyn FnOnce(Result<(), AttError>) + Send>;

/// Completion of a user attribute callback, fed back by the host.
#[derive(Debug)]
pub(crate) enum ServerInput {
    Authorize(Result<(), AttErrorCode>),
    Read(Result<Vec<u8>, AttErrorCode>),
    Write(Result<(), AttErrorCode>),
}

struct PendingRequest {
    pdu: Vec<u8>,
    expected_rsp: u8,
    callback: ResponseCallback,
}

struct InflightRequest {
    request_opcode: u8,
    expected_rsp: u8,
    callback: ResponseCallback,
}

struct HeldNotification {
    pdu: Vec<u8>,
    on_sent: Option<DataCallback>,
    on_complete: Option<DataCallback>,
}

struct PendingIndication {
    handle: u16,
    value: Vec<u8>,
    callback: IndicationCallback,
}

/// How to post-process an asynchronous read completion.
enum ReadMode {
    /// Handler returns the full value; validate and slice at `offset`
    Full { offset: u16, max: usize },
    /// Handler returns the value already trimmed from `offset`
    Partial { offset: u16, max: usize },
}

/// Progress state of the server request being handled.
enum ServerOp {
    Read {
        opcode: u8,
        handle: u16,
        offset: u16,
        authorized: bool,
        mode: Option<ReadMode>,
    },
    ReadMultiple {
        handles: Vec<u16>,
        index: usize,
        acc: Vec<u8>,
        best: Option<(u8, u16, AttErrorCode)>,
        authorized: bool,
        mode: Option<ReadMode>,
    },
    ReadByType {
        uuid: Uuid,
        cursor: u16,
        end: u16,
        entries: Vec<(u16, Vec<u8>)>,
        unit_len: Option<usize>,
        authorized: bool,
        mode: Option<ReadMode>,
    },
    FindByTypeValue {
        att_type: u16,
        target: Vec<u8>,
        cursor: u16,
        end: u16,
        groups: Vec<(u16, u16)>,
        authorized: bool,
        mode: Option<ReadMode>,
    },
    Write {
        opcode: u8,
        handle: u16,
        value: Vec<u8>,
        needs_response: bool,
        authorized: bool,
    },
    PrepareWrite {
        request: PrepareWriteRequest,
    },
    ExecuteWrite {
        remaining: usize,
        responded: bool,
    },
}

/// The ATT engine state for one connection.
pub(crate) struct AttBearer {
    conn_handle: u16,
    mtu: u16,
    mtu_settled: bool,
    timed_out: bool,
    // client side
    request_queue: VecDeque<PendingRequest>,
    inflight: Option<InflightRequest>,
    request_deadline: Option<Instant>,
    pending_client_mtu: u16,
    confirmation_owed: bool,
    // server side
    current_op: Option<ServerOp>,
    generation: u64,
    prepare_queue: Vec<(u16, u16, Vec<u8>)>,
    notify_hold: VecDeque<HeldNotification>,
    indication_queue: VecDeque<PendingIndication>,
    inflight_indication: Option<IndicationCallback>,
    indication_deadline: Option<Instant>,
}

impl AttBearer {
    pub fn new(conn_handle: u16) -> Self {
        Self {
            conn_handle,
            mtu: ATT_DEFAULT_MTU,
            mtu_settled: false,
            timed_out: false,
            request_queue: VecDeque::new(),
            inflight: None,
            request_deadline: None,
            pending_client_mtu: ATT_DEFAULT_MTU,
            confirmation_owed: false,
            current_op: None,
            generation: 0,
            prepare_queue: Vec::new(),
            notify_hold: VecDeque::new(),
            indication_queue: VecDeque::new(),
            inflight_indication: None,
            indication_deadline: None,
        }
    }

    pub fn mtu(&self) -> u16 {
        self.mtu
    }

    pub fn is_dead(&self) -> bool {
        self.timed_out
    }

    /// Earliest pending transaction deadline, for the host's timer poll.
    pub fn next_deadline(&self) -> Option<Instant> {
        match (self.request_deadline, self.indication_deadline) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Declares the bearer dead if a transaction deadline has passed.
    /// Returns true the moment it dies.
    pub fn poll_timeout(&mut self, now: Instant) -> bool {
        if self.timed_out {
            return false;
        }
        let expired = |d: Option<Instant>| d.map_or(false, |deadline| now >= deadline);
        if expired(self.request_deadline) || expired(self.indication_deadline) {
            warn!("handle 0x{:03X}: ATT transaction timed out", self.conn_handle);
            self.die(AttError::Timeout);
            return true;
        }
        false
    }

    /// Fails every queued operation and suppresses all further I/O.
    pub fn die(&mut self, error: AttError) {
        self.timed_out = true;
        self.request_deadline = None;
        self.indication_deadline = None;
        if let Some(inflight) = self.inflight.take() {
            (inflight.callback)(Err(error.clone()));
        }
        for pending in self.request_queue.drain(..) {
            (pending.callback)(Err(error.clone()));
        }
        if let Some(cb) = self.inflight_indication.take() {
            cb(Err(error.clone()));
        }
        for pending in self.indication_queue.drain(..) {
            (pending.callback)(Err(error.clone()));
        }
        self.current_op = None;
        self.generation += 1;
    }

    // --- Client requests ------------------------------------------------

    fn enqueue_request(
        &mut self,
        adapter: &mut HciAdapter,
        pdu: Vec<u8>,
        expected_rsp: u8,
        callback: ResponseCallback,
    ) {
        if self.timed_out {
            callback(Err(AttError::BearerDead));
            return;
        }
        self.request_queue.push_back(PendingRequest {
            pdu,
            expected_rsp,
            callback,
        });
        self.send_next_request(adapter);
    }

    fn send_next_request(&mut self, adapter: &mut HciAdapter) {
        if self.inflight.is_some() || self.timed_out {
            return;
        }
        let Some(pending) = self.request_queue.pop_front() else {
            return;
        };
        let request_opcode = pending.pdu[0];
        let _ = adapter.send_data(self.conn_handle, ATT_CID, &pending.pdu, None, None);
        self.inflight = Some(InflightRequest {
            request_opcode,
            expected_rsp: pending.expected_rsp,
            callback: pending.callback,
        });
        self.request_deadline =
            Some(Instant::now() + Duration::from_secs(ATT_TRANSACTION_TIMEOUT_SECS));
    }

    pub fn exchange_mtu(
        &mut self,
        adapter: &mut HciAdapter,
        client_mtu: u16,
        callback: ResponseCallback,
    ) {
        let client_mtu = client_mtu.clamp(ATT_DEFAULT_MTU, ATT_MAX_MTU);
        self.pending_client_mtu = client_mtu;
        let pdu = ExchangeMtuRequest { mtu: client_mtu }.serialize();
        self.enqueue_request(adapter, pdu, ATT_EXCHANGE_MTU_RSP, callback);
    }

    pub fn find_information(
        &mut self,
        adapter: &mut HciAdapter,
        start: u16,
        end: u16,
        callback: ResponseCallback,
    ) {
        let pdu = FindInformationRequest {
            start_handle: start,
            end_handle: end,
        }
        .serialize();
        self.enqueue_request(adapter, pdu, ATT_FIND_INFO_RSP, callback);
    }

    pub fn find_by_type_value(
        &mut self,
        adapter: &mut HciAdapter,
        start: u16,
        end: u16,
        attribute_type: u16,
        value: Vec<u8>,
        callback: ResponseCallback,
    ) {
        let pdu = FindByTypeValueRequest {
            start_handle: start,
            end_handle: end,
            attribute_type,
            value,
        }
        .serialize();
        self.enqueue_request(adapter, pdu, ATT_FIND_BY_TYPE_VALUE_RSP, callback);
    }

    pub fn read_by_type(
        &mut self,
        adapter: &mut HciAdapter,
        start: u16,
        end: u16,
        attribute_type: Uuid,
        callback: ResponseCallback,
    ) {
        let pdu = ReadByTypeRequest {
            start_handle: start,
            end_handle: end,
            attribute_type,
        }
        .serialize();
        self.enqueue_request(adapter, pdu, ATT_READ_BY_TYPE_RSP, callback);
    }

    pub fn read(&mut self, adapter: &mut HciAdapter, handle: u16, callback: ResponseCallback) {
        let pdu = ReadRequest { handle }.serialize();
        self.enqueue_request(adapter, pdu, ATT_READ_RSP, callback);
    }

    pub fn read_blob(
        &mut self,
        adapter: &mut HciAdapter,
        handle: u16,
        offset: u16,
        callback: ResponseCallback,
    ) {
        let pdu = ReadBlobRequest { handle, offset }.serialize();
        self.enqueue_request(adapter, pdu, ATT_READ_BLOB_RSP, callback);
    }

    pub fn read_multiple(
        &mut self,
        adapter: &mut HciAdapter,
        handles: Vec<u16>,
        callback: ResponseCallback,
    ) {
        let pdu = ReadMultipleRequest { handles }.serialize();
        self.enqueue_request(adapter, pdu, ATT_READ_MULTIPLE_RSP, callback);
    }

    pub fn read_by_group_type(
        &mut self,
        adapter: &mut HciAdapter,
        start: u16,
        end: u16,
        group_type: Uuid,
        callback: ResponseCallback,
    ) {
        let pdu = ReadByGroupTypeRequest {
            start_handle: start,
            end_handle: end,
            group_type,
        }
        .serialize();
        self.enqueue_request(adapter, pdu, ATT_READ_BY_GROUP_TYPE_RSP, callback);
    }

    pub fn write(
        &mut self,
        adapter: &mut HciAdapter,
        handle: u16,
        value: Vec<u8>,
        callback: ResponseCallback,
    ) {
        let pdu = WriteRequest { handle, value }.serialize();
        self.enqueue_request(adapter, pdu, ATT_WRITE_RSP, callback);
    }

    /// Write Without Response: no queue slot, flow-controlled only by ACL
    /// credits. `on_sent` fires when the command reaches the controller.
    pub fn write_command(
        &mut self,
        adapter: &mut HciAdapter,
        handle: u16,
        value: Vec<u8>,
        on_sent: Option<DataCallback>,
    ) {
        if self.timed_out {
            return;
        }
        let mut value = value;
        value.truncate(self.mtu as usize - 3);
        let pdu = WriteCommand { handle, value }.serialize();
        let _ = adapter.send_data(self.conn_handle, ATT_CID, &pdu, on_sent, None);
    }

    pub fn prepare_write(
        &mut self,
        adapter: &mut HciAdapter,
        handle: u16,
        offset: u16,
        value: Vec<u8>,
        callback: ResponseCallback,
    ) {
        let pdu = PrepareWriteRequest {
            handle,
            offset,
            value,
        }
        .serialize();
        self.enqueue_request(adapter, pdu, ATT_PREPARE_WRITE_RSP, callback);
    }

    pub fn execute_write(
        &mut self,
        adapter: &mut HciAdapter,
        commit: bool,
        callback: ResponseCallback,
    ) {
        let pdu = ExecuteWriteRequest {
            flags: if commit {
                ATT_EXEC_WRITE_COMMIT
            } else {
                ATT_EXEC_WRITE_CANCEL
            },
        }
        .serialize();
        self.enqueue_request(adapter, pdu, ATT_EXECUTE_WRITE_RSP, callback);
    }

    /// Sends the confirmation for an inbound indication.
    pub fn send_confirmation(&mut self, adapter: &mut HciAdapter) {
        if !self.confirmation_owed || self.timed_out {
            return;
        }
        self.confirmation_owed = false;
        let pdu = HandleValueConfirmation.serialize();
        let _ = adapter.send_data(self.conn_handle, ATT_CID, &pdu, None, None);
    }

    fn mtu_exchange_inflight(&self) -> bool {
        self.inflight
            .as_ref()
            .map_or(false, |r| r.request_opcode == ATT_EXCHANGE_MTU_REQ)
    }

    // --- Server notifications / indications -----------------------------

    /// Queues a Handle Value Notification. While an MTU exchange request is
    /// in flight the PDU is held back and flushed on completion.
    pub fn notify(
        &mut self,
        adapter: &mut HciAdapter,
        handle: u16,
        value: &[u8],
        on_sent: Option<DataCallback>,
        on_complete: Option<DataCallback>,
    ) {
        if self.timed_out {
            return;
        }
        let mut value = value.to_vec();
        value.truncate(self.mtu as usize - 3);
        let pdu = HandleValueNotification { handle, value }.serialize();
        if self.mtu_exchange_inflight() {
            self.notify_hold.push_back(HeldNotification {
                pdu,
                on_sent,
                on_complete,
            });
            return;
        }
        let _ = adapter.send_data(self.conn_handle, ATT_CID, &pdu, on_sent, on_complete);
    }

    /// Queues a Handle Value Indication; at most one is outstanding, and
    /// the callback fires on the peer's confirmation.
    pub fn indicate(
        &mut self,
        adapter: &mut HciAdapter,
        handle: u16,
        value: &[u8],
        callback: IndicationCallback,
    ) {
        if self.timed_out {
            callback(Err(AttError::BearerDead));
            return;
        }
        let mut value = value.to_vec();
        value.truncate(self.mtu as usize - 3);
        self.indication_queue.push_back(PendingIndication {
            handle,
            value,
            callback,
        });
        self.send_next_indication(adapter);
    }

    fn send_next_indication(&mut self, adapter: &mut HciAdapter) {
        if self.inflight_indication.is_some() || self.timed_out || self.mtu_exchange_inflight() {
            return;
        }
        let Some(pending) = self.indication_queue.pop_front() else {
            return;
        };
        let pdu = HandleValueIndication {
            handle: pending.handle,
            value: pending.value,
        }
        .serialize();
        let _ = adapter.send_data(self.conn_handle, ATT_CID, &pdu, None, None);
        self.inflight_indication = Some(pending.callback);
        self.indication_deadline =
            Some(Instant::now() + Duration::from_secs(ATT_TRANSACTION_TIMEOUT_SECS));
    }

    fn flush_after_mtu_exchange(&mut self, adapter: &mut HciAdapter) {
        while let Some(held) = self.notify_hold.pop_front() {
            let _ = adapter.send_data(
                self.conn_handle,
                ATT_CID,
                &held.pdu,
                held.on_sent,
                held.on_complete,
            );
        }
        self.send_next_indication(adapter);
    }

    // --- Inbound PDUs ---------------------------------------------------

    pub fn handle_pdu(&mut self, ctx: &mut AttContext<'_>, pdu: &[u8]) {
        if pdu.is_empty() || self.timed_out {
            return;
        }
        let opcode = pdu[0];
        match opcode {
            ATT_ERROR_RSP
            | ATT_EXCHANGE_MTU_RSP
            | ATT_FIND_INFO_RSP
            | ATT_FIND_BY_TYPE_VALUE_RSP
            | ATT_READ_BY_TYPE_RSP
            | ATT_READ_RSP
            | ATT_READ_BLOB_RSP
            | ATT_READ_MULTIPLE_RSP
            | ATT_READ_BY_GROUP_TYPE_RSP
            | ATT_WRITE_RSP
            | ATT_PREPARE_WRITE_RSP
            | ATT_EXECUTE_WRITE_RSP => self.handle_client_response(ctx, opcode, pdu),
            ATT_HANDLE_VALUE_NTF => {
                if let Some(ntf) = HandleValueNotification::parse(pdu) {
                    let conn = ctx.conn;
                    ctx.defer.lock().unwrap().push_back(Box::new(move |host| {
                        host.deliver_notification(conn, ntf.handle, ntf.value, false);
                    }));
                }
            }
            ATT_HANDLE_VALUE_IND => {
                if let Some(ind) = HandleValueIndication::parse(pdu) {
                    // A second indication while we still owe a confirmation
                    // is a peer violation; drop it.
                    if self.confirmation_owed {
                        trace!("indication dropped, confirmation still outbound");
                        return;
                    }
                    self.confirmation_owed = true;
                    let conn = ctx.conn;
                    ctx.defer.lock().unwrap().push_back(Box::new(move |host| {
                        host.deliver_notification(conn, ind.handle, ind.value, true);
                    }));
                }
            }
            ATT_HANDLE_VALUE_CONF => {
                if HandleValueConfirmation::parse(pdu).is_some() {
                    if let Some(cb) = self.inflight_indication.take() {
                        self.indication_deadline = None;
                        cb(Ok(()));
                        self.send_next_indication(ctx.adapter);
                    }
                }
            }
            ATT_SIGNED_WRITE_CMD => {
                // Accepted but unhandled
                trace!("signed write command ignored");
            }
            _ => self.handle_server_pdu(ctx, opcode, pdu),
        }
    }

    fn handle_client_response(&mut self, ctx: &mut AttContext<'_>, opcode: u8, pdu: &[u8]) {
        let matches = match (&self.inflight, opcode) {
            (Some(inflight), ATT_ERROR_RSP) => ErrorResponse::parse(pdu)
                .map_or(false, |e| e.request_opcode == inflight.request_opcode),
            (Some(inflight), opcode) => inflight.expected_rsp == opcode,
            (None, _) => false,
        };
        if !matches {
            trace!("unmatched response opcode 0x{:02X} dropped", opcode);
            return;
        }

        let result = if opcode == ATT_ERROR_RSP {
            let error = ErrorResponse::parse(pdu).expect("matched above");
            Err(AttError::protocol(error.error_code.into(), error.handle))
        } else {
            match self.parse_response(opcode, pdu) {
                Some(response) => Ok(response),
                None => {
                    // Malformed response: leave the request in flight so the
                    // transaction timer fires, per the robustness rule.
                    warn!("malformed response for opcode 0x{:02X}", opcode);
                    return;
                }
            }
        };

        let was_mtu_exchange = self.mtu_exchange_inflight();
        let inflight = self.inflight.take().expect("matched above");
        self.request_deadline = None;

        if let Ok(AttResponse::ExchangeMtu(server_mtu)) = &result {
            let effective = self.pending_client_mtu.min(*server_mtu).max(ATT_DEFAULT_MTU);
            if !self.mtu_settled {
                self.mtu = effective;
                self.mtu_settled = true;
            }
            debug!(
                "handle 0x{:03X}: MTU exchanged, effective {}",
                self.conn_handle, self.mtu
            );
        }

        (inflight.callback)(result);
        if was_mtu_exchange {
            self.flush_after_mtu_exchange(ctx.adapter);
        }
        self.send_next_request(ctx.adapter);
    }

    fn parse_response(&self, opcode: u8, pdu: &[u8]) -> Option<AttResponse> {
        Some(match opcode {
            ATT_EXCHANGE_MTU_RSP => AttResponse::ExchangeMtu(ExchangeMtuResponse::parse(pdu)?.mtu),
            ATT_FIND_INFO_RSP => {
                AttResponse::FindInformation(FindInformationResponse::parse(pdu)?.entries)
            }
            ATT_FIND_BY_TYPE_VALUE_RSP => {
                AttResponse::FindByTypeValue(FindByTypeValueResponse::parse(pdu)?.handles)
            }
            ATT_READ_BY_TYPE_RSP => AttResponse::ReadByType(ReadByTypeResponse::parse(pdu)?.entries),
            ATT_READ_RSP => AttResponse::Read(ReadResponse::parse(pdu)?.value),
            ATT_READ_BLOB_RSP => AttResponse::ReadBlob(ReadBlobResponse::parse(pdu)?.value),
            ATT_READ_MULTIPLE_RSP => {
                AttResponse::ReadMultiple(ReadMultipleResponse::parse(pdu)?.values)
            }
            ATT_READ_BY_GROUP_TYPE_RSP => {
                AttResponse::ReadByGroupType(ReadByGroupTypeResponse::parse(pdu)?.entries)
            }
            ATT_WRITE_RSP => {
                WriteResponse::parse(pdu)?;
                AttResponse::Write
            }
            ATT_PREPARE_WRITE_RSP => {
                let rsp = PrepareWriteResponse::parse(pdu)?;
                AttResponse::PrepareWrite {
                    handle: rsp.handle,
                    offset: rsp.offset,
                    value: rsp.value,
                }
            }
            ATT_EXECUTE_WRITE_RSP => {
                ExecuteWriteResponse::parse(pdu)?;
                AttResponse::ExecuteWrite
            }
            _ => return None,
        })
    }

    // --- Server side ----------------------------------------------------

    fn handle_server_pdu(&mut self, ctx: &mut AttContext<'_>, opcode: u8, pdu: &[u8]) {
        if self.current_op.is_some() {
            // Busy with an asynchronous handler; the peer must wait for the
            // response before issuing another request.
            debug!("request 0x{:02X} dropped while handling a request", opcode);
            return;
        }
        match opcode {
            ATT_EXCHANGE_MTU_REQ => {
                let Some(request) = ExchangeMtuRequest::parse(pdu) else {
                    return;
                };
                let client_mtu = request.mtu.max(ATT_DEFAULT_MTU);
                let effective = client_mtu.min(ATT_MAX_MTU);
                if !self.mtu_settled {
                    self.mtu = effective;
                    self.mtu_settled = true;
                }
                self.send_pdu(ctx.adapter, ExchangeMtuResponse { mtu: ATT_MAX_MTU }.serialize());
            }
            ATT_FIND_INFO_REQ => self.handle_find_information(ctx, pdu),
            ATT_FIND_BY_TYPE_VALUE_REQ => {
                let Some(request) = FindByTypeValueRequest::parse(pdu) else {
                    return;
                };
                if request.start_handle > request.end_handle || request.start_handle == 0 {
                    self.send_error(
                        ctx.adapter,
                        opcode,
                        request.start_handle,
                        AttErrorCode::InvalidHandle,
                    );
                    return;
                }
                self.current_op = Some(ServerOp::FindByTypeValue {
                    att_type: request.attribute_type,
                    target: request.value,
                    cursor: request.start_handle,
                    end: request.end_handle,
                    groups: Vec::new(),
                    authorized: false,
                    mode: None,
                });
                self.continue_op(ctx, None);
            }
            ATT_READ_BY_TYPE_REQ => {
                let Some(request) = ReadByTypeRequest::parse(pdu) else {
                    return;
                };
                if request.start_handle > request.end_handle || request.start_handle == 0 {
                    self.send_error(
                        ctx.adapter,
                        opcode,
                        request.start_handle,
                        AttErrorCode::InvalidHandle,
                    );
                    return;
                }
                self.current_op = Some(ServerOp::ReadByType {
                    uuid: request.attribute_type,
                    cursor: request.start_handle,
                    end: request.end_handle,
                    entries: Vec::new(),
                    unit_len: None,
                    authorized: false,
                    mode: None,
                });
                self.continue_op(ctx, None);
            }
            ATT_READ_REQ => {
                let Some(request) = ReadRequest::parse(pdu) else {
                    return;
                };
                self.current_op = Some(ServerOp::Read {
                    opcode,
                    handle: request.handle,
                    offset: 0,
                    authorized: false,
                    mode: None,
                });
                self.continue_op(ctx, None);
            }
            ATT_READ_BLOB_REQ => {
                let Some(request) = ReadBlobRequest::parse(pdu) else {
                    return;
                };
                self.current_op = Some(ServerOp::Read {
                    opcode,
                    handle: request.handle,
                    offset: request.offset,
                    authorized: false,
                    mode: None,
                });
                self.continue_op(ctx, None);
            }
            ATT_READ_MULTIPLE_REQ => {
                let Some(request) = ReadMultipleRequest::parse(pdu) else {
                    return;
                };
                self.current_op = Some(ServerOp::ReadMultiple {
                    handles: request.handles,
                    index: 0,
                    acc: Vec::new(),
                    best: None,
                    authorized: false,
                    mode: None,
                });
                self.continue_op(ctx, None);
            }
            ATT_READ_BY_GROUP_TYPE_REQ => self.handle_read_by_group_type(ctx, pdu),
            ATT_WRITE_REQ => {
                let Some(request) = WriteRequest::parse(pdu) else {
                    return;
                };
                self.current_op = Some(ServerOp::Write {
                    opcode,
                    handle: request.handle,
                    value: request.value,
                    needs_response: true,
                    authorized: false,
                });
                self.continue_op(ctx, None);
            }
            ATT_WRITE_CMD => {
                let Some(command) = WriteCommand::parse(pdu) else {
                    return;
                };
                self.current_op = Some(ServerOp::Write {
                    opcode,
                    handle: command.handle,
                    value: command.value,
                    needs_response: false,
                    authorized: false,
                });
                self.continue_op(ctx, None);
            }
            ATT_PREPARE_WRITE_REQ => {
                let Some(request) = PrepareWriteRequest::parse(pdu) else {
                    return;
                };
                self.current_op = Some(ServerOp::PrepareWrite { request });
                self.continue_op(ctx, None);
            }
            ATT_EXECUTE_WRITE_REQ => {
                let Some(request) = ExecuteWriteRequest::parse(pdu) else {
                    return;
                };
                self.handle_execute_write(ctx, request.flags);
            }
            other if other & 0x40 == 0 => {
                // Unknown request opcode
                self.send_error(ctx.adapter, other, 0, AttErrorCode::RequestNotSupported);
            }
            other => {
                trace!("unknown command opcode 0x{:02X} ignored", other);
            }
        }
    }

    fn send_pdu(&mut self, adapter: &mut HciAdapter, pdu: Vec<u8>) {
        let _ = adapter.send_data(self.conn_handle, ATT_CID, &pdu, None, None);
    }

    fn send_error(&mut self, adapter: &mut HciAdapter, opcode: u8, handle: u16, code: AttErrorCode) {
        let pdu = ErrorResponse {
            request_opcode: opcode,
            handle,
            error_code: code.into(),
        }
        .serialize();
        self.send_pdu(adapter, pdu);
    }

    /// Finishes the current server op with an outbound PDU (or nothing for
    /// a write command).
    fn finish_op(&mut self, adapter: &mut HciAdapter, response: Option<Vec<u8>>) {
        self.current_op = None;
        self.generation += 1;
        if let Some(pdu) = response {
            self.send_pdu(adapter, pdu);
        }
    }

    fn finish_op_error(
        &mut self,
        adapter: &mut HciAdapter,
        opcode: u8,
        handle: u16,
        code: AttErrorCode,
    ) {
        self.current_op = None;
        self.generation += 1;
        self.send_error(adapter, opcode, handle, code);
    }

    /// Entry point for attribute-handler completions routed by the host.
    pub fn attribute_response(&mut self, ctx: &mut AttContext<'_>, generation: u64, input: ServerInput) {
        if generation != self.generation || self.current_op.is_none() || self.timed_out {
            trace!("stale attribute completion dropped");
            return;
        }
        self.continue_op(ctx, Some(input));
    }

    fn dispatch_read(
        &self,
        ctx: &mut AttContext<'_>,
        handle: u16,
        offset: u16,
        authorized: bool,
    ) -> ReadOutcome {
        ctx.db.read_attribute(
            &ctx.conn,
            ctx.level,
            ctx.has_ltk,
            handle,
            offset,
            authorized,
            &ctx.defer,
            self.generation,
        )
    }

    fn dispatch_write(
        &self,
        ctx: &mut AttContext<'_>,
        handle: u16,
        offset: u16,
        value: &[u8],
        needs_response: bool,
        authorized: bool,
    ) -> WriteOutcome {
        let (outcome, cccd_change) = ctx.db.write_attribute(
            &ctx.conn,
            ctx.level,
            ctx.has_ltk,
            handle,
            offset,
            value,
            needs_response,
            authorized,
            &ctx.defer,
            self.generation,
        );
        if let Some((cccd_handle, bits)) = cccd_change {
            if ctx.bonded {
                let conn = ctx.conn;
                ctx.defer.lock().unwrap().push_back(Box::new(move |host| {
                    host.persist_cccd(conn, cccd_handle, bits);
                }));
            }
        }
        outcome
    }

    /// Applies an async completion to a pending read, producing the final
    /// value or error for that attribute.
    fn settle_read(mode: ReadMode, input: Result<Vec<u8>, AttErrorCode>) -> Result<Vec<u8>, AttErrorCode> {
        let value = input?;
        match mode {
            ReadMode::Full { offset, max } => {
                if value.len() > max {
                    return Err(AttErrorCode::Unlikely);
                }
                if offset as usize > value.len() {
                    return Err(AttErrorCode::InvalidOffset);
                }
                Ok(value[offset as usize..].to_vec())
            }
            ReadMode::Partial { offset, max } => {
                if offset as usize + value.len() > max {
                    return Err(AttErrorCode::Unlikely);
                }
                Ok(value)
            }
        }
    }

    /// Drives the current server op until it responds or parks on a user
    /// callback.
    fn continue_op(&mut self, ctx: &mut AttContext<'_>, input: Option<ServerInput>) {
        let Some(mut op) = self.current_op.take() else {
            return;
        };
        if self.step_op(ctx, &mut op, input) {
            self.current_op = Some(op);
        }
    }

    /// One advancement of the op. Returns true when the op parked on a user
    /// callback and must be kept; false when it finished (the response, if
    /// any, has been sent and the generation bumped).
    fn step_op(
        &mut self,
        ctx: &mut AttContext<'_>,
        op: &mut ServerOp,
        mut input: Option<ServerInput>,
    ) -> bool {
        match op {
            ServerOp::Read {
                opcode,
                handle,
                offset,
                authorized,
                mode,
            } => {
                let (opcode, handle, offset) = (*opcode, *handle, *offset);
                // A granted authorization re-enters the plain dispatch path
                if let Some(ServerInput::Authorize(Ok(()))) = &input {
                    *authorized = true;
                    input = None;
                }
                let outcome: Result<Vec<u8>, AttErrorCode> = match (input.take(), mode.take()) {
                    (Some(ServerInput::Authorize(Err(code))), _) => Err(code),
                    (Some(ServerInput::Read(result)), Some(m)) => Self::settle_read(m, result),
                    (None, _) => {
                        match self.dispatch_read(ctx, handle, offset, *authorized) {
                            ReadOutcome::Done(result) => result,
                            ReadOutcome::PendingAuthorize => return true,
                            ReadOutcome::PendingFull => {
                                *mode = Some(ReadMode::Full {
                                    offset,
                                    max: attr_max(ctx, handle),
                                });
                                return true;
                            }
                            ReadOutcome::PendingPartial => {
                                *mode = Some(ReadMode::Partial {
                                    offset,
                                    max: attr_max(ctx, handle),
                                });
                                return true;
                            }
                        }
                    }
                    (Some(_), _) => return true,
                };
                match outcome {
                    Ok(mut value) => {
                        value.truncate(self.mtu as usize - 1);
                        let pdu = if opcode == ATT_READ_BLOB_REQ {
                            ReadBlobResponse { value }.serialize()
                        } else {
                            ReadResponse { value }.serialize()
                        };
                        self.finish_op(ctx.adapter, Some(pdu));
                    }
                    Err(code) => self.finish_op_error(ctx.adapter, opcode, handle, code),
                }
                false
            }

            ServerOp::ReadMultiple {
                handles,
                index,
                acc,
                best,
                authorized,
                mode,
            } => {
                if let Some(incoming) = input.take() {
                    let handle = handles[*index];
                    match (incoming, mode.take()) {
                        (ServerInput::Authorize(Ok(())), _) => {
                            *authorized = true;
                        }
                        (ServerInput::Authorize(Err(code)), _) => {
                            record_read_error(best, handle, code);
                            *index += 1;
                            *authorized = false;
                        }
                        (ServerInput::Read(result), Some(m)) => {
                            match Self::settle_read(m, result) {
                                Ok(value) => acc.extend_from_slice(&value),
                                Err(code) => record_read_error(best, handle, code),
                            }
                            *index += 1;
                            *authorized = false;
                        }
                        _ => return true,
                    }
                }
                while *index < handles.len() {
                    let handle = handles[*index];
                    match self.dispatch_read(ctx, handle, 0, *authorized) {
                        ReadOutcome::Done(Ok(value)) => {
                            acc.extend_from_slice(&value);
                            *index += 1;
                            *authorized = false;
                        }
                        ReadOutcome::Done(Err(code)) => {
                            record_read_error(best, handle, code);
                            *index += 1;
                            *authorized = false;
                        }
                        ReadOutcome::PendingAuthorize => return true,
                        ReadOutcome::PendingFull => {
                            *mode = Some(ReadMode::Full {
                                offset: 0,
                                max: attr_max(ctx, handle),
                            });
                            return true;
                        }
                        ReadOutcome::PendingPartial => {
                            *mode = Some(ReadMode::Partial {
                                offset: 0,
                                max: attr_max(ctx, handle),
                            });
                            return true;
                        }
                    }
                }
                match best.take() {
                    Some((_, handle, code)) => {
                        self.finish_op_error(ctx.adapter, ATT_READ_MULTIPLE_REQ, handle, code)
                    }
                    None => {
                        let mut values = std::mem::take(acc);
                        values.truncate(self.mtu as usize - 1);
                        let pdu = ReadMultipleResponse { values }.serialize();
                        self.finish_op(ctx.adapter, Some(pdu));
                    }
                }
                false
            }

            ServerOp::ReadByType {
                uuid,
                cursor,
                end,
                entries,
                unit_len,
                authorized,
                mode,
            } => {
                let mtu = self.mtu as usize;
                // Longest value a single entry can carry
                let value_cap = (mtu - 4).min(253);
                let mut exhausted = false;

                if let Some(incoming) = input.take() {
                    let handle = *cursor;
                    match (incoming, mode.take()) {
                        (ServerInput::Authorize(Ok(())), _) => {
                            *authorized = true;
                        }
                        (ServerInput::Authorize(Err(code)), _) => {
                            if entries.is_empty() {
                                self.finish_op_error(ctx.adapter, ATT_READ_BY_TYPE_REQ, handle, code);
                                return false;
                            }
                            exhausted = true;
                        }
                        (ServerInput::Read(result), Some(m)) => {
                            *authorized = false;
                            match Self::settle_read(m, result) {
                                Ok(value) => {
                                    if !push_typed_entry(
                                        entries, unit_len, handle, value, value_cap, mtu,
                                    ) || handle == *end
                                    {
                                        exhausted = true;
                                    } else {
                                        *cursor = handle + 1;
                                    }
                                }
                                Err(code) => {
                                    if entries.is_empty() {
                                        self.finish_op_error(
                                            ctx.adapter,
                                            ATT_READ_BY_TYPE_REQ,
                                            handle,
                                            code,
                                        );
                                        return false;
                                    }
                                    exhausted = true;
                                }
                            }
                        }
                        _ => return true,
                    }
                }

                while !exhausted {
                    let next = ctx
                        .db
                        .range_iter(*cursor, *end)
                        .find(|(_, attr)| attr.uuid == *uuid)
                        .map(|(h, _)| h);
                    let Some(handle) = next else {
                        break;
                    };
                    *cursor = handle;
                    match self.dispatch_read(ctx, handle, 0, *authorized) {
                        ReadOutcome::Done(Ok(value)) => {
                            *authorized = false;
                            if !push_typed_entry(entries, unit_len, handle, value, value_cap, mtu)
                                || handle == *end
                            {
                                break;
                            }
                            *cursor = handle + 1;
                        }
                        ReadOutcome::Done(Err(code)) => {
                            if entries.is_empty() {
                                self.finish_op_error(ctx.adapter, ATT_READ_BY_TYPE_REQ, handle, code);
                                return false;
                            }
                            break;
                        }
                        ReadOutcome::PendingAuthorize => return true,
                        ReadOutcome::PendingFull => {
                            *mode = Some(ReadMode::Full {
                                offset: 0,
                                max: attr_max(ctx, handle),
                            });
                            return true;
                        }
                        ReadOutcome::PendingPartial => {
                            *mode = Some(ReadMode::Partial {
                                offset: 0,
                                max: attr_max(ctx, handle),
                            });
                            return true;
                        }
                    }
                }

                if entries.is_empty() {
                    let handle = *cursor;
                    self.finish_op_error(
                        ctx.adapter,
                        ATT_READ_BY_TYPE_REQ,
                        handle,
                        AttErrorCode::AttributeNotFound,
                    );
                } else {
                    let pdu = ReadByTypeResponse {
                        entries: std::mem::take(entries),
                    }
                    .serialize();
                    self.finish_op(ctx.adapter, Some(pdu));
                }
                false
            }

            ServerOp::FindByTypeValue {
                att_type,
                target,
                cursor,
                end,
                groups,
                authorized,
                mode,
            } => {
                let cap = ((self.mtu as usize - 1) / 4).max(1);
                let mut exhausted = false;

                if let Some(incoming) = input.take() {
                    let handle = *cursor;
                    match (incoming, mode.take()) {
                        (ServerInput::Authorize(Ok(())), _) => {
                            *authorized = true;
                        }
                        (ServerInput::Authorize(Err(_)), _) => {
                            // Unauthorized attributes are skipped
                            *authorized = false;
                            if handle == *end {
                                exhausted = true;
                            } else {
                                *cursor = handle + 1;
                            }
                        }
                        (ServerInput::Read(result), Some(m)) => {
                            *authorized = false;
                            if let Ok(value) = Self::settle_read(m, result) {
                                if value == *target {
                                    let group_end = ctx
                                        .db
                                        .attribute(handle)
                                        .and_then(|a| a.group_end)
                                        .unwrap_or(handle);
                                    groups.push((handle, group_end));
                                }
                            }
                            if handle == *end || groups.len() >= cap {
                                exhausted = true;
                            } else {
                                *cursor = handle + 1;
                            }
                        }
                        _ => return true,
                    }
                }

                while !exhausted && groups.len() < cap {
                    let next = ctx
                        .db
                        .range_iter(*cursor, *end)
                        .find(|(_, attr)| attr.uuid.as_u16() == Some(*att_type))
                        .map(|(h, _)| h);
                    let Some(handle) = next else {
                        break;
                    };
                    *cursor = handle;
                    match self.dispatch_read(ctx, handle, 0, *authorized) {
                        ReadOutcome::Done(result) => {
                            *authorized = false;
                            if let Ok(value) = result {
                                if value == *target {
                                    let group_end = ctx
                                        .db
                                        .attribute(handle)
                                        .and_then(|a| a.group_end)
                                        .unwrap_or(handle);
                                    groups.push((handle, group_end));
                                }
                            }
                            // Permission failures are silently skipped
                            if handle == *end {
                                break;
                            }
                            *cursor = handle + 1;
                        }
                        ReadOutcome::PendingAuthorize => return true,
                        ReadOutcome::PendingFull => {
                            *mode = Some(ReadMode::Full {
                                offset: 0,
                                max: attr_max(ctx, handle),
                            });
                            return true;
                        }
                        ReadOutcome::PendingPartial => {
                            *mode = Some(ReadMode::Partial {
                                offset: 0,
                                max: attr_max(ctx, handle),
                            });
                            return true;
                        }
                    }
                }

                if groups.is_empty() {
                    let handle = *cursor;
                    self.finish_op_error(
                        ctx.adapter,
                        ATT_FIND_BY_TYPE_VALUE_REQ,
                        handle,
                        AttErrorCode::AttributeNotFound,
                    );
                } else {
                    let pdu = FindByTypeValueResponse {
                        handles: std::mem::take(groups),
                    }
                    .serialize();
                    self.finish_op(ctx.adapter, Some(pdu));
                }
                false
            }

            ServerOp::Write {
                opcode,
                handle,
                value,
                needs_response,
                authorized,
            } => {
                let (opcode, handle, needs_response) = (*opcode, *handle, *needs_response);
                if let Some(ServerInput::Authorize(Ok(()))) = &input {
                    *authorized = true;
                    input = None;
                }
                let outcome: Result<(), AttErrorCode> = match input.take() {
                    Some(ServerInput::Authorize(Err(code))) => Err(code),
                    Some(ServerInput::Write(result)) => result,
                    None => {
                        let value = value.clone();
                        let authorized_now = *authorized;
                        match self.dispatch_write(
                            ctx,
                            handle,
                            0,
                            &value,
                            needs_response,
                            authorized_now,
                        ) {
                            WriteOutcome::Done(result) => result,
                            WriteOutcome::PendingWrite | WriteOutcome::PendingAuthorize => {
                                return true
                            }
                        }
                    }
                    Some(_) => return true,
                };
                if !needs_response {
                    // Write commands emit neither a response nor an error
                    self.generation += 1;
                    return false;
                }
                match outcome {
                    Ok(()) => self.finish_op(ctx.adapter, Some(WriteResponse.serialize())),
                    Err(code) => self.finish_op_error(ctx.adapter, opcode, handle, code),
                }
                false
            }

            ServerOp::PrepareWrite { request } => {
                match input.take() {
                    None => match ctx.db.authorize_write(
                        &ctx.conn,
                        ctx.level,
                        ctx.has_ltk,
                        request.handle,
                        &ctx.defer,
                        self.generation,
                    ) {
                        Ok(true) => return true,
                        Ok(false) => {}
                        Err(code) => {
                            let handle = request.handle;
                            self.finish_op_error(ctx.adapter, ATT_PREPARE_WRITE_REQ, handle, code);
                            return false;
                        }
                    },
                    Some(ServerInput::Authorize(Ok(()))) => {}
                    Some(ServerInput::Authorize(Err(code))) => {
                        let handle = request.handle;
                        self.finish_op_error(ctx.adapter, ATT_PREPARE_WRITE_REQ, handle, code);
                        return false;
                    }
                    Some(_) => return true,
                }

                // Coalesce with the queue tail when the fragment continues
                // it directly
                let coalesced = match self.prepare_queue.last_mut() {
                    Some((tail_handle, tail_offset, tail_value))
                        if *tail_handle == request.handle
                            && *tail_offset as usize + tail_value.len()
                                == request.offset as usize =>
                    {
                        tail_value.extend_from_slice(&request.value);
                        true
                    }
                    _ => false,
                };
                if !coalesced {
                    if self.prepare_queue.len() >= ATT_PREPARE_QUEUE_SIZE {
                        let handle = request.handle;
                        self.finish_op_error(
                            ctx.adapter,
                            ATT_PREPARE_WRITE_REQ,
                            handle,
                            AttErrorCode::PrepareQueueFull,
                        );
                        return false;
                    }
                    self.prepare_queue
                        .push((request.handle, request.offset, request.value.clone()));
                }
                // Echo the request as the response
                let pdu = PrepareWriteResponse {
                    handle: request.handle,
                    offset: request.offset,
                    value: request.value.clone(),
                }
                .serialize();
                self.finish_op(ctx.adapter, Some(pdu));
                false
            }

            ServerOp::ExecuteWrite {
                remaining,
                responded,
            } => {
                if let Some(ServerInput::Write(result)) = input.take() {
                    *remaining = remaining.saturating_sub(1);
                    if let Err(code) = result {
                        if !*responded {
                            *responded = true;
                            self.send_error(ctx.adapter, ATT_EXECUTE_WRITE_REQ, 0, code);
                        }
                    }
                }
                if *remaining == 0 {
                    let responded = *responded;
                    self.generation += 1;
                    if !responded {
                        self.send_pdu(ctx.adapter, ExecuteWriteResponse.serialize());
                    }
                    false
                } else {
                    true
                }
            }
        }
    }

    fn handle_find_information(&mut self, ctx: &mut AttContext<'_>, pdu: &[u8]) {
        let Some(request) = FindInformationRequest::parse(pdu) else {
            return;
        };
        if request.start_handle > request.end_handle || request.start_handle == 0 {
            self.send_error(
                ctx.adapter,
                ATT_FIND_INFO_REQ,
                request.start_handle,
                AttErrorCode::InvalidHandle,
            );
            return;
        }
        let mtu = self.mtu as usize;
        let mut format = None;
        let mut entries = Vec::new();
        for (handle, attr) in ctx.db.range_iter(request.start_handle, request.end_handle) {
            let short = attr.uuid.as_u16().is_some();
            let entry_format = if short {
                ATT_FIND_INFO_FORMAT_16BIT
            } else {
                ATT_FIND_INFO_FORMAT_128BIT
            };
            match format {
                None => format = Some(entry_format),
                Some(f) if f != entry_format => break,
                Some(_) => {}
            }
            let entry_size = if short { 4 } else { 18 };
            if (entries.len() + 1) * entry_size > mtu - 2 {
                break;
            }
            entries.push((handle, attr.uuid));
        }
        match format {
            None => self.send_error(
                ctx.adapter,
                ATT_FIND_INFO_REQ,
                request.start_handle,
                AttErrorCode::AttributeNotFound,
            ),
            Some(format) => {
                let pdu = FindInformationResponse { format, entries }.serialize();
                self.send_pdu(ctx.adapter, pdu);
            }
        }
    }

    fn handle_read_by_group_type(&mut self, ctx: &mut AttContext<'_>, pdu: &[u8]) {
        let Some(request) = ReadByGroupTypeRequest::parse(pdu) else {
            return;
        };
        if request.start_handle > request.end_handle || request.start_handle == 0 {
            self.send_error(
                ctx.adapter,
                ATT_READ_BY_GROUP_TYPE_REQ,
                request.start_handle,
                AttErrorCode::InvalidHandle,
            );
            return;
        }
        let group16 = request.group_type.as_u16();
        if group16 != Some(PRIMARY_SERVICE_UUID) && group16 != Some(SECONDARY_SERVICE_UUID) {
            self.send_error(
                ctx.adapter,
                ATT_READ_BY_GROUP_TYPE_REQ,
                request.start_handle,
                AttErrorCode::UnsupportedGroupType,
            );
            return;
        }

        let mtu = self.mtu as usize;
        let declarations: Vec<(u16, u16)> = ctx
            .db
            .range_iter(request.start_handle, request.end_handle)
            .filter(|(_, attr)| attr.uuid == request.group_type)
            .map(|(handle, attr)| (handle, attr.group_end.unwrap_or(handle)))
            .collect();

        let mut unit_len = None;
        let mut entries: Vec<(u16, u16, Vec<u8>)> = Vec::new();
        for (handle, group_end) in declarations {
            // Service declarations are plain stored values
            let value = match self.dispatch_read(ctx, handle, 0, false) {
                ReadOutcome::Done(Ok(value)) => value,
                _ => continue,
            };
            match unit_len {
                None => unit_len = Some(value.len()),
                Some(len) if len != value.len() => break,
                Some(_) => {}
            }
            let entry_size = 4 + value.len();
            if (entries.len() + 1) * entry_size > mtu - 2 {
                break;
            }
            entries.push((handle, group_end, value));
        }

        if entries.is_empty() {
            self.send_error(
                ctx.adapter,
                ATT_READ_BY_GROUP_TYPE_REQ,
                request.start_handle,
                AttErrorCode::AttributeNotFound,
            );
        } else {
            let pdu = ReadByGroupTypeResponse { entries }.serialize();
            self.send_pdu(ctx.adapter, pdu);
        }
    }

    fn handle_execute_write(&mut self, ctx: &mut AttContext<'_>, flags: u8) {
        let queue = std::mem::take(&mut self.prepare_queue);
        if flags != ATT_EXEC_WRITE_COMMIT || queue.is_empty() {
            // Cancel: discard and acknowledge
            self.send_pdu(ctx.adapter, ExecuteWriteResponse.serialize());
            return;
        }

        // Pre-validate every entry before committing anything
        for (handle, offset, value) in &queue {
            let Some(attr) = ctx.db.attribute(*handle) else {
                self.send_error(
                    ctx.adapter,
                    ATT_EXECUTE_WRITE_REQ,
                    *handle,
                    AttErrorCode::InvalidHandle,
                );
                return;
            };
            if *offset as usize > attr.max_length {
                self.send_error(
                    ctx.adapter,
                    ATT_EXECUTE_WRITE_REQ,
                    *handle,
                    AttErrorCode::InvalidOffset,
                );
                return;
            }
            if *offset as usize + value.len() > attr.max_length {
                self.send_error(
                    ctx.adapter,
                    ATT_EXECUTE_WRITE_REQ,
                    *handle,
                    AttErrorCode::InvalidAttributeValueLength,
                );
                return;
            }
        }

        // Issue every write; asynchronous ones complete through the op
        self.current_op = Some(ServerOp::ExecuteWrite {
            remaining: 0,
            responded: false,
        });
        let mut pending = 0usize;
        let mut first_error: Option<AttErrorCode> = None;
        for (handle, offset, value) in &queue {
            match self.dispatch_write(ctx, *handle, *offset, value, true, true) {
                WriteOutcome::Done(Ok(())) => {}
                WriteOutcome::Done(Err(code)) => {
                    if first_error.is_none() {
                        first_error = Some(code);
                    }
                }
                WriteOutcome::PendingWrite | WriteOutcome::PendingAuthorize => {
                    pending += 1;
                }
            }
        }

        let responded = first_error.is_some();
        if let Some(code) = first_error {
            self.send_error(ctx.adapter, ATT_EXECUTE_WRITE_REQ, 0, code);
        }
        if pending == 0 {
            self.current_op = None;
            self.generation += 1;
            if !responded {
                self.send_pdu(ctx.adapter, ExecuteWriteResponse.serialize());
            }
        } else if let Some(ServerOp::ExecuteWrite {
            remaining,
            responded: op_responded,
        }) = self.current_op.as_mut()
        {
            *remaining = pending;
            *op_responded = responded;
        }
    }
}

fn attr_max(ctx: &AttContext<'_>, handle: u16) -> usize {
    ctx.db.attribute(handle).map_or(0, |a| a.max_length)
}

fn record_read_error(
    best: &mut Option<(u8, u16, AttErrorCode)>,
    handle: u16,
    code: AttErrorCode,
) {
    let rank = code.read_error_rank();
    match best {
        Some((existing, _, _)) if *existing >= rank => {}
        _ => *best = Some((rank, handle, code)),
    }
}

/// Appends an entry to a Read By Type collection, enforcing the identical
/// value-length rule and the MTU budget. Returns false when collection
/// must stop (the entry was not added).
fn push_typed_entry(
    entries: &mut Vec<(u16, Vec<u8>)>,
    unit_len: &mut Option<usize>,
    handle: u16,
    mut value: Vec<u8>,
    value_cap: usize,
    mtu: usize,
) -> bool {
    value.truncate(value_cap);
    match unit_len {
        None => *unit_len = Some(value.len()),
        Some(len) if *len != value.len() => return false,
        Some(_) => {}
    }
    let entry_size = 2 + value.len();
    if (entries.len() + 1) * entry_size > mtu - 2 {
        return false;
    }
    entries.push((handle, value));
    true
}
