//! GATT client
//!
//! Discovery, reads and writes against a remote GATT server, driven as a
//! per-connection queue of operations. Each operation issues ATT requests
//! through the bearer and advances on their responses; discovered services
//! land in the range cache so reconnections skip rediscovery.

use crate::att::bearer::{AttResponse, ResponseCallback};
use crate::att::constants::*;
use crate::att::error::{AttError, AttErrorCode};
use crate::gatt::cache::{GattClientCache, IncludedEntry, RemoteService};
use crate::host::BleHost;
use crate::store::{now_millis, Store};
use crate::address::Address;
use crate::uuid::Uuid;
use log::debug;
use std::collections::VecDeque;
use thiserror::Error;

/// Errors surfaced by GATT client operations.
#[derive(Debug, Error)]
pub enum GattError {
    #[error("ATT error: {0}")]
    Att(#[from] AttError),

    #[error("device not connected")]
    NotConnected,

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("prepare write echo did not match the request")]
    EchoMismatch,

    #[error("reliable write session aborted")]
    ReliableWriteAborted,
}

/// A characteristic discovered on a remote server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteCharacteristic {
    pub declaration_handle: u16,
    pub value_handle: u16,
    /// Last handle belonging to this characteristic
    pub end_handle: u16,
    /// Declaration properties byte
    pub properties: u8,
    pub uuid: Uuid,
}

/// A descriptor discovered on a remote server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteDescriptor {
    pub handle: u16,
    pub uuid: Uuid,
}

pub type MtuCallback = Box<dyn FnOnce(&mut BleHost, Result<u16, GattError>) + Send>;
pub type ServicesCallback = Box<dyn FnOnce(&mut BleHost, Result<Vec<RemoteService>, GattError>) + Send>;
pub type IncludesCallback = Box<dyn FnOnce(&mut BleHost, Result<Vec<IncludedEntry>, GattError>) + Send>;
pub type CharacteristicsCallback =
    Box<dyn FnOnce(&mut BleHost, Result<Vec<RemoteCharacteristic>, GattError>) + Send>;
pub type DescriptorsCallback =
    Box<dyn FnOnce(&mut BleHost, Result<Vec<RemoteDescriptor>, GattError>) + Send>;
pub type ValueCallback = Box<dyn FnOnce(&mut BleHost, Result<Vec<u8>, GattError>) + Send>;
pub type HandleValuesCallback =
    Box<dyn FnOnce(&mut BleHost, Result<Vec<(u16, Vec<u8>)>, GattError>) + Send>;
pub type UnitCallback = Box<dyn FnOnce(&mut BleHost, Result<(), GattError>) + Send>;

/// Progress of a scan over one undecided handle range.
struct RangeScan {
    cursor: u16,
    range_end: u16,
}

enum WritePhase {
    Preparing,
    Executing,
    Aborting(GattError),
}

pub(crate) enum ClientOp {
    ExchangeMtu {
        cb: MtuCallback,
    },
    DiscoverPrimary {
        uuid: Option<Uuid>,
        num_to_find: Option<usize>,
        ranges: VecDeque<(u16, u16)>,
        scan: Option<RangeScan>,
        found: usize,
        /// Set once `found` reached `num_to_find`; stops gap marking
        satisfied: bool,
        cb: ServicesCallback,
    },
    FindIncluded {
        start: u16,
        end: u16,
        cursor: u16,
        acc: Vec<IncludedEntry>,
        /// Indices into `acc` still needing a 128-bit UUID fetch
        fetch: VecDeque<usize>,
        fetching: bool,
        cb: IncludesCallback,
    },
    DiscoverCharacteristics {
        end: u16,
        cursor: u16,
        raw: Vec<(u16, u8, u16, Uuid)>,
        cb: CharacteristicsCallback,
    },
    DiscoverDescriptors {
        end: u16,
        cursor: u16,
        acc: Vec<RemoteDescriptor>,
        cb: DescriptorsCallback,
    },
    Read {
        handle: u16,
        /// First byte of the value the caller asked for
        base_offset: u16,
        long: bool,
        acc: Vec<u8>,
        started: bool,
        cb: ValueCallback,
    },
    ReadByUuid {
        start: u16,
        end: u16,
        uuid: Uuid,
        cb: HandleValuesCallback,
    },
    Write {
        handle: u16,
        value: Vec<u8>,
        offset: u16,
        /// Start of the chunk currently on the wire
        chunk_start: usize,
        /// Bytes prepared so far
        pos: usize,
        plain: bool,
        in_session: bool,
        phase: WritePhase,
        cb: UnitCallback,
    },
    Execute {
        commit: bool,
        cb: UnitCallback,
    },
    WriteCccd {
        characteristic: RemoteCharacteristic,
        bits: u8,
        cccd: Option<u16>,
        cursor: u16,
        cb: UnitCallback,
    },
}

enum Step {
    /// A request was issued; wait for its response
    Wait,
    /// The op finished; run the completion with host access
    Done(Box<dyn FnOnce(&mut BleHost) + Send>),
}

/// GATT client state for one connection.
pub(crate) struct GattClientState {
    pub cache: GattClientCache,
    ops: VecDeque<ClientOp>,
    waiting: bool,
    reliable_session: bool,
    /// True once discovery saw a Service Changed characteristic, which
    /// suppresses cache persistence for non-bonded peers
    service_changed_seen: bool,
}

impl GattClientState {
    pub fn new() -> Self {
        Self {
            cache: GattClientCache::new(),
            ops: VecDeque::new(),
            waiting: false,
            reliable_session: false,
            service_changed_seen: false,
        }
    }

    /// Seeds the cache from the store on connection setup.
    pub fn load_cache(&mut self, store: &Store, own: Address, identity: Address, bonded: bool) {
        if let Some(data) = store.get_gatt_cache(own, identity, bonded) {
            self.cache = GattClientCache::from_data(&data);
            debug!("restored GATT cache for {}", identity);
        }
    }

    pub(crate) fn take_ops(&mut self) -> Vec<ClientOp> {
        self.waiting = false;
        self.ops.drain(..).collect()
    }
}

/// Fails a drained op list, e.g. on disconnect or ATT timeout.
pub(crate) fn fail_client_ops(host: &mut BleHost, ops: Vec<ClientOp>, error: AttError) {
    for op in ops {
        fail_op(host, op, GattError::Att(error.clone()));
    }
}

fn fail_op(host: &mut BleHost, op: ClientOp, error: GattError) {
    match op {
        ClientOp::ExchangeMtu { cb } => cb(host, Err(error)),
        ClientOp::DiscoverPrimary { cb, .. } => cb(host, Err(error)),
        ClientOp::FindIncluded { cb, .. } => cb(host, Err(error)),
        ClientOp::DiscoverCharacteristics { cb, .. } => cb(host, Err(error)),
        ClientOp::DiscoverDescriptors { cb, .. } => cb(host, Err(error)),
        ClientOp::Read { cb, .. } => cb(host, Err(error)),
        ClientOp::ReadByUuid { cb, .. } => cb(host, Err(error)),
        ClientOp::Write { cb, .. } => cb(host, Err(error)),
        ClientOp::Execute { cb, .. } => cb(host, Err(error)),
        ClientOp::WriteCccd { cb, .. } => cb(host, Err(error)),
    }
}

/// Response callback wiring a bearer completion back into the op queue.
fn request_cb(host: &BleHost, conn: u16) -> ResponseCallback {
    let defer = host.defer.clone();
    Box::new(move |result| {
        defer.lock().unwrap().push_back(Box::new(move |host| {
            advance(host, conn, result);
        }));
    })
}

fn start_op(host: &mut BleHost, conn: u16, op: ClientOp) {
    let Some(c) = host.connections.get_mut(&conn) else {
        fail_op(host, op, GattError::NotConnected);
        return;
    };
    c.client.ops.push_back(op);
    if !c.client.waiting && c.client.ops.len() == 1 {
        step_front(host, conn, None);
    }
}

pub(crate) fn advance(host: &mut BleHost, conn: u16, result: Result<AttResponse, AttError>) {
    if let Some(c) = host.connections.get_mut(&conn) {
        c.client.waiting = false;
    }
    step_front(host, conn, Some(result));
}

fn step_front(host: &mut BleHost, conn: u16, mut input: Option<Result<AttResponse, AttError>>) {
    loop {
        let Some(mut op) = ({
            match host.connections.get_mut(&conn) {
                Some(c) if !c.client.waiting => c.client.ops.pop_front(),
                _ => None,
            }
        }) else {
            return;
        };
        match step(host, conn, &mut op, input.take()) {
            Step::Wait => {
                if let Some(c) = host.connections.get_mut(&conn) {
                    c.client.ops.push_front(op);
                    c.client.waiting = true;
                } else {
                    fail_op(host, op, GattError::NotConnected);
                }
                return;
            }
            Step::Done(complete) => {
                complete(host);
            }
        }
    }
}

fn mtu_of(host: &mut BleHost, conn: u16) -> usize {
    host.connections
        .get_mut(&conn)
        .map(|c| c.att.mtu() as usize)
        .unwrap_or(ATT_DEFAULT_MTU as usize)
}

fn done<T: Send + 'static>(
    cb: impl FnOnce(&mut BleHost, Result<T, GattError>) + Send + 'static,
    result: Result<T, GattError>,
) -> Step {
    Step::Done(Box::new(move |host| cb(host, result)))
}

/// Saves the connection's cache unless the peer's address rotates or its
/// database is volatile.
fn persist_cache(host: &mut BleHost, conn: u16) {
    let Some(own) = host.own_address else {
        return;
    };
    let Some(c) = host.connections.get(&conn) else {
        return;
    };
    // Resolvable private addresses rotate between sessions; never cache
    // for such peers.
    if c.info.peer.is_resolvable_random() {
        return;
    }
    // A server carrying Service Changed may alter its database between
    // sessions, so only bonded peers (who get indications) may cache it.
    if !c.bonded && c.client.service_changed_seen {
        return;
    }
    let data = c.client.cache.to_data(now_millis());
    host.store.store_gatt_cache(own, c.identity, c.bonded, &data);
}

/// Records a discovered primary service, demoting any stale secondary
/// cache entry for the same range.
fn record_primary(cache: &mut GattClientCache, service: RemoteService) {
    cache.secondary.remove_overlapping(service.start, service.end);
    cache.insert_primary(service);
}

/// One advancement of the front op. `input` carries the ATT response that
/// woke us, if any.
fn step(
    host: &mut BleHost,
    conn: u16,
    op: &mut ClientOp,
    input: Option<Result<AttResponse, AttError>>,
) -> Step {
    match op {
        ClientOp::ExchangeMtu { cb } => match input {
            None => {
                let issued = issue(host, conn, |bearer, adapter, cb| {
                    bearer.exchange_mtu(adapter, ATT_MAX_MTU, cb)
                });
                if !issued {
                    return done(take_cb(cb), Err(GattError::NotConnected));
                }
                Step::Wait
            }
            Some(Ok(AttResponse::ExchangeMtu(_))) => {
                let mtu = mtu_of(host, conn) as u16;
                done(take_cb(cb), Ok(mtu))
            }
            Some(Err(err)) => done(take_cb(cb), Err(err.into())),
            Some(Ok(_)) => done(take_cb(cb), Err(GattError::Att(AttError::Timeout))),
        },

        ClientOp::DiscoverPrimary {
            uuid,
            num_to_find,
            ranges,
            scan,
            found,
            satisfied,
            cb,
        } => {
            let uuid = *uuid;
            match input {
                None => {}
                Some(Ok(AttResponse::ReadByGroupType(entries))) => {
                    let scan_state = scan.as_mut().expect("response implies a scan");
                    let mut cursor = scan_state.cursor as u32;
                    for (start, end, value) in &entries {
                        let Some(svc_uuid) = Uuid::try_from_slice_le(value) else {
                            continue;
                        };
                        let service = RemoteService {
                            start: *start,
                            end: *end,
                            uuid: svc_uuid,
                            includes: Vec::new(),
                        };
                        if !*satisfied && (*start as u32) > cursor {
                            // The space before this service is verified empty
                            let gap = (cursor as u16, *start - 1);
                            with_cache(host, conn, |cache| {
                                cache.all_primary.insert(gap.0, gap.1, None)
                            });
                        }
                        with_cache(host, conn, |cache| record_primary(cache, service));
                        *found += 1;
                        cursor = *end as u32 + 1;
                        if num_to_find.map_or(false, |n| *found >= n) {
                            *satisfied = true;
                        }
                    }
                    if *satisfied || cursor > scan_state.range_end as u32 {
                        scan.take();
                        if *satisfied {
                            ranges.clear();
                        }
                    } else {
                        scan_state.cursor = cursor as u16;
                    }
                }
                Some(Ok(AttResponse::FindByTypeValue(groups))) => {
                    let filter = uuid.expect("find-by-type-value implies a filter");
                    let scan_state = scan.as_mut().expect("response implies a scan");
                    let mut cursor = scan_state.cursor as u32;
                    for (start, group_end) in &groups {
                        let service = RemoteService {
                            start: *start,
                            end: *group_end,
                            uuid: filter,
                            includes: Vec::new(),
                        };
                        if !*satisfied && (*start as u32) > cursor {
                            let gap = (cursor as u16, *start - 1);
                            with_cache(host, conn, |cache| {
                                cache
                                    .primary_by_uuid
                                    .entry(filter)
                                    .or_default()
                                    .insert(gap.0, gap.1, None)
                            });
                        }
                        with_cache(host, conn, |cache| record_primary(cache, service));
                        *found += 1;
                        cursor = *group_end as u32 + 1;
                        if num_to_find.map_or(false, |n| *found >= n) {
                            *satisfied = true;
                        }
                    }
                    if *satisfied || cursor > scan_state.range_end as u32 {
                        scan.take();
                        if *satisfied {
                            ranges.clear();
                        }
                    } else {
                        scan_state.cursor = cursor as u16;
                    }
                }
                Some(Err(AttError::Protocol {
                    code: AttErrorCode::AttributeNotFound,
                    ..
                })) => {
                    // The rest of this range is a verified gap
                    if let Some(scan_state) = scan.take() {
                        if !*satisfied {
                            with_cache(host, conn, |cache| match uuid {
                                Some(filter) => {
                                    cache.primary_by_uuid.entry(filter).or_default().insert(
                                        scan_state.cursor,
                                        scan_state.range_end,
                                        None,
                                    );
                                }
                                None => cache.all_primary.insert(
                                    scan_state.cursor,
                                    scan_state.range_end,
                                    None,
                                ),
                            });
                        }
                    }
                }
                Some(Err(err)) => return done(take_cb(cb), Err(err.into())),
                Some(Ok(_)) => return done(take_cb(cb), Err(GattError::Att(AttError::Timeout))),
            }

            // Start the next range scan, or finish
            if scan.is_none() {
                match ranges.pop_front() {
                    Some((start, end)) if !*satisfied => {
                        *scan = Some(RangeScan {
                            cursor: start,
                            range_end: end,
                        });
                    }
                    _ => {
                        let result = finish_primary_discovery(host, conn, uuid, *num_to_find);
                        persist_cache(host, conn);
                        return done(take_cb(cb), Ok(result));
                    }
                }
            }
            let scan_state = scan.as_ref().expect("set above");
            let (cursor, range_end) = (scan_state.cursor, scan_state.range_end);
            let issued = match uuid {
                None => issue(host, conn, |bearer, adapter, cb| {
                    bearer.read_by_group_type(
                        adapter,
                        cursor,
                        range_end,
                        Uuid::from_u16(PRIMARY_SERVICE_UUID),
                        cb,
                    )
                }),
                Some(filter) => {
                    let mut value = Vec::new();
                    filter.write_wire(&mut value);
                    issue(host, conn, move |bearer, adapter, cb| {
                        bearer.find_by_type_value(
                            adapter,
                            cursor,
                            range_end,
                            PRIMARY_SERVICE_UUID,
                            value,
                            cb,
                        )
                    })
                }
            };
            if !issued {
                return done(take_cb(cb), Err(GattError::NotConnected));
            }
            Step::Wait
        }

        ClientOp::FindIncluded {
            start,
            end,
            cursor,
            acc,
            fetch,
            fetching,
            cb,
        } => {
            match input {
                None => {}
                Some(Ok(AttResponse::ReadByType(entries))) if !*fetching => {
                    let mut last = *cursor;
                    for (handle, value) in &entries {
                        last = *handle;
                        let entry = match value.len() {
                            6 => IncludedEntry {
                                start: u16::from_le_bytes([value[0], value[1]]),
                                end: u16::from_le_bytes([value[2], value[3]]),
                                uuid: Some(Uuid::from_u16(u16::from_le_bytes([
                                    value[4], value[5],
                                ]))),
                            },
                            4 => IncludedEntry {
                                start: u16::from_le_bytes([value[0], value[1]]),
                                end: u16::from_le_bytes([value[2], value[3]]),
                                uuid: None,
                            },
                            _ => continue,
                        };
                        if entry.uuid.is_none() {
                            fetch.push_back(acc.len());
                        }
                        acc.push(entry);
                    }
                    if last >= *end {
                        *fetching = true;
                    } else {
                        *cursor = last + 1;
                    }
                }
                Some(Err(AttError::Protocol {
                    code: AttErrorCode::AttributeNotFound,
                    ..
                })) if !*fetching => {
                    *fetching = true;
                }
                Some(Ok(AttResponse::Read(value))) if *fetching => {
                    // 128-bit include target: the service declaration value
                    // carries the full UUID
                    if let Some(index) = fetch.pop_front() {
                        acc[index].uuid = Uuid::try_from_slice_le(&value);
                    }
                }
                Some(Err(err)) => return done(take_cb(cb), Err(err.into())),
                Some(Ok(_)) => return done(take_cb(cb), Err(GattError::Att(AttError::Timeout))),
            }

            if !*fetching {
                let (cursor, end) = (*cursor, *end);
                let issued = issue(host, conn, move |bearer, adapter, cb| {
                    bearer.read_by_type(adapter, cursor, end, Uuid::from_u16(INCLUDE_UUID), cb)
                });
                if !issued {
                    return done(take_cb(cb), Err(GattError::NotConnected));
                }
                return Step::Wait;
            }
            if let Some(&index) = fetch.front() {
                let handle = acc[index].start;
                let issued = issue(host, conn, move |bearer, adapter, cb| {
                    bearer.read(adapter, handle, cb)
                });
                if !issued {
                    return done(take_cb(cb), Err(GattError::NotConnected));
                }
                return Step::Wait;
            }

            // Attach the include list to the cached service
            let start = *start;
            let includes = acc.clone();
            with_cache(host, conn, |cache| {
                if let Some((s, e, Some(service))) = cache.all_primary.get(start) {
                    let mut service = service.clone();
                    service.includes = includes.clone();
                    cache.all_primary.insert(s, e, Some(service));
                } else if let Some((s, e, Some(service))) = cache.secondary.get(start) {
                    let mut service = service.clone();
                    service.includes = includes.clone();
                    cache.secondary.insert(s, e, Some(service));
                }
            });
            persist_cache(host, conn);
            done(take_cb(cb), Ok(std::mem::take(acc)))
        }

        ClientOp::DiscoverCharacteristics {
            end,
            cursor,
            raw,
            cb,
        } => {
            match input {
                None => {}
                Some(Ok(AttResponse::ReadByType(entries))) => {
                    let mut last = *cursor;
                    for (handle, value) in &entries {
                        last = *handle;
                        if value.len() < 5 {
                            continue;
                        }
                        let properties = value[0];
                        let value_handle = u16::from_le_bytes([value[1], value[2]]);
                        let Some(uuid) = Uuid::try_from_slice_le(&value[3..]) else {
                            continue;
                        };
                        raw.push((*handle, properties, value_handle, uuid));
                    }
                    if last >= *end {
                        *cursor = *end;
                        return finish_characteristics(host, conn, raw, *end, cb);
                    }
                    *cursor = last + 1;
                }
                Some(Err(AttError::Protocol {
                    code: AttErrorCode::AttributeNotFound,
                    ..
                })) => {
                    return finish_characteristics(host, conn, raw, *end, cb);
                }
                Some(Err(err)) => return done(take_cb(cb), Err(err.into())),
                Some(Ok(_)) => return done(take_cb(cb), Err(GattError::Att(AttError::Timeout))),
            }
            let (cursor, end) = (*cursor, *end);
            let issued = issue(host, conn, move |bearer, adapter, cb| {
                bearer.read_by_type(adapter, cursor, end, Uuid::from_u16(CHARACTERISTIC_UUID), cb)
            });
            if !issued {
                return done(take_cb(cb), Err(GattError::NotConnected));
            }
            Step::Wait
        }

        ClientOp::DiscoverDescriptors {
            end,
            cursor,
            acc,
            cb,
        } => {
            match input {
                None => {
                    if *cursor > *end {
                        // Nothing between value handle and end handle
                        return done(take_cb(cb), Ok(std::mem::take(acc)));
                    }
                }
                Some(Ok(AttResponse::FindInformation(entries))) => {
                    let mut last = *cursor;
                    for (handle, uuid) in entries {
                        last = handle;
                        acc.push(RemoteDescriptor { handle, uuid });
                    }
                    if last >= *end {
                        return done(take_cb(cb), Ok(std::mem::take(acc)));
                    }
                    *cursor = last + 1;
                }
                Some(Err(AttError::Protocol {
                    code: AttErrorCode::AttributeNotFound,
                    ..
                })) => {
                    return done(take_cb(cb), Ok(std::mem::take(acc)));
                }
                Some(Err(err)) => return done(take_cb(cb), Err(err.into())),
                Some(Ok(_)) => return done(take_cb(cb), Err(GattError::Att(AttError::Timeout))),
            }
            let (cursor, end) = (*cursor, *end);
            let issued = issue(host, conn, move |bearer, adapter, cb| {
                bearer.find_information(adapter, cursor, end, cb)
            });
            if !issued {
                return done(take_cb(cb), Err(GattError::NotConnected));
            }
            Step::Wait
        }

        ClientOp::Read {
            handle,
            base_offset,
            long,
            acc,
            started,
            cb,
        } => {
            let mtu = mtu_of(host, conn);
            let cap = ATT_MAX_VALUE_LEN.saturating_sub(*base_offset as usize);
            match input {
                None => {}
                Some(Ok(AttResponse::Read(value))) | Some(Ok(AttResponse::ReadBlob(value))) => {
                    let chunk_len = value.len();
                    acc.extend_from_slice(&value);
                    let full = chunk_len == mtu - 1;
                    let continue_blob = *long && full && acc.len() < cap;
                    if !continue_blob {
                        acc.truncate(cap);
                        return done(take_cb(cb), Ok(std::mem::take(acc)));
                    }
                }
                Some(Err(AttError::Protocol {
                    code: AttErrorCode::AttributeNotLong,
                    ..
                })) if *started && !acc.is_empty() => {
                    // The value simply is not longer than one response
                    return done(take_cb(cb), Ok(std::mem::take(acc)));
                }
                Some(Err(err)) => return done(take_cb(cb), Err(err.into())),
                Some(Ok(_)) => return done(take_cb(cb), Err(GattError::Att(AttError::Timeout))),
            }
            let handle = *handle;
            let issued = if !*started {
                *started = true;
                if *base_offset == 0 {
                    issue(host, conn, move |bearer, adapter, cb| {
                        bearer.read(adapter, handle, cb)
                    })
                } else {
                    let offset = *base_offset;
                    issue(host, conn, move |bearer, adapter, cb| {
                        bearer.read_blob(adapter, handle, offset, cb)
                    })
                }
            } else {
                let offset = *base_offset + acc.len() as u16;
                issue(host, conn, move |bearer, adapter, cb| {
                    bearer.read_blob(adapter, handle, offset, cb)
                })
            };
            if !issued {
                return done(take_cb(cb), Err(GattError::NotConnected));
            }
            Step::Wait
        }

        ClientOp::ReadByUuid {
            start,
            end,
            uuid,
            cb,
        } => match input {
            None => {
                let (start, end, uuid) = (*start, *end, *uuid);
                let issued = issue(host, conn, move |bearer, adapter, cb| {
                    bearer.read_by_type(adapter, start, end, uuid, cb)
                });
                if !issued {
                    return done(take_cb(cb), Err(GattError::NotConnected));
                }
                Step::Wait
            }
            Some(Ok(AttResponse::ReadByType(entries))) => done(take_cb(cb), Ok(entries)),
            Some(Err(err)) => done(take_cb(cb), Err(err.into())),
            Some(Ok(_)) => done(take_cb(cb), Err(GattError::Att(AttError::Timeout))),
        },

        ClientOp::Write {
            handle,
            value,
            offset,
            chunk_start,
            pos,
            plain,
            in_session,
            phase,
            cb,
        } => {
            let mtu = mtu_of(host, conn);
            let handle = *handle;
            match (&*phase, input) {
                (_, None) => {}
                (WritePhase::Preparing, Some(Ok(AttResponse::Write))) => {
                    return done(take_cb(cb), Ok(()));
                }
                (
                    WritePhase::Preparing,
                    Some(Ok(AttResponse::PrepareWrite {
                        handle: echo_handle,
                        offset: echo_offset,
                        value: echo_value,
                    })),
                ) => {
                    // The response must echo the request byte for byte
                    let expected_offset = *offset as usize + *chunk_start;
                    let expected_chunk = &value[*chunk_start..*pos];
                    let echo_ok = echo_handle == handle
                        && echo_offset as usize == expected_offset
                        && echo_value == expected_chunk;
                    if !echo_ok {
                        let error = if *in_session {
                            GattError::ReliableWriteAborted
                        } else {
                            GattError::EchoMismatch
                        };
                        *phase = WritePhase::Aborting(error);
                    } else if *pos >= value.len() {
                        if *in_session {
                            // The session owner commits later
                            return done(take_cb(cb), Ok(()));
                        }
                        *phase = WritePhase::Executing;
                    }
                }
                (WritePhase::Executing, Some(Ok(AttResponse::ExecuteWrite))) => {
                    return done(take_cb(cb), Ok(()));
                }
                (WritePhase::Aborting(_), Some(_)) => {
                    // The cancel round-trip finished (either way); surface
                    // the original failure
                    let error = match std::mem::replace(phase, WritePhase::Executing) {
                        WritePhase::Aborting(error) => error,
                        _ => unreachable!(),
                    };
                    if matches!(error, GattError::ReliableWriteAborted) {
                        end_session(host, conn);
                    }
                    return done(take_cb(cb), Err(error));
                }
                (WritePhase::Preparing, Some(Err(err))) if !*plain => {
                    // Abort the queue before surfacing the failure
                    *phase = WritePhase::Aborting(err.into());
                }
                (_, Some(Err(err))) => {
                    return done(take_cb(cb), Err(err.into()));
                }
                (_, Some(Ok(_))) => {
                    return done(take_cb(cb), Err(GattError::Att(AttError::Timeout)))
                }
            }

            let issued = match &*phase {
                WritePhase::Preparing if *plain => {
                    let data = value.clone();
                    issue(host, conn, move |bearer, adapter, cb| {
                        bearer.write(adapter, handle, data, cb)
                    })
                }
                WritePhase::Preparing => {
                    let chunk_size = mtu - 5;
                    let chunk = value[*pos..(*pos + chunk_size).min(value.len())].to_vec();
                    let chunk_offset = *offset + *pos as u16;
                    *chunk_start = *pos;
                    *pos += chunk.len();
                    issue(host, conn, move |bearer, adapter, cb| {
                        bearer.prepare_write(adapter, handle, chunk_offset, chunk, cb)
                    })
                }
                WritePhase::Executing => issue(host, conn, |bearer, adapter, cb| {
                    bearer.execute_write(adapter, true, cb)
                }),
                WritePhase::Aborting(_) => issue(host, conn, |bearer, adapter, cb| {
                    bearer.execute_write(adapter, false, cb)
                }),
            };
            if !issued {
                return done(take_cb(cb), Err(GattError::NotConnected));
            }
            Step::Wait
        }

        ClientOp::Execute { commit, cb } => match input {
            None => {
                let commit = *commit;
                let issued = issue(host, conn, move |bearer, adapter, cb| {
                    bearer.execute_write(adapter, commit, cb)
                });
                if !issued {
                    return done(take_cb(cb), Err(GattError::NotConnected));
                }
                Step::Wait
            }
            Some(Ok(AttResponse::ExecuteWrite)) => {
                end_session(host, conn);
                done(take_cb(cb), Ok(()))
            }
            Some(Err(err)) => {
                end_session(host, conn);
                done(take_cb(cb), Err(err.into()))
            }
            Some(Ok(_)) => done(take_cb(cb), Err(GattError::Att(AttError::Timeout))),
        },

        ClientOp::WriteCccd {
            characteristic,
            bits,
            cccd,
            cursor,
            cb,
        } => {
            let missing = || {
                GattError::Att(AttError::protocol(
                    AttErrorCode::AttributeNotFound,
                    characteristic.value_handle,
                ))
            };
            match input {
                None => {
                    if characteristic.value_handle >= characteristic.end_handle {
                        // No room for any descriptor
                        return done(take_cb(cb), Err(missing()));
                    }
                }
                Some(Ok(AttResponse::FindInformation(entries))) => {
                    let mut last = *cursor;
                    for (handle, uuid) in entries {
                        last = handle;
                        if uuid == CLIENT_CHAR_CONFIG_UUID {
                            *cccd = Some(handle);
                        }
                    }
                    if cccd.is_none() {
                        if last >= characteristic.end_handle {
                            return done(take_cb(cb), Err(missing()));
                        }
                        *cursor = last + 1;
                    }
                }
                Some(Ok(AttResponse::Write)) => {
                    return done(take_cb(cb), Ok(()));
                }
                Some(Err(AttError::Protocol {
                    code: AttErrorCode::AttributeNotFound,
                    ..
                })) if cccd.is_none() => {
                    return done(take_cb(cb), Err(missing()));
                }
                Some(Err(err)) => return done(take_cb(cb), Err(err.into())),
                Some(Ok(_)) => return done(take_cb(cb), Err(GattError::Att(AttError::Timeout))),
            }

            let issued = if let Some(handle) = *cccd {
                let payload = vec![*bits, 0x00];
                issue(host, conn, move |bearer, adapter, cb| {
                    bearer.write(adapter, handle, payload, cb)
                })
            } else {
                let (cursor, end) = (*cursor, characteristic.end_handle);
                issue(host, conn, move |bearer, adapter, cb| {
                    bearer.find_information(adapter, cursor, end, cb)
                })
            };
            if !issued {
                return done(take_cb(cb), Err(GattError::NotConnected));
            }
            Step::Wait
        }
    }
}

/// Replaces the callback slot with a no-op so the op value can be consumed
/// while its callback runs later.
fn take_cb<T: Send + 'static>(
    cb: &mut Box<dyn FnOnce(&mut BleHost, Result<T, GattError>) + Send>,
) -> Box<dyn FnOnce(&mut BleHost, Result<T, GattError>) + Send> {
    std::mem::replace(cb, Box::new(|_, _| {}))
}

fn with_cache<R>(host: &mut BleHost, conn: u16, f: impl FnOnce(&mut GattClientCache) -> R) -> Option<R> {
    host.connections
        .get_mut(&conn)
        .map(|c| f(&mut c.client.cache))
}

fn end_session(host: &mut BleHost, conn: u16) {
    if let Some(c) = host.connections.get_mut(&conn) {
        c.client.reliable_session = false;
    }
}

/// Issues an ATT request through the connection's bearer. Returns false if
/// the connection vanished.
fn issue(
    host: &mut BleHost,
    conn: u16,
    f: impl FnOnce(&mut crate::att::bearer::AttBearer, &mut crate::hci::HciAdapter, ResponseCallback),
) -> bool {
    let cb = request_cb(host, conn);
    let Some(c) = host.connections.get_mut(&conn) else {
        return false;
    };
    f(&mut c.att, &mut host.adapter, cb);
    true
}

/// Collects the discovery result for a primary-service query from the
/// cache, in handle order.
fn finish_primary_discovery(
    host: &mut BleHost,
    conn: u16,
    uuid: Option<Uuid>,
    num_to_find: Option<usize>,
) -> Vec<RemoteService> {
    let Some(c) = host.connections.get_mut(&conn) else {
        return Vec::new();
    };
    let cache = &mut c.client.cache;
    if uuid.is_none() && cache.all_primary.is_fully_covered(ATT_HANDLE_MIN, ATT_HANDLE_MAX) {
        cache.has_all_primary_services = true;
    }
    let mut services: Vec<RemoteService> = cache
        .all_primary
        .values()
        .filter(|s| uuid.map_or(true, |u| s.uuid == u))
        .cloned()
        .collect();
    if let Some(n) = num_to_find {
        services.truncate(n);
    }
    services
}

fn finish_characteristics(
    host: &mut BleHost,
    conn: u16,
    raw: &mut Vec<(u16, u8, u16, Uuid)>,
    service_end: u16,
    cb: &mut CharacteristicsCallback,
) -> Step {
    let raw = std::mem::take(raw);
    let mut chars = Vec::with_capacity(raw.len());
    for (i, (decl, properties, value_handle, uuid)) in raw.iter().enumerate() {
        let end_handle = raw
            .get(i + 1)
            .map(|(next_decl, _, _, _)| next_decl - 1)
            .unwrap_or(service_end);
        chars.push(RemoteCharacteristic {
            declaration_handle: *decl,
            value_handle: *value_handle,
            end_handle,
            properties: *properties,
            uuid: *uuid,
        });
    }
    // A peer exposing Service Changed may rewrite its database; remember
    // that before deciding to persist the cache
    if chars.iter().any(|c| c.uuid == SERVICE_CHANGED_UUID) {
        if let Some(c) = host.connections.get_mut(&conn) {
            c.client.service_changed_seen = true;
        }
    }
    done(take_cb(cb), Ok(chars))
}

// --- Public client surface on the host ----------------------------------

impl BleHost {
    /// Negotiates the ATT MTU; completes with the effective value.
    pub fn exchange_mtu(
        &mut self,
        conn: u16,
        done: impl FnOnce(&mut BleHost, Result<u16, GattError>) + Send + 'static,
    ) {
        start_op(self, conn, ClientOp::ExchangeMtu { cb: Box::new(done) });
    }

    /// Discovers every primary service, reusing and extending the cache.
    pub fn discover_all_primary_services(
        &mut self,
        conn: u16,
        done: impl FnOnce(&mut BleHost, Result<Vec<RemoteService>, GattError>) + Send + 'static,
    ) {
        self.discover_primary(conn, None, None, Box::new(done));
    }

    /// Discovers primary services with the given UUID, stopping early once
    /// `num_to_find` are known.
    pub fn discover_services_by_uuid(
        &mut self,
        conn: u16,
        uuid: Uuid,
        num_to_find: Option<usize>,
        done: impl FnOnce(&mut BleHost, Result<Vec<RemoteService>, GattError>) + Send + 'static,
    ) {
        self.discover_primary(conn, Some(uuid), num_to_find, Box::new(done));
    }

    fn discover_primary(
        &mut self,
        conn: u16,
        uuid: Option<Uuid>,
        num_to_find: Option<usize>,
        cb: ServicesCallback,
    ) {
        let Some(c) = self.connections.get_mut(&conn) else {
            cb(self, Err(GattError::NotConnected));
            return;
        };
        let cache = &c.client.cache;
        let (cached, ranges): (usize, Vec<(u16, u16)>) = match uuid {
            None if cache.has_all_primary_services => (cache.all_primary.values().count(), Vec::new()),
            None => (
                cache.all_primary.values().count(),
                cache
                    .all_primary
                    .undecided_ranges(ATT_HANDLE_MIN, ATT_HANDLE_MAX),
            ),
            Some(filter) => {
                let map = cache.primary_by_uuid.get(&filter);
                let cached = map.map_or(0, |m| m.values().count());
                let ranges = match map {
                    Some(m) => m.undecided_ranges(ATT_HANDLE_MIN, ATT_HANDLE_MAX),
                    None => vec![(ATT_HANDLE_MIN, ATT_HANDLE_MAX)],
                };
                (cached, ranges)
            }
        };
        let satisfied = num_to_find.map_or(false, |n| cached >= n) || ranges.is_empty();
        start_op(
            self,
            conn,
            ClientOp::DiscoverPrimary {
                uuid,
                num_to_find,
                ranges: ranges.into(),
                scan: None,
                found: cached,
                satisfied,
                cb,
            },
        );
    }

    /// Discovers the services included by `service`.
    pub fn find_included_services(
        &mut self,
        conn: u16,
        service: &RemoteService,
        done: impl FnOnce(&mut BleHost, Result<Vec<IncludedEntry>, GattError>) + Send + 'static,
    ) {
        start_op(
            self,
            conn,
            ClientOp::FindIncluded {
                start: service.start,
                end: service.end,
                cursor: service.start,
                acc: Vec::new(),
                fetch: VecDeque::new(),
                fetching: false,
                cb: Box::new(done),
            },
        );
    }

    /// Discovers the characteristics of `service`.
    pub fn discover_characteristics(
        &mut self,
        conn: u16,
        service: &RemoteService,
        done: impl FnOnce(&mut BleHost, Result<Vec<RemoteCharacteristic>, GattError>)
            + Send
            + 'static,
    ) {
        start_op(
            self,
            conn,
            ClientOp::DiscoverCharacteristics {
                end: service.end,
                cursor: service.start,
                raw: Vec::new(),
                cb: Box::new(done),
            },
        );
    }

    /// Discovers the descriptors of `characteristic`.
    pub fn discover_descriptors(
        &mut self,
        conn: u16,
        characteristic: &RemoteCharacteristic,
        done: impl FnOnce(&mut BleHost, Result<Vec<RemoteDescriptor>, GattError>) + Send + 'static,
    ) {
        start_op(
            self,
            conn,
            ClientOp::DiscoverDescriptors {
                end: characteristic.end_handle,
                cursor: characteristic.value_handle + 1,
                acc: Vec::new(),
                cb: Box::new(done),
            },
        );
    }

    /// Reads an attribute value, following up with Read Blob requests while
    /// full-MTU responses keep arriving (up to 512 bytes).
    pub fn read_characteristic(
        &mut self,
        conn: u16,
        handle: u16,
        done: impl FnOnce(&mut BleHost, Result<Vec<u8>, GattError>) + Send + 'static,
    ) {
        start_op(
            self,
            conn,
            ClientOp::Read {
                handle,
                base_offset: 0,
                long: true,
                acc: Vec::new(),
                started: false,
                cb: Box::new(done),
            },
        );
    }

    /// Reads an attribute value starting at `offset`, following up with
    /// further Read Blob requests as needed.
    pub fn read_long_characteristic(
        &mut self,
        conn: u16,
        handle: u16,
        offset: u16,
        done: impl FnOnce(&mut BleHost, Result<Vec<u8>, GattError>) + Send + 'static,
    ) {
        start_op(
            self,
            conn,
            ClientOp::Read {
                handle,
                base_offset: offset,
                long: true,
                acc: Vec::new(),
                started: false,
                cb: Box::new(done),
            },
        );
    }

    /// Reads at most one response worth of an attribute value.
    pub fn read_short(
        &mut self,
        conn: u16,
        handle: u16,
        done: impl FnOnce(&mut BleHost, Result<Vec<u8>, GattError>) + Send + 'static,
    ) {
        start_op(
            self,
            conn,
            ClientOp::Read {
                handle,
                base_offset: 0,
                long: false,
                acc: Vec::new(),
                started: false,
                cb: Box::new(done),
            },
        );
    }

    /// Reads attributes of the given type within a handle range.
    pub fn read_by_uuid(
        &mut self,
        conn: u16,
        start: u16,
        end: u16,
        uuid: Uuid,
        done: impl FnOnce(&mut BleHost, Result<Vec<(u16, Vec<u8>)>, GattError>) + Send + 'static,
    ) {
        start_op(
            self,
            conn,
            ClientOp::ReadByUuid {
                start,
                end,
                uuid,
                cb: Box::new(done),
            },
        );
    }

    /// Writes a characteristic value, transparently using the prepare /
    /// execute procedure for values beyond MTU-3 or inside a reliable-write
    /// session.
    pub fn write_characteristic(
        &mut self,
        conn: u16,
        handle: u16,
        value: Vec<u8>,
        done: impl FnOnce(&mut BleHost, Result<(), GattError>) + Send + 'static,
    ) {
        let mtu = mtu_of(self, conn);
        let in_session = self
            .connections
            .get(&conn)
            .map_or(false, |c| c.client.reliable_session);
        let plain = !in_session && value.len() <= mtu - 3;
        start_op(
            self,
            conn,
            ClientOp::Write {
                handle,
                value,
                offset: 0,
                chunk_start: 0,
                pos: 0,
                plain,
                in_session,
                phase: WritePhase::Preparing,
                cb: Box::new(done),
            },
        );
    }

    /// Writes a long value starting at `offset` with the prepare / execute
    /// procedure.
    pub fn write_long_characteristic(
        &mut self,
        conn: u16,
        handle: u16,
        offset: u16,
        value: Vec<u8>,
        done: impl FnOnce(&mut BleHost, Result<(), GattError>) + Send + 'static,
    ) {
        let in_session = self
            .connections
            .get(&conn)
            .map_or(false, |c| c.client.reliable_session);
        start_op(
            self,
            conn,
            ClientOp::Write {
                handle,
                value,
                offset,
                chunk_start: 0,
                pos: 0,
                plain: false,
                in_session,
                phase: WritePhase::Preparing,
                cb: Box::new(done),
            },
        );
    }

    /// Long descriptor write. Not permitted during a reliable-write
    /// session, where prepared data must all belong to the session.
    pub fn write_long_descriptor(
        &mut self,
        conn: u16,
        handle: u16,
        offset: u16,
        value: Vec<u8>,
        done: impl FnOnce(&mut BleHost, Result<(), GattError>) + Send + 'static,
    ) {
        let in_session = self
            .connections
            .get(&conn)
            .map_or(false, |c| c.client.reliable_session);
        if in_session {
            done(
                self,
                Err(GattError::InvalidParameter(
                    "long descriptor writes are not allowed during a reliable write".into(),
                )),
            );
            return;
        }
        self.write_long_characteristic(conn, handle, offset, value, done);
    }

    /// Write Without Response. `on_sent` fires once the PDU reached the
    /// controller.
    pub fn write_command(
        &mut self,
        conn: u16,
        handle: u16,
        value: Vec<u8>,
        on_sent: Option<Box<dyn FnOnce() + Send>>,
    ) -> Result<(), GattError> {
        let Some(c) = self.connections.get_mut(&conn) else {
            return Err(GattError::NotConnected);
        };
        c.att.write_command(&mut self.adapter, handle, value, on_sent);
        Ok(())
    }

    /// Subscribes or unsubscribes by writing the characteristic's CCCD,
    /// discovering it first when necessary.
    pub fn write_cccd(
        &mut self,
        conn: u16,
        characteristic: &RemoteCharacteristic,
        enable_notifications: bool,
        enable_indications: bool,
        done: impl FnOnce(&mut BleHost, Result<(), GattError>) + Send + 'static,
    ) {
        const PROP_NOTIFY: u8 = 0x10;
        const PROP_INDICATE: u8 = 0x20;
        if enable_notifications && characteristic.properties & PROP_NOTIFY == 0 {
            done(
                self,
                Err(GattError::InvalidParameter(
                    "characteristic does not support notifications".into(),
                )),
            );
            return;
        }
        if enable_indications && characteristic.properties & PROP_INDICATE == 0 {
            done(
                self,
                Err(GattError::InvalidParameter(
                    "characteristic does not support indications".into(),
                )),
            );
            return;
        }
        let bits = (enable_notifications as u8) | ((enable_indications as u8) << 1);
        start_op(
            self,
            conn,
            ClientOp::WriteCccd {
                characteristic: characteristic.clone(),
                bits,
                cccd: None,
                cursor: characteristic.value_handle + 1,
                cb: Box::new(done),
            },
        );
    }

    /// Opens a reliable-write session: subsequent characteristic writes are
    /// prepared but not executed until commit.
    pub fn begin_reliable_write(&mut self, conn: u16) -> Result<(), GattError> {
        let c = self.connections.get_mut(&conn).ok_or(GattError::NotConnected)?;
        if c.client.reliable_session {
            return Err(GattError::InvalidParameter(
                "reliable write already in progress".into(),
            ));
        }
        c.client.reliable_session = true;
        Ok(())
    }

    /// Commits every prepared write of the session.
    pub fn commit_reliable_write(
        &mut self,
        conn: u16,
        done: impl FnOnce(&mut BleHost, Result<(), GattError>) + Send + 'static,
    ) {
        let in_session = self
            .connections
            .get(&conn)
            .map_or(false, |c| c.client.reliable_session);
        if !in_session {
            done(
                self,
                Err(GattError::InvalidParameter("no reliable write session".into())),
            );
            return;
        }
        start_op(
            self,
            conn,
            ClientOp::Execute {
                commit: true,
                cb: Box::new(done),
            },
        );
    }

    /// Abandons the session, discarding every prepared write.
    pub fn cancel_reliable_write(
        &mut self,
        conn: u16,
        done: impl FnOnce(&mut BleHost, Result<(), GattError>) + Send + 'static,
    ) {
        let in_session = self
            .connections
            .get(&conn)
            .map_or(false, |c| c.client.reliable_session);
        if !in_session {
            done(
                self,
                Err(GattError::InvalidParameter("no reliable write session".into())),
            );
            return;
        }
        start_op(
            self,
            conn,
            ClientOp::Execute {
                commit: false,
                cb: Box::new(done),
            },
        );
    }

    /// Drops every cached service overlapping `[start, end]` (typically on
    /// a Service Changed indication) and persists the reduced cache.
    pub fn invalidate_services(&mut self, conn: u16, start: u16, end: u16) {
        if let Some(c) = self.connections.get_mut(&conn) {
            c.client.cache.invalidate(start, end);
        }
        persist_cache(self, conn);
    }
}
