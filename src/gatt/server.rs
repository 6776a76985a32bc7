//! GATT server attribute database
//!
//! Builds the sparse attribute array from declarative service definitions:
//! handle placement with first-fit gaps and start-handle hints, automatic
//! CCCD / Extended Properties descriptors, and the read/write/CCCD
//! dispatchers the ATT server drives.

use crate::att::constants::*;
use crate::att::error::AttErrorCode;
use crate::error::Error;
use crate::gatt::types::*;
use crate::host::DeferQueue;
use crate::uuid::Uuid;
use log::debug;
use std::collections::{BTreeMap, HashMap};

/// Where an attribute's bytes come from.
pub(crate) enum AttrBacking {
    /// Fixed declaration value
    Const(Vec<u8>),
    /// Index into the value slab (characteristic values and descriptors)
    Value(usize),
    /// Index into the characteristic slab; value is per-connection
    Cccd(usize),
}

pub(crate) struct Attribute {
    pub uuid: Uuid,
    /// Set on service declarations: last handle of the group
    pub group_end: Option<u16>,
    pub read_perm: Permission,
    pub write_perm: Permission,
    pub max_length: usize,
    pub backing: AttrBacking,
}

struct ValueSlot {
    value: Vec<u8>,
    handlers: AttributeHandlers,
}

pub(crate) struct CharEntry {
    pub uuid: Uuid,
    pub properties: Properties,
    pub value_handle: u16,
    pub cccd_handle: Option<u16>,
    /// Per-connection CCCD bits, created lazily
    subscriptions: HashMap<u16, u8>,
    on_subscription_change: Option<SubscriptionHandler>,
}

struct ServiceEntry {
    id: u64,
    uuid: Uuid,
    is_secondary: bool,
    start: u16,
    end: u16,
}

/// A characteristic owned by the local database, addressed by its handles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalCharacteristic {
    pub value_handle: u16,
    pub cccd_handle: Option<u16>,
}

/// Outcome of a read dispatch.
pub(crate) enum ReadOutcome {
    Done(Result<Vec<u8>, AttErrorCode>),
    /// An authorize callback is pending; redo the read once it passes
    PendingAuthorize,
    /// A full-value read callback is pending; slice at the offset after
    PendingFull,
    /// A partial read callback is pending; it returns offset-trimmed bytes
    PendingPartial,
}

/// Outcome of a write dispatch.
pub(crate) enum WriteOutcome {
    Done(Result<(), AttErrorCode>),
    PendingAuthorize,
    PendingWrite,
}

/// CCCD values that changed and must be persisted for a bonded peer:
/// `(cccd handle, new value)`.
pub(crate) type CccdChange = (u16, u8);

pub struct GattServerDb {
    services: Vec<ServiceEntry>,
    attributes: BTreeMap<u16, Attribute>,
    values: Vec<Option<ValueSlot>>,
    chars: Vec<Option<CharEntry>>,
    next_service_id: u64,
    device_name_handle: u16,
    appearance_handle: u16,
    svcc: LocalCharacteristic,
}

impl GattServerDb {
    /// Creates a database pre-populated with the mandatory Generic
    /// Attribute and Generic Access services.
    pub fn new() -> Self {
        let mut db = Self {
            services: Vec::new(),
            attributes: BTreeMap::new(),
            values: Vec::new(),
            chars: Vec::new(),
            next_service_id: 1,
            device_name_handle: 0,
            appearance_handle: 0,
            svcc: LocalCharacteristic {
                value_handle: 0,
                cccd_handle: None,
            },
        };

        let gatt_service = Service::new(Uuid::from_u16(GENERIC_ATTRIBUTE_SERVICE_UUID))
            .characteristic(
                Characteristic::new(Uuid::from_u16(SERVICE_CHANGED_UUID), Properties::INDICATE)
                    .max_length(4)
                    .read_permission(Permission::NotPermitted)
                    .write_permission(Permission::NotPermitted),
            );
        let gap_service = Service::new(Uuid::from_u16(GENERIC_ACCESS_SERVICE_UUID))
            .characteristic(
                Characteristic::new(Uuid::from_u16(DEVICE_NAME_UUID), Properties::READ)
                    .max_length(248),
            )
            .characteristic(
                Characteristic::new(Uuid::from_u16(APPEARANCE_UUID), Properties::READ)
                    .max_length(2)
                    .value(vec![0, 0]),
            );
        db.add_services(vec![gatt_service, gap_service])
            .expect("mandatory services always place");

        db.svcc = db
            .find_characteristic(Uuid::from_u16(SERVICE_CHANGED_UUID))
            .expect("just added");
        db.device_name_handle = db
            .find_characteristic(Uuid::from_u16(DEVICE_NAME_UUID))
            .expect("just added")
            .value_handle;
        db.appearance_handle = db
            .find_characteristic(Uuid::from_u16(APPEARANCE_UUID))
            .expect("just added")
            .value_handle;
        db
    }

    /// Sets the Device Name characteristic value (up to 248 UTF-8 bytes).
    pub fn set_device_name(&mut self, name: &str) -> Result<(), Error> {
        let bytes = name.as_bytes();
        if bytes.len() > 248 {
            return Err(Error::invalid_argument("device name exceeds 248 bytes"));
        }
        self.write_stored_value(self.device_name_handle, bytes.to_vec());
        Ok(())
    }

    /// Sets the Appearance characteristic value.
    pub fn set_appearance(&mut self, appearance: u16) {
        self.write_stored_value(self.appearance_handle, appearance.to_le_bytes().to_vec());
    }

    /// The Service Changed characteristic, for issuing indications after
    /// database modifications.
    pub fn get_svcc_characteristic(&self) -> LocalCharacteristic {
        self.svcc
    }

    fn write_stored_value(&mut self, handle: u16, value: Vec<u8>) {
        if let Some(Attribute {
            backing: AttrBacking::Value(idx),
            ..
        }) = self.attributes.get(&handle)
        {
            if let Some(slot) = self.values.get_mut(*idx).and_then(|s| s.as_mut()) {
                slot.value = value;
            }
        }
    }

    fn find_characteristic(&self, uuid: Uuid) -> Option<LocalCharacteristic> {
        self.chars.iter().flatten().find_map(|c| {
            (c.uuid == uuid).then_some(LocalCharacteristic {
                value_handle: c.value_handle,
                cccd_handle: c.cccd_handle,
            })
        })
    }

    /// The characteristic owning `value_handle`, if any.
    pub fn characteristic_by_value_handle(&self, value_handle: u16) -> Option<LocalCharacteristic> {
        self.char_index_by_value_handle(value_handle).map(|idx| {
            let c = self.chars[idx].as_ref().expect("index valid");
            LocalCharacteristic {
                value_handle: c.value_handle,
                cccd_handle: c.cccd_handle,
            }
        })
    }

    fn char_index_by_value_handle(&self, value_handle: u16) -> Option<usize> {
        self.chars
            .iter()
            .position(|c| c.as_ref().map_or(false, |c| c.value_handle == value_handle))
    }

    pub(crate) fn char_properties(&self, value_handle: u16) -> Option<Properties> {
        self.char_index_by_value_handle(value_handle)
            .map(|idx| self.chars[idx].as_ref().expect("index valid").properties)
    }

    /// Current CCCD bits of `conn` for the characteristic at `value_handle`.
    pub fn subscription_bits(&self, conn: u16, value_handle: u16) -> u8 {
        self.char_index_by_value_handle(value_handle)
            .and_then(|idx| self.chars[idx].as_ref())
            .and_then(|c| c.subscriptions.get(&conn).copied())
            .unwrap_or(0)
    }

    // --- Service addition -----------------------------------------------

    /// Adds a batch of services. Either every service is placed or the
    /// database is left untouched.
    pub fn add_services(&mut self, services: Vec<Service>) -> Result<Vec<ServiceId>, Error> {
        for (i, service) in services.iter().enumerate() {
            self.validate_service(service, i)?;
        }

        // Plan every placement before touching anything, so failure rolls
        // the whole batch back trivially.
        let mut occupied: Vec<(u16, u16)> =
            self.services.iter().map(|s| (s.start, s.end)).collect();
        let mut placements = Vec::with_capacity(services.len());
        for service in &services {
            let needed = handle_count(service);
            let start = find_gap(&occupied, needed, service.start_handle).ok_or_else(|| {
                Error::invalid_argument(format!(
                    "no room for a service of {} handles",
                    needed
                ))
            })?;
            let end = (start as u32 + needed - 1) as u16;
            let at = occupied.partition_point(|&(s, _)| s < start);
            occupied.insert(at, (start, end));
            placements.push((start, end));
        }

        let mut ids = Vec::with_capacity(services.len());
        for (service, &(start, end)) in services.iter().zip(&placements) {
            let id = self.commit_service(service, start, end, &placements, &ids);
            ids.push(id);
        }
        Ok(ids)
    }

    fn validate_service(&self, service: &Service, batch_index: usize) -> Result<(), Error> {
        for include in &service.includes {
            match include {
                IncludeRef::Added(id) => {
                    if !self.services.iter().any(|s| s.id == id.0) {
                        return Err(Error::invalid_argument("included service does not exist"));
                    }
                }
                IncludeRef::InBatch(i) => {
                    if *i >= batch_index {
                        return Err(Error::invalid_argument(
                            "included service must appear earlier in the batch",
                        ));
                    }
                }
            }
        }
        for c in &service.characteristics {
            validate_characteristic(c)?;
        }
        Ok(())
    }

    fn commit_service(
        &mut self,
        service: &Service,
        start: u16,
        end: u16,
        placements: &[(u16, u16)],
        batch_ids: &[ServiceId],
    ) -> ServiceId {
        let id = self.next_service_id;
        self.next_service_id += 1;

        let decl_uuid = if service.is_secondary {
            SECONDARY_SERVICE_UUID
        } else {
            PRIMARY_SERVICE_UUID
        };
        let mut decl_value = Vec::new();
        service.uuid.write_wire(&mut decl_value);
        let decl_len = decl_value.len();
        self.attributes.insert(
            start,
            Attribute {
                uuid: Uuid::from_u16(decl_uuid),
                group_end: Some(end),
                read_perm: Permission::Open,
                write_perm: Permission::NotPermitted,
                max_length: decl_len,
                backing: AttrBacking::Const(decl_value),
            },
        );

        let mut handle = start as u32 + 1;
        for include in &service.includes {
            let (inc_start, inc_end, inc_uuid) = match include {
                IncludeRef::Added(sid) => {
                    let s = self
                        .services
                        .iter()
                        .find(|s| s.id == sid.0)
                        .expect("validated");
                    (s.start, s.end, s.uuid)
                }
                IncludeRef::InBatch(i) => {
                    let batch_service_id = batch_ids[*i];
                    let (s, e) = placements[*i];
                    let uuid = self
                        .services
                        .iter()
                        .find(|svc| svc.id == batch_service_id.0)
                        .map(|svc| svc.uuid)
                        .expect("committed earlier in batch");
                    (s, e, uuid)
                }
            };
            // 16-bit include UUIDs ride in the declaration; 128-bit ones
            // are fetched by reading the included service declaration
            let mut value = Vec::with_capacity(6);
            value.extend_from_slice(&inc_start.to_le_bytes());
            value.extend_from_slice(&inc_end.to_le_bytes());
            if let Some(short) = inc_uuid.as_u16() {
                value.extend_from_slice(&short.to_le_bytes());
            }
            let len = value.len();
            self.attributes.insert(
                handle as u16,
                Attribute {
                    uuid: Uuid::from_u16(INCLUDE_UUID),
                    group_end: None,
                    read_perm: Permission::Open,
                    write_perm: Permission::NotPermitted,
                    max_length: len,
                    backing: AttrBacking::Const(value),
                },
            );
            handle += 1;
        }

        for c in &service.characteristics {
            handle = self.commit_characteristic(c, handle);
        }
        debug_assert_eq!(handle, end as u32 + 1);

        let entry = ServiceEntry {
            id,
            uuid: service.uuid,
            is_secondary: service.is_secondary,
            start,
            end,
        };
        let at = self.services.partition_point(|s| s.start < start);
        self.services.insert(at, entry);
        ServiceId(id)
    }

    fn commit_characteristic(&mut self, c: &Characteristic, decl_handle: u32) -> u32 {
        let decl_handle = decl_handle as u16;
        let value_handle = decl_handle + 1;

        let mut decl_value = Vec::with_capacity(3 + c.uuid.wire_len());
        decl_value.push(c.properties.declaration_byte());
        decl_value.extend_from_slice(&value_handle.to_le_bytes());
        c.uuid.write_wire(&mut decl_value);
        let decl_len = decl_value.len();
        self.attributes.insert(
            decl_handle,
            Attribute {
                uuid: Uuid::from_u16(CHARACTERISTIC_UUID),
                group_end: None,
                read_perm: Permission::Open,
                write_perm: Permission::NotPermitted,
                max_length: decl_len,
                backing: AttrBacking::Const(decl_value),
            },
        );

        let char_index = self.chars.len();
        self.values.push(Some(ValueSlot {
            value: c.value.clone(),
            handlers: c.handlers.clone(),
        }));
        let value_slot = self.values.len() - 1;
        self.attributes.insert(
            value_handle,
            Attribute {
                uuid: c.uuid,
                group_end: None,
                read_perm: c.read_perm,
                write_perm: c.write_perm,
                max_length: c.max_length,
                backing: AttrBacking::Value(value_slot),
            },
        );

        let mut handle: u32 = value_handle as u32 + 1;
        let mut cccd_handle = None;
        for d in &c.descriptors {
            if d.uuid == CLIENT_CHAR_CONFIG_UUID {
                cccd_handle = Some(handle as u16);
                self.attributes.insert(
                    handle as u16,
                    Attribute {
                        uuid: d.uuid,
                        group_end: None,
                        read_perm: d.read_perm,
                        write_perm: d.write_perm,
                        max_length: 2,
                        backing: AttrBacking::Cccd(char_index),
                    },
                );
            } else {
                self.values.push(Some(ValueSlot {
                    value: d.value.clone(),
                    handlers: d.handlers.clone(),
                }));
                let slot = self.values.len() - 1;
                self.attributes.insert(
                    handle as u16,
                    Attribute {
                        uuid: d.uuid,
                        group_end: None,
                        read_perm: d.read_perm,
                        write_perm: d.write_perm,
                        max_length: d.max_length,
                        backing: AttrBacking::Value(slot),
                    },
                );
            }
            handle += 1;
        }

        if cccd_handle.is_none() && (c.properties.can_notify() || c.properties.can_indicate()) {
            cccd_handle = Some(handle as u16);
            self.attributes.insert(
                handle as u16,
                Attribute {
                    uuid: Uuid::from_u16(CLIENT_CHAR_CONFIG_UUID),
                    group_end: None,
                    read_perm: Permission::Open,
                    write_perm: Permission::Open,
                    max_length: 2,
                    backing: AttrBacking::Cccd(char_index),
                },
            );
            handle += 1;
        }

        let extended = c.properties.extended_bits();
        if extended != 0 {
            self.attributes.insert(
                handle as u16,
                Attribute {
                    uuid: Uuid::from_u16(EXTENDED_PROPERTIES_UUID),
                    group_end: None,
                    read_perm: Permission::Open,
                    write_perm: Permission::NotPermitted,
                    max_length: 2,
                    backing: AttrBacking::Const(extended.to_le_bytes().to_vec()),
                },
            );
            handle += 1;
        }

        self.chars.push(Some(CharEntry {
            uuid: c.uuid,
            properties: c.properties,
            value_handle,
            cccd_handle,
            subscriptions: HashMap::new(),
            on_subscription_change: c.on_subscription_change.clone(),
        }));
        handle
    }

    /// Removes a service and every attribute in its range. The embedder is
    /// responsible for signalling Service Changed.
    pub fn remove_service(&mut self, id: ServiceId) -> Result<(), Error> {
        let idx = self
            .services
            .iter()
            .position(|s| s.id == id.0)
            .ok_or_else(|| Error::invalid_argument("unknown service id"))?;
        let entry = self.services.remove(idx);
        let doomed: Vec<u16> = self
            .attributes
            .range(entry.start..=entry.end)
            .map(|(&h, _)| h)
            .collect();
        for handle in doomed {
            if let Some(attr) = self.attributes.remove(&handle) {
                match attr.backing {
                    AttrBacking::Value(slot) => self.values[slot] = None,
                    AttrBacking::Cccd(idx) => self.chars[idx] = None,
                    AttrBacking::Const(_) => {}
                }
            }
        }
        debug!(
            "removed service {:?} at [0x{:04X}, 0x{:04X}]",
            entry.uuid, entry.start, entry.end
        );
        Ok(())
    }

    // --- Attribute access for the ATT server ----------------------------

    pub(crate) fn attribute(&self, handle: u16) -> Option<&Attribute> {
        self.attributes.get(&handle)
    }

    pub(crate) fn range_iter(
        &self,
        start: u16,
        end: u16,
    ) -> impl Iterator<Item = (u16, &Attribute)> {
        self.attributes.range(start..=end).map(|(&h, a)| (h, a))
    }

    /// Dispatches a read of `handle` at `offset`.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn read_attribute(
        &self,
        conn: &ConnectionRef,
        level: EncryptionLevel,
        has_ltk: bool,
        handle: u16,
        offset: u16,
        authorized: bool,
        defer: &DeferQueue,
        generation: u64,
    ) -> ReadOutcome {
        let attr = match self.attributes.get(&handle) {
            Some(attr) => attr,
            None => return ReadOutcome::Done(Err(AttErrorCode::InvalidHandle)),
        };
        if !authorized {
            if let Err(code) = check_permission(attr.read_perm, level, has_ltk, true) {
                return ReadOutcome::Done(Err(code));
            }
            if attr.read_perm == Permission::Custom {
                if let AttrBacking::Value(slot) = &attr.backing {
                    let handler = self.values[*slot]
                        .as_ref()
                        .and_then(|s| s.handlers.on_authorize_read.clone());
                    if let Some(handler) = handler {
                        let responder = AuthorizeResponder {
                            inner: ResponderInner {
                                defer: defer.clone(),
                                conn: conn.handle,
                                generation,
                            },
                        };
                        (handler.lock().unwrap())(conn, responder);
                        return ReadOutcome::PendingAuthorize;
                    }
                }
            }
        }

        match &attr.backing {
            AttrBacking::Const(value) => ReadOutcome::Done(slice_from(value, offset)),
            AttrBacking::Cccd(idx) => {
                let bits = self.chars[*idx]
                    .as_ref()
                    .and_then(|c| c.subscriptions.get(&conn.handle).copied())
                    .unwrap_or(0);
                ReadOutcome::Done(slice_from(&[bits, 0x00], offset))
            }
            AttrBacking::Value(slot) => {
                let slot = match self.values[*slot].as_ref() {
                    Some(slot) => slot,
                    None => return ReadOutcome::Done(Err(AttErrorCode::InvalidHandle)),
                };
                if let Some(handler) = slot.handlers.on_partial_read.clone() {
                    let responder = ReadResponder {
                        inner: ResponderInner {
                            defer: defer.clone(),
                            conn: conn.handle,
                            generation,
                        },
                    };
                    (handler.lock().unwrap())(conn, offset, responder);
                    ReadOutcome::PendingPartial
                } else if let Some(handler) = slot.handlers.on_read.clone() {
                    let responder = ReadResponder {
                        inner: ResponderInner {
                            defer: defer.clone(),
                            conn: conn.handle,
                            generation,
                        },
                    };
                    (handler.lock().unwrap())(conn, responder);
                    ReadOutcome::PendingFull
                } else {
                    ReadOutcome::Done(slice_from(&slot.value, offset))
                }
            }
        }
    }

    /// Dispatches a write of `handle`. CCCD writes are resolved entirely
    /// here, including the subscription-change callback; the returned
    /// change, if any, must be persisted for bonded peers.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn write_attribute(
        &mut self,
        conn: &ConnectionRef,
        level: EncryptionLevel,
        has_ltk: bool,
        handle: u16,
        offset: u16,
        value: &[u8],
        needs_response: bool,
        authorized: bool,
        defer: &DeferQueue,
        generation: u64,
    ) -> (WriteOutcome, Option<CccdChange>) {
        enum Backing {
            Const,
            Value(usize),
            Cccd(usize),
        }
        let (write_perm, max_length, backing) = match self.attributes.get(&handle) {
            Some(attr) => (
                attr.write_perm,
                attr.max_length,
                match &attr.backing {
                    AttrBacking::Const(_) => Backing::Const,
                    AttrBacking::Value(slot) => Backing::Value(*slot),
                    AttrBacking::Cccd(idx) => Backing::Cccd(*idx),
                },
            ),
            None => {
                return (
                    WriteOutcome::Done(Err(AttErrorCode::InvalidHandle)),
                    None,
                )
            }
        };
        if !authorized {
            if let Err(code) = check_permission(write_perm, level, has_ltk, false) {
                return (WriteOutcome::Done(Err(code)), None);
            }
            if write_perm == Permission::Custom {
                if let Backing::Value(slot) = backing {
                    let handler = self.values[slot]
                        .as_ref()
                        .and_then(|s| s.handlers.on_authorize_write.clone());
                    if let Some(handler) = handler {
                        let responder = AuthorizeResponder {
                            inner: ResponderInner {
                                defer: defer.clone(),
                                conn: conn.handle,
                                generation,
                            },
                        };
                        (handler.lock().unwrap())(conn, responder);
                        return (WriteOutcome::PendingAuthorize, None);
                    }
                }
            }
        }

        match backing {
            Backing::Const => (
                WriteOutcome::Done(Err(AttErrorCode::WriteNotPermitted)),
                None,
            ),
            // The CCCD dispatcher owns its own shape validation
            Backing::Cccd(idx) => self.write_cccd(conn, idx, offset, value),
            Backing::Value(slot_idx) => {
                if offset as usize > max_length {
                    return (WriteOutcome::Done(Err(AttErrorCode::InvalidOffset)), None);
                }
                if offset as usize + value.len() > max_length {
                    return (
                        WriteOutcome::Done(Err(AttErrorCode::InvalidAttributeValueLength)),
                        None,
                    );
                }
                let slot = match self.values[slot_idx].as_ref() {
                    Some(slot) => slot,
                    None => {
                        return (
                            WriteOutcome::Done(Err(AttErrorCode::InvalidHandle)),
                            None,
                        )
                    }
                };
                if let Some(handler) = slot.handlers.on_partial_write.clone() {
                    let responder = WriteResponder {
                        inner: ResponderInner {
                            defer: defer.clone(),
                            conn: conn.handle,
                            generation,
                        },
                    };
                    (handler.lock().unwrap())(conn, needs_response, offset, value.to_vec(), responder);
                    (WriteOutcome::PendingWrite, None)
                } else if let Some(handler) = slot.handlers.on_write.clone() {
                    if offset != 0 {
                        return (WriteOutcome::Done(Err(AttErrorCode::InvalidOffset)), None);
                    }
                    let responder = WriteResponder {
                        inner: ResponderInner {
                            defer: defer.clone(),
                            conn: conn.handle,
                            generation,
                        },
                    };
                    (handler.lock().unwrap())(conn, needs_response, value.to_vec(), responder);
                    (WriteOutcome::PendingWrite, None)
                } else {
                    let slot = self.values[slot_idx].as_mut().expect("checked above");
                    let offset = offset as usize;
                    if offset == 0 {
                        slot.value = value.to_vec();
                    } else {
                        slot.value.resize(offset, 0);
                        slot.value.extend_from_slice(value);
                    }
                    (WriteOutcome::Done(Ok(())), None)
                }
            }
        }
    }

    /// Write-permission gate without performing a write, for Prepare Write
    /// authorization. `Ok(true)` means an authorize callback is pending.
    pub(crate) fn authorize_write(
        &self,
        conn: &ConnectionRef,
        level: EncryptionLevel,
        has_ltk: bool,
        handle: u16,
        defer: &DeferQueue,
        generation: u64,
    ) -> Result<bool, AttErrorCode> {
        let attr = self.attributes.get(&handle).ok_or(AttErrorCode::InvalidHandle)?;
        check_permission(attr.write_perm, level, has_ltk, false)?;
        if attr.write_perm == Permission::Custom {
            if let AttrBacking::Value(slot) = &attr.backing {
                let handler = self.values[*slot]
                    .as_ref()
                    .and_then(|s| s.handlers.on_authorize_write.clone());
                if let Some(handler) = handler {
                    let responder = AuthorizeResponder {
                        inner: ResponderInner {
                            defer: defer.clone(),
                            conn: conn.handle,
                            generation,
                        },
                    };
                    (handler.lock().unwrap())(conn, responder);
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    fn write_cccd(
        &mut self,
        conn: &ConnectionRef,
        char_index: usize,
        offset: u16,
        value: &[u8],
    ) -> (WriteOutcome, Option<CccdChange>) {
        let entry = match self.chars[char_index].as_mut() {
            Some(entry) => entry,
            None => {
                return (
                    WriteOutcome::Done(Err(AttErrorCode::InvalidHandle)),
                    None,
                )
            }
        };
        if offset != 0 || value.len() != 2 || value[1] != 0 || value[0] > 3 {
            return (
                WriteOutcome::Done(Err(AttErrorCode::CccdImproperlyConfigured)),
                None,
            );
        }
        let bits = value[0];
        let notification = bits & 0x01 != 0;
        let indication = bits & 0x02 != 0;
        if notification && !entry.properties.can_notify() {
            return (
                WriteOutcome::Done(Err(AttErrorCode::CccdImproperlyConfigured)),
                None,
            );
        }
        if indication && !entry.properties.can_indicate() {
            return (
                WriteOutcome::Done(Err(AttErrorCode::CccdImproperlyConfigured)),
                None,
            );
        }

        let previous = entry.subscriptions.insert(conn.handle, bits).unwrap_or(0);
        let change = (previous != bits)
            .then_some((entry.cccd_handle.expect("CCCD exists"), bits));
        let handler = entry.on_subscription_change.clone();
        if let Some(handler) = handler {
            (handler.lock().unwrap())(conn, notification, indication, true);
        }
        (WriteOutcome::Done(Ok(())), change)
    }

    // --- Connection lifecycle -------------------------------------------

    /// Phase 1 of a bonded reconnect: restore stored CCCD values into the
    /// per-connection maps, before any ATT traffic.
    pub(crate) fn connection_opened_phase1(&mut self, conn: u16, stored: &[(u16, u8)]) {
        for &(handle, value) in stored {
            if value > 3 {
                continue;
            }
            if let Some(Attribute {
                backing: AttrBacking::Cccd(idx),
                ..
            }) = self.attributes.get(&handle)
            {
                if let Some(entry) = self.chars[*idx].as_mut() {
                    entry.subscriptions.insert(conn, value);
                }
            }
        }
    }

    /// Phase 2: announce restored nonzero subscriptions to their handlers.
    pub(crate) fn connection_opened_phase2(&mut self, conn: &ConnectionRef) {
        let to_fire: Vec<(SubscriptionHandler, bool, bool)> = self
            .chars
            .iter()
            .flatten()
            .filter_map(|c| {
                let bits = c.subscriptions.get(&conn.handle).copied().unwrap_or(0);
                if bits == 0 {
                    return None;
                }
                c.on_subscription_change
                    .clone()
                    .map(|h| (h, bits & 0x01 != 0, bits & 0x02 != 0))
            })
            .collect();
        for (handler, notification, indication) in to_fire {
            (handler.lock().unwrap())(conn, notification, indication, false);
        }
    }

    /// Removes the connection's CCCD state, telling handlers about lost
    /// subscriptions.
    pub(crate) fn connection_closed(&mut self, conn: &ConnectionRef) {
        let mut to_fire = Vec::new();
        for c in self.chars.iter_mut().flatten() {
            if let Some(bits) = c.subscriptions.remove(&conn.handle) {
                if bits != 0 {
                    if let Some(handler) = c.on_subscription_change.clone() {
                        to_fire.push(handler);
                    }
                }
            }
        }
        for handler in to_fire {
            (handler.lock().unwrap())(conn, false, false, false);
        }
    }

    /// CCCD values to persist when a connection bonds after subscribing.
    pub(crate) fn current_cccds(&self, conn: u16) -> Vec<(u16, u8)> {
        self.chars
            .iter()
            .flatten()
            .filter_map(|c| {
                let bits = c.subscriptions.get(&conn).copied()?;
                Some((c.cccd_handle?, bits))
            })
            .collect()
    }
}

impl Default for GattServerDb {
    fn default() -> Self {
        Self::new()
    }
}

fn slice_from(value: &[u8], offset: u16) -> Result<Vec<u8>, AttErrorCode> {
    let offset = offset as usize;
    if offset > value.len() {
        Err(AttErrorCode::InvalidOffset)
    } else {
        Ok(value[offset..].to_vec())
    }
}

fn validate_characteristic(c: &Characteristic) -> Result<(), Error> {
    if c.properties.contains(Properties::AUTHENTICATED_SIGNED_WRITES) {
        return Err(Error::invalid_argument(
            "authenticated signed writes are not supported",
        ));
    }
    if c.max_length > ATT_MAX_VALUE_LEN {
        return Err(Error::invalid_argument("max length exceeds 512"));
    }
    if c.value.len() > c.max_length {
        return Err(Error::invalid_argument("initial value exceeds max length"));
    }
    let readable = c.properties.readable();
    if readable != (c.read_perm != Permission::NotPermitted) {
        return Err(Error::invalid_argument(
            "read property and read permission must agree",
        ));
    }
    let writable = c.properties.writable();
    if writable != (c.write_perm != Permission::NotPermitted) {
        return Err(Error::invalid_argument(
            "write properties and write permission must agree",
        ));
    }
    let mut cccds = 0;
    for d in &c.descriptors {
        if d.uuid == EXTENDED_PROPERTIES_UUID {
            return Err(Error::invalid_argument(
                "the Extended Properties descriptor is added automatically",
            ));
        }
        if d.uuid == CLIENT_CHAR_CONFIG_UUID {
            cccds += 1;
            if cccds > 1 {
                return Err(Error::invalid_argument(
                    "at most one CCCD per characteristic",
                ));
            }
        }
        if d.max_length > ATT_MAX_VALUE_LEN {
            return Err(Error::invalid_argument("descriptor max length exceeds 512"));
        }
    }
    Ok(())
}

fn handle_count(service: &Service) -> u32 {
    let mut count = 1 + service.includes.len() as u32;
    for c in &service.characteristics {
        count += 2 + c.characteristic_descriptor_count();
    }
    count
}

impl Characteristic {
    fn characteristic_descriptor_count(&self) -> u32 {
        let mut count = self.descriptors.len() as u32;
        let has_user_cccd = self
            .descriptors
            .iter()
            .any(|d| d.uuid == CLIENT_CHAR_CONFIG_UUID);
        if !has_user_cccd && (self.properties.can_notify() || self.properties.can_indicate()) {
            count += 1;
        }
        if self.properties.extended_bits() != 0 {
            count += 1;
        }
        count
    }
}

/// First-fit placement over the sorted occupied ranges, trying the hint
/// first. Handles run 1..=0xFFFF.
fn find_gap(occupied: &[(u16, u16)], wanted: u32, hint: Option<u16>) -> Option<u16> {
    let mut gaps = Vec::new();
    let mut cursor: u32 = 1;
    for &(start, end) in occupied {
        if (start as u32) > cursor {
            gaps.push((cursor as u16, start - 1));
        }
        cursor = cursor.max(end as u32 + 1);
    }
    if cursor <= 0xFFFF {
        gaps.push((cursor as u16, 0xFFFF));
    }

    if let Some(hint) = hint {
        for &(lo, hi) in &gaps {
            if hint >= lo && (hint as u32) + wanted - 1 <= hi as u32 {
                return Some(hint);
            }
        }
    }
    gaps.iter()
        .find(|&&(lo, hi)| (hi as u32) - (lo as u32) + 1 >= wanted)
        .map(|&(lo, _)| lo)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::{AddressType, BdAddr};
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    fn defer_queue() -> DeferQueue {
        Arc::new(Mutex::new(VecDeque::new()))
    }

    fn conn_ref(handle: u16) -> ConnectionRef {
        ConnectionRef {
            handle,
            peer: crate::address::Address::new(
                AddressType::Public,
                BdAddr::new([1, 2, 3, 4, 5, 6]),
            ),
        }
    }

    fn plain_read_char(uuid: u16) -> Characteristic {
        Characteristic::new(Uuid::from_u16(uuid), Properties::READ).value(vec![1, 2, 3])
    }

    #[test]
    fn mandatory_services_are_present() {
        let db = GattServerDb::new();
        // GATT service declaration first, then Service Changed with CCCD
        let decl = db.attribute(1).unwrap();
        assert_eq!(decl.uuid, PRIMARY_SERVICE_UUID);
        assert_eq!(decl.group_end, Some(4));

        let svcc = db.get_svcc_characteristic();
        assert_eq!(svcc.value_handle, 3);
        assert_eq!(svcc.cccd_handle, Some(4));

        // GAP service right after: decl, name decl/value, appearance decl/value
        let gap_decl = db.attribute(5).unwrap();
        assert_eq!(gap_decl.group_end, Some(9));
    }

    #[test]
    fn device_name_round_trip() {
        let mut db = GattServerDb::new();
        db.set_device_name("widget").unwrap();
        let defer = defer_queue();
        let conn = conn_ref(0x40);
        match db.read_attribute(
            &conn,
            EncryptionLevel::default(),
            false,
            db.device_name_handle,
            0,
            false,
            &defer,
            0,
        ) {
            ReadOutcome::Done(Ok(value)) => assert_eq!(value, b"widget"),
            _ => panic!("expected a stored read"),
        }
        assert!(db.set_device_name(&"x".repeat(249)).is_err());
    }

    #[test]
    fn placement_honors_hint_then_first_fit() {
        let mut db = GattServerDb::new();
        // Mandatory services occupy [1..9]. Seed a far service at [20..30].
        let far = Service::new(Uuid::from_u16(0xAA00)).start_handle(20).characteristic(
            Characteristic::new(Uuid::from_u16(0xAA01), Properties::READ)
                .max_length(4)
                .descriptor(Descriptor::new(Uuid::from_u16(0x2901)))
                .descriptor(Descriptor::new(Uuid::from_u16(0x2904)))
                .descriptor(Descriptor::new(Uuid::from_u16(0x2905)))
                .descriptor(Descriptor::new(Uuid::from_u16(0x2906)))
                .descriptor(Descriptor::new(Uuid::from_u16(0x2907)))
                .descriptor(Descriptor::new(Uuid::from_u16(0x2908)))
                .descriptor(Descriptor::new(Uuid::from_u16(0x2909)))
                .descriptor(Descriptor::new(Uuid::from_u16(0x290A))),
        );
        db.add_services(vec![far]).unwrap();

        // Five handles with a hint of 15 -> [15..19]
        let hinted = Service::new(Uuid::from_u16(0xBB00)).start_handle(15).characteristic(
            Characteristic::new(Uuid::from_u16(0xBB01), Properties::READ)
                .descriptor(Descriptor::new(Uuid::from_u16(0x2901)))
                .descriptor(Descriptor::new(Uuid::from_u16(0x2904))),
        );
        let ids = db.add_services(vec![hinted]).unwrap();
        let decl = db.attribute(15).unwrap();
        assert_eq!(decl.group_end, Some(19));

        // Five more without a hint -> first sufficient gap [10..14]
        let unhinted = Service::new(Uuid::from_u16(0xCC00)).characteristic(
            Characteristic::new(Uuid::from_u16(0xCC01), Properties::READ)
                .descriptor(Descriptor::new(Uuid::from_u16(0x2901)))
                .descriptor(Descriptor::new(Uuid::from_u16(0x2904))),
        );
        db.add_services(vec![unhinted]).unwrap();
        let decl = db.attribute(10).unwrap();
        assert_eq!(decl.group_end, Some(14));
        drop(ids);
    }

    #[test]
    fn batch_failure_rolls_back() {
        let mut db = GattServerDb::new();
        let fits = Service::new(Uuid::from_u16(0xAA00)).characteristic(plain_read_char(0xAA01));
        // A service bigger than the entire handle space cannot place
        let mut monster = Service::new(Uuid::from_u16(0xBB00));
        for i in 0..33000u32 {
            monster = monster.characteristic(Characteristic::new(
                Uuid::from_u16((i % 0xFFF0) as u16 + 1),
                Properties::NONE,
            ));
        }
        assert!(db.add_services(vec![fits, monster]).is_err());
        // The first service of the batch was rolled back too
        assert!(db.attribute(10).is_none());
    }

    #[test]
    fn signed_writes_rejected_at_add_time() {
        let mut db = GattServerDb::new();
        let service = Service::new(Uuid::from_u16(0xAA00)).characteristic(Characteristic::new(
            Uuid::from_u16(0xAA01),
            Properties::WRITE | Properties::AUTHENTICATED_SIGNED_WRITES,
        ));
        assert!(db.add_services(vec![service]).is_err());
    }

    #[test]
    fn permission_property_consistency_enforced() {
        let mut db = GattServerDb::new();
        let service = Service::new(Uuid::from_u16(0xAA00)).characteristic(
            Characteristic::new(Uuid::from_u16(0xAA01), Properties::READ)
                .read_permission(Permission::NotPermitted),
        );
        assert!(db.add_services(vec![service]).is_err());

        let service = Service::new(Uuid::from_u16(0xAA00)).characteristic(
            // Write permission without any write property
            Characteristic::new(Uuid::from_u16(0xAA01), Properties::READ)
                .write_permission(Permission::Open),
        );
        assert!(db.add_services(vec![service]).is_err());
    }

    #[test]
    fn user_extended_properties_descriptor_rejected() {
        let mut db = GattServerDb::new();
        let service = Service::new(Uuid::from_u16(0xAA00)).characteristic(
            Characteristic::new(Uuid::from_u16(0xAA01), Properties::READ)
                .descriptor(Descriptor::new(Uuid::from_u16(0x2900))),
        );
        assert!(db.add_services(vec![service]).is_err());
    }

    #[test]
    fn reliable_write_emits_extended_properties() {
        let mut db = GattServerDb::new();
        let service = Service::new(Uuid::from_u16(0xAA00)).characteristic(Characteristic::new(
            Uuid::from_u16(0xAA01),
            Properties::WRITE | Properties::RELIABLE_WRITE,
        ));
        db.add_services(vec![service]).unwrap();

        // decl at 10, value at 11, extended properties at 12
        let decl = db.attribute(10).unwrap();
        match &decl.backing {
            AttrBacking::Const(value) => {
                // Extended-properties bit set in the declaration byte
                assert_eq!(value[0] & 0x80, 0x80);
            }
            _ => panic!("declaration is const"),
        }
        let ext = db.attribute(12).unwrap();
        assert_eq!(ext.uuid, EXTENDED_PROPERTIES_UUID);
        match &ext.backing {
            AttrBacking::Const(value) => assert_eq!(value, &vec![0x01, 0x00]),
            _ => panic!("extended properties is const"),
        }
    }

    #[test]
    fn cccd_write_validates_and_fires_callback() {
        let changes = Arc::new(Mutex::new(Vec::new()));
        let log = changes.clone();
        let mut db = GattServerDb::new();
        let service = Service::new(Uuid::from_u16(0xAA00)).characteristic(
            Characteristic::new(Uuid::from_u16(0xAA01), Properties::NOTIFY)
                .on_subscription_change(move |_, n, i, w| log.lock().unwrap().push((n, i, w))),
        );
        db.add_services(vec![service]).unwrap();
        let cccd = db
            .characteristic_by_value_handle(11)
            .unwrap()
            .cccd_handle
            .unwrap();

        let conn = conn_ref(0x40);
        let defer = defer_queue();
        let level = EncryptionLevel::default();

        // Indication bit without the indicate property
        let (outcome, change) =
            db.write_attribute(&conn, level, false, cccd, 0, &[0x02, 0x00], true, false, &defer, 0);
        assert!(matches!(
            outcome,
            WriteOutcome::Done(Err(AttErrorCode::CccdImproperlyConfigured))
        ));
        assert!(change.is_none());

        // Wrong shape
        for bad in [&[0x01u8][..], &[0x01, 0x01][..], &[0x04, 0x00][..]] {
            let (outcome, _) =
                db.write_attribute(&conn, level, false, cccd, 0, bad, true, false, &defer, 0);
            assert!(matches!(
                outcome,
                WriteOutcome::Done(Err(AttErrorCode::CccdImproperlyConfigured))
            ));
        }

        // Valid subscribe
        let (outcome, change) =
            db.write_attribute(&conn, level, false, cccd, 0, &[0x01, 0x00], true, false, &defer, 0);
        assert!(matches!(outcome, WriteOutcome::Done(Ok(()))));
        assert_eq!(change, Some((cccd, 1)));
        assert_eq!(db.subscription_bits(0x40, 11), 1);
        assert_eq!(*changes.lock().unwrap(), vec![(true, false, true)]);

        // Re-writing the same value is no change to persist
        let (_, change) =
            db.write_attribute(&conn, level, false, cccd, 0, &[0x01, 0x00], true, false, &defer, 0);
        assert!(change.is_none());

        // CCCD read returns the per-connection value
        match db.read_attribute(&conn, level, false, cccd, 0, false, &defer, 0) {
            ReadOutcome::Done(Ok(value)) => assert_eq!(value, vec![0x01, 0x00]),
            _ => panic!("CCCD reads are synchronous"),
        }
        // Another connection still sees zero
        let other = conn_ref(0x41);
        match db.read_attribute(&other, level, false, cccd, 0, false, &defer, 0) {
            ReadOutcome::Done(Ok(value)) => assert_eq!(value, vec![0x00, 0x00]),
            _ => panic!("CCCD reads are synchronous"),
        }
    }

    #[test]
    fn disconnect_clears_subscriptions_and_notifies() {
        let fired = Arc::new(AtomicUsize::new(0));
        let count = fired.clone();
        let mut db = GattServerDb::new();
        let service = Service::new(Uuid::from_u16(0xAA00)).characteristic(
            Characteristic::new(Uuid::from_u16(0xAA01), Properties::NOTIFY)
                .on_subscription_change(move |_, n, i, w| {
                    if !n && !i && !w {
                        count.fetch_add(1, Ordering::SeqCst);
                    }
                }),
        );
        db.add_services(vec![service]).unwrap();
        let cccd = db.characteristic_by_value_handle(11).unwrap().cccd_handle.unwrap();

        let conn = conn_ref(0x40);
        let defer = defer_queue();
        db.write_attribute(
            &conn,
            EncryptionLevel::default(),
            false,
            cccd,
            0,
            &[0x01, 0x00],
            true,
            false,
            &defer,
            0,
        );
        db.connection_closed(&conn);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(db.subscription_bits(0x40, 11), 0);
    }

    #[test]
    fn bonded_reconnect_restores_cccds() {
        let restored = Arc::new(Mutex::new(Vec::new()));
        let log = restored.clone();
        let mut db = GattServerDb::new();
        let service = Service::new(Uuid::from_u16(0xAA00)).characteristic(
            Characteristic::new(
                Uuid::from_u16(0xAA01),
                Properties::NOTIFY | Properties::INDICATE,
            )
            .on_subscription_change(move |_, n, i, w| log.lock().unwrap().push((n, i, w))),
        );
        db.add_services(vec![service]).unwrap();
        let cccd = db.characteristic_by_value_handle(11).unwrap().cccd_handle.unwrap();

        let conn = conn_ref(0x40);
        db.connection_opened_phase1(conn.handle, &[(cccd, 1)]);
        // Nothing fired yet
        assert!(restored.lock().unwrap().is_empty());
        db.connection_opened_phase2(&conn);
        assert_eq!(*restored.lock().unwrap(), vec![(true, false, false)]);
        assert_eq!(db.current_cccds(conn.handle), vec![(cccd, 1)]);
    }

    #[test]
    fn remove_service_deletes_attributes() {
        let mut db = GattServerDb::new();
        let ids = db
            .add_services(vec![
                Service::new(Uuid::from_u16(0xAA00)).characteristic(plain_read_char(0xAA01))
            ])
            .unwrap();
        assert!(db.attribute(10).is_some());
        db.remove_service(ids[0]).unwrap();
        assert!(db.attribute(10).is_none());
        assert!(db.attribute(11).is_none());
        assert!(db.remove_service(ids[0]).is_err());

        // The freed range is reusable
        db.add_services(vec![
            Service::new(Uuid::from_u16(0xBB00)).characteristic(plain_read_char(0xBB01))
        ])
        .unwrap();
        assert!(db.attribute(10).is_some());
    }

    #[test]
    fn async_read_handler_is_invoked() {
        let calls = Arc::new(AtomicUsize::new(0));
        let count = calls.clone();
        let mut db = GattServerDb::new();
        let service = Service::new(Uuid::from_u16(0xAA00)).characteristic(
            Characteristic::new(Uuid::from_u16(0xAA01), Properties::READ).on_read(
                move |_, responder| {
                    count.fetch_add(1, Ordering::SeqCst);
                    responder.value(vec![7, 7]);
                },
            ),
        );
        db.add_services(vec![service]).unwrap();

        let defer = defer_queue();
        let conn = conn_ref(0x40);
        match db.read_attribute(&conn, EncryptionLevel::default(), false, 11, 0, false, &defer, 9) {
            ReadOutcome::PendingFull => {}
            _ => panic!("handler reads are pending"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        // The responder queued the completion for the host
        assert_eq!(defer.lock().unwrap().len(), 1);
    }

    #[test]
    fn encrypted_permission_maps_to_error_class() {
        let mut db = GattServerDb::new();
        let service = Service::new(Uuid::from_u16(0xAA00)).characteristic(
            Characteristic::new(Uuid::from_u16(0xAA01), Properties::READ)
                .read_permission(Permission::Encrypted),
        );
        db.add_services(vec![service]).unwrap();
        let defer = defer_queue();
        let conn = conn_ref(0x40);

        // Without a stored LTK the peer must authenticate first
        match db.read_attribute(&conn, EncryptionLevel::default(), false, 11, 0, false, &defer, 0) {
            ReadOutcome::Done(Err(AttErrorCode::InsufficientAuthentication)) => {}
            _ => panic!("expected insufficient authentication"),
        }
        // With one, it must simply encrypt
        match db.read_attribute(&conn, EncryptionLevel::default(), true, 11, 0, false, &defer, 0) {
            ReadOutcome::Done(Err(AttErrorCode::InsufficientEncryption)) => {}
            _ => panic!("expected insufficient encryption"),
        }
        let encrypted = EncryptionLevel {
            encrypted: true,
            ..Default::default()
        };
        match db.read_attribute(&conn, encrypted, false, 11, 0, false, &defer, 0) {
            ReadOutcome::Done(Ok(_)) => {}
            _ => panic!("expected success"),
        }
    }
}
