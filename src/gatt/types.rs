//! User-facing GATT server building blocks
//!
//! Services are described declaratively and handed to
//! [`crate::gatt::server::GattServerDb::add_services`]. An attribute's
//! behavior is its capability set: any combination of authorize, read,
//! partial-read, write, partial-write and subscription-change callbacks,
//! resolved once at service construction.

use crate::address::Address;
use crate::att::bearer::ServerInput;
use crate::att::error::AttErrorCode;
use crate::host::DeferQueue;
use crate::uuid::Uuid;
use std::ops::BitOr;
use std::sync::{Arc, Mutex};

/// Characteristic property bitmap. The low byte maps onto the declaration
/// byte; reliable-write and writable-auxiliaries live in the Extended
/// Properties descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Properties(u16);

impl Properties {
    pub const NONE: Properties = Properties(0);
    pub const BROADCAST: Properties = Properties(0x0001);
    pub const READ: Properties = Properties(0x0002);
    pub const WRITE_WITHOUT_RESPONSE: Properties = Properties(0x0004);
    pub const WRITE: Properties = Properties(0x0008);
    pub const NOTIFY: Properties = Properties(0x0010);
    pub const INDICATE: Properties = Properties(0x0020);
    pub const AUTHENTICATED_SIGNED_WRITES: Properties = Properties(0x0040);
    pub const RELIABLE_WRITE: Properties = Properties(0x0100);
    pub const WRITABLE_AUXILIARIES: Properties = Properties(0x0200);

    pub fn contains(self, other: Properties) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn readable(self) -> bool {
        self.contains(Self::READ)
    }

    pub fn writable(self) -> bool {
        self.contains(Self::WRITE)
            || self.contains(Self::WRITE_WITHOUT_RESPONSE)
            || self.contains(Self::RELIABLE_WRITE)
    }

    pub fn can_notify(self) -> bool {
        self.contains(Self::NOTIFY)
    }

    pub fn can_indicate(self) -> bool {
        self.contains(Self::INDICATE)
    }

    /// Extended-properties value for the 0x2900 descriptor.
    pub fn extended_bits(self) -> u16 {
        let mut bits = 0;
        if self.contains(Self::RELIABLE_WRITE) {
            bits |= 0x0001;
        }
        if self.contains(Self::WRITABLE_AUXILIARIES) {
            bits |= 0x0002;
        }
        bits
    }

    /// The byte carried in the characteristic declaration. Bit 7 signals
    /// the presence of the Extended Properties descriptor.
    pub fn declaration_byte(self) -> u8 {
        let mut byte = (self.0 & 0x7F) as u8;
        if self.extended_bits() != 0 {
            byte |= 0x80;
        }
        byte
    }
}

impl BitOr for Properties {
    type Output = Properties;

    fn bitor(self, rhs: Properties) -> Properties {
        Properties(self.0 | rhs.0)
    }
}

/// Access requirement for reading or writing an attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Permission {
    /// The operation is never allowed
    NotPermitted,
    #[default]
    /// No security requirement
    Open,
    /// Link must be encrypted
    Encrypted,
    /// Link must be encrypted with an authenticated (MITM-protected) key
    EncryptedMitm,
    /// Link must be encrypted with an authenticated Secure Connections key
    EncryptedMitmSc,
    /// Deferred to the attribute's authorize callback
    Custom,
}

/// Current security state of a connection, as far as the ATT layer cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EncryptionLevel {
    pub encrypted: bool,
    pub mitm: bool,
    pub sc: bool,
}

/// Checks a permission against the link state. `has_ltk` selects between
/// the insufficient-encryption and insufficient-authentication errors for
/// unencrypted links.
pub(crate) fn check_permission(
    perm: Permission,
    level: EncryptionLevel,
    has_ltk: bool,
    is_read: bool,
) -> Result<(), AttErrorCode> {
    let not_encrypted_error = if has_ltk {
        AttErrorCode::InsufficientEncryption
    } else {
        AttErrorCode::InsufficientAuthentication
    };
    match perm {
        Permission::Open | Permission::Custom => Ok(()),
        Permission::NotPermitted => Err(if is_read {
            AttErrorCode::ReadNotPermitted
        } else {
            AttErrorCode::WriteNotPermitted
        }),
        Permission::Encrypted => {
            if level.encrypted {
                Ok(())
            } else {
                Err(not_encrypted_error)
            }
        }
        Permission::EncryptedMitm => {
            if !level.encrypted {
                Err(not_encrypted_error)
            } else if !level.mitm {
                Err(AttErrorCode::InsufficientAuthentication)
            } else {
                Ok(())
            }
        }
        Permission::EncryptedMitmSc => {
            if !level.encrypted {
                Err(not_encrypted_error)
            } else if !level.mitm || !level.sc {
                Err(AttErrorCode::InsufficientAuthentication)
            } else {
                Ok(())
            }
        }
    }
}

/// Identity of a connection as seen by attribute callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionRef {
    /// HCI connection handle
    pub handle: u16,
    pub peer: Address,
}

// --- Responder tokens ---------------------------------------------------

pub(crate) struct ResponderInner {
    pub defer: DeferQueue,
    pub conn: u16,
    pub generation: u64,
}

impl ResponderInner {
    fn complete(self, input: ServerInput) {
        let ResponderInner {
            defer,
            conn,
            generation,
        } = self;
        defer.lock().unwrap().push_back(Box::new(move |host| {
            host.attribute_response(conn, generation, input);
        }));
    }
}

/// One-shot completion token for a read callback. Consumed by value;
/// completing it after the connection dropped is a silent no-op.
pub struct ReadResponder {
    pub(crate) inner: ResponderInner,
}

impl ReadResponder {
    pub fn respond(self, result: Result<Vec<u8>, AttErrorCode>) {
        self.inner.complete(ServerInput::Read(result));
    }

    pub fn value(self, value: impl Into<Vec<u8>>) {
        self.respond(Ok(value.into()));
    }

    pub fn error(self, code: AttErrorCode) {
        self.respond(Err(code));
    }
}

/// One-shot completion token for a write callback.
pub struct WriteResponder {
    pub(crate) inner: ResponderInner,
}

impl WriteResponder {
    pub fn respond(self, result: Result<(), AttErrorCode>) {
        self.inner.complete(ServerInput::Write(result));
    }

    pub fn ok(self) {
        self.respond(Ok(()));
    }

    pub fn error(self, code: AttErrorCode) {
        self.respond(Err(code));
    }
}

/// One-shot completion token for an authorize callback.
pub struct AuthorizeResponder {
    pub(crate) inner: ResponderInner,
}

impl AuthorizeResponder {
    pub fn authorized(self) {
        self.inner.complete(ServerInput::Authorize(Ok(())));
    }

    pub fn denied(self) {
        self.inner
            .complete(ServerInput::Authorize(Err(AttErrorCode::InsufficientAuthorization)));
    }

    pub fn error(self, code: AttErrorCode) {
        self.inner.complete(ServerInput::Authorize(Err(code)));
    }
}

// --- Capability callbacks -----------------------------------------------

pub type ReadHandler = Arc<Mutex<dyn FnMut(&ConnectionRef, ReadResponder) + Send>>;
pub type PartialReadHandler = Arc<Mutex<dyn FnMut(&ConnectionRef, u16, ReadResponder) + Send>>;
pub type WriteHandler = Arc<Mutex<dyn FnMut(&ConnectionRef, bool, Vec<u8>, WriteResponder) + Send>>;
pub type PartialWriteHandler =
    Arc<Mutex<dyn FnMut(&ConnectionRef, bool, u16, Vec<u8>, WriteResponder) + Send>>;
pub type AuthorizeHandler = Arc<Mutex<dyn FnMut(&ConnectionRef, AuthorizeResponder) + Send>>;
/// `(connection, notifications, indications, caused_by_write)`
pub type SubscriptionHandler = Arc<Mutex<dyn FnMut(&ConnectionRef, bool, bool, bool) + Send>>;

/// The optional callbacks an attribute may carry.
#[derive(Default, Clone)]
pub(crate) struct AttributeHandlers {
    pub on_authorize_read: Option<AuthorizeHandler>,
    pub on_read: Option<ReadHandler>,
    pub on_partial_read: Option<PartialReadHandler>,
    pub on_authorize_write: Option<AuthorizeHandler>,
    pub on_write: Option<WriteHandler>,
    pub on_partial_write: Option<PartialWriteHandler>,
}

// --- Declarative service description ------------------------------------

/// A user-defined descriptor.
pub struct Descriptor {
    pub(crate) uuid: Uuid,
    pub(crate) max_length: usize,
    pub(crate) read_perm: Permission,
    pub(crate) write_perm: Permission,
    pub(crate) value: Vec<u8>,
    pub(crate) handlers: AttributeHandlers,
}

impl Descriptor {
    pub fn new(uuid: impl Into<Uuid>) -> Self {
        Self {
            uuid: uuid.into(),
            max_length: 512,
            read_perm: Permission::Open,
            write_perm: Permission::NotPermitted,
            value: Vec::new(),
            handlers: AttributeHandlers::default(),
        }
    }

    pub fn value(mut self, value: impl Into<Vec<u8>>) -> Self {
        self.value = value.into();
        self
    }

    pub fn max_length(mut self, max_length: usize) -> Self {
        self.max_length = max_length;
        self
    }

    pub fn read_permission(mut self, perm: Permission) -> Self {
        self.read_perm = perm;
        self
    }

    pub fn write_permission(mut self, perm: Permission) -> Self {
        self.write_perm = perm;
        self
    }

    pub fn on_read(mut self, f: impl FnMut(&ConnectionRef, ReadResponder) + Send + 'static) -> Self {
        self.handlers.on_read = Some(Arc::new(Mutex::new(f)));
        self
    }

    pub fn on_partial_read(
        mut self,
        f: impl FnMut(&ConnectionRef, u16, ReadResponder) + Send + 'static,
    ) -> Self {
        self.handlers.on_partial_read = Some(Arc::new(Mutex::new(f)));
        self
    }

    pub fn on_write(
        mut self,
        f: impl FnMut(&ConnectionRef, bool, Vec<u8>, WriteResponder) + Send + 'static,
    ) -> Self {
        self.handlers.on_write = Some(Arc::new(Mutex::new(f)));
        self
    }

    pub fn on_partial_write(
        mut self,
        f: impl FnMut(&ConnectionRef, bool, u16, Vec<u8>, WriteResponder) + Send + 'static,
    ) -> Self {
        self.handlers.on_partial_write = Some(Arc::new(Mutex::new(f)));
        self
    }

    pub fn on_authorize_read(
        mut self,
        f: impl FnMut(&ConnectionRef, AuthorizeResponder) + Send + 'static,
    ) -> Self {
        self.handlers.on_authorize_read = Some(Arc::new(Mutex::new(f)));
        self
    }

    pub fn on_authorize_write(
        mut self,
        f: impl FnMut(&ConnectionRef, AuthorizeResponder) + Send + 'static,
    ) -> Self {
        self.handlers.on_authorize_write = Some(Arc::new(Mutex::new(f)));
        self
    }
}

/// A user-defined characteristic.
pub struct Characteristic {
    pub(crate) uuid: Uuid,
    pub(crate) properties: Properties,
    pub(crate) max_length: usize,
    pub(crate) read_perm: Permission,
    pub(crate) write_perm: Permission,
    pub(crate) value: Vec<u8>,
    pub(crate) descriptors: Vec<Descriptor>,
    pub(crate) handlers: AttributeHandlers,
    pub(crate) on_subscription_change: Option<SubscriptionHandler>,
}

impl Characteristic {
    pub fn new(uuid: impl Into<Uuid>, properties: Properties) -> Self {
        Self {
            uuid: uuid.into(),
            properties,
            max_length: 512,
            read_perm: if properties.readable() {
                Permission::Open
            } else {
                Permission::NotPermitted
            },
            write_perm: if properties.writable() {
                Permission::Open
            } else {
                Permission::NotPermitted
            },
            value: Vec::new(),
            descriptors: Vec::new(),
            handlers: AttributeHandlers::default(),
            on_subscription_change: None,
        }
    }

    pub fn value(mut self, value: impl Into<Vec<u8>>) -> Self {
        self.value = value.into();
        self
    }

    pub fn max_length(mut self, max_length: usize) -> Self {
        self.max_length = max_length;
        self
    }

    pub fn read_permission(mut self, perm: Permission) -> Self {
        self.read_perm = perm;
        self
    }

    pub fn write_permission(mut self, perm: Permission) -> Self {
        self.write_perm = perm;
        self
    }

    pub fn descriptor(mut self, descriptor: Descriptor) -> Self {
        self.descriptors.push(descriptor);
        self
    }

    pub fn on_read(mut self, f: impl FnMut(&ConnectionRef, ReadResponder) + Send + 'static) -> Self {
        self.handlers.on_read = Some(Arc::new(Mutex::new(f)));
        self
    }

    pub fn on_partial_read(
        mut self,
        f: impl FnMut(&ConnectionRef, u16, ReadResponder) + Send + 'static,
    ) -> Self {
        self.handlers.on_partial_read = Some(Arc::new(Mutex::new(f)));
        self
    }

    pub fn on_write(
        mut self,
        f: impl FnMut(&ConnectionRef, bool, Vec<u8>, WriteResponder) + Send + 'static,
    ) -> Self {
        self.handlers.on_write = Some(Arc::new(Mutex::new(f)));
        self
    }

    pub fn on_partial_write(
        mut self,
        f: impl FnMut(&ConnectionRef, bool, u16, Vec<u8>, WriteResponder) + Send + 'static,
    ) -> Self {
        self.handlers.on_partial_write = Some(Arc::new(Mutex::new(f)));
        self
    }

    pub fn on_authorize_read(
        mut self,
        f: impl FnMut(&ConnectionRef, AuthorizeResponder) + Send + 'static,
    ) -> Self {
        self.handlers.on_authorize_read = Some(Arc::new(Mutex::new(f)));
        self
    }

    pub fn on_authorize_write(
        mut self,
        f: impl FnMut(&ConnectionRef, AuthorizeResponder) + Send + 'static,
    ) -> Self {
        self.handlers.on_authorize_write = Some(Arc::new(Mutex::new(f)));
        self
    }

    pub fn on_subscription_change(
        mut self,
        f: impl FnMut(&ConnectionRef, bool, bool, bool) + Send + 'static,
    ) -> Self {
        self.on_subscription_change = Some(Arc::new(Mutex::new(f)));
        self
    }
}

/// Stable identifier of a service added to the database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ServiceId(pub(crate) u64);

/// Reference to an included service: either one already in the database or
/// one earlier in the same `add_services` batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IncludeRef {
    Added(ServiceId),
    InBatch(usize),
}

/// A user-defined service.
pub struct Service {
    pub(crate) uuid: Uuid,
    pub(crate) is_secondary: bool,
    pub(crate) start_handle: Option<u16>,
    pub(crate) includes: Vec<IncludeRef>,
    pub(crate) characteristics: Vec<Characteristic>,
}

impl Service {
    pub fn new(uuid: impl Into<Uuid>) -> Self {
        Self {
            uuid: uuid.into(),
            is_secondary: false,
            start_handle: None,
            includes: Vec::new(),
            characteristics: Vec::new(),
        }
    }

    pub fn secondary(mut self) -> Self {
        self.is_secondary = true;
        self
    }

    /// Requests a specific start handle; honored when it fits in a gap.
    pub fn start_handle(mut self, handle: u16) -> Self {
        self.start_handle = Some(handle);
        self
    }

    pub fn include(mut self, include: IncludeRef) -> Self {
        self.includes.push(include);
        self
    }

    pub fn characteristic(mut self, characteristic: Characteristic) -> Self {
        self.characteristics.push(characteristic);
        self
    }
}
