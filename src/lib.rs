//! ble-host - a host-side Bluetooth Low Energy stack
//!
//! Implements the upper layers above an HCI controller reached through an
//! opaque byte transport: the HCI command/event/data multiplexer with L2CAP
//! fragmentation, the ATT request/response engine, and a GATT server and
//! client on top, with on-disk persistence of bonds, CCCD values and GATT
//! caches.
//!
//! The embedder owns the transport read loop: feed each complete HCI packet
//! to [`BleHost::handle_packet`] and call [`BleHost::poll_timers`] at the
//! deadline it returns. All user callbacks run from those entry points.

pub mod address;
pub mod att;
pub mod error;
pub mod gatt;
pub mod hci;
pub mod store;
pub mod transport;
pub mod util;
pub mod uuid;

mod host;

pub use address::{construct_address, Address, AddressType, BdAddr};
pub use att::{AttError, AttErrorCode};
pub use error::{Error, HciError};
pub use gatt::{
    Characteristic, ConnectionRef, Descriptor, GattError, GattServerDb, IncludeRef,
    LocalCharacteristic, Permission, Properties, RemoteCharacteristic, RemoteDescriptor,
    RemoteService, Service, ServiceId,
};
pub use hci::{AdvertisingReport, HciAdapter, Role};
pub use host::BleHost;
pub use store::{BondKeys, LongTermKey, Store};
pub use transport::Transport;
pub use util::DuplicateCache;
pub use uuid::Uuid;
