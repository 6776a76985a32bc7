//! Generic Attribute Profile
//!
//! Server side: a declaratively built attribute database with per-connection
//! CCCD state. Client side: a discovery engine over the ATT bearer with a
//! persisted partial-range service cache.

pub mod cache;
pub mod client;
pub mod server;
pub mod types;


pub use cache::{GattClientCache, IncludedEntry, RemoteService};
pub use client::{GattError, RemoteCharacteristic, RemoteDescriptor};
pub use server::{GattServerDb, LocalCharacteristic};
pub use types::{
    AuthorizeResponder, Characteristic, ConnectionRef, Descriptor, EncryptionLevel, IncludeRef,
    Permission, Properties, ReadResponder, Service, ServiceId, WriteResponder,
};
