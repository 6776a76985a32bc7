//! HCI adapter layer
//!
//! Serializes commands toward the controller (one in flight), accounts ACL
//! buffer credits, demultiplexes events, and reassembles inbound L2CAP PDUs
//! per connection.

pub mod constants;
pub mod packet;

mod acl;
mod adapter;

#[cfg(test)]
mod tests;

pub use acl::{DataCallback, Role};
pub use adapter::{
    AdvertisingReport, CommandCallback, ConnectionCallback, ExtendedAdvertisingReport,
    HciAdapter, HciNotification, LeConnectionComplete,
};
pub use packet::{append_advertising_structure, parse_advertising_data, HciEvent};
