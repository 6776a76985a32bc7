//! Bluetooth device addresses

use std::fmt;
use std::str::FromStr;

/// Address type byte as used on the HCI wire.
pub const ADDRESS_TYPE_PUBLIC: u8 = 0x00;
pub const ADDRESS_TYPE_RANDOM: u8 = 0x01;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AddressType {
    Public,
    Random,
}

impl From<AddressType> for u8 {
    fn from(value: AddressType) -> Self {
        match value {
            AddressType::Public => ADDRESS_TYPE_PUBLIC,
            AddressType::Random => ADDRESS_TYPE_RANDOM,
        }
    }
}

impl From<u8> for AddressType {
    fn from(value: u8) -> Self {
        // Identity address types (0x02/0x03) collapse onto their base type.
        if value & 0x01 != 0 {
            AddressType::Random
        } else {
            AddressType::Public
        }
    }
}

/// A 48-bit device address, stored in wire (little-endian) byte order:
/// `bytes[0]` is the least significant octet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BdAddr {
    pub bytes: [u8; 6],
}

impl BdAddr {
    pub const fn new(bytes: [u8; 6]) -> Self {
        Self { bytes }
    }

    pub fn from_slice(slice: &[u8]) -> Option<Self> {
        if slice.len() >= 6 {
            let mut bytes = [0u8; 6];
            bytes.copy_from_slice(&slice[0..6]);
            Some(Self { bytes })
        } else {
            None
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }
}

impl fmt::Display for BdAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            self.bytes[5],
            self.bytes[4],
            self.bytes[3],
            self.bytes[2],
            self.bytes[1],
            self.bytes[0]
        )
    }
}

/// A device address paired with its type, the identity key for everything
/// the stack persists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address {
    pub addr_type: AddressType,
    pub addr: BdAddr,
}

impl Address {
    pub const fn new(addr_type: AddressType, addr: BdAddr) -> Self {
        Self { addr_type, addr }
    }

    pub fn public(addr: BdAddr) -> Self {
        Self::new(AddressType::Public, addr)
    }

    pub fn random(addr: BdAddr) -> Self {
        Self::new(AddressType::Random, addr)
    }

    /// True for resolvable private addresses: random type with the top two
    /// bits of the most significant octet equal to 0b01.
    pub fn is_resolvable_random(&self) -> bool {
        self.addr_type == AddressType::Random && self.addr.bytes[5] & 0xC0 == 0x40
    }

    /// The filesystem-safe directory form, `TT-AA-AA-AA-BB-BB-BB`.
    pub fn to_dir_name(&self) -> String {
        let b = &self.addr.bytes;
        format!(
            "{:02X}-{:02X}-{:02X}-{:02X}-{:02X}-{:02X}-{:02X}",
            u8::from(self.addr_type),
            b[5],
            b[4],
            b[3],
            b[2],
            b[1],
            b[0]
        )
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02X}:{}", u8::from(self.addr_type), self.addr)
    }
}

/// Error from parsing an address out of its textual form.
#[derive(Debug, thiserror::Error)]
#[error("invalid device address")]
pub struct AddressParseError;

impl FromStr for Address {
    type Err = AddressParseError;

    /// Parses `TT:AA:AA:AA:BB:BB:BB` (type octet first, then the address in
    /// display order).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() != 7 {
            return Err(AddressParseError);
        }
        let mut octets = [0u8; 7];
        for (i, part) in parts.iter().enumerate() {
            if part.len() != 2 {
                return Err(AddressParseError);
            }
            octets[i] = u8::from_str_radix(part, 16).map_err(|_| AddressParseError)?;
        }
        let mut bytes = [0u8; 6];
        for i in 0..6 {
            bytes[i] = octets[6 - i];
        }
        Ok(Address::new(AddressType::from(octets[0]), BdAddr::new(bytes)))
    }
}

/// Builds an [`Address`] from a type byte and display-order octet string,
/// e.g. `construct_address(0x00, "00:AA:BB:CC:DD:EE")`.
pub fn construct_address(addr_type: u8, addr: &str) -> Result<Address, AddressParseError> {
    format!("{:02X}:{}", addr_type, addr).parse()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_reverses_byte_order() {
        let addr = BdAddr::new([0xFF, 0xEE, 0xDD, 0xCC, 0xBB, 0xAA]);
        assert_eq!(addr.to_string(), "AA:BB:CC:DD:EE:FF");
    }

    #[test]
    fn parse_round_trip() {
        let addr: Address = "00:AA:BB:CC:DD:EE:FF".parse().unwrap();
        assert_eq!(addr.addr_type, AddressType::Public);
        assert_eq!(addr.to_string(), "00:AA:BB:CC:DD:EE:FF");
        assert_eq!(addr.to_dir_name(), "00-AA-BB-CC-DD-EE-FF");
    }

    #[test]
    fn resolvable_random_check() {
        let rpa = construct_address(0x01, "42:1F:9A:11:22:33").unwrap();
        assert!(rpa.is_resolvable_random());

        // Static random: top bits 0b11.
        let stat = construct_address(0x01, "C2:1F:9A:11:22:33").unwrap();
        assert!(!stat.is_resolvable_random());

        // Public addresses never resolve.
        let public = construct_address(0x00, "42:1F:9A:11:22:33").unwrap();
        assert!(!public.is_resolvable_random());
    }
}
