use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// A 128-bit Bluetooth UUID.
///
/// SIG-assigned 16-bit and 32-bit values are canonicalized onto the Bluetooth
/// base UUID. The value is held as the numeric (big-endian semantic) form;
/// wire encodings are little-endian per the ATT convention.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Uuid(u128);

/// The Bluetooth base UUID, "00000000-0000-1000-8000-00805F9B34FB".
const BASE_UUID: u128 = 0x00000000_0000_1000_8000_00805F9B34FB;

/// Mask covering everything but the 16/32-bit insertion point.
const BASE_MASK: u128 = (1u128 << 96) - 1;

impl Uuid {
    /// Creates a UUID from a 16-bit SIG-assigned value.
    pub const fn from_u16(uuid16: u16) -> Self {
        Uuid(BASE_UUID | ((uuid16 as u128) << 96))
    }

    /// Creates a UUID from a 32-bit SIG-assigned value.
    pub const fn from_u32(uuid32: u32) -> Self {
        Uuid(BASE_UUID | ((uuid32 as u128) << 96))
    }

    /// Creates a UUID from 16 bytes in little-endian (wire) order.
    pub const fn from_bytes_le(bytes: [u8; 16]) -> Self {
        Uuid(u128::from_le_bytes(bytes))
    }

    /// Creates a UUID from 16 bytes in big-endian (display) order.
    pub const fn from_bytes_be(bytes: [u8; 16]) -> Self {
        Uuid(u128::from_be_bytes(bytes))
    }

    /// Tries to create a UUID from a wire-order byte slice.
    ///
    /// Accepts slices of length 2 (16-bit) or 16 (128-bit); anything else is
    /// not a valid attribute-type encoding.
    pub fn try_from_slice_le(slice: &[u8]) -> Option<Self> {
        match slice.len() {
            2 => Some(Uuid::from_u16(u16::from_le_bytes([slice[0], slice[1]]))),
            16 => {
                let mut bytes = [0u8; 16];
                bytes.copy_from_slice(slice);
                Some(Uuid::from_bytes_le(bytes))
            }
            _ => None,
        }
    }

    /// Returns the 16 bytes in little-endian (wire) order.
    pub const fn to_bytes_le(self) -> [u8; 16] {
        self.0.to_le_bytes()
    }

    /// Returns the 16 bytes in big-endian (display) order.
    pub const fn to_bytes_be(self) -> [u8; 16] {
        self.0.to_be_bytes()
    }

    fn is_sig_assigned(&self) -> bool {
        self.0 & BASE_MASK == BASE_UUID
    }

    /// The 16-bit short form, if this UUID has one.
    pub fn as_u16(&self) -> Option<u16> {
        let high = (self.0 >> 96) as u32;
        if self.is_sig_assigned() && high <= u16::MAX as u32 {
            Some(high as u16)
        } else {
            None
        }
    }

    /// The 32-bit short form, if this UUID has one.
    pub fn as_u32(&self) -> Option<u32> {
        if self.is_sig_assigned() {
            Some((self.0 >> 96) as u32)
        } else {
            None
        }
    }

    /// Serialized length on the ATT wire: 2 for short-form UUIDs, 16 otherwise.
    pub fn wire_len(&self) -> usize {
        if self.as_u16().is_some() {
            2
        } else {
            16
        }
    }

    /// Appends the shortest wire encoding (2 or 16 bytes, little-endian).
    pub fn write_wire(&self, out: &mut Vec<u8>) {
        if let Some(short) = self.as_u16() {
            out.extend_from_slice(&short.to_le_bytes());
        } else {
            out.extend_from_slice(&self.to_bytes_le());
        }
    }
}

impl From<u16> for Uuid {
    fn from(uuid16: u16) -> Self {
        Uuid::from_u16(uuid16)
    }
}

impl From<u32> for Uuid {
    fn from(uuid32: u32) -> Self {
        Uuid::from_u32(uuid32)
    }
}

impl PartialEq<u16> for Uuid {
    fn eq(&self, other: &u16) -> bool {
        self.as_u16() == Some(*other)
    }
}

impl fmt::Display for Uuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = self.to_bytes_be();
        write!(
            f,
            "{:02x}{:02x}{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
            b[8], b[9], b[10], b[11], b[12], b[13], b[14], b[15]
        )
    }
}

impl fmt::Debug for Uuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(short) = self.as_u16() {
            write!(f, "Uuid(0x{:04X})", short)
        } else {
            fmt::Display::fmt(self, f)
        }
    }
}

/// Error produced when parsing a UUID from text.
#[derive(Debug, thiserror::Error)]
pub enum UuidParseError {
    #[error("UUID has invalid length")]
    InvalidLength,
    #[error("UUID contains invalid hex: {0}")]
    Hex(#[from] hex::FromHexError),
}

impl FromStr for Uuid {
    type Err = UuidParseError;

    /// Parses "180A", "0000180A", or the full hyphenated/unhyphenated
    /// 128-bit form.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let cleaned: String = s.chars().filter(|c| *c != '-').collect();
        match cleaned.len() {
            4 => {
                let mut bytes = [0u8; 2];
                hex::decode_to_slice(&cleaned, &mut bytes)?;
                Ok(Uuid::from_u16(u16::from_be_bytes(bytes)))
            }
            8 => {
                let mut bytes = [0u8; 4];
                hex::decode_to_slice(&cleaned, &mut bytes)?;
                Ok(Uuid::from_u32(u32::from_be_bytes(bytes)))
            }
            32 => {
                let mut bytes = [0u8; 16];
                hex::decode_to_slice(&cleaned, &mut bytes)?;
                Ok(Uuid::from_bytes_be(bytes))
            }
            _ => Err(UuidParseError::InvalidLength),
        }
    }
}

impl Serialize for Uuid {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Uuid {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_form_round_trip() {
        let uuid = Uuid::from_u16(0x180A);
        assert_eq!(uuid.as_u16(), Some(0x180A));
        assert_eq!(uuid.as_u32(), Some(0x180A));
        assert_eq!(uuid.to_string(), "0000180a-0000-1000-8000-00805f9b34fb");
        assert_eq!(uuid.wire_len(), 2);
    }

    #[test]
    fn full_form_is_not_short() {
        let uuid: Uuid = "6e400001-b5a3-f393-e0a9-e50e24dcca9e".parse().unwrap();
        assert_eq!(uuid.as_u16(), None);
        assert_eq!(uuid.wire_len(), 16);
        assert_eq!(Uuid::from_bytes_le(uuid.to_bytes_le()), uuid);
    }

    #[test]
    fn wire_order_is_little_endian() {
        let uuid = Uuid::from_u16(0x2902);
        let mut out = Vec::new();
        uuid.write_wire(&mut out);
        assert_eq!(out, vec![0x02, 0x29]);

        let le = uuid.to_bytes_le();
        assert_eq!(&le[12..14], &[0x02, 0x29]);
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!("12345".parse::<Uuid>().is_err());
        assert!("zzzz".parse::<Uuid>().is_err());
    }

    #[test]
    fn serde_round_trip() {
        let uuid = Uuid::from_u16(0x2A00);
        let json = serde_json::to_string(&uuid).unwrap();
        let back: Uuid = serde_json::from_str(&json).unwrap();
        assert_eq!(back, uuid);
    }
}
