//! ATT PDU parsing and serialization
//!
//! Every PDU starts with a one-byte opcode. Parsing returns `None` for
//! malformed input; the engine drops such PDUs silently per the protocol's
//! robustness rule.

use super::constants::*;
use crate::uuid::Uuid;
use byteorder::{LittleEndian, ReadBytesExt};
use std::io::Cursor;

/// Common shape of an ATT PDU: a wire opcode, a parser, and a serializer.
pub trait AttPdu: Sized {
    const OPCODE: u8;

    /// Parses a full PDU (opcode byte included). `None` means malformed.
    fn parse(data: &[u8]) -> Option<Self>;

    /// Serializes the full PDU, opcode byte included.
    fn serialize(&self) -> Vec<u8>;
}

fn read_u16(cursor: &mut Cursor<&[u8]>) -> Option<u16> {
    cursor.read_u16::<LittleEndian>().ok()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorResponse {
    pub request_opcode: u8,
    pub handle: u16,
    pub error_code: u8,
}

impl AttPdu for ErrorResponse {
    const OPCODE: u8 = ATT_ERROR_RSP;

    fn parse(data: &[u8]) -> Option<Self> {
        if data.len() != 5 || data[0] != Self::OPCODE {
            return None;
        }
        Some(Self {
            request_opcode: data[1],
            handle: u16::from_le_bytes([data[2], data[3]]),
            error_code: data[4],
        })
    }

    fn serialize(&self) -> Vec<u8> {
        let mut pdu = Vec::with_capacity(5);
        pdu.push(Self::OPCODE);
        pdu.push(self.request_opcode);
        pdu.extend_from_slice(&self.handle.to_le_bytes());
        pdu.push(self.error_code);
        pdu
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeMtuRequest {
    pub mtu: u16,
}

impl AttPdu for ExchangeMtuRequest {
    const OPCODE: u8 = ATT_EXCHANGE_MTU_REQ;

    fn parse(data: &[u8]) -> Option<Self> {
        if data.len() != 3 || data[0] != Self::OPCODE {
            return None;
        }
        Some(Self {
            mtu: u16::from_le_bytes([data[1], data[2]]),
        })
    }

    fn serialize(&self) -> Vec<u8> {
        let mut pdu = Vec::with_capacity(3);
        pdu.push(Self::OPCODE);
        pdu.extend_from_slice(&self.mtu.to_le_bytes());
        pdu
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeMtuResponse {
    pub mtu: u16,
}

impl AttPdu for ExchangeMtuResponse {
    const OPCODE: u8 = ATT_EXCHANGE_MTU_RSP;

    fn parse(data: &[u8]) -> Option<Self> {
        if data.len() != 3 || data[0] != Self::OPCODE {
            return None;
        }
        Some(Self {
            mtu: u16::from_le_bytes([data[1], data[2]]),
        })
    }

    fn serialize(&self) -> Vec<u8> {
        let mut pdu = Vec::with_capacity(3);
        pdu.push(Self::OPCODE);
        pdu.extend_from_slice(&self.mtu.to_le_bytes());
        pdu
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FindInformationRequest {
    pub start_handle: u16,
    pub end_handle: u16,
}

impl AttPdu for FindInformationRequest {
    const OPCODE: u8 = ATT_FIND_INFO_REQ;

    fn parse(data: &[u8]) -> Option<Self> {
        if data.len() != 5 || data[0] != Self::OPCODE {
            return None;
        }
        Some(Self {
            start_handle: u16::from_le_bytes([data[1], data[2]]),
            end_handle: u16::from_le_bytes([data[3], data[4]]),
        })
    }

    fn serialize(&self) -> Vec<u8> {
        let mut pdu = Vec::with_capacity(5);
        pdu.push(Self::OPCODE);
        pdu.extend_from_slice(&self.start_handle.to_le_bytes());
        pdu.extend_from_slice(&self.end_handle.to_le_bytes());
        pdu
    }
}

/// Find Information response: handle/UUID pairs, all in the same format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FindInformationResponse {
    pub format: u8,
    pub entries: Vec<(u16, Uuid)>,
}

impl AttPdu for FindInformationResponse {
    const OPCODE: u8 = ATT_FIND_INFO_RSP;

    fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < 2 || data[0] != Self::OPCODE {
            return None;
        }
        let format = data[1];
        let entry_len = match format {
            ATT_FIND_INFO_FORMAT_16BIT => 4,
            ATT_FIND_INFO_FORMAT_128BIT => 18,
            _ => return None,
        };
        let body = &data[2..];
        if body.is_empty() || body.len() % entry_len != 0 {
            return None;
        }
        let mut entries = Vec::with_capacity(body.len() / entry_len);
        for chunk in body.chunks_exact(entry_len) {
            let handle = u16::from_le_bytes([chunk[0], chunk[1]]);
            let uuid = Uuid::try_from_slice_le(&chunk[2..])?;
            entries.push((handle, uuid));
        }
        Some(Self { format, entries })
    }

    fn serialize(&self) -> Vec<u8> {
        let mut pdu = vec![Self::OPCODE, self.format];
        for (handle, uuid) in &self.entries {
            pdu.extend_from_slice(&handle.to_le_bytes());
            if self.format == ATT_FIND_INFO_FORMAT_16BIT {
                // Entries are pre-filtered to have short forms
                pdu.extend_from_slice(&uuid.as_u16().unwrap_or(0).to_le_bytes());
            } else {
                pdu.extend_from_slice(&uuid.to_bytes_le());
            }
        }
        pdu
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FindByTypeValueRequest {
    pub start_handle: u16,
    pub end_handle: u16,
    pub attribute_type: u16,
    pub value: Vec<u8>,
}

impl AttPdu for FindByTypeValueRequest {
    const OPCODE: u8 = ATT_FIND_BY_TYPE_VALUE_REQ;

    fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < 7 || data[0] != Self::OPCODE {
            return None;
        }
        let mut cursor = Cursor::new(&data[1..]);
        let start_handle = read_u16(&mut cursor)?;
        let end_handle = read_u16(&mut cursor)?;
        let attribute_type = read_u16(&mut cursor)?;
        Some(Self {
            start_handle,
            end_handle,
            attribute_type,
            value: data[7..].to_vec(),
        })
    }

    fn serialize(&self) -> Vec<u8> {
        let mut pdu = Vec::with_capacity(7 + self.value.len());
        pdu.push(Self::OPCODE);
        pdu.extend_from_slice(&self.start_handle.to_le_bytes());
        pdu.extend_from_slice(&self.end_handle.to_le_bytes());
        pdu.extend_from_slice(&self.attribute_type.to_le_bytes());
        pdu.extend_from_slice(&self.value);
        pdu
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FindByTypeValueResponse {
    /// (found handle, group end handle) pairs
    pub handles: Vec<(u16, u16)>,
}

impl AttPdu for FindByTypeValueResponse {
    const OPCODE: u8 = ATT_FIND_BY_TYPE_VALUE_RSP;

    fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < 5 || data[0] != Self::OPCODE || (data.len() - 1) % 4 != 0 {
            return None;
        }
        let handles = data[1..]
            .chunks_exact(4)
            .map(|c| {
                (
                    u16::from_le_bytes([c[0], c[1]]),
                    u16::from_le_bytes([c[2], c[3]]),
                )
            })
            .collect();
        Some(Self { handles })
    }

    fn serialize(&self) -> Vec<u8> {
        let mut pdu = Vec::with_capacity(1 + 4 * self.handles.len());
        pdu.push(Self::OPCODE);
        for (start, end) in &self.handles {
            pdu.extend_from_slice(&start.to_le_bytes());
            pdu.extend_from_slice(&end.to_le_bytes());
        }
        pdu
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadByTypeRequest {
    pub start_handle: u16,
    pub end_handle: u16,
    pub attribute_type: Uuid,
}

impl AttPdu for ReadByTypeRequest {
    const OPCODE: u8 = ATT_READ_BY_TYPE_REQ;

    fn parse(data: &[u8]) -> Option<Self> {
        if !(data.len() == 7 || data.len() == 21) || data[0] != Self::OPCODE {
            return None;
        }
        Some(Self {
            start_handle: u16::from_le_bytes([data[1], data[2]]),
            end_handle: u16::from_le_bytes([data[3], data[4]]),
            attribute_type: Uuid::try_from_slice_le(&data[5..])?,
        })
    }

    fn serialize(&self) -> Vec<u8> {
        let mut pdu = Vec::with_capacity(5 + self.attribute_type.wire_len());
        pdu.push(Self::OPCODE);
        pdu.extend_from_slice(&self.start_handle.to_le_bytes());
        pdu.extend_from_slice(&self.end_handle.to_le_bytes());
        self.attribute_type.write_wire(&mut pdu);
        pdu
    }
}

/// Read By Type response: fixed-size handle/value entries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadByTypeResponse {
    pub entries: Vec<(u16, Vec<u8>)>,
}

impl AttPdu for ReadByTypeResponse {
    const OPCODE: u8 = ATT_READ_BY_TYPE_RSP;

    fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < 4 || data[0] != Self::OPCODE {
            return None;
        }
        let entry_len = data[1] as usize;
        let body = &data[2..];
        if entry_len < 2 || body.is_empty() || body.len() % entry_len != 0 {
            return None;
        }
        let entries = body
            .chunks_exact(entry_len)
            .map(|c| (u16::from_le_bytes([c[0], c[1]]), c[2..].to_vec()))
            .collect();
        Some(Self { entries })
    }

    fn serialize(&self) -> Vec<u8> {
        let entry_len = self.entries.first().map_or(2, |(_, v)| 2 + v.len());
        let mut pdu = vec![Self::OPCODE, entry_len as u8];
        for (handle, value) in &self.entries {
            pdu.extend_from_slice(&handle.to_le_bytes());
            pdu.extend_from_slice(value);
        }
        pdu
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadRequest {
    pub handle: u16,
}

impl AttPdu for ReadRequest {
    const OPCODE: u8 = ATT_READ_REQ;

    fn parse(data: &[u8]) -> Option<Self> {
        if data.len() != 3 || data[0] != Self::OPCODE {
            return None;
        }
        Some(Self {
            handle: u16::from_le_bytes([data[1], data[2]]),
        })
    }

    fn serialize(&self) -> Vec<u8> {
        let mut pdu = Vec::with_capacity(3);
        pdu.push(Self::OPCODE);
        pdu.extend_from_slice(&self.handle.to_le_bytes());
        pdu
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadResponse {
    pub value: Vec<u8>,
}

impl AttPdu for ReadResponse {
    const OPCODE: u8 = ATT_READ_RSP;

    fn parse(data: &[u8]) -> Option<Self> {
        if data.is_empty() || data[0] != Self::OPCODE {
            return None;
        }
        Some(Self {
            value: data[1..].to_vec(),
        })
    }

    fn serialize(&self) -> Vec<u8> {
        let mut pdu = Vec::with_capacity(1 + self.value.len());
        pdu.push(Self::OPCODE);
        pdu.extend_from_slice(&self.value);
        pdu
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadBlobRequest {
    pub handle: u16,
    pub offset: u16,
}

impl AttPdu for ReadBlobRequest {
    const OPCODE: u8 = ATT_READ_BLOB_REQ;

    fn parse(data: &[u8]) -> Option<Self> {
        if data.len() != 5 || data[0] != Self::OPCODE {
            return None;
        }
        Some(Self {
            handle: u16::from_le_bytes([data[1], data[2]]),
            offset: u16::from_le_bytes([data[3], data[4]]),
        })
    }

    fn serialize(&self) -> Vec<u8> {
        let mut pdu = Vec::with_capacity(5);
        pdu.push(Self::OPCODE);
        pdu.extend_from_slice(&self.handle.to_le_bytes());
        pdu.extend_from_slice(&self.offset.to_le_bytes());
        pdu
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadBlobResponse {
    pub value: Vec<u8>,
}

impl AttPdu for ReadBlobResponse {
    const OPCODE: u8 = ATT_READ_BLOB_RSP;

    fn parse(data: &[u8]) -> Option<Self> {
        if data.is_empty() || data[0] != Self::OPCODE {
            return None;
        }
        Some(Self {
            value: data[1..].to_vec(),
        })
    }

    fn serialize(&self) -> Vec<u8> {
        let mut pdu = Vec::with_capacity(1 + self.value.len());
        pdu.push(Self::OPCODE);
        pdu.extend_from_slice(&self.value);
        pdu
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadMultipleRequest {
    pub handles: Vec<u16>,
}

impl AttPdu for ReadMultipleRequest {
    const OPCODE: u8 = ATT_READ_MULTIPLE_REQ;

    fn parse(data: &[u8]) -> Option<Self> {
        // At least two handles per the protocol
        if data.len() < 5 || data[0] != Self::OPCODE || (data.len() - 1) % 2 != 0 {
            return None;
        }
        let handles = data[1..]
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .collect();
        Some(Self { handles })
    }

    fn serialize(&self) -> Vec<u8> {
        let mut pdu = Vec::with_capacity(1 + 2 * self.handles.len());
        pdu.push(Self::OPCODE);
        for handle in &self.handles {
            pdu.extend_from_slice(&handle.to_le_bytes());
        }
        pdu
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadMultipleResponse {
    pub values: Vec<u8>,
}

impl AttPdu for ReadMultipleResponse {
    const OPCODE: u8 = ATT_READ_MULTIPLE_RSP;

    fn parse(data: &[u8]) -> Option<Self> {
        if data.is_empty() || data[0] != Self::OPCODE {
            return None;
        }
        Some(Self {
            values: data[1..].to_vec(),
        })
    }

    fn serialize(&self) -> Vec<u8> {
        let mut pdu = Vec::with_capacity(1 + self.values.len());
        pdu.push(Self::OPCODE);
        pdu.extend_from_slice(&self.values);
        pdu
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadByGroupTypeRequest {
    pub start_handle: u16,
    pub end_handle: u16,
    pub group_type: Uuid,
}

impl AttPdu for ReadByGroupTypeRequest {
    const OPCODE: u8 = ATT_READ_BY_GROUP_TYPE_REQ;

    fn parse(data: &[u8]) -> Option<Self> {
        if data.is_empty() || data[0] != Self::OPCODE || !(data.len() == 7 || data.len() == 21) {
            return None;
        }
        Some(Self {
            start_handle: u16::from_le_bytes([data[1], data[2]]),
            end_handle: u16::from_le_bytes([data[3], data[4]]),
            group_type: Uuid::try_from_slice_le(&data[5..])?,
        })
    }

    fn serialize(&self) -> Vec<u8> {
        let mut pdu = Vec::with_capacity(5 + self.group_type.wire_len());
        pdu.push(Self::OPCODE);
        pdu.extend_from_slice(&self.start_handle.to_le_bytes());
        pdu.extend_from_slice(&self.end_handle.to_le_bytes());
        self.group_type.write_wire(&mut pdu);
        pdu
    }
}

/// Read By Group Type response: fixed-size (handle, end, value) entries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadByGroupTypeResponse {
    pub entries: Vec<(u16, u16, Vec<u8>)>,
}

impl AttPdu for ReadByGroupTypeResponse {
    const OPCODE: u8 = ATT_READ_BY_GROUP_TYPE_RSP;

    fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < 6 || data[0] != Self::OPCODE {
            return None;
        }
        let entry_len = data[1] as usize;
        let body = &data[2..];
        if entry_len < 4 || body.is_empty() || body.len() % entry_len != 0 {
            return None;
        }
        let entries = body
            .chunks_exact(entry_len)
            .map(|c| {
                (
                    u16::from_le_bytes([c[0], c[1]]),
                    u16::from_le_bytes([c[2], c[3]]),
                    c[4..].to_vec(),
                )
            })
            .collect();
        Some(Self { entries })
    }

    fn serialize(&self) -> Vec<u8> {
        let entry_len = self.entries.first().map_or(4, |(_, _, v)| 4 + v.len());
        let mut pdu = vec![Self::OPCODE, entry_len as u8];
        for (start, end, value) in &self.entries {
            pdu.extend_from_slice(&start.to_le_bytes());
            pdu.extend_from_slice(&end.to_le_bytes());
            pdu.extend_from_slice(value);
        }
        pdu
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteRequest {
    pub handle: u16,
    pub value: Vec<u8>,
}

impl AttPdu for WriteRequest {
    const OPCODE: u8 = ATT_WRITE_REQ;

    fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < 3 || data[0] != Self::OPCODE {
            return None;
        }
        Some(Self {
            handle: u16::from_le_bytes([data[1], data[2]]),
            value: data[3..].to_vec(),
        })
    }

    fn serialize(&self) -> Vec<u8> {
        let mut pdu = Vec::with_capacity(3 + self.value.len());
        pdu.push(Self::OPCODE);
        pdu.extend_from_slice(&self.handle.to_le_bytes());
        pdu.extend_from_slice(&self.value);
        pdu
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteResponse;

impl AttPdu for WriteResponse {
    const OPCODE: u8 = ATT_WRITE_RSP;

    fn parse(data: &[u8]) -> Option<Self> {
        if data != [Self::OPCODE] {
            return None;
        }
        Some(Self)
    }

    fn serialize(&self) -> Vec<u8> {
        vec![Self::OPCODE]
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteCommand {
    pub handle: u16,
    pub value: Vec<u8>,
}

impl AttPdu for WriteCommand {
    const OPCODE: u8 = ATT_WRITE_CMD;

    fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < 3 || data[0] != Self::OPCODE {
            return None;
        }
        Some(Self {
            handle: u16::from_le_bytes([data[1], data[2]]),
            value: data[3..].to_vec(),
        })
    }

    fn serialize(&self) -> Vec<u8> {
        let mut pdu = Vec::with_capacity(3 + self.value.len());
        pdu.push(Self::OPCODE);
        pdu.extend_from_slice(&self.handle.to_le_bytes());
        pdu.extend_from_slice(&self.value);
        pdu
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrepareWriteRequest {
    pub handle: u16,
    pub offset: u16,
    pub value: Vec<u8>,
}

impl AttPdu for PrepareWriteRequest {
    const OPCODE: u8 = ATT_PREPARE_WRITE_REQ;

    fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < 5 || data[0] != Self::OPCODE {
            return None;
        }
        Some(Self {
            handle: u16::from_le_bytes([data[1], data[2]]),
            offset: u16::from_le_bytes([data[3], data[4]]),
            value: data[5..].to_vec(),
        })
    }

    fn serialize(&self) -> Vec<u8> {
        let mut pdu = Vec::with_capacity(5 + self.value.len());
        pdu.push(Self::OPCODE);
        pdu.extend_from_slice(&self.handle.to_le_bytes());
        pdu.extend_from_slice(&self.offset.to_le_bytes());
        pdu.extend_from_slice(&self.value);
        pdu
    }
}

/// The Prepare Write response echoes the request fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrepareWriteResponse {
    pub handle: u16,
    pub offset: u16,
    pub value: Vec<u8>,
}

impl AttPdu for PrepareWriteResponse {
    const OPCODE: u8 = ATT_PREPARE_WRITE_RSP;

    fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < 5 || data[0] != Self::OPCODE {
            return None;
        }
        Some(Self {
            handle: u16::from_le_bytes([data[1], data[2]]),
            offset: u16::from_le_bytes([data[3], data[4]]),
            value: data[5..].to_vec(),
        })
    }

    fn serialize(&self) -> Vec<u8> {
        let mut pdu = Vec::with_capacity(5 + self.value.len());
        pdu.push(Self::OPCODE);
        pdu.extend_from_slice(&self.handle.to_le_bytes());
        pdu.extend_from_slice(&self.offset.to_le_bytes());
        pdu.extend_from_slice(&self.value);
        pdu
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecuteWriteRequest {
    pub flags: u8,
}

impl AttPdu for ExecuteWriteRequest {
    const OPCODE: u8 = ATT_EXECUTE_WRITE_REQ;

    fn parse(data: &[u8]) -> Option<Self> {
        if data.len() != 2 || data[0] != Self::OPCODE {
            return None;
        }
        Some(Self { flags: data[1] })
    }

    fn serialize(&self) -> Vec<u8> {
        vec![Self::OPCODE, self.flags]
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecuteWriteResponse;

impl AttPdu for ExecuteWriteResponse {
    const OPCODE: u8 = ATT_EXECUTE_WRITE_RSP;

    fn parse(data: &[u8]) -> Option<Self> {
        if data != [Self::OPCODE] {
            return None;
        }
        Some(Self)
    }

    fn serialize(&self) -> Vec<u8> {
        vec![Self::OPCODE]
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandleValueNotification {
    pub handle: u16,
    pub value: Vec<u8>,
}

impl AttPdu for HandleValueNotification {
    const OPCODE: u8 = ATT_HANDLE_VALUE_NTF;

    fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < 3 || data[0] != Self::OPCODE {
            return None;
        }
        Some(Self {
            handle: u16::from_le_bytes([data[1], data[2]]),
            value: data[3..].to_vec(),
        })
    }

    fn serialize(&self) -> Vec<u8> {
        let mut pdu = Vec::with_capacity(3 + self.value.len());
        pdu.push(Self::OPCODE);
        pdu.extend_from_slice(&self.handle.to_le_bytes());
        pdu.extend_from_slice(&self.value);
        pdu
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandleValueIndication {
    pub handle: u16,
    pub value: Vec<u8>,
}

impl AttPdu for HandleValueIndication {
    const OPCODE: u8 = ATT_HANDLE_VALUE_IND;

    fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < 3 || data[0] != Self::OPCODE {
            return None;
        }
        Some(Self {
            handle: u16::from_le_bytes([data[1], data[2]]),
            value: data[3..].to_vec(),
        })
    }

    fn serialize(&self) -> Vec<u8> {
        let mut pdu = Vec::with_capacity(3 + self.value.len());
        pdu.push(Self::OPCODE);
        pdu.extend_from_slice(&self.handle.to_le_bytes());
        pdu.extend_from_slice(&self.value);
        pdu
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandleValueConfirmation;

impl AttPdu for HandleValueConfirmation {
    const OPCODE: u8 = ATT_HANDLE_VALUE_CONF;

    fn parse(data: &[u8]) -> Option<Self> {
        if data != [Self::OPCODE] {
            return None;
        }
        Some(Self)
    }

    fn serialize(&self) -> Vec<u8> {
        vec![Self::OPCODE]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_response_round_trip() {
        let rsp = ErrorResponse {
            request_opcode: ATT_READ_REQ,
            handle: 0x0042,
            error_code: 0x0A,
        };
        let bytes = rsp.serialize();
        assert_eq!(bytes, vec![0x01, 0x0A, 0x42, 0x00, 0x0A]);
        assert_eq!(ErrorResponse::parse(&bytes).unwrap(), rsp);
        assert!(ErrorResponse::parse(&bytes[..4]).is_none());
    }

    #[test]
    fn find_information_formats() {
        let rsp = FindInformationResponse {
            format: ATT_FIND_INFO_FORMAT_16BIT,
            entries: vec![(0x0001, Uuid::from_u16(0x2800)), (0x0002, Uuid::from_u16(0x2803))],
        };
        let bytes = rsp.serialize();
        assert_eq!(bytes.len(), 2 + 2 * 4);
        let parsed = FindInformationResponse::parse(&bytes).unwrap();
        assert_eq!(parsed.entries, rsp.entries);

        let long: Uuid = "6e400001-b5a3-f393-e0a9-e50e24dcca9e".parse().unwrap();
        let rsp = FindInformationResponse {
            format: ATT_FIND_INFO_FORMAT_128BIT,
            entries: vec![(0x0010, long)],
        };
        let parsed = FindInformationResponse::parse(&rsp.serialize()).unwrap();
        assert_eq!(parsed.entries[0].1, long);
    }

    #[test]
    fn read_by_type_rejects_ragged_body() {
        // entry_len 4 but body of 5 bytes
        let bad = [ATT_READ_BY_TYPE_RSP, 4, 1, 0, 9, 9, 9];
        assert!(ReadByTypeResponse::parse(&bad).is_none());
    }

    #[test]
    fn read_by_group_type_round_trip() {
        let rsp = ReadByGroupTypeResponse {
            entries: vec![
                (0x0001, 0x0007, vec![0x00, 0x18]),
                (0x0008, 0x000C, vec![0x01, 0x18]),
            ],
        };
        let parsed = ReadByGroupTypeResponse::parse(&rsp.serialize()).unwrap();
        assert_eq!(parsed, rsp);
    }

    #[test]
    fn prepare_write_echo_shape() {
        let req = PrepareWriteRequest {
            handle: 0x50,
            offset: 18,
            value: vec![1, 2, 3],
        };
        let rsp = PrepareWriteResponse {
            handle: 0x50,
            offset: 18,
            value: vec![1, 2, 3],
        };
        // The response is the request PDU with the response opcode
        assert_eq!(req.serialize()[1..], rsp.serialize()[1..]);
    }

    #[test]
    fn zero_length_values_parse() {
        assert_eq!(
            ReadResponse::parse(&[ATT_READ_RSP]).unwrap().value,
            Vec::<u8>::new()
        );
        assert!(WriteResponse::parse(&[ATT_WRITE_RSP]).is_some());
        assert!(WriteResponse::parse(&[ATT_WRITE_RSP, 0]).is_none());
    }
}
