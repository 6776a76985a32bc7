//! HCI packet framing
//!
//! Commands: type(1) | opcode(2, LE) | param_len(1) | params.
//! Events:   type(1) | event_code(1) | param_len(1) | params.
//! ACL:      type(1) | handle+flags(2, LE) | data_len(2, LE) | payload.

use super::constants::*;

/// Builds a complete HCI command packet.
pub fn command_packet(opcode: u16, params: &[u8]) -> Vec<u8> {
    debug_assert!(params.len() <= 255);
    let mut packet = Vec::with_capacity(4 + params.len());
    packet.push(HCI_COMMAND_PKT);
    packet.extend_from_slice(&opcode.to_le_bytes());
    packet.push(params.len() as u8);
    packet.extend_from_slice(params);
    packet
}

/// Builds a complete ACL data packet. The handle occupies the low 12 bits,
/// the packet-boundary flag bits 12-13; broadcast bits stay zero.
pub fn acl_packet(handle: u16, pb: u8, payload: &[u8]) -> Vec<u8> {
    let handle_flags = (handle & 0x0FFF) | ((pb as u16) << 12);
    let mut packet = Vec::with_capacity(5 + payload.len());
    packet.push(HCI_ACL_PKT);
    packet.extend_from_slice(&handle_flags.to_le_bytes());
    packet.extend_from_slice(&(payload.len() as u16).to_le_bytes());
    packet.extend_from_slice(payload);
    packet
}

/// A parsed HCI event packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HciEvent {
    pub code: u8,
    pub params: Vec<u8>,
}

impl HciEvent {
    /// Parses an event from the bytes following the packet-type indicator.
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < 2 {
            return None;
        }
        let code = data[0];
        let param_len = data[1] as usize;
        if data.len() < 2 + param_len {
            return None;
        }
        Some(HciEvent {
            code,
            params: data[2..2 + param_len].to_vec(),
        })
    }
}

/// A parsed ACL data fragment header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AclHeader {
    pub handle: u16,
    pub pb: u8,
}

/// Parses an ACL fragment from the bytes following the packet-type
/// indicator, returning the header and payload.
pub fn parse_acl(data: &[u8]) -> Option<(AclHeader, &[u8])> {
    if data.len() < 4 {
        return None;
    }
    let handle_flags = u16::from_le_bytes([data[0], data[1]]);
    let data_len = u16::from_le_bytes([data[2], data[3]]) as usize;
    if data.len() != 4 + data_len {
        return None;
    }
    Some((
        AclHeader {
            handle: handle_flags & 0x0FFF,
            pb: ((handle_flags >> 12) & 0x03) as u8,
        },
        &data[4..],
    ))
}

/// Splits advertising data into (type, payload) structures.
pub fn parse_advertising_data(data: &[u8]) -> Vec<(u8, Vec<u8>)> {
    let mut result = Vec::new();
    let mut i = 0;
    while i < data.len() {
        let length = data[i] as usize;
        if length == 0 || i + length >= data.len() {
            break;
        }
        result.push((data[i + 1], data[i + 2..i + 1 + length].to_vec()));
        i += 1 + length;
    }
    result
}

/// Appends one advertising-data structure to `out`.
pub fn append_advertising_structure(out: &mut Vec<u8>, ad_type: u8, payload: &[u8]) {
    debug_assert!(payload.len() <= 254);
    out.push(payload.len() as u8 + 1);
    out.push(ad_type);
    out.extend_from_slice(payload);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_framing() {
        let packet = command_packet(opcode(OGF_HOST_CTL, OCF_RESET), &[]);
        assert_eq!(packet, vec![0x01, 0x03, 0x0C, 0x00]);
    }

    #[test]
    fn acl_framing_round_trip() {
        let packet = acl_packet(0x0040, ACL_PB_FIRST_NON_FLUSHABLE, &[1, 2, 3]);
        let (header, payload) = parse_acl(&packet[1..]).unwrap();
        assert_eq!(header.handle, 0x0040);
        assert_eq!(header.pb, ACL_PB_FIRST_NON_FLUSHABLE);
        assert_eq!(payload, &[1, 2, 3]);
    }

    #[test]
    fn acl_length_must_match() {
        let mut packet = acl_packet(0x0040, ACL_PB_CONTINUATION, &[1, 2, 3]);
        packet.pop();
        assert!(parse_acl(&packet[1..]).is_none());
    }

    #[test]
    fn event_parse_truncated() {
        assert!(HciEvent::parse(&[0x0E]).is_none());
        assert!(HciEvent::parse(&[0x0E, 4, 1, 2, 3]).is_none());
        let event = HciEvent::parse(&[0x0E, 3, 1, 0x03, 0x0C]).unwrap();
        assert_eq!(event.code, EVT_CMD_COMPLETE);
        assert_eq!(event.params, vec![1, 0x03, 0x0C]);
    }

    #[test]
    fn advertising_data_round_trip() {
        let mut data = Vec::new();
        append_advertising_structure(&mut data, ADV_TYPE_FLAGS, &[0x06]);
        append_advertising_structure(&mut data, ADV_TYPE_COMPLETE_LOCAL_NAME, b"ble");
        let parsed = parse_advertising_data(&data);
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0], (ADV_TYPE_FLAGS, vec![0x06]));
        assert_eq!(parsed[1], (ADV_TYPE_COMPLETE_LOCAL_NAME, b"ble".to_vec()));
    }
}
