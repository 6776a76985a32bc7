//! Per-connection ACL state
//!
//! Each connection owns an inbound L2CAP reassembly buffer, an outbound
//! fragment queue drained under controller-credit control, and the list of
//! completion callbacks for fragments currently held by the controller.

use super::constants::*;
use crate::address::Address;
use log::{trace, warn};
use std::collections::VecDeque;

/// Connection role reported by the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Central,
    Peripheral,
}

impl From<u8> for Role {
    fn from(value: u8) -> Self {
        if value == 0 {
            Role::Central
        } else {
            Role::Peripheral
        }
    }
}

/// Fired when a fragment is handed to the transport (sent) or reported
/// complete by the controller.
pub type DataCallback = Box<dyn FnOnce() + Send>;

pub(crate) struct OutboundFragment {
    pub first: bool,
    pub data: Vec<u8>,
    pub on_sent: Option<DataCallback>,
    pub on_complete: Option<DataCallback>,
}

/// State for one ACL connection inside the adapter.
pub(crate) struct AclConnection {
    pub handle: u16,
    pub role: Role,
    pub peer: Address,
    pub disconnecting: bool,
    /// Inbound fragments being reassembled into one L2CAP PDU
    reassembly: Option<Vec<u8>>,
    /// Outbound fragments not yet written to the transport
    pub outbound: VecDeque<OutboundFragment>,
    /// Completion callbacks for fragments the controller holds, in order
    pub outstanding: VecDeque<Option<DataCallback>>,
}

impl AclConnection {
    pub fn new(handle: u16, role: Role, peer: Address) -> Self {
        Self {
            handle,
            role,
            peer,
            disconnecting: false,
            reassembly: None,
            outbound: VecDeque::new(),
            outstanding: VecDeque::new(),
        }
    }

    /// Feeds one inbound ACL fragment. Returns a complete L2CAP PDU as
    /// `(cid, payload)` once the length header is satisfied.
    pub fn receive_fragment(&mut self, pb: u8, payload: &[u8]) -> Option<(u16, Vec<u8>)> {
        if pb == ACL_PB_CONTINUATION {
            match self.reassembly.as_mut() {
                Some(buf) => buf.extend_from_slice(payload),
                None => {
                    trace!(
                        "handle 0x{:03X}: continuation without a first fragment, dropped",
                        self.handle
                    );
                    return None;
                }
            }
        } else {
            if self.reassembly.is_some() {
                warn!(
                    "handle 0x{:03X}: new first fragment discards partial reassembly",
                    self.handle
                );
            }
            self.reassembly = Some(payload.to_vec());
        }

        let buf = self.reassembly.as_ref()?;
        if buf.len() < 4 {
            return None;
        }
        let l2cap_len = u16::from_le_bytes([buf[0], buf[1]]) as usize;
        let expected = 4 + l2cap_len;
        if buf.len() < expected {
            return None;
        }
        let buf = self.reassembly.take().unwrap();
        if buf.len() > expected {
            trace!("handle 0x{:03X}: over-length L2CAP fragment dropped", self.handle);
            return None;
        }
        let cid = u16::from_le_bytes([buf[2], buf[3]]);
        Some((cid, buf[4..].to_vec()))
    }

    /// Splits an L2CAP PDU into `acl_mtu`-sized fragments and queues them.
    /// The sent/complete callbacks ride on the final fragment.
    pub fn enqueue_pdu(
        &mut self,
        cid: u16,
        payload: &[u8],
        acl_mtu: usize,
        on_sent: Option<DataCallback>,
        on_complete: Option<DataCallback>,
    ) {
        let mut pdu = Vec::with_capacity(4 + payload.len());
        pdu.extend_from_slice(&(payload.len() as u16).to_le_bytes());
        pdu.extend_from_slice(&cid.to_le_bytes());
        pdu.extend_from_slice(payload);

        let chunks: Vec<&[u8]> = pdu.chunks(acl_mtu).collect();
        let last = chunks.len() - 1;
        let mut on_sent = on_sent;
        let mut on_complete = on_complete;
        for (i, chunk) in chunks.into_iter().enumerate() {
            self.outbound.push_back(OutboundFragment {
                first: i == 0,
                data: chunk.to_vec(),
                on_sent: if i == last { on_sent.take() } else { None },
                on_complete: if i == last { on_complete.take() } else { None },
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::{AddressType, BdAddr};

    fn conn() -> AclConnection {
        AclConnection::new(
            0x40,
            Role::Central,
            Address::new(AddressType::Public, BdAddr::new([1, 2, 3, 4, 5, 6])),
        )
    }

    #[test]
    fn single_fragment_pdu() {
        let mut c = conn();
        // len=3, cid=4, payload [9,9,9]
        let frame = [3, 0, 4, 0, 9, 9, 9];
        let (cid, pdu) = c
            .receive_fragment(ACL_PB_FIRST_FLUSHABLE, &frame)
            .expect("complete PDU");
        assert_eq!(cid, 4);
        assert_eq!(pdu, vec![9, 9, 9]);
    }

    #[test]
    fn fragments_reassemble_in_order() {
        let mut c = conn();
        assert!(c.receive_fragment(ACL_PB_FIRST_FLUSHABLE, &[5, 0, 4, 0, 1]).is_none());
        assert!(c.receive_fragment(ACL_PB_CONTINUATION, &[2, 3]).is_none());
        let (cid, pdu) = c
            .receive_fragment(ACL_PB_CONTINUATION, &[4, 5])
            .expect("complete PDU");
        assert_eq!(cid, 4);
        assert_eq!(pdu, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn orphan_continuation_is_dropped() {
        let mut c = conn();
        assert!(c.receive_fragment(ACL_PB_CONTINUATION, &[1, 2, 3]).is_none());
        // A proper first fragment still works afterwards
        let out = c.receive_fragment(ACL_PB_FIRST_FLUSHABLE, &[1, 0, 4, 0, 7]);
        assert_eq!(out, Some((4, vec![7])));
    }

    #[test]
    fn new_first_discards_partial() {
        let mut c = conn();
        assert!(c.receive_fragment(ACL_PB_FIRST_FLUSHABLE, &[10, 0, 4, 0, 1]).is_none());
        let out = c.receive_fragment(ACL_PB_FIRST_FLUSHABLE, &[1, 0, 4, 0, 8]);
        assert_eq!(out, Some((4, vec![8])));
    }

    #[test]
    fn over_length_is_dropped_silently() {
        let mut c = conn();
        // Claims 1 byte but carries 2
        assert!(c.receive_fragment(ACL_PB_FIRST_FLUSHABLE, &[1, 0, 4, 0, 8, 8]).is_none());
        // Reassembly state was consumed
        assert!(c.receive_fragment(ACL_PB_CONTINUATION, &[1]).is_none());
    }

    #[test]
    fn enqueue_fragments_at_mtu() {
        let mut c = conn();
        let payload = vec![0xABu8; 60];
        c.enqueue_pdu(4, &payload, 27, None, None);
        // 64 bytes of PDU split into 27+27+10
        assert_eq!(c.outbound.len(), 3);
        assert!(c.outbound[0].first);
        assert!(!c.outbound[1].first);
        assert_eq!(c.outbound[0].data.len(), 27);
        assert_eq!(c.outbound[2].data.len(), 10);
        assert_eq!(c.outbound[0].data[..4], [60, 0, 4, 0]);
    }
}
