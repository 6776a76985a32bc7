//! HCI command/event/data multiplexer
//!
//! One command outstanding at a time, ACL data flow-controlled by controller
//! buffer credits, events demultiplexed to their handlers, inbound ACL
//! fragments reassembled into L2CAP PDUs per connection.

use super::acl::{AclConnection, DataCallback, Role};
use super::constants::*;
use super::packet::{acl_packet, command_packet, parse_acl, HciEvent};
use crate::address::{Address, AddressType, BdAddr};
use crate::error::Error;
use crate::transport::Transport;
use log::{debug, trace, warn};
use rand::Rng;
use std::collections::{HashMap, VecDeque};

/// Response callback for an HCI command: `(status, return_params)` where
/// `return_params` excludes the status byte.
pub type CommandCallback = Box<dyn FnOnce(u8, &[u8]) + Send>;

/// Consumed-on-use callback slot for an LE connection completion.
pub type ConnectionCallback = Box<dyn FnOnce(&LeConnectionComplete) + Send>;

struct QueuedCommand {
    opcode: u16,
    packet: Vec<u8>,
    callback: Option<CommandCallback>,
    /// Connection the command belongs to; dropped when it disconnects
    assoc_handle: Option<u16>,
}

struct PendingCommand {
    opcode: u16,
    callback: Option<CommandCallback>,
    assoc_handle: Option<u16>,
    ignore_response: bool,
}

/// LE Connection Complete / Enhanced Connection Complete parameters.
#[derive(Debug, Clone)]
pub struct LeConnectionComplete {
    pub status: u8,
    pub handle: u16,
    pub role: Role,
    pub peer: Address,
    pub conn_interval: u16,
    pub conn_latency: u16,
    pub supervision_timeout: u16,
}

/// One entry of an LE Advertising Report event.
#[derive(Debug, Clone)]
pub struct AdvertisingReport {
    pub event_type: u8,
    pub address: Address,
    pub data: Vec<u8>,
    pub rssi: i8,
}

/// One entry of an LE Extended Advertising Report event.
#[derive(Debug, Clone)]
pub struct ExtendedAdvertisingReport {
    pub event_type: u16,
    pub address: Address,
    pub primary_phy: u8,
    pub secondary_phy: u8,
    pub advertising_sid: u8,
    pub tx_power: i8,
    pub rssi: i8,
    pub data: Vec<u8>,
}

/// Structured events the adapter hands to its owner after internal
/// bookkeeping. Command responses are delivered through their callbacks and
/// never appear here.
#[derive(Debug)]
pub enum HciNotification {
    ConnectionComplete(LeConnectionComplete),
    DisconnectionComplete {
        handle: u16,
        reason: u8,
    },
    /// A fully reassembled L2CAP PDU
    AclData {
        handle: u16,
        cid: u16,
        pdu: Vec<u8>,
    },
    EncryptionChange {
        handle: u16,
        status: u8,
        enabled: bool,
    },
    EncryptionKeyRefresh {
        handle: u16,
        status: u8,
    },
    ReadRemoteVersionComplete {
        handle: u16,
        status: u8,
        version: u8,
        manufacturer: u16,
        subversion: u16,
    },
    LeConnectionUpdateComplete {
        handle: u16,
        status: u8,
        conn_interval: u16,
        conn_latency: u16,
        supervision_timeout: u16,
    },
    LeReadRemoteFeaturesComplete {
        handle: u16,
        status: u8,
        features: [u8; 8],
    },
    LeLongTermKeyRequest {
        handle: u16,
        rand: [u8; 8],
        ediv: u16,
    },
    LePhyUpdateComplete {
        handle: u16,
        status: u8,
        tx_phy: u8,
        rx_phy: u8,
    },
    LeP256PublicKeyComplete {
        status: u8,
        key: [u8; 64],
    },
    LeDhKeyComplete {
        status: u8,
        dh_key: [u8; 32],
    },
    AdvertisingReports(Vec<AdvertisingReport>),
    ExtendedAdvertisingReports(Vec<ExtendedAdvertisingReport>),
    HardwareError(u8),
}

/// The HCI adapter: command serialization, ACL credit accounting, event
/// dispatch, and L2CAP fragment reassembly over an opaque transport.
pub struct HciAdapter {
    transport: Option<Box<dyn Transport>>,
    command_queue: VecDeque<QueuedCommand>,
    pending_command: Option<PendingCommand>,
    connections: HashMap<u16, AclConnection>,
    /// Largest ACL fragment the controller accepts
    acl_mtu: usize,
    total_buffers: u16,
    free_buffers: u16,
    adv_callback: Option<ConnectionCallback>,
    conn_callback: Option<ConnectionCallback>,
    hardware_error_callback: Option<Box<dyn FnMut(u8) + Send>>,
    stopped: bool,
}

impl HciAdapter {
    pub fn new(transport: Box<dyn Transport>) -> Self {
        Self {
            transport: Some(transport),
            command_queue: VecDeque::new(),
            pending_command: None,
            connections: HashMap::new(),
            acl_mtu: ACL_MTU_DEFAULT,
            total_buffers: 1,
            free_buffers: 1,
            adv_callback: None,
            conn_callback: None,
            hardware_error_callback: None,
            stopped: false,
        }
    }

    /// Detaches the transport; every further operation becomes inert.
    pub fn stop(&mut self) {
        self.stopped = true;
        self.transport = None;
        self.command_queue.clear();
        self.pending_command = None;
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// Installs the adapter-wide hardware-error handler.
    pub fn set_hardware_error_callback(&mut self, cb: impl FnMut(u8) + Send + 'static) {
        self.hardware_error_callback = Some(Box::new(cb));
    }

    /// Arms the slot consumed when a connection completes with us as
    /// peripheral (i.e. our advertisement was taken).
    pub fn set_advertising_connection_callback(&mut self, cb: ConnectionCallback) {
        self.adv_callback = Some(cb);
    }

    /// Arms the slot consumed when a connection we initiated completes.
    pub fn set_create_connection_callback(&mut self, cb: ConnectionCallback) {
        self.conn_callback = Some(cb);
    }

    /// Largest L2CAP fragment currently usable.
    pub fn acl_mtu(&self) -> usize {
        self.acl_mtu
    }

    /// Controller buffer credits not currently holding a packet.
    pub fn free_buffers(&self) -> u16 {
        self.free_buffers
    }

    pub fn is_connected(&self, handle: u16) -> bool {
        self.connections.contains_key(&handle)
    }

    /// True once [`HciAdapter::disconnect`] was issued for the handle and
    /// the Disconnection Complete event has not arrived yet.
    pub fn is_disconnecting(&self, handle: u16) -> bool {
        self.connections
            .get(&handle)
            .map_or(false, |c| c.disconnecting)
    }

    pub fn connection_role(&self, handle: u16) -> Option<Role> {
        self.connections.get(&handle).map(|c| c.role)
    }

    pub fn connection_peer(&self, handle: u16) -> Option<Address> {
        self.connections.get(&handle).map(|c| c.peer)
    }

    // --- Commands -------------------------------------------------------

    fn queue_command(
        &mut self,
        opcode: u16,
        params: Vec<u8>,
        assoc_handle: Option<u16>,
        callback: Option<CommandCallback>,
    ) {
        if self.stopped {
            return;
        }
        let packet = command_packet(opcode, &params);
        if self.pending_command.is_none() {
            self.transmit(&packet);
            self.pending_command = Some(PendingCommand {
                opcode,
                callback,
                assoc_handle,
                ignore_response: false,
            });
        } else {
            self.command_queue.push_back(QueuedCommand {
                opcode,
                packet,
                callback,
                assoc_handle,
            });
        }
    }

    fn dispatch_next_command(&mut self) {
        if self.pending_command.is_some() {
            return;
        }
        if let Some(cmd) = self.command_queue.pop_front() {
            self.transmit(&cmd.packet);
            self.pending_command = Some(PendingCommand {
                opcode: cmd.opcode,
                callback: cmd.callback,
                assoc_handle: cmd.assoc_handle,
                ignore_response: false,
            });
        }
    }

    fn transmit(&mut self, packet: &[u8]) {
        if let Some(transport) = self.transport.as_mut() {
            if let Err(err) = transport.write(packet) {
                warn!("transport write failed: {}", err);
            }
        }
    }

    pub fn reset(&mut self, callback: CommandCallback) {
        self.queue_command(opcode(OGF_HOST_CTL, OCF_RESET), Vec::new(), None, Some(callback));
    }

    pub fn set_event_mask(&mut self, mask: u64, callback: CommandCallback) {
        self.queue_command(
            opcode(OGF_HOST_CTL, OCF_SET_EVENT_MASK),
            mask.to_le_bytes().to_vec(),
            None,
            Some(callback),
        );
    }

    pub fn read_buffer_size(&mut self, callback: CommandCallback) {
        self.queue_command(
            opcode(OGF_INFO_PARAM, OCF_READ_BUFFER_SIZE),
            Vec::new(),
            None,
            Some(callback),
        );
    }

    pub fn read_local_version(&mut self, callback: CommandCallback) {
        self.queue_command(
            opcode(OGF_INFO_PARAM, OCF_READ_LOCAL_VERSION),
            Vec::new(),
            None,
            Some(callback),
        );
    }

    pub fn read_bd_addr(&mut self, callback: CommandCallback) {
        self.queue_command(
            opcode(OGF_INFO_PARAM, OCF_READ_BD_ADDR),
            Vec::new(),
            None,
            Some(callback),
        );
    }

    pub fn le_set_event_mask(&mut self, mask: u64, callback: CommandCallback) {
        self.queue_command(
            opcode(OGF_LE, OCF_LE_SET_EVENT_MASK),
            mask.to_le_bytes().to_vec(),
            None,
            Some(callback),
        );
    }

    pub fn le_read_buffer_size(&mut self, callback: CommandCallback) {
        self.queue_command(
            opcode(OGF_LE, OCF_LE_READ_BUFFER_SIZE),
            Vec::new(),
            None,
            Some(callback),
        );
    }

    pub fn le_set_random_address(&mut self, address: BdAddr, callback: CommandCallback) {
        self.queue_command(
            opcode(OGF_LE, OCF_LE_SET_RANDOM_ADDRESS),
            address.bytes.to_vec(),
            None,
            Some(callback),
        );
    }

    #[allow(clippy::too_many_arguments)]
    pub fn le_set_advertising_parameters(
        &mut self,
        interval_min: u16,
        interval_max: u16,
        adv_type: u8,
        own_address_type: u8,
        peer_address_type: u8,
        peer_address: BdAddr,
        channel_map: u8,
        filter_policy: u8,
        callback: CommandCallback,
    ) {
        let mut params = Vec::with_capacity(15);
        params.extend_from_slice(&interval_min.to_le_bytes());
        params.extend_from_slice(&interval_max.to_le_bytes());
        params.push(adv_type);
        params.push(own_address_type);
        params.push(peer_address_type);
        params.extend_from_slice(&peer_address.bytes);
        params.push(channel_map);
        params.push(filter_policy);
        self.queue_command(
            opcode(OGF_LE, OCF_LE_SET_ADVERTISING_PARAMETERS),
            params,
            None,
            Some(callback),
        );
    }

    pub fn le_set_advertising_data(&mut self, data: &[u8], callback: CommandCallback) {
        // Fixed 32-byte parameter block: significant length plus padding
        let len = data.len().min(31);
        let mut params = vec![0u8; 32];
        params[0] = len as u8;
        params[1..1 + len].copy_from_slice(&data[..len]);
        self.queue_command(
            opcode(OGF_LE, OCF_LE_SET_ADVERTISING_DATA),
            params,
            None,
            Some(callback),
        );
    }

    pub fn le_set_scan_response_data(&mut self, data: &[u8], callback: CommandCallback) {
        let len = data.len().min(31);
        let mut params = vec![0u8; 32];
        params[0] = len as u8;
        params[1..1 + len].copy_from_slice(&data[..len]);
        self.queue_command(
            opcode(OGF_LE, OCF_LE_SET_SCAN_RESPONSE_DATA),
            params,
            None,
            Some(callback),
        );
    }

    pub fn le_set_advertising_enable(&mut self, enable: bool, callback: CommandCallback) {
        self.queue_command(
            opcode(OGF_LE, OCF_LE_SET_ADVERTISING_ENABLE),
            vec![enable as u8],
            None,
            Some(callback),
        );
    }

    pub fn le_set_scan_parameters(
        &mut self,
        active: bool,
        interval: u16,
        window: u16,
        own_address_type: u8,
        filter_policy: u8,
        callback: CommandCallback,
    ) {
        let mut params = Vec::with_capacity(7);
        params.push(active as u8);
        params.extend_from_slice(&interval.to_le_bytes());
        params.extend_from_slice(&window.to_le_bytes());
        params.push(own_address_type);
        params.push(filter_policy);
        self.queue_command(
            opcode(OGF_LE, OCF_LE_SET_SCAN_PARAMETERS),
            params,
            None,
            Some(callback),
        );
    }

    pub fn le_set_scan_enable(
        &mut self,
        enable: bool,
        filter_duplicates: bool,
        callback: CommandCallback,
    ) {
        self.queue_command(
            opcode(OGF_LE, OCF_LE_SET_SCAN_ENABLE),
            vec![enable as u8, filter_duplicates as u8],
            None,
            Some(callback),
        );
    }

    #[allow(clippy::too_many_arguments)]
    pub fn le_create_connection(
        &mut self,
        scan_interval: u16,
        scan_window: u16,
        filter_policy: u8,
        peer: Address,
        own_address_type: u8,
        conn_interval_min: u16,
        conn_interval_max: u16,
        conn_latency: u16,
        supervision_timeout: u16,
        callback: CommandCallback,
    ) {
        let mut params = Vec::with_capacity(25);
        params.extend_from_slice(&scan_interval.to_le_bytes());
        params.extend_from_slice(&scan_window.to_le_bytes());
        params.push(filter_policy);
        params.push(u8::from(peer.addr_type));
        params.extend_from_slice(&peer.addr.bytes);
        params.push(own_address_type);
        params.extend_from_slice(&conn_interval_min.to_le_bytes());
        params.extend_from_slice(&conn_interval_max.to_le_bytes());
        params.extend_from_slice(&conn_latency.to_le_bytes());
        params.extend_from_slice(&supervision_timeout.to_le_bytes());
        params.extend_from_slice(&0u16.to_le_bytes()); // min CE length
        params.extend_from_slice(&0u16.to_le_bytes()); // max CE length
        self.queue_command(
            opcode(OGF_LE, OCF_LE_CREATE_CONNECTION),
            params,
            None,
            Some(callback),
        );
    }

    pub fn le_create_connection_cancel(&mut self, callback: CommandCallback) {
        self.queue_command(
            opcode(OGF_LE, OCF_LE_CREATE_CONNECTION_CANCEL),
            Vec::new(),
            None,
            Some(callback),
        );
    }

    pub fn le_connection_update(
        &mut self,
        handle: u16,
        conn_interval_min: u16,
        conn_interval_max: u16,
        conn_latency: u16,
        supervision_timeout: u16,
        callback: CommandCallback,
    ) {
        let mut params = Vec::with_capacity(14);
        params.extend_from_slice(&handle.to_le_bytes());
        params.extend_from_slice(&conn_interval_min.to_le_bytes());
        params.extend_from_slice(&conn_interval_max.to_le_bytes());
        params.extend_from_slice(&conn_latency.to_le_bytes());
        params.extend_from_slice(&supervision_timeout.to_le_bytes());
        params.extend_from_slice(&0u16.to_le_bytes());
        params.extend_from_slice(&0u16.to_le_bytes());
        self.queue_command(
            opcode(OGF_LE, OCF_LE_CONNECTION_UPDATE),
            params,
            Some(handle),
            Some(callback),
        );
    }

    pub fn le_read_remote_features(&mut self, handle: u16, callback: CommandCallback) {
        self.queue_command(
            opcode(OGF_LE, OCF_LE_READ_REMOTE_FEATURES),
            handle.to_le_bytes().to_vec(),
            Some(handle),
            Some(callback),
        );
    }

    pub fn read_remote_version(&mut self, handle: u16, callback: CommandCallback) {
        self.queue_command(
            opcode(OGF_LINK_CTL, OCF_READ_REMOTE_VERSION),
            handle.to_le_bytes().to_vec(),
            Some(handle),
            Some(callback),
        );
    }

    pub fn le_start_encryption(
        &mut self,
        handle: u16,
        rand: [u8; 8],
        ediv: u16,
        ltk: [u8; 16],
        callback: CommandCallback,
    ) {
        let mut params = Vec::with_capacity(28);
        params.extend_from_slice(&handle.to_le_bytes());
        params.extend_from_slice(&rand);
        params.extend_from_slice(&ediv.to_le_bytes());
        params.extend_from_slice(&ltk);
        self.queue_command(
            opcode(OGF_LE, OCF_LE_START_ENCRYPTION),
            params,
            Some(handle),
            Some(callback),
        );
    }

    pub fn le_long_term_key_request_reply(
        &mut self,
        handle: u16,
        ltk: [u8; 16],
        callback: CommandCallback,
    ) {
        let mut params = Vec::with_capacity(18);
        params.extend_from_slice(&handle.to_le_bytes());
        params.extend_from_slice(&ltk);
        self.queue_command(
            opcode(OGF_LE, OCF_LE_LTK_REQUEST_REPLY),
            params,
            Some(handle),
            Some(callback),
        );
    }

    pub fn le_long_term_key_request_negative_reply(
        &mut self,
        handle: u16,
        callback: CommandCallback,
    ) {
        self.queue_command(
            opcode(OGF_LE, OCF_LE_LTK_REQUEST_NEGATIVE_REPLY),
            handle.to_le_bytes().to_vec(),
            Some(handle),
            Some(callback),
        );
    }

    pub fn le_rand(&mut self, callback: CommandCallback) {
        self.queue_command(opcode(OGF_LE, OCF_LE_RAND), Vec::new(), None, Some(callback));
    }

    pub fn le_read_local_p256_public_key(&mut self, callback: CommandCallback) {
        self.queue_command(
            opcode(OGF_LE, OCF_LE_READ_LOCAL_P256_PUBLIC_KEY),
            Vec::new(),
            None,
            Some(callback),
        );
    }

    pub fn le_generate_dhkey(&mut self, remote_key: [u8; 64], callback: CommandCallback) {
        self.queue_command(
            opcode(OGF_LE, OCF_LE_GENERATE_DHKEY),
            remote_key.to_vec(),
            None,
            Some(callback),
        );
    }

    pub fn le_set_phy(
        &mut self,
        handle: u16,
        all_phys: u8,
        tx_phys: u8,
        rx_phys: u8,
        callback: CommandCallback,
    ) {
        let mut params = Vec::with_capacity(7);
        params.extend_from_slice(&handle.to_le_bytes());
        params.push(all_phys);
        params.push(tx_phys);
        params.push(rx_phys);
        params.extend_from_slice(&0u16.to_le_bytes()); // PHY options
        self.queue_command(opcode(OGF_LE, OCF_LE_SET_PHY), params, Some(handle), Some(callback));
    }

    /// Requests disconnection; the connection stops being eligible for
    /// outbound drain immediately.
    pub fn disconnect(&mut self, handle: u16, reason: u8) {
        if let Some(conn) = self.connections.get_mut(&handle) {
            conn.disconnecting = true;
        }
        let mut params = Vec::with_capacity(3);
        params.extend_from_slice(&handle.to_le_bytes());
        params.push(reason);
        self.queue_command(opcode(OGF_LINK_CTL, OCF_DISCONNECT), params, Some(handle), None);
    }

    // --- ACL data -------------------------------------------------------

    /// Queues an L2CAP PDU for `handle` on channel `cid`.
    ///
    /// `on_sent` fires when the final fragment enters the controller;
    /// `on_complete` fires when the controller reports it completed.
    pub fn send_data(
        &mut self,
        handle: u16,
        cid: u16,
        payload: &[u8],
        on_sent: Option<DataCallback>,
        on_complete: Option<DataCallback>,
    ) -> Result<(), Error> {
        if self.stopped {
            return Err(Error::Hci(crate::error::HciError::Stopped));
        }
        let acl_mtu = self.acl_mtu;
        let conn = self
            .connections
            .get_mut(&handle)
            .ok_or(Error::NotConnected)?;
        conn.enqueue_pdu(cid, payload, acl_mtu, on_sent, on_complete);
        self.drain_acl();
        Ok(())
    }

    /// Writes queued fragments while buffer credits remain, choosing
    /// uniformly at random among connections with pending data.
    fn drain_acl(&mut self) {
        while self.free_buffers > 0 {
            let candidates: Vec<u16> = self
                .connections
                .values()
                .filter(|c| !c.disconnecting && !c.outbound.is_empty())
                .map(|c| c.handle)
                .collect();
            if candidates.is_empty() {
                return;
            }
            let pick = candidates[rand::thread_rng().gen_range(0..candidates.len())];
            let conn = self.connections.get_mut(&pick).expect("candidate exists");
            let fragment = conn.outbound.pop_front().expect("candidate has data");
            let pb = if fragment.first {
                ACL_PB_FIRST_NON_FLUSHABLE
            } else {
                ACL_PB_CONTINUATION
            };
            let packet = acl_packet(pick, pb, &fragment.data);
            conn.outstanding.push_back(fragment.on_complete);
            self.free_buffers -= 1;
            self.transmit(&packet);
            if let Some(on_sent) = fragment.on_sent {
                on_sent();
            }
        }
    }

    // --- Inbound packets ------------------------------------------------

    /// Consumes one complete HCI packet from the transport.
    pub fn handle_packet(&mut self, packet: &[u8]) -> Vec<HciNotification> {
        let mut out = Vec::new();
        if self.stopped || packet.is_empty() {
            return out;
        }
        match packet[0] {
            HCI_EVENT_PKT => {
                if let Some(event) = HciEvent::parse(&packet[1..]) {
                    self.handle_event(event, &mut out);
                } else {
                    trace!("malformed event packet dropped");
                }
            }
            HCI_ACL_PKT => {
                if let Some((header, payload)) = parse_acl(&packet[1..]) {
                    if let Some(conn) = self.connections.get_mut(&header.handle) {
                        if let Some((cid, pdu)) = conn.receive_fragment(header.pb, payload) {
                            out.push(HciNotification::AclData {
                                handle: header.handle,
                                cid,
                                pdu,
                            });
                        }
                    } else {
                        trace!("ACL data for unknown handle 0x{:03X}", header.handle);
                    }
                } else {
                    trace!("malformed ACL packet dropped");
                }
            }
            other => {
                trace!("unexpected packet indicator 0x{:02X}", other);
            }
        }
        out
    }

    fn handle_event(&mut self, event: HciEvent, out: &mut Vec<HciNotification>) {
        let p = &event.params;
        match event.code {
            EVT_CMD_COMPLETE => {
                if p.len() < 3 {
                    return;
                }
                let cmd_opcode = u16::from_le_bytes([p[1], p[2]]);
                let status = p.get(3).copied().unwrap_or(0);
                let ret = if p.len() > 4 { &p[4..] } else { &[][..] };
                self.intercept_buffer_size(cmd_opcode, status, ret);
                self.finish_command(cmd_opcode, status, ret);
            }
            EVT_CMD_STATUS => {
                if p.len() < 4 {
                    return;
                }
                let status = p[0];
                let cmd_opcode = u16::from_le_bytes([p[2], p[3]]);
                self.finish_command(cmd_opcode, status, &[]);
            }
            EVT_DISCONN_COMPLETE => {
                if p.len() < 4 {
                    return;
                }
                let handle = u16::from_le_bytes([p[1], p[2]]);
                let reason = p[3];
                self.forget_connection(handle);
                out.push(HciNotification::DisconnectionComplete { handle, reason });
            }
            EVT_ENCRYPTION_CHANGE => {
                if p.len() < 4 {
                    return;
                }
                out.push(HciNotification::EncryptionChange {
                    handle: u16::from_le_bytes([p[1], p[2]]),
                    status: p[0],
                    enabled: p[3] != 0,
                });
            }
            EVT_ENCRYPTION_KEY_REFRESH_COMPLETE => {
                if p.len() < 3 {
                    return;
                }
                out.push(HciNotification::EncryptionKeyRefresh {
                    handle: u16::from_le_bytes([p[1], p[2]]),
                    status: p[0],
                });
            }
            EVT_READ_REMOTE_VERSION_COMPLETE => {
                if p.len() < 8 {
                    return;
                }
                out.push(HciNotification::ReadRemoteVersionComplete {
                    handle: u16::from_le_bytes([p[1], p[2]]),
                    status: p[0],
                    version: p[3],
                    manufacturer: u16::from_le_bytes([p[4], p[5]]),
                    subversion: u16::from_le_bytes([p[6], p[7]]),
                });
            }
            EVT_HARDWARE_ERROR => {
                let code = p.first().copied().unwrap_or(0);
                warn!("controller hardware error 0x{:02X}", code);
                // No command progress can be trusted until a Reset
                self.pending_command = None;
                self.command_queue.clear();
                if let Some(cb) = self.hardware_error_callback.as_mut() {
                    cb(code);
                }
                out.push(HciNotification::HardwareError(code));
            }
            EVT_NUM_COMPLETED_PACKETS => {
                self.handle_completed_packets(p);
            }
            EVT_LE_META_EVENT => {
                if p.is_empty() {
                    return;
                }
                self.handle_le_meta(p[0], &p[1..], out);
            }
            other => {
                trace!("ignoring event 0x{:02X}", other);
            }
        }
    }

    /// Buffer-size responses always update credit accounting, no matter who
    /// issued the command.
    fn intercept_buffer_size(&mut self, cmd_opcode: u16, status: u8, ret: &[u8]) {
        if status != 0 {
            return;
        }
        if cmd_opcode == opcode(OGF_LE, OCF_LE_READ_BUFFER_SIZE) && ret.len() >= 3 {
            let mtu = u16::from_le_bytes([ret[0], ret[1]]) as usize;
            let buffers = ret[2] as u16;
            if mtu > 0 && buffers > 0 {
                self.acl_mtu = mtu.min(ACL_MTU_CAP);
                self.total_buffers = buffers;
                self.free_buffers = buffers;
                debug!("LE buffers: {} x {} bytes", buffers, self.acl_mtu);
            }
        } else if cmd_opcode == opcode(OGF_INFO_PARAM, OCF_READ_BUFFER_SIZE) && ret.len() >= 7 {
            let mtu = u16::from_le_bytes([ret[0], ret[1]]) as usize;
            let buffers = u16::from_le_bytes([ret[3], ret[4]]);
            if mtu > 0 && buffers > 0 {
                self.acl_mtu = mtu.min(ACL_MTU_CAP);
                self.total_buffers = buffers;
                self.free_buffers = buffers;
                debug!("shared buffers: {} x {} bytes", buffers, self.acl_mtu);
            }
        }
    }

    fn finish_command(&mut self, cmd_opcode: u16, status: u8, ret: &[u8]) {
        let matches = self
            .pending_command
            .as_ref()
            .map_or(false, |pending| pending.opcode == cmd_opcode);
        if !matches {
            // Another process may share the controller; not our command
            trace!("response for opcode 0x{:04X} is not ours", cmd_opcode);
            return;
        }
        let pending = self.pending_command.take().expect("matched above");
        if !pending.ignore_response {
            if let Some(cb) = pending.callback {
                cb(status, ret);
            }
        }
        self.dispatch_next_command();
    }

    fn handle_completed_packets(&mut self, p: &[u8]) {
        if p.is_empty() {
            return;
        }
        let count = p[0] as usize;
        if p.len() < 1 + count * 4 {
            return;
        }
        let mut fire = Vec::new();
        for i in 0..count {
            let base = 1 + i * 4;
            let handle = u16::from_le_bytes([p[base], p[base + 1]]);
            let completed = u16::from_le_bytes([p[base + 2], p[base + 3]]) as usize;
            if let Some(conn) = self.connections.get_mut(&handle) {
                // Clamp to what we actually have outstanding
                let n = completed.min(conn.outstanding.len());
                for _ in 0..n {
                    if let Some(cb) = conn.outstanding.pop_front().flatten() {
                        fire.push(cb);
                    }
                }
                self.free_buffers = (self.free_buffers + n as u16).min(self.total_buffers);
            }
        }
        for cb in fire {
            cb();
        }
        self.drain_acl();
    }

    fn handle_le_meta(&mut self, subevent: u8, p: &[u8], out: &mut Vec<HciNotification>) {
        match subevent {
            EVT_LE_CONN_COMPLETE | EVT_LE_ENHANCED_CONN_COMPLETE => {
                if p.len() < 18 {
                    return;
                }
                let status = p[0];
                let handle = u16::from_le_bytes([p[1], p[2]]);
                let role = Role::from(p[3]);
                let peer = Address::new(
                    AddressType::from(p[4]),
                    BdAddr::from_slice(&p[5..11]).expect("length checked"),
                );
                // The enhanced form inserts local/peer RPAs before the
                // connection parameters
                let rest = if subevent == EVT_LE_ENHANCED_CONN_COMPLETE {
                    if p.len() < 30 {
                        return;
                    }
                    &p[23..]
                } else {
                    &p[11..]
                };
                let complete = LeConnectionComplete {
                    status,
                    handle,
                    role,
                    peer,
                    conn_interval: u16::from_le_bytes([rest[0], rest[1]]),
                    conn_latency: u16::from_le_bytes([rest[2], rest[3]]),
                    supervision_timeout: u16::from_le_bytes([rest[4], rest[5]]),
                };
                if status == 0 {
                    self.connections
                        .insert(handle, AclConnection::new(handle, role, peer));
                }
                let slot = match role {
                    Role::Peripheral => self.adv_callback.take(),
                    Role::Central => self.conn_callback.take(),
                };
                if let Some(cb) = slot {
                    cb(&complete);
                }
                out.push(HciNotification::ConnectionComplete(complete));
            }
            EVT_LE_ADVERTISING_REPORT => {
                let reports = parse_advertising_reports(p);
                if !reports.is_empty() {
                    out.push(HciNotification::AdvertisingReports(reports));
                }
            }
            EVT_LE_EXTENDED_ADVERTISING_REPORT => {
                let reports = parse_extended_advertising_reports(p);
                if !reports.is_empty() {
                    out.push(HciNotification::ExtendedAdvertisingReports(reports));
                }
            }
            EVT_LE_CONN_UPDATE_COMPLETE => {
                if p.len() < 9 {
                    return;
                }
                out.push(HciNotification::LeConnectionUpdateComplete {
                    handle: u16::from_le_bytes([p[1], p[2]]),
                    status: p[0],
                    conn_interval: u16::from_le_bytes([p[3], p[4]]),
                    conn_latency: u16::from_le_bytes([p[5], p[6]]),
                    supervision_timeout: u16::from_le_bytes([p[7], p[8]]),
                });
            }
            EVT_LE_READ_REMOTE_FEATURES_COMPLETE => {
                if p.len() < 11 {
                    return;
                }
                let mut features = [0u8; 8];
                features.copy_from_slice(&p[3..11]);
                out.push(HciNotification::LeReadRemoteFeaturesComplete {
                    handle: u16::from_le_bytes([p[1], p[2]]),
                    status: p[0],
                    features,
                });
            }
            EVT_LE_LONG_TERM_KEY_REQUEST => {
                if p.len() < 12 {
                    return;
                }
                let mut rand = [0u8; 8];
                rand.copy_from_slice(&p[2..10]);
                out.push(HciNotification::LeLongTermKeyRequest {
                    handle: u16::from_le_bytes([p[0], p[1]]),
                    rand,
                    ediv: u16::from_le_bytes([p[10], p[11]]),
                });
            }
            EVT_LE_P256_PUBLIC_KEY_COMPLETE => {
                if p.len() < 65 {
                    return;
                }
                let mut key = [0u8; 64];
                key.copy_from_slice(&p[1..65]);
                out.push(HciNotification::LeP256PublicKeyComplete { status: p[0], key });
            }
            EVT_LE_GENERATE_DHKEY_COMPLETE => {
                if p.len() < 33 {
                    return;
                }
                let mut dh_key = [0u8; 32];
                dh_key.copy_from_slice(&p[1..33]);
                out.push(HciNotification::LeDhKeyComplete { status: p[0], dh_key });
            }
            EVT_LE_PHY_UPDATE_COMPLETE => {
                if p.len() < 5 {
                    return;
                }
                out.push(HciNotification::LePhyUpdateComplete {
                    handle: u16::from_le_bytes([p[1], p[2]]),
                    status: p[0],
                    tx_phy: p[3],
                    rx_phy: p[4],
                });
            }
            other => {
                trace!("ignoring LE subevent 0x{:02X}", other);
            }
        }
    }

    fn forget_connection(&mut self, handle: u16) {
        if let Some(conn) = self.connections.remove(&handle) {
            // Credits for packets the controller flushed come back here;
            // their completion callbacks are cancelled by the disconnect.
            let lost = conn.outstanding.len() as u16;
            self.free_buffers = (self.free_buffers + lost).min(self.total_buffers);
        }
        self.command_queue
            .retain(|cmd| cmd.assoc_handle != Some(handle));
        if let Some(pending) = self.pending_command.as_mut() {
            if pending.assoc_handle == Some(handle) {
                pending.ignore_response = true;
            }
        }
        self.drain_acl();
    }
}

fn parse_advertising_reports(p: &[u8]) -> Vec<AdvertisingReport> {
    let mut reports = Vec::new();
    if p.is_empty() {
        return reports;
    }
    let count = p[0] as usize;
    let mut i = 1;
    for _ in 0..count {
        if p.len() < i + 9 {
            break;
        }
        let event_type = p[i];
        let addr_type = p[i + 1];
        let addr = BdAddr::from_slice(&p[i + 2..i + 8]).expect("length checked");
        let data_len = p[i + 8] as usize;
        if p.len() < i + 9 + data_len + 1 {
            break;
        }
        let data = p[i + 9..i + 9 + data_len].to_vec();
        let rssi = p[i + 9 + data_len] as i8;
        reports.push(AdvertisingReport {
            event_type,
            address: Address::new(AddressType::from(addr_type), addr),
            data,
            rssi,
        });
        i += 10 + data_len;
    }
    reports
}

fn parse_extended_advertising_reports(p: &[u8]) -> Vec<ExtendedAdvertisingReport> {
    let mut reports = Vec::new();
    if p.is_empty() {
        return reports;
    }
    let count = p[0] as usize;
    let mut i = 1;
    for _ in 0..count {
        if p.len() < i + 24 {
            break;
        }
        let event_type = u16::from_le_bytes([p[i], p[i + 1]]);
        let addr_type = p[i + 2];
        let addr = BdAddr::from_slice(&p[i + 3..i + 9]).expect("length checked");
        let primary_phy = p[i + 9];
        let secondary_phy = p[i + 10];
        let advertising_sid = p[i + 11];
        let tx_power = p[i + 12] as i8;
        let rssi = p[i + 13] as i8;
        // periodic interval (2), direct address type (1), direct address (6)
        let data_len = p[i + 23] as usize;
        if p.len() < i + 24 + data_len {
            break;
        }
        let data = p[i + 24..i + 24 + data_len].to_vec();
        reports.push(ExtendedAdvertisingReport {
            event_type,
            address: Address::new(AddressType::from(addr_type), addr),
            primary_phy,
            secondary_phy,
            advertising_sid,
            tx_power,
            rssi,
            data,
        });
        i += 24 + data_len;
    }
    reports
}
