//! Host composition root
//!
//! [`BleHost`] ties the HCI adapter, the per-connection ATT bearers, the
//! GATT server database, the GATT client and the persistence store
//! together. The embedder owns the transport read loop and feeds complete
//! HCI packets to [`BleHost::handle_packet`]; user callbacks never run
//! while internal state is mid-transition, they are queued and drained at
//! the entry-point boundaries.

use crate::address::Address;
use crate::att::bearer::{AttBearer, AttContext, ServerInput};
use crate::att::constants::ATT_CID;
use crate::att::error::AttError;
use crate::error::Error;
use crate::gatt::client::{fail_client_ops, GattClientState};
use crate::gatt::server::{GattServerDb, LocalCharacteristic};
use crate::gatt::types::{ConnectionRef, EncryptionLevel};
use crate::hci::{
    AdvertisingReport, DataCallback, HciAdapter, HciNotification, LeConnectionComplete, Role,
};
use crate::store::Store;
use crate::transport::Transport;
use crate::util::DuplicateCache;
use log::{debug, info, trace, warn};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Instant;

/// A queued user callback, run with exclusive host access at a suspension
/// point.
pub(crate) type DeferredCall = Box<dyn FnOnce(&mut BleHost) + Send>;
pub(crate) type DeferQueue = Arc<Mutex<VecDeque<DeferredCall>>>;

/// How many distinct advertisers the scan-report duplicate filter tracks.
const ADV_CACHE_CAPACITY: usize = 128;

type StatusCallback = Box<dyn FnOnce(&mut BleHost, u8) + Send>;

/// Callbacks for per-connection HCI operations currently in flight.
#[derive(Default)]
pub(crate) struct PendingConnOps {
    pub conn_update: Option<StatusCallback>,
    pub read_remote_version: Option<Box<dyn FnOnce(&mut BleHost, u8, u8, u16, u16) + Send>>,
    pub read_remote_features: Option<Box<dyn FnOnce(&mut BleHost, u8, [u8; 8]) + Send>>,
    pub encryption_change: Option<Box<dyn FnOnce(&mut BleHost, u8, bool) + Send>>,
    pub phy_update: Option<Box<dyn FnOnce(&mut BleHost, u8, u8, u8) + Send>>,
}

/// Host-side state for one ACL connection.
pub(crate) struct Connection {
    pub info: ConnectionRef,
    pub role: Role,
    /// Identity address after IRK resolution; equals the connection
    /// address for non-resolvable peers
    pub identity: Address,
    pub bonded: bool,
    pub level: EncryptionLevel,
    pub att: AttBearer,
    pub client: GattClientState,
    pub pending: PendingConnOps,
}

type ConnectHandler = Box<dyn FnMut(&mut BleHost, ConnectionRef, Role) + Send>;
type DisconnectHandler = Box<dyn FnMut(&mut BleHost, ConnectionRef, u8) + Send>;
type NotificationHandler = Box<dyn FnMut(&mut BleHost, ConnectionRef, u16, Vec<u8>, bool) + Send>;
type TimeoutHandler = Box<dyn FnMut(&mut BleHost, ConnectionRef) + Send>;
type ReportHandler = Box<dyn FnMut(&AdvertisingReport) + Send>;
type LtkRequestHandler = Box<dyn FnMut(&mut BleHost, u16, [u8; 8], u16) + Send>;
type L2capHandler = Box<dyn FnMut(&mut BleHost, u16, u16, Vec<u8>) + Send>;

#[derive(Default)]
struct HostCallbacks {
    on_connect: Option<ConnectHandler>,
    on_disconnect: Option<DisconnectHandler>,
    on_notification: Option<NotificationHandler>,
    on_att_timeout: Option<TimeoutHandler>,
    on_advertising_report: Option<ReportHandler>,
    on_ltk_request: Option<LtkRequestHandler>,
    on_l2cap_data: Option<L2capHandler>,
}

/// The BLE host stack.
pub struct BleHost {
    pub(crate) adapter: HciAdapter,
    pub(crate) gatt_db: GattServerDb,
    pub(crate) store: Store,
    pub(crate) connections: HashMap<u16, Connection>,
    pub(crate) defer: DeferQueue,
    pub(crate) own_address: Option<Address>,
    callbacks: HostCallbacks,
    adv_filter: Option<DuplicateCache<Address, ()>>,
}

impl BleHost {
    pub fn new(transport: Box<dyn Transport>, store: Store) -> Self {
        Self {
            adapter: HciAdapter::new(transport),
            gatt_db: GattServerDb::new(),
            store,
            connections: HashMap::new(),
            defer: Arc::new(Mutex::new(VecDeque::new())),
            own_address: None,
            callbacks: HostCallbacks::default(),
            adv_filter: None,
        }
    }

    /// The GATT server database, for adding and removing services.
    pub fn gatt_db(&mut self) -> &mut GattServerDb {
        &mut self.gatt_db
    }

    /// Direct access to the HCI adapter for raw command issuing.
    pub fn adapter(&mut self) -> &mut HciAdapter {
        &mut self.adapter
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Our public address, known once [`BleHost::initialize`] completed.
    pub fn own_address(&self) -> Option<Address> {
        self.own_address
    }

    /// Overrides the own address used as the persistence key, for stacks
    /// running on a static random address.
    pub fn set_own_address(&mut self, address: Address) {
        self.own_address = Some(address);
    }

    /// Stops the adapter; every further operation is inert.
    pub fn stop(&mut self) {
        self.adapter.stop();
    }

    // --- User callbacks -------------------------------------------------

    pub fn set_connect_callback(
        &mut self,
        f: impl FnMut(&mut BleHost, ConnectionRef, Role) + Send + 'static,
    ) {
        self.callbacks.on_connect = Some(Box::new(f));
    }

    pub fn set_disconnect_callback(
        &mut self,
        f: impl FnMut(&mut BleHost, ConnectionRef, u8) + Send + 'static,
    ) {
        self.callbacks.on_disconnect = Some(Box::new(f));
    }

    /// Receives inbound notifications and indications from peers we are a
    /// client of. For indications the handler must call
    /// [`BleHost::confirm_indication`].
    pub fn set_notification_callback(
        &mut self,
        f: impl FnMut(&mut BleHost, ConnectionRef, u16, Vec<u8>, bool) + Send + 'static,
    ) {
        self.callbacks.on_notification = Some(Box::new(f));
    }

    /// Fires when a connection's ATT bearer dies of a transaction timeout.
    pub fn set_att_timeout_callback(
        &mut self,
        f: impl FnMut(&mut BleHost, ConnectionRef) + Send + 'static,
    ) {
        self.callbacks.on_att_timeout = Some(Box::new(f));
    }

    /// Receives scan reports. With `filter_duplicates`, repeated reports
    /// from the same advertiser are suppressed through a bounded cache.
    pub fn set_advertising_report_callback(
        &mut self,
        filter_duplicates: bool,
        f: impl FnMut(&AdvertisingReport) + Send + 'static,
    ) {
        self.adv_filter = filter_duplicates.then(|| DuplicateCache::new(ADV_CACHE_CAPACITY));
        self.callbacks.on_advertising_report = Some(Box::new(f));
    }

    /// Receives LE Long Term Key Request events; the handler replies via
    /// the adapter's LTK reply commands.
    pub fn set_ltk_request_callback(
        &mut self,
        f: impl FnMut(&mut BleHost, u16, [u8; 8], u16) + Send + 'static,
    ) {
        self.callbacks.on_ltk_request = Some(Box::new(f));
    }

    /// Receives L2CAP PDUs on channels the host does not consume itself
    /// (e.g. CID 0x0006 for an external SMP implementation).
    pub fn set_l2cap_data_callback(
        &mut self,
        f: impl FnMut(&mut BleHost, u16, u16, Vec<u8>) + Send + 'static,
    ) {
        self.callbacks.on_l2cap_data = Some(Box::new(f));
    }

    // --- Bring-up -------------------------------------------------------

    /// Runs the controller bring-up command chain: reset, event masks,
    /// buffer sizes, own address. The callback fires with the public
    /// address once done.
    pub fn initialize(
        &mut self,
        done: impl FnOnce(&mut BleHost, Result<Address, Error>) + Send + 'static,
    ) {
        let defer = self.defer.clone();
        self.adapter.reset(Box::new(move |status, _| {
            defer.lock().unwrap().push_back(Box::new(move |host| {
                if status != 0 {
                    done(host, Err(Error::Hci(crate::error::HciError::HardwareError(status))));
                    return;
                }
                host.init_masks(done);
            }));
        }));
    }

    fn init_masks(
        &mut self,
        done: impl FnOnce(&mut BleHost, Result<Address, Error>) + Send + 'static,
    ) {
        self.adapter.set_event_mask(0x3FFF_FFFF_FFFF_FFFF, Box::new(|_, _| {}));
        self.adapter.le_set_event_mask(0x0000_0000_001F_FFFF, Box::new(|_, _| {}));
        let defer = self.defer.clone();
        self.adapter.le_read_buffer_size(Box::new(move |status, ret| {
            // A zero LE buffer count means the controller shares its
            // BR/EDR buffers; sizes were captured by the adapter either way
            let shared = status != 0 || ret.len() < 3 || ret[..2] == [0, 0] || ret[2] == 0;
            defer.lock().unwrap().push_back(Box::new(move |host| {
                if shared {
                    host.adapter.read_buffer_size(Box::new(|_, _| {}));
                }
                host.init_read_address(done);
            }));
        }));
    }

    fn init_read_address(
        &mut self,
        done: impl FnOnce(&mut BleHost, Result<Address, Error>) + Send + 'static,
    ) {
        let defer = self.defer.clone();
        self.adapter.read_bd_addr(Box::new(move |status, ret| {
            let address = if status == 0 && ret.len() >= 6 {
                crate::address::BdAddr::from_slice(ret).map(Address::public)
            } else {
                None
            };
            defer.lock().unwrap().push_back(Box::new(move |host| match address {
                Some(address) => {
                    if host.own_address.is_none() {
                        host.own_address = Some(address);
                    }
                    info!("controller address {}", address);
                    done(host, Ok(address));
                }
                None => done(
                    host,
                    Err(Error::Hci(crate::error::HciError::InvalidPacketFormat)),
                ),
            }));
        }));
    }

    // --- Main loop ------------------------------------------------------

    /// Feeds one complete HCI packet from the transport.
    pub fn handle_packet(&mut self, packet: &[u8]) {
        let notifications = self.adapter.handle_packet(packet);
        for notification in notifications {
            self.route_notification(notification);
        }
        self.drain_deferred();
    }

    /// Fires any expired ATT transaction timers and returns the next
    /// deadline the embedder should wake up at.
    pub fn poll_timers(&mut self, now: Instant) -> Option<Instant> {
        let handles: Vec<u16> = self.connections.keys().copied().collect();
        for handle in handles {
            let died = match self.connections.get_mut(&handle) {
                Some(conn) => conn.att.poll_timeout(now),
                None => false,
            };
            if died {
                self.att_bearer_died(handle);
            }
        }
        self.drain_deferred();
        self.connections
            .values()
            .filter_map(|c| c.att.next_deadline())
            .min()
    }

    pub(crate) fn drain_deferred(&mut self) {
        loop {
            let job = self.defer.lock().unwrap().pop_front();
            match job {
                Some(job) => job(self),
                None => break,
            }
        }
    }

    fn route_notification(&mut self, notification: HciNotification) {
        match notification {
            HciNotification::ConnectionComplete(complete) => {
                self.on_connection_complete(complete)
            }
            HciNotification::DisconnectionComplete { handle, reason } => {
                self.on_disconnection(handle, reason)
            }
            HciNotification::AclData { handle, cid, pdu } => {
                if cid == ATT_CID {
                    self.on_att_pdu(handle, &pdu);
                } else if let Some(mut cb) = self.callbacks.on_l2cap_data.take() {
                    cb(self, handle, cid, pdu);
                    if self.callbacks.on_l2cap_data.is_none() {
                        self.callbacks.on_l2cap_data = Some(cb);
                    }
                } else {
                    trace!("L2CAP PDU on unhandled CID 0x{:04X}", cid);
                }
            }
            HciNotification::EncryptionChange {
                handle,
                status,
                enabled,
            } => self.on_encryption_change(handle, status, enabled),
            HciNotification::EncryptionKeyRefresh { handle, status } => {
                if status != 0 {
                    if let Some(conn) = self.connections.get_mut(&handle) {
                        conn.level = EncryptionLevel::default();
                    }
                }
            }
            HciNotification::ReadRemoteVersionComplete {
                handle,
                status,
                version,
                manufacturer,
                subversion,
            } => {
                if let Some(cb) = self
                    .connections
                    .get_mut(&handle)
                    .and_then(|c| c.pending.read_remote_version.take())
                {
                    cb(self, status, version, manufacturer, subversion);
                }
            }
            HciNotification::LeReadRemoteFeaturesComplete {
                handle,
                status,
                features,
            } => {
                if let Some(cb) = self
                    .connections
                    .get_mut(&handle)
                    .and_then(|c| c.pending.read_remote_features.take())
                {
                    cb(self, status, features);
                }
            }
            HciNotification::LeConnectionUpdateComplete { handle, status, .. } => {
                if let Some(cb) = self
                    .connections
                    .get_mut(&handle)
                    .and_then(|c| c.pending.conn_update.take())
                {
                    cb(self, status);
                }
            }
            HciNotification::LePhyUpdateComplete {
                handle,
                status,
                tx_phy,
                rx_phy,
            } => {
                if let Some(cb) = self
                    .connections
                    .get_mut(&handle)
                    .and_then(|c| c.pending.phy_update.take())
                {
                    cb(self, status, tx_phy, rx_phy);
                }
            }
            HciNotification::LeLongTermKeyRequest { handle, rand, ediv } => {
                if let Some(mut cb) = self.callbacks.on_ltk_request.take() {
                    cb(self, handle, rand, ediv);
                    if self.callbacks.on_ltk_request.is_none() {
                        self.callbacks.on_ltk_request = Some(cb);
                    }
                } else {
                    // Without a handler nothing can produce the key
                    self.adapter
                        .le_long_term_key_request_negative_reply(handle, Box::new(|_, _| {}));
                }
            }
            HciNotification::AdvertisingReports(reports) => {
                for report in reports {
                    let duplicate = match self.adv_filter.as_mut() {
                        Some(filter) => !filter.add(report.address, ()),
                        None => false,
                    };
                    if duplicate {
                        continue;
                    }
                    if let Some(cb) = self.callbacks.on_advertising_report.as_mut() {
                        cb(&report);
                    }
                }
            }
            HciNotification::ExtendedAdvertisingReports(reports) => {
                for report in reports {
                    let duplicate = match self.adv_filter.as_mut() {
                        Some(filter) => !filter.add(report.address, ()),
                        None => false,
                    };
                    if duplicate {
                        continue;
                    }
                    let legacy = AdvertisingReport {
                        event_type: (report.event_type & 0xFF) as u8,
                        address: report.address,
                        data: report.data,
                        rssi: report.rssi,
                    };
                    if let Some(cb) = self.callbacks.on_advertising_report.as_mut() {
                        cb(&legacy);
                    }
                }
            }
            HciNotification::LeP256PublicKeyComplete { .. }
            | HciNotification::LeDhKeyComplete { .. } => {
                // Pairing crypto is outside this host; an external SMP can
                // observe these through its own adapter commands
            }
            HciNotification::HardwareError(code) => {
                warn!("hardware error 0x{:02X} surfaced to the embedder", code);
            }
        }
    }

    fn on_connection_complete(&mut self, complete: LeConnectionComplete) {
        if complete.status != 0 {
            debug!("connection attempt failed with status 0x{:02X}", complete.status);
            return;
        }
        let handle = complete.handle;
        let peer = complete.peer;
        let own = self.own_address;

        // Resolve the identity behind a resolvable private address
        let identity = own
            .filter(|_| peer.is_resolvable_random())
            .and_then(|own| self.store.resolve_address(own, peer))
            .unwrap_or(peer);
        let bonded = own.map_or(false, |own| self.store.is_bonded(own, identity));

        let info = ConnectionRef { handle, peer };
        let mut client = GattClientState::new();
        if let Some(own) = own {
            client.load_cache(&self.store, own, identity, bonded);
        }
        let conn = Connection {
            info,
            role: complete.role,
            identity,
            bonded,
            level: EncryptionLevel::default(),
            att: AttBearer::new(handle),
            client,
            pending: PendingConnOps::default(),
        };

        if bonded {
            // Phase 1: restore persisted CCCDs before any ATT traffic,
            // phase 2: announce the restored subscriptions
            if let Some(own) = own {
                let stored = self.store.get_all_cccds(own, identity);
                self.gatt_db.connection_opened_phase1(handle, &stored);
            }
            self.gatt_db.connection_opened_phase2(&info);
        }
        let role = conn.role;
        self.connections.insert(handle, conn);
        info!("connected 0x{:03X} to {} ({:?})", handle, peer, role);

        if let Some(mut cb) = self.callbacks.on_connect.take() {
            let defer = self.defer.clone();
            defer.lock().unwrap().push_back(Box::new(move |host| {
                cb(host, info, role);
                if host.callbacks.on_connect.is_none() {
                    host.callbacks.on_connect = Some(cb);
                }
            }));
        }
    }

    fn on_disconnection(&mut self, handle: u16, reason: u8) {
        let Some(mut conn) = self.connections.remove(&handle) else {
            return;
        };
        debug!("disconnected 0x{:03X}, reason 0x{:02X}", handle, reason);
        self.gatt_db.connection_closed(&conn.info);
        conn.att.die(AttError::Disconnected);
        let info = conn.info;
        let ops = conn.client.take_ops();
        let defer = self.defer.clone();
        defer.lock().unwrap().push_back(Box::new(move |host| {
            fail_client_ops(host, ops, AttError::Disconnected);
            if let Some(mut cb) = host.callbacks.on_disconnect.take() {
                cb(host, info, reason);
                if host.callbacks.on_disconnect.is_none() {
                    host.callbacks.on_disconnect = Some(cb);
                }
            }
        }));
    }

    fn on_att_pdu(&mut self, handle: u16, pdu: &[u8]) {
        let own = self.own_address;
        let Some(conn) = self.connections.get_mut(&handle) else {
            return;
        };
        let has_ltk = match own {
            Some(own) => self.store.has_ltk(own, conn.identity),
            None => false,
        };
        let mut ctx = AttContext {
            adapter: &mut self.adapter,
            db: &mut self.gatt_db,
            conn: conn.info,
            level: conn.level,
            has_ltk,
            bonded: conn.bonded,
            defer: self.defer.clone(),
        };
        conn.att.handle_pdu(&mut ctx, pdu);
    }

    fn on_encryption_change(&mut self, handle: u16, status: u8, enabled: bool) {
        let own = self.own_address;
        if let Some(conn) = self.connections.get_mut(&handle) {
            if status == 0 && enabled {
                let keys = own.and_then(|own| self.store.get_keys(own, conn.identity));
                conn.level = EncryptionLevel {
                    encrypted: true,
                    mitm: keys.as_ref().map_or(false, |k| k.mitm),
                    sc: keys.as_ref().map_or(false, |k| k.sc),
                };
            } else {
                conn.level = EncryptionLevel::default();
            }
            if let Some(cb) = conn.pending.encryption_change.take() {
                cb(self, status, enabled);
            }
        }
    }

    fn att_bearer_died(&mut self, handle: u16) {
        let Some(conn) = self.connections.get_mut(&handle) else {
            return;
        };
        let info = conn.info;
        let ops = conn.client.take_ops();
        let defer = self.defer.clone();
        defer.lock().unwrap().push_back(Box::new(move |host| {
            fail_client_ops(host, ops, AttError::Timeout);
            if let Some(mut cb) = host.callbacks.on_att_timeout.take() {
                cb(host, info);
                if host.callbacks.on_att_timeout.is_none() {
                    host.callbacks.on_att_timeout = Some(cb);
                }
            }
        }));
    }

    // --- Server-initiated traffic ---------------------------------------

    /// Sends a notification for a characteristic the peer subscribed to.
    pub fn notify(
        &mut self,
        handle: u16,
        characteristic: LocalCharacteristic,
        value: &[u8],
        on_sent: Option<DataCallback>,
        on_complete: Option<DataCallback>,
    ) -> Result<(), Error> {
        let props = self
            .gatt_db
            .char_properties(characteristic.value_handle)
            .ok_or_else(|| Error::invalid_argument("unknown characteristic"))?;
        if !props.can_notify() {
            return Err(Error::invalid_argument(
                "characteristic has no notify property",
            ));
        }
        if self.gatt_db.subscription_bits(handle, characteristic.value_handle) & 0x01 == 0 {
            return Err(Error::NotSubscribed);
        }
        if self.adapter.is_disconnecting(handle) {
            return Err(Error::Disconnecting);
        }
        let conn = self.connections.get_mut(&handle).ok_or(Error::NotConnected)?;
        conn.att.notify(
            &mut self.adapter,
            characteristic.value_handle,
            value,
            on_sent,
            on_complete,
        );
        Ok(())
    }

    /// Sends an indication; the callback fires on the peer's confirmation
    /// or on timeout.
    pub fn indicate(
        &mut self,
        handle: u16,
        characteristic: LocalCharacteristic,
        value: &[u8],
        done: impl FnOnce(Result<(), AttError>) + Send + 'static,
    ) -> Result<(), Error> {
        let props = self
            .gatt_db
            .char_properties(characteristic.value_handle)
            .ok_or_else(|| Error::invalid_argument("unknown characteristic"))?;
        if !props.can_indicate() {
            return Err(Error::invalid_argument(
                "characteristic has no indicate property",
            ));
        }
        if self.gatt_db.subscription_bits(handle, characteristic.value_handle) & 0x02 == 0 {
            return Err(Error::NotSubscribed);
        }
        if self.adapter.is_disconnecting(handle) {
            return Err(Error::Disconnecting);
        }
        let conn = self.connections.get_mut(&handle).ok_or(Error::NotConnected)?;
        conn.att.indicate(
            &mut self.adapter,
            characteristic.value_handle,
            value,
            Box::new(done),
        );
        Ok(())
    }

    /// Confirms the most recent inbound indication. The notification
    /// callback is responsible for calling this.
    pub fn confirm_indication(&mut self, handle: u16) {
        if let Some(conn) = self.connections.get_mut(&handle) {
            conn.att.send_confirmation(&mut self.adapter);
        }
    }

    // --- Per-connection HCI operations ----------------------------------

    pub fn disconnect(&mut self, handle: u16, reason: u8) {
        self.adapter.disconnect(handle, reason);
    }

    pub fn connection_update(
        &mut self,
        handle: u16,
        interval_min: u16,
        interval_max: u16,
        latency: u16,
        supervision_timeout: u16,
        done: impl FnOnce(&mut BleHost, u8) + Send + 'static,
    ) -> Result<(), Error> {
        if self.adapter.is_disconnecting(handle) {
            return Err(Error::Disconnecting);
        }
        let conn = self.connections.get_mut(&handle).ok_or(Error::NotConnected)?;
        if conn.pending.conn_update.is_some() {
            return Err(Error::Busy);
        }
        conn.pending.conn_update = Some(Box::new(done));
        let defer = self.defer.clone();
        self.adapter.le_connection_update(
            handle,
            interval_min,
            interval_max,
            latency,
            supervision_timeout,
            Box::new(move |status, _| {
                if status != 0 {
                    defer.lock().unwrap().push_back(Box::new(move |host| {
                        if let Some(cb) = host
                            .connections
                            .get_mut(&handle)
                            .and_then(|c| c.pending.conn_update.take())
                        {
                            cb(host, status);
                        }
                    }));
                }
            }),
        );
        Ok(())
    }

    pub fn read_remote_version(
        &mut self,
        handle: u16,
        done: impl FnOnce(&mut BleHost, u8, u8, u16, u16) + Send + 'static,
    ) -> Result<(), Error> {
        if self.adapter.is_disconnecting(handle) {
            return Err(Error::Disconnecting);
        }
        let conn = self.connections.get_mut(&handle).ok_or(Error::NotConnected)?;
        if conn.pending.read_remote_version.is_some() {
            return Err(Error::Busy);
        }
        conn.pending.read_remote_version = Some(Box::new(done));
        self.adapter.read_remote_version(handle, Box::new(|_, _| {}));
        Ok(())
    }

    pub fn read_remote_features(
        &mut self,
        handle: u16,
        done: impl FnOnce(&mut BleHost, u8, [u8; 8]) + Send + 'static,
    ) -> Result<(), Error> {
        if self.adapter.is_disconnecting(handle) {
            return Err(Error::Disconnecting);
        }
        let conn = self.connections.get_mut(&handle).ok_or(Error::NotConnected)?;
        if conn.pending.read_remote_features.is_some() {
            return Err(Error::Busy);
        }
        conn.pending.read_remote_features = Some(Box::new(done));
        self.adapter.le_read_remote_features(handle, Box::new(|_, _| {}));
        Ok(())
    }

    pub fn set_phy(
        &mut self,
        handle: u16,
        tx_phys: u8,
        rx_phys: u8,
        done: impl FnOnce(&mut BleHost, u8, u8, u8) + Send + 'static,
    ) -> Result<(), Error> {
        if self.adapter.is_disconnecting(handle) {
            return Err(Error::Disconnecting);
        }
        let conn = self.connections.get_mut(&handle).ok_or(Error::NotConnected)?;
        if conn.pending.phy_update.is_some() {
            return Err(Error::Busy);
        }
        conn.pending.phy_update = Some(Box::new(done));
        self.adapter.le_set_phy(handle, 0, tx_phys, rx_phys, Box::new(|_, _| {}));
        Ok(())
    }

    /// Arms the encryption-change callback the external pairing logic can
    /// wait on before retrying a security-gated operation.
    pub fn on_encryption_changed(
        &mut self,
        handle: u16,
        done: impl FnOnce(&mut BleHost, u8, bool) + Send + 'static,
    ) -> Result<(), Error> {
        let conn = self.connections.get_mut(&handle).ok_or(Error::NotConnected)?;
        conn.pending.encryption_change = Some(Box::new(done));
        Ok(())
    }

    // --- Bond bookkeeping -----------------------------------------------

    /// Marks a live connection as bonded (called by the embedder's pairing
    /// logic once keys are distributed) and persists its current CCCDs.
    pub fn set_bonded(&mut self, handle: u16) -> Result<(), Error> {
        let own = self.own_address.ok_or(Error::NotConnected)?;
        let conn = self.connections.get_mut(&handle).ok_or(Error::NotConnected)?;
        conn.bonded = true;
        let identity = conn.identity;
        for (cccd_handle, bits) in self.gatt_db.current_cccds(handle) {
            self.store.store_cccd(own, identity, cccd_handle, bits);
        }
        Ok(())
    }

    /// The resolved identity address of a live connection.
    pub fn identity_address(&self, handle: u16) -> Option<Address> {
        self.connections.get(&handle).map(|c| c.identity)
    }

    pub fn is_connected(&self, handle: u16) -> bool {
        self.connections.contains_key(&handle)
    }

    // --- Internal plumbing used by deferred completions -----------------

    /// Routes an attribute-handler completion back into the right bearer.
    pub(crate) fn attribute_response(&mut self, handle: u16, generation: u64, input: ServerInput) {
        let own = self.own_address;
        let Some(conn) = self.connections.get_mut(&handle) else {
            trace!("attribute completion for a vanished connection");
            return;
        };
        let has_ltk = match own {
            Some(own) => self.store.has_ltk(own, conn.identity),
            None => false,
        };
        let mut ctx = AttContext {
            adapter: &mut self.adapter,
            db: &mut self.gatt_db,
            conn: conn.info,
            level: conn.level,
            has_ltk,
            bonded: conn.bonded,
            defer: self.defer.clone(),
        };
        conn.att.attribute_response(&mut ctx, generation, input);
    }

    /// Persists a CCCD change for a bonded connection.
    pub(crate) fn persist_cccd(&mut self, conn: ConnectionRef, cccd_handle: u16, bits: u8) {
        let Some(own) = self.own_address else {
            return;
        };
        if let Some(connection) = self.connections.get(&conn.handle) {
            self.store.store_cccd(own, connection.identity, cccd_handle, bits);
        }
    }

    /// Hands an inbound notification or indication to the user callback.
    pub(crate) fn deliver_notification(
        &mut self,
        conn: ConnectionRef,
        handle: u16,
        value: Vec<u8>,
        is_indication: bool,
    ) {
        if let Some(mut cb) = self.callbacks.on_notification.take() {
            cb(self, conn, handle, value, is_indication);
            if self.callbacks.on_notification.is_none() {
                self.callbacks.on_notification = Some(cb);
            }
        } else if is_indication {
            // Nobody to confirm it otherwise
            self.confirm_indication(conn.handle);
        }
    }
}
