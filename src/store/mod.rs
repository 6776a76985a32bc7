//! On-disk persistence for bonds and GATT caches
//!
//! Layout, per own address (directory `TT-AA-AA-AA-BB-BB-BB`):
//!
//! ```text
//! bonds/<peer>/keys.json
//! bonds/<peer>/gatt_client_cache.json
//! bonds/<peer>/gatt_server_cccds/XXXX.json
//! unbonded/<peer>/gatt_client_cache.json
//! ```
//!
//! Unbonded GATT caches go through a bounded FIFO; evicted entries lose
//! their file. All file I/O is best-effort: write failures are logged and
//! swallowed, unreadable or out-of-domain entries are ignored on load.

use crate::address::Address;
use crate::gatt::cache::GattCacheData;
use crate::util::DuplicateCache;
use aes::cipher::{generic_array::GenericArray, BlockEncrypt, KeyInit};
use aes::Aes128;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

/// Default bound on unbonded GATT caches kept per own address.
pub const UNBONDED_CACHE_CAPACITY: usize = 50;

/// A Long-Term Key with its identifying material.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LongTermKey {
    pub rand: [u8; 8],
    pub ediv: u16,
    pub ltk: [u8; 16],
}

/// Everything remembered about a bonded peer's keys.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BondKeys {
    pub mitm: bool,
    pub sc: bool,
    /// Peer IRK, little-endian as distributed over SMP
    pub irk: Option<[u8; 16]>,
    pub local_ltk: Option<LongTermKey>,
    pub peer_ltk: Option<LongTermKey>,
}

#[derive(Serialize, Deserialize)]
struct LtkFile {
    rand: String,
    ediv: u16,
    ltk: String,
}

#[derive(Serialize, Deserialize)]
struct KeysFile {
    mitm: bool,
    sc: bool,
    irk: Option<String>,
    #[serde(rename = "localLtk")]
    local_ltk: Option<LtkFile>,
    #[serde(rename = "peerLtk")]
    peer_ltk: Option<LtkFile>,
}

struct BondEntry {
    keys: Option<BondKeys>,
    /// AES-128 pre-keyed with the byte-reversed IRK, ready for `ah`
    irk_cipher: Option<Aes128>,
    cccds: HashMap<u16, u8>,
    gatt_cache: Option<GattCacheData>,
}

impl BondEntry {
    fn empty() -> Self {
        Self {
            keys: None,
            irk_cipher: None,
            cccds: HashMap::new(),
            gatt_cache: None,
        }
    }
}

struct OwnEntry {
    bonds: HashMap<Address, BondEntry>,
    /// FIFO of unbonded peers with a cache on disk, oldest first
    unbonded: DuplicateCache<Address, GattCacheData>,
}

/// The persistence store. Construct once and hand to the host; keyed by
/// (own address, peer address). Not safe to share a directory between
/// processes.
pub struct Store {
    base_dir: PathBuf,
    unbonded_capacity: usize,
    entries: Mutex<HashMap<Address, OwnEntry>>,
}

impl Store {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self::with_unbonded_capacity(base_dir, UNBONDED_CACHE_CAPACITY)
    }

    pub fn with_unbonded_capacity(base_dir: impl Into<PathBuf>, capacity: usize) -> Self {
        Self {
            base_dir: base_dir.into(),
            unbonded_capacity: capacity,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn own_dir(&self, own: Address) -> PathBuf {
        self.base_dir.join(own.to_dir_name())
    }

    fn bond_dir(&self, own: Address, peer: Address) -> PathBuf {
        self.own_dir(own).join("bonds").join(peer.to_dir_name())
    }

    fn unbonded_dir(&self, own: Address, peer: Address) -> PathBuf {
        self.own_dir(own).join("unbonded").join(peer.to_dir_name())
    }

    /// Runs `f` with the lazily-loaded entry for `own`.
    fn with_entry<R>(&self, own: Address, f: impl FnOnce(&mut OwnEntry) -> R) -> R {
        let mut entries = self.entries.lock().unwrap();
        let entry = entries.entry(own).or_insert_with(|| self.load_own(own));
        f(entry)
    }

    fn load_own(&self, own: Address) -> OwnEntry {
        let mut bonds = HashMap::new();
        let bonds_dir = self.own_dir(own).join("bonds");
        for peer in list_address_dirs(&bonds_dir) {
            let dir = bonds_dir.join(peer.to_dir_name());
            let mut bond = BondEntry::empty();
            if let Some(keys) = read_keys_file(&dir.join("keys.json")) {
                bond.irk_cipher = keys.irk.map(|irk| irk_cipher(&irk));
                bond.keys = Some(keys);
            }
            bond.gatt_cache = read_json(&dir.join("gatt_client_cache.json"));
            bond.cccds = read_cccd_dir(&dir.join("gatt_server_cccds"));
            bonds.insert(peer, bond);
        }

        let unbonded_root = self.own_dir(own).join("unbonded");
        let mut caches: Vec<(Address, GattCacheData)> = list_address_dirs(&unbonded_root)
            .into_iter()
            .filter_map(|peer| {
                let path = unbonded_root.join(peer.to_dir_name()).join("gatt_client_cache.json");
                read_json::<GattCacheData>(&path).map(|data| (peer, data))
            })
            .collect();
        // FIFO order mirrors age
        caches.sort_by_key(|(_, data)| data.timestamp);

        let mut unbonded = DuplicateCache::new(self.unbonded_capacity.max(1));
        let root = unbonded_root.clone();
        unbonded.set_eviction_callback(move |peer: &Address, _| {
            let dir = root.join(peer.to_dir_name());
            if let Err(err) = fs::remove_dir_all(&dir) {
                debug!("failed to remove evicted cache {}: {}", dir.display(), err);
            }
        });
        for (peer, data) in caches {
            unbonded.add(peer, data);
        }

        OwnEntry { bonds, unbonded }
    }

    /// True when any key material is stored for the peer.
    pub fn is_bonded(&self, own: Address, peer: Address) -> bool {
        self.with_entry(own, |entry| {
            entry.bonds.get(&peer).map_or(false, |b| b.keys.is_some())
        })
    }

    /// True when an LTK is stored for the peer, which decides between the
    /// insufficient-encryption and insufficient-authentication errors.
    pub fn has_ltk(&self, own: Address, peer: Address) -> bool {
        self.with_entry(own, |entry| {
            entry
                .bonds
                .get(&peer)
                .and_then(|b| b.keys.as_ref())
                .map_or(false, |k| k.local_ltk.is_some() || k.peer_ltk.is_some())
        })
    }

    /// Overwrites the stored keys for a bond, in memory and on disk.
    pub fn store_keys(&self, own: Address, peer: Address, keys: BondKeys) {
        let dir = self.bond_dir(own, peer);
        let file = KeysFile {
            mitm: keys.mitm,
            sc: keys.sc,
            irk: keys.irk.map(hex::encode),
            local_ltk: keys.local_ltk.as_ref().map(ltk_to_file),
            peer_ltk: keys.peer_ltk.as_ref().map(ltk_to_file),
        };
        write_json(&dir.join("keys.json"), &file);

        self.with_entry(own, |entry| {
            let bond = entry.bonds.entry(peer).or_insert_with(BondEntry::empty);
            bond.irk_cipher = keys.irk.map(|irk| irk_cipher(&irk));
            bond.keys = Some(keys);
        });
    }

    pub fn get_keys(&self, own: Address, peer: Address) -> Option<BondKeys> {
        self.with_entry(own, |entry| {
            entry.bonds.get(&peer).and_then(|b| b.keys.clone())
        })
    }

    /// Resolves a resolvable private address against every stored IRK,
    /// returning the matching identity address.
    pub fn resolve_address(&self, own: Address, random: Address) -> Option<Address> {
        if !random.is_resolvable_random() {
            return None;
        }
        let b = &random.addr.bytes;
        // Upper 24 bits are prand, lower 24 the hash, both little-endian
        let prand = [b[5], b[4], b[3]];
        let hash = [b[2], b[1], b[0]];
        self.with_entry(own, |entry| {
            entry
                .bonds
                .iter()
                .find(|(_, bond)| {
                    bond.irk_cipher
                        .as_ref()
                        .map_or(false, |cipher| ah_matches(cipher, &prand, &hash))
                })
                .map(|(peer, _)| *peer)
        })
    }

    /// Persists a CCCD value for a bonded peer; writes only on change.
    pub fn store_cccd(&self, own: Address, peer: Address, handle: u16, value: u8) {
        if value > 3 {
            warn!("refusing to store out-of-domain CCCD value {}", value);
            return;
        }
        let changed = self.with_entry(own, |entry| {
            let bond = entry.bonds.entry(peer).or_insert_with(BondEntry::empty);
            if bond.cccds.get(&handle) == Some(&value) {
                false
            } else {
                bond.cccds.insert(handle, value);
                true
            }
        });
        if changed {
            let dir = self.bond_dir(own, peer).join("gatt_server_cccds");
            write_json(&dir.join(format!("{:04X}.json", handle)), &value);
        }
    }

    pub fn get_cccd(&self, own: Address, peer: Address, handle: u16) -> Option<u8> {
        self.with_entry(own, |entry| {
            entry.bonds.get(&peer).and_then(|b| b.cccds.get(&handle).copied())
        })
    }

    /// Every stored CCCD for the peer, for restoring subscriptions on a
    /// bonded reconnect.
    pub fn get_all_cccds(&self, own: Address, peer: Address) -> Vec<(u16, u8)> {
        self.with_entry(own, |entry| {
            entry
                .bonds
                .get(&peer)
                .map(|b| b.cccds.iter().map(|(&h, &v)| (h, v)).collect())
                .unwrap_or_default()
        })
    }

    /// Persists the GATT client cache for a peer. Unbonded peers flow
    /// through the bounded FIFO.
    pub fn store_gatt_cache(
        &self,
        own: Address,
        peer: Address,
        is_bonded: bool,
        data: &GattCacheData,
    ) {
        if is_bonded {
            write_json(
                &self.bond_dir(own, peer).join("gatt_client_cache.json"),
                data,
            );
            self.with_entry(own, |entry| {
                let bond = entry.bonds.entry(peer).or_insert_with(BondEntry::empty);
                bond.gatt_cache = Some(data.clone());
            });
        } else {
            write_json(
                &self.unbonded_dir(own, peer).join("gatt_client_cache.json"),
                data,
            );
            self.with_entry(own, |entry| {
                entry.unbonded.add(peer, data.clone());
            });
        }
    }

    pub fn get_gatt_cache(
        &self,
        own: Address,
        peer: Address,
        is_bonded: bool,
    ) -> Option<GattCacheData> {
        self.with_entry(own, |entry| {
            if is_bonded {
                entry.bonds.get(&peer).and_then(|b| b.gatt_cache.clone())
            } else {
                entry.unbonded.get(&peer).cloned()
            }
        })
    }

    /// Drops all persisted state for a bond.
    pub fn remove_bond(&self, own: Address, peer: Address) {
        self.with_entry(own, |entry| {
            entry.bonds.remove(&peer);
        });
        let dir = self.bond_dir(own, peer);
        if let Err(err) = fs::remove_dir_all(&dir) {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!("failed to remove bond directory {}: {}", dir.display(), err);
            }
        }
    }
}

/// Milliseconds since the epoch, for cache timestamps.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn ltk_to_file(ltk: &LongTermKey) -> LtkFile {
    LtkFile {
        rand: hex::encode(ltk.rand),
        ediv: ltk.ediv,
        ltk: hex::encode(ltk.ltk),
    }
}

fn ltk_from_file(file: &LtkFile) -> Option<LongTermKey> {
    let mut rand = [0u8; 8];
    let mut ltk = [0u8; 16];
    hex::decode_to_slice(&file.rand, &mut rand).ok()?;
    hex::decode_to_slice(&file.ltk, &mut ltk).ok()?;
    Some(LongTermKey {
        rand,
        ediv: file.ediv,
        ltk,
    })
}

fn read_keys_file(path: &Path) -> Option<BondKeys> {
    let file: KeysFile = read_json(path)?;
    let irk = match file.irk {
        Some(s) => {
            let mut irk = [0u8; 16];
            hex::decode_to_slice(&s, &mut irk).ok()?;
            Some(irk)
        }
        None => None,
    };
    Some(BondKeys {
        mitm: file.mitm,
        sc: file.sc,
        irk,
        local_ltk: file.local_ltk.as_ref().and_then(ltk_from_file),
        peer_ltk: file.peer_ltk.as_ref().and_then(ltk_from_file),
    })
}

fn read_cccd_dir(dir: &Path) -> HashMap<u16, u8> {
    let mut cccds = HashMap::new();
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(_) => return cccds,
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        let stem = match name.strip_suffix(".json") {
            Some(stem) if stem.len() == 4 => stem,
            _ => continue,
        };
        let handle = match u16::from_str_radix(stem, 16) {
            Ok(handle) => handle,
            Err(_) => continue,
        };
        if let Some(value) = read_json::<u8>(&entry.path()) {
            if value <= 3 {
                cccds.insert(handle, value);
            }
        }
    }
    cccds
}

fn list_address_dirs(dir: &Path) -> Vec<Address> {
    let mut out = Vec::new();
    if let Ok(entries) = fs::read_dir(dir) {
        for entry in entries.flatten() {
            let name = entry.file_name();
            let name = name.to_string_lossy().replace('-', ":");
            if let Ok(addr) = name.parse::<Address>() {
                out.push(addr);
            }
        }
    }
    out
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Option<T> {
    let bytes = fs::read(path).ok()?;
    match serde_json::from_slice(&bytes) {
        Ok(value) => Some(value),
        Err(err) => {
            debug!("ignoring corrupt {}: {}", path.display(), err);
            None
        }
    }
}

fn write_json<T: Serialize>(path: &Path, value: &T) {
    let parent = match path.parent() {
        Some(parent) => parent,
        None => return,
    };
    if let Err(err) = fs::create_dir_all(parent) {
        warn!("failed to create {}: {}", parent.display(), err);
        return;
    }
    match serde_json::to_vec(value) {
        Ok(bytes) => {
            if let Err(err) = fs::write(path, bytes) {
                warn!("failed to write {}: {}", path.display(), err);
            }
        }
        Err(err) => warn!("failed to serialize {}: {}", path.display(), err),
    }
}

/// Keys an AES-128 block cipher with the byte-reversed IRK for the `ah`
/// random-address hash.
fn irk_cipher(irk_le: &[u8; 16]) -> Aes128 {
    let mut key = *irk_le;
    key.reverse();
    Aes128::new(GenericArray::from_slice(&key))
}

/// Runs the `ah` function: encrypt a zero block carrying prand in its last
/// three bytes, compare the last three ciphertext bytes against the hash.
/// The comparison is constant-time across candidates.
fn ah_matches(cipher: &Aes128, prand: &[u8; 3], hash: &[u8; 3]) -> bool {
    let mut block = GenericArray::from([0u8; 16]);
    block[13] = prand[0];
    block[14] = prand[1];
    block[15] = prand[2];
    cipher.encrypt_block(&mut block);
    let mut diff = 0u8;
    for i in 0..3 {
        diff |= block[13 + i] ^ hash[i];
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::construct_address;
    use crate::gatt::cache::GattClientCache;
    use tempfile::tempdir;

    fn own() -> Address {
        construct_address(0x00, "00:11:22:33:44:55").unwrap()
    }

    fn peer() -> Address {
        construct_address(0x00, "AA:BB:CC:DD:EE:FF").unwrap()
    }

    fn sample_keys() -> BondKeys {
        BondKeys {
            mitm: true,
            sc: false,
            irk: Some([0x10; 16]),
            local_ltk: Some(LongTermKey {
                rand: [1, 2, 3, 4, 5, 6, 7, 8],
                ediv: 0x1234,
                ltk: [0xAB; 16],
            }),
            peer_ltk: None,
        }
    }

    #[test]
    fn keys_round_trip_through_disk() {
        let dir = tempdir().unwrap();
        let keys = sample_keys();
        {
            let store = Store::new(dir.path());
            store.store_keys(own(), peer(), keys.clone());
        }
        // A fresh store re-reads from disk
        let store = Store::new(dir.path());
        assert_eq!(store.get_keys(own(), peer()), Some(keys));
        assert!(store.is_bonded(own(), peer()));
        assert!(store.has_ltk(own(), peer()));
    }

    #[test]
    fn remove_bond_deletes_directory() {
        let dir = tempdir().unwrap();
        let store = Store::new(dir.path());
        store.store_keys(own(), peer(), sample_keys());
        store.store_cccd(own(), peer(), 0x0102, 1);

        let bond_dir = store.bond_dir(own(), peer());
        assert!(bond_dir.is_dir());

        store.remove_bond(own(), peer());
        assert_eq!(store.get_keys(own(), peer()), None);
        assert!(!bond_dir.exists());
    }

    #[test]
    fn cccd_round_trip_and_domain() {
        let dir = tempdir().unwrap();
        {
            let store = Store::new(dir.path());
            for value in 0..=3u8 {
                store.store_cccd(own(), peer(), 0x0100 + value as u16, value);
            }
            store.store_cccd(own(), peer(), 0x0200, 9);
        }
        let store = Store::new(dir.path());
        for value in 0..=3u8 {
            assert_eq!(store.get_cccd(own(), peer(), 0x0100 + value as u16), Some(value));
        }
        assert_eq!(store.get_cccd(own(), peer(), 0x0200), None);
        assert_eq!(store.get_all_cccds(own(), peer()).len(), 4);
    }

    #[test]
    fn resolve_address_core_spec_vector() {
        // Sample data from the AH function definition: IRK
        // ec0234a357c8ad05341010a60a397d9b, prand 708194, hash 0dfbaa.
        let dir = tempdir().unwrap();
        let store = Store::new(dir.path());
        let mut irk = [0u8; 16];
        hex::decode_to_slice("ec0234a357c8ad05341010a60a397d9b", &mut irk).unwrap();
        irk.reverse(); // distributed little-endian
        store.store_keys(
            own(),
            peer(),
            BondKeys {
                irk: Some(irk),
                ..BondKeys::default()
            },
        );

        let rpa = construct_address(0x01, "70:81:94:0D:FB:AA").unwrap();
        assert_eq!(store.resolve_address(own(), rpa), Some(peer()));

        // Off-by-one hash must not resolve
        let wrong = construct_address(0x01, "70:81:94:0D:FB:AB").unwrap();
        assert_eq!(store.resolve_address(own(), wrong), None);

        // Non-resolvable addresses are rejected outright
        let public = construct_address(0x00, "70:81:94:0D:FB:AA").unwrap();
        assert_eq!(store.resolve_address(own(), public), None);
    }

    #[test]
    fn unbonded_cache_fifo_eviction_removes_files() {
        let dir = tempdir().unwrap();
        let store = Store::with_unbonded_capacity(dir.path(), 2);

        let peers: Vec<Address> = (0..3)
            .map(|i| construct_address(0x00, &format!("AA:BB:CC:DD:EE:0{}", i)).unwrap())
            .collect();
        for (i, p) in peers.iter().enumerate() {
            let cache = GattClientCache::new().to_data(i as u64);
            store.store_gatt_cache(own(), *p, false, &cache);
        }

        // Oldest fell out of the FIFO and off the disk
        assert!(store.get_gatt_cache(own(), peers[0], false).is_none());
        assert!(store.get_gatt_cache(own(), peers[1], false).is_some());
        assert!(store.get_gatt_cache(own(), peers[2], false).is_some());
        assert!(!store.unbonded_dir(own(), peers[0]).exists());
    }

    #[test]
    fn unbonded_caches_reload_in_age_order() {
        let dir = tempdir().unwrap();
        let peers: Vec<Address> = (0..3)
            .map(|i| construct_address(0x00, &format!("AA:BB:CC:DD:EE:1{}", i)).unwrap())
            .collect();
        {
            let store = Store::with_unbonded_capacity(dir.path(), 10);
            // Stored out of order; timestamps define age
            store.store_gatt_cache(own(), peers[2], false, &GattClientCache::new().to_data(300));
            store.store_gatt_cache(own(), peers[0], false, &GattClientCache::new().to_data(100));
            store.store_gatt_cache(own(), peers[1], false, &GattClientCache::new().to_data(200));
        }
        let store = Store::with_unbonded_capacity(dir.path(), 2);
        // Capacity 2: loading three entries evicts the oldest (timestamp 100)
        assert!(store.get_gatt_cache(own(), peers[0], false).is_none());
        assert!(store.get_gatt_cache(own(), peers[1], false).is_some());
        assert!(store.get_gatt_cache(own(), peers[2], false).is_some());
    }

    #[test]
    fn corrupt_files_are_ignored() {
        let dir = tempdir().unwrap();
        let store = Store::new(dir.path());
        let keys_path = store.bond_dir(own(), peer()).join("keys.json");
        fs::create_dir_all(keys_path.parent().unwrap()).unwrap();
        fs::write(&keys_path, b"{ not json").unwrap();

        let store = Store::new(dir.path());
        assert_eq!(store.get_keys(own(), peer()), None);
    }
}
