//! GATT client service cache
//!
//! Remembers, per connection, which handle ranges are known to contain a
//! service and which are verified gaps, so rediscovery after reconnection
//! can be skipped. Interval maps are keyed by range start and never overlap.

use crate::uuid::Uuid;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// A discovered remote service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteService {
    pub start: u16,
    pub end: u16,
    pub uuid: Uuid,
    /// Ranges of services this one includes, as far as discovery has seen
    pub includes: Vec<IncludedEntry>,
}

/// An include reference inside a service. A `None` UUID means the entry
/// must be rediscovered (128-bit include, or invalidated).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncludedEntry {
    pub start: u16,
    pub end: u16,
    pub uuid: Option<Uuid>,
}

#[derive(Debug, Clone)]
struct RangeEntry<T> {
    end: u16,
    value: Option<T>,
}

/// An interval container ordered by range start with non-overlapping
/// entries. `None` values record verified-absent gaps.
#[derive(Debug, Clone)]
pub struct RangeMap<T> {
    map: BTreeMap<u16, RangeEntry<T>>,
}

impl<T> Default for RangeMap<T> {
    fn default() -> Self {
        Self {
            map: BTreeMap::new(),
        }
    }
}

impl<T: Clone> RangeMap<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn clear(&mut self) {
        self.map.clear();
    }

    /// Records `[start, end]` as holding `value` (or a verified gap for
    /// `None`), displacing anything the range overlaps.
    pub fn insert(&mut self, start: u16, end: u16, value: Option<T>) {
        debug_assert!(start <= end);
        self.remove_overlapping(start, end);
        self.map.insert(start, RangeEntry { end, value });
    }

    /// The entry covering `handle`, if any: `(start, end, value)`.
    pub fn get(&self, handle: u16) -> Option<(u16, u16, Option<&T>)> {
        let (&start, entry) = self.map.range(..=handle).next_back()?;
        if entry.end >= handle {
            Some((start, entry.end, entry.value.as_ref()))
        } else {
            None
        }
    }

    /// Removes every interval overlapping `[start, end]`, returning them.
    pub fn remove_overlapping(&mut self, start: u16, end: u16) -> Vec<(u16, u16, Option<T>)> {
        let mut doomed: Vec<u16> = Vec::new();
        // A predecessor interval can reach into the range
        if let Some((&s, e)) = self.map.range(..start).next_back() {
            if e.end >= start {
                doomed.push(s);
            }
        }
        for (&s, _) in self.map.range(start..=end) {
            doomed.push(s);
        }
        let mut removed = Vec::with_capacity(doomed.len());
        for s in doomed {
            if let Some(entry) = self.map.remove(&s) {
                removed.push((s, entry.end, entry.value));
            }
        }
        removed
    }

    /// All intervals, in handle order.
    pub fn iter(&self) -> impl Iterator<Item = (u16, u16, Option<&T>)> {
        self.map
            .iter()
            .map(|(&start, entry)| (start, entry.end, entry.value.as_ref()))
    }

    /// Present (non-gap) values, in handle order.
    pub fn values(&self) -> impl Iterator<Item = &T> {
        self.map.values().filter_map(|entry| entry.value.as_ref())
    }

    /// Subranges of `[start, end]` not yet covered by any interval.
    pub fn undecided_ranges(&self, start: u16, end: u16) -> Vec<(u16, u16)> {
        let mut gaps = Vec::new();
        let mut cursor = start;
        // Start inside a predecessor interval?
        if let Some((_, e, _)) = self.get(cursor) {
            if e == u16::MAX || e >= end {
                return gaps;
            }
            cursor = e + 1;
        }
        for (s, e, _) in self.iter() {
            if e < cursor {
                continue;
            }
            if s > end {
                break;
            }
            if s > cursor {
                gaps.push((cursor, (s - 1).min(end)));
            }
            if e >= end || e == u16::MAX {
                return gaps;
            }
            cursor = e + 1;
        }
        if cursor <= end {
            gaps.push((cursor, end));
        }
        gaps
    }

    /// True when every handle in `[start, end]` is covered.
    pub fn is_fully_covered(&self, start: u16, end: u16) -> bool {
        self.undecided_ranges(start, end).is_empty()
    }
}

/// Per-connection service cache for the GATT client.
#[derive(Debug, Clone, Default)]
pub struct GattClientCache {
    pub has_all_primary_services: bool,
    pub all_primary: RangeMap<RemoteService>,
    pub secondary: RangeMap<RemoteService>,
    pub primary_by_uuid: HashMap<Uuid, RangeMap<()>>,
}

impl GattClientCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a discovered primary service in both the unfiltered map and
    /// the by-UUID map.
    pub fn insert_primary(&mut self, service: RemoteService) {
        self.primary_by_uuid
            .entry(service.uuid)
            .or_default()
            .insert(service.start, service.end, Some(()));
        self.all_primary
            .insert(service.start, service.end, Some(service));
    }

    /// Promotes a cached secondary service to primary if discovery reveals
    /// it was one all along.
    pub fn promote_secondary(&mut self, start: u16) {
        if let Some((s, e, Some(service))) = self.secondary.get(start) {
            let service = service.clone();
            self.secondary.remove_overlapping(s, e);
            self.insert_primary(service);
        }
    }

    /// Drops every cached interval overlapping `[start, end]` from all maps
    /// and marks surviving services that included the range for rediscovery.
    pub fn invalidate(&mut self, start: u16, end: u16) {
        self.all_primary.remove_overlapping(start, end);
        self.secondary.remove_overlapping(start, end);
        for map in self.primary_by_uuid.values_mut() {
            map.remove_overlapping(start, end);
        }
        self.has_all_primary_services = false;

        let mut invalidate_includes = |map: &mut RangeMap<RemoteService>| {
            let survivors: Vec<(u16, u16, Option<RemoteService>)> = map
                .iter()
                .map(|(s, e, v)| (s, e, v.cloned()))
                .collect();
            for (s, e, service) in survivors {
                if let Some(mut service) = service {
                    let mut touched = false;
                    for include in service.includes.iter_mut() {
                        if include.start <= end && include.end >= start {
                            include.uuid = None;
                            touched = true;
                        }
                    }
                    if touched {
                        map.insert(s, e, Some(service));
                    }
                }
            }
        };
        invalidate_includes(&mut self.all_primary);
        invalidate_includes(&mut self.secondary);
    }
}

// --- Persisted form -----------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedService {
    pub uuid: Uuid,
    #[serde(default)]
    pub includes: Vec<IncludedEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedRange {
    pub start: u16,
    pub end: u16,
    pub service: Option<CachedService>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedUuidRange {
    pub start: u16,
    pub end: u16,
    pub exists: bool,
}

/// The JSON image written to `gatt_client_cache.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GattCacheData {
    #[serde(rename = "hasAllPrimaryServices")]
    pub has_all_primary_services: bool,
    #[serde(rename = "allPrimaryServices")]
    pub all_primary_services: Vec<CachedRange>,
    #[serde(rename = "secondaryServices")]
    pub secondary_services: Vec<CachedRange>,
    #[serde(rename = "primaryServicesByUUID")]
    pub primary_services_by_uuid: HashMap<Uuid, Vec<CachedUuidRange>>,
    /// Milliseconds since the epoch, used to age out unbonded entries
    pub timestamp: u64,
}

fn to_cached_ranges(map: &RangeMap<RemoteService>) -> Vec<CachedRange> {
    map.iter()
        .map(|(start, end, service)| CachedRange {
            start,
            end,
            service: service.map(|s| CachedService {
                uuid: s.uuid,
                includes: s.includes.clone(),
            }),
        })
        .collect()
}

fn from_cached_ranges(ranges: &[CachedRange]) -> RangeMap<RemoteService> {
    let mut map = RangeMap::new();
    for range in ranges {
        if range.start > range.end {
            continue;
        }
        let value = range.service.as_ref().map(|s| RemoteService {
            start: range.start,
            end: range.end,
            uuid: s.uuid,
            includes: s.includes.clone(),
        });
        map.insert(range.start, range.end, value);
    }
    map
}

impl GattClientCache {
    pub fn to_data(&self, timestamp: u64) -> GattCacheData {
        GattCacheData {
            has_all_primary_services: self.has_all_primary_services,
            all_primary_services: to_cached_ranges(&self.all_primary),
            secondary_services: to_cached_ranges(&self.secondary),
            primary_services_by_uuid: self
                .primary_by_uuid
                .iter()
                .map(|(uuid, map)| {
                    let ranges = map
                        .iter()
                        .map(|(start, end, value)| CachedUuidRange {
                            start,
                            end,
                            exists: value.is_some(),
                        })
                        .collect();
                    (*uuid, ranges)
                })
                .collect(),
            timestamp,
        }
    }

    pub fn from_data(data: &GattCacheData) -> Self {
        let mut primary_by_uuid = HashMap::new();
        for (uuid, ranges) in &data.primary_services_by_uuid {
            let mut map = RangeMap::new();
            for range in ranges {
                if range.start > range.end {
                    continue;
                }
                map.insert(range.start, range.end, range.exists.then_some(()));
            }
            primary_by_uuid.insert(*uuid, map);
        }
        Self {
            has_all_primary_services: data.has_all_primary_services,
            all_primary: from_cached_ranges(&data.all_primary_services),
            secondary: from_cached_ranges(&data.secondary_services),
            primary_by_uuid,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service(start: u16, end: u16, uuid: u16) -> RemoteService {
        RemoteService {
            start,
            end,
            uuid: Uuid::from_u16(uuid),
            includes: Vec::new(),
        }
    }

    #[test]
    fn lookup_respects_bounds() {
        let mut map = RangeMap::new();
        map.insert(10, 20, Some("a"));
        map.insert(30, 40, None);
        assert_eq!(map.get(9), None);
        assert_eq!(map.get(10).unwrap().2, Some(&"a"));
        assert_eq!(map.get(20).unwrap().2, Some(&"a"));
        assert_eq!(map.get(21), None);
        // Verified gap is covered but empty
        assert_eq!(map.get(35).unwrap().2, None);
    }

    #[test]
    fn insert_displaces_overlaps() {
        let mut map = RangeMap::new();
        map.insert(10, 20, Some(1));
        map.insert(25, 30, Some(2));
        map.insert(15, 27, Some(3));
        let spans: Vec<(u16, u16)> = map.iter().map(|(s, e, _)| (s, e)).collect();
        assert_eq!(spans, vec![(15, 27)]);
    }

    #[test]
    fn undecided_ranges_walk_gaps() {
        let mut map = RangeMap::new();
        map.insert(5, 9, Some(1));
        map.insert(20, 29, None);
        assert_eq!(
            map.undecided_ranges(1, 40),
            vec![(1, 4), (10, 19), (30, 40)]
        );
        assert_eq!(map.undecided_ranges(6, 8), vec![]);
        assert!(map.is_fully_covered(5, 9));
        assert!(!map.is_fully_covered(5, 10));
    }

    #[test]
    fn undecided_handles_full_range() {
        let mut map: RangeMap<u8> = RangeMap::new();
        assert_eq!(map.undecided_ranges(1, 0xFFFF), vec![(1, 0xFFFF)]);
        map.insert(1, 0xFFFF, None);
        assert_eq!(map.undecided_ranges(1, 0xFFFF), vec![]);
    }

    #[test]
    fn invalidate_clears_all_maps() {
        let mut cache = GattClientCache::new();
        cache.insert_primary(service(1, 10, 0x1800));
        cache.insert_primary(service(11, 20, 0x180A));
        cache.has_all_primary_services = true;

        cache.invalidate(5, 12);
        assert!(!cache.has_all_primary_services);
        assert!(cache.all_primary.get(5).is_none());
        assert!(cache.all_primary.get(15).is_none());
        let by_uuid = cache.primary_by_uuid.get(&Uuid::from_u16(0x1800)).unwrap();
        assert!(by_uuid.get(1).is_none());
    }

    #[test]
    fn invalidate_marks_surviving_includes() {
        let mut cache = GattClientCache::new();
        let mut svc = service(1, 10, 0x1800);
        svc.includes.push(IncludedEntry {
            start: 30,
            end: 35,
            uuid: Some(Uuid::from_u16(0x180F)),
        });
        cache.insert_primary(svc);
        cache.insert_primary(service(30, 35, 0x180F));

        cache.invalidate(30, 40);
        let survivor = cache.all_primary.get(1).unwrap().2.unwrap();
        assert_eq!(survivor.includes[0].uuid, None);
        assert_eq!(survivor.includes[0].start, 30);
    }

    #[test]
    fn secondary_promotion_moves_service() {
        let mut cache = GattClientCache::new();
        cache
            .secondary
            .insert(50, 60, Some(service(50, 60, 0x180F)));
        cache.promote_secondary(50);
        assert!(cache.secondary.get(50).is_none());
        assert_eq!(
            cache.all_primary.get(55).unwrap().2.unwrap().uuid,
            Uuid::from_u16(0x180F)
        );
    }

    #[test]
    fn persisted_form_round_trips() {
        let mut cache = GattClientCache::new();
        cache.insert_primary(service(1, 10, 0x1800));
        cache.all_primary.insert(11, 0xFFFF, None);
        cache.has_all_primary_services = true;

        let data = cache.to_data(1234);
        let json = serde_json::to_string(&data).unwrap();
        let parsed: GattCacheData = serde_json::from_str(&json).unwrap();
        let back = GattClientCache::from_data(&parsed);

        assert!(back.has_all_primary_services);
        assert_eq!(
            back.all_primary.get(3).unwrap().2.unwrap().uuid,
            Uuid::from_u16(0x1800)
        );
        assert_eq!(back.all_primary.get(100).unwrap().2, None);
        assert!(back
            .primary_by_uuid
            .get(&Uuid::from_u16(0x1800))
            .unwrap()
            .get(5)
            .unwrap()
            .2
            .is_some());
    }
}
