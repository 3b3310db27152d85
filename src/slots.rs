//! Slot map (C4): key-to-slot hashing and the atomically-published topology
//! table that the router (C6) consults on every command (spec §4.4).
//!
//! Publication uses [`arc_swap::ArcSwap`] rather than an `RwLock`: readers on
//! the hot path take a lock-free snapshot ([`SlotMap::load`]) and a background
//! refresh swaps in a whole new table with a single pointer store, so there is
//! never a window where a reader observes half of an old table and half of a
//! new one (spec §4.4 "no torn reads"). This generalizes the teacher's
//! `SlotMap = BTreeMap<u16, String>` rebuilt wholesale on every
//! `refresh_slots`, keyed the same way: by each range's *end* slot, so a
//! lookup is `range(&slot..).next()`.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use crc16::{State, XMODEM};

use crate::error::{RedisCoreError, RedisCoreResult};
use crate::value::Value;

pub const SLOT_COUNT: u16 = 16384;

/// Extract the hash-tag substring between the first `{` and the next `}` in
/// `key`, if one exists and is non-empty; otherwise the whole key (spec §4.4,
/// identical rule to the teacher's `sub_key`).
pub fn hash_tag(key: &[u8]) -> &[u8] {
    key.iter()
        .position(|b| *b == b'{')
        .and_then(|open| {
            let after_open = open + 1;
            key[after_open..]
                .iter()
                .position(|b| *b == b'}')
                .and_then(|close_offset| {
                    if close_offset != 0 {
                        Some(&key[after_open..after_open + close_offset])
                    } else {
                        None
                    }
                })
        })
        .unwrap_or(key)
}

/// CRC16/XMODEM over the hash-tagged key, reduced mod 16384 (spec §4.4).
pub fn key_slot(key: &[u8]) -> u16 {
    State::<XMODEM>::calculate(hash_tag(key)) % SLOT_COUNT
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotRange {
    pub start: u16,
    pub end: u16,
    pub primary: SocketAddr,
    pub replicas: Vec<SocketAddr>,
}

#[derive(Debug, Default)]
struct SlotMapInner {
    by_end: BTreeMap<u16, SlotRange>,
}

impl SlotMapInner {
    fn range_for(&self, slot: u16) -> Option<&SlotRange> {
        self.by_end.range(slot..).next().map(|(_, range)| range)
    }
}

/// The shared, atomically-swapped topology table. Cheap to clone (an `Arc`
/// around the swap cell); every connected component (router, pool) holds one
/// clone rather than a reference into a `Client`.
#[derive(Clone)]
pub struct SlotMap {
    inner: Arc<ArcSwap<SlotMapInner>>,
    version: Arc<AtomicU64>,
}

impl SlotMap {
    /// An empty table, as used before the first topology refresh completes
    /// (spec §4.4: standalone mode never populates this at all).
    pub fn empty() -> Self {
        SlotMap {
            inner: Arc::new(ArcSwap::from_pointee(SlotMapInner::default())),
            version: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    pub fn primary_for_slot(&self, slot: u16) -> Option<SocketAddr> {
        self.inner.load().range_for(slot).map(|r| r.primary)
    }

    pub fn replicas_for_slot(&self, slot: u16) -> Vec<SocketAddr> {
        self.inner
            .load()
            .range_for(slot)
            .map(|r| r.replicas.clone())
            .unwrap_or_default()
    }

    pub fn all_primaries(&self) -> Vec<SocketAddr> {
        let snapshot = self.inner.load();
        let mut addrs: Vec<SocketAddr> = snapshot.by_end.values().map(|r| r.primary).collect();
        addrs.sort_unstable_by_key(|a| a.to_string());
        addrs.dedup();
        addrs
    }

    pub fn all_nodes(&self) -> Vec<SocketAddr> {
        let snapshot = self.inner.load();
        let mut addrs: Vec<SocketAddr> = snapshot
            .by_end
            .values()
            .flat_map(|r| std::iter::once(r.primary).chain(r.replicas.iter().copied()))
            .collect();
        addrs.sort_unstable_by_key(|a| a.to_string());
        addrs.dedup();
        addrs
    }

    pub fn is_empty(&self) -> bool {
        self.inner.load().by_end.is_empty()
    }

    /// Validate full 0..16384 coverage with no gaps or overlaps, build the new
    /// table, and swap it in with a bumped version (spec §4.4). Rejects a
    /// partial topology outright rather than publishing it: a caller that
    /// sees this error keeps serving the previous snapshot, and the next
    /// background refresh tries again.
    pub fn publish(&self, mut ranges: Vec<SlotRange>) -> RedisCoreResult<()> {
        ranges.sort_by_key(|r| r.start);
        let mut by_end = BTreeMap::new();
        let mut expected_start = 0u16;
        for range in ranges {
            if range.start != expected_start {
                return Err(RedisCoreError::config(format!(
                    "slot map has a gap or overlap at slot {}: expected start {}, got {}",
                    expected_start, expected_start, range.start
                )));
            }
            expected_start = range.end.checked_add(1).ok_or_else(|| {
                RedisCoreError::config("slot range end overflowed slot space")
            })?;
            by_end.insert(range.end, range);
        }
        if expected_start != SLOT_COUNT {
            return Err(RedisCoreError::config(format!(
                "slot map does not cover the full keyspace: covered up to {}",
                expected_start
            )));
        }
        self.inner.store(Arc::new(SlotMapInner { by_end }));
        self.version.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }
}

/// Parses a `CLUSTER SLOTS` reply (spec §4.4's fallback topology source,
/// identical shape to the teacher's `get_slots`): each entry is
/// `[start, end, [primary_ip, primary_port, ...], [replica_ip, replica_port, ...], ...]`.
pub fn parse_cluster_slots(value: &Value) -> RedisCoreResult<Vec<SlotRange>> {
    let entries = value
        .as_array()
        .ok_or_else(|| RedisCoreError::config("CLUSTER SLOTS did not return an array"))?;

    let mut result = Vec::with_capacity(entries.len());
    for entry in entries {
        let fields = match entry.as_array() {
            Some(f) if f.len() >= 3 => f,
            _ => continue,
        };
        let start = match fields[0].as_int() {
            Some(n) => n as u16,
            None => continue,
        };
        let end = match fields[1].as_int() {
            Some(n) => n as u16,
            None => continue,
        };
        let mut nodes: Vec<SocketAddr> = fields[2..]
            .iter()
            .filter_map(node_value_to_addr)
            .collect();
        if nodes.is_empty() {
            continue;
        }
        let replicas = nodes.split_off(1);
        result.push(SlotRange {
            start,
            end,
            primary: nodes.pop().expect("checked non-empty above"),
            replicas,
        });
    }
    Ok(result)
}

fn node_value_to_addr(value: &Value) -> Option<SocketAddr> {
    let fields = value.as_array()?;
    if fields.len() < 2 {
        return None;
    }
    let ip = fields[0].as_bulk().map(|b| String::from_utf8_lossy(b).into_owned())?;
    let port = fields[1].as_int()?;
    format!("{}:{}", ip, port).parse().ok()
}

/// Parses a `CLUSTER SHARDS` reply (spec §4.4's preferred topology source —
/// it additionally carries node health and avoids `CLUSTER SLOTS`'
/// deprecation). Each shard is a flat field/value array: `"slots"`,
/// `[start, end, ...]`, `"nodes"`, `[node, ...]`, where each node is itself a
/// flat field/value array with `"ip"`/`"endpoint"`, `"port"`, `"role"`.
pub fn parse_cluster_shards(value: &Value) -> RedisCoreResult<Vec<SlotRange>> {
    let shards = value
        .as_array()
        .ok_or_else(|| RedisCoreError::config("CLUSTER SHARDS did not return an array"))?;

    let mut result = Vec::new();
    for shard in shards {
        let fields = match shard.as_array() {
            Some(f) => f,
            None => continue,
        };
        let shard_map = flat_fields_to_map(fields);

        let slot_pairs = shard_map
            .get("slots")
            .and_then(|v| v.as_array())
            .map(|a| a.to_vec())
            .unwrap_or_default();
        let nodes = shard_map
            .get("nodes")
            .and_then(|v| v.as_array())
            .map(|a| a.to_vec())
            .unwrap_or_default();

        let mut primary = None;
        let mut replicas = Vec::new();
        for node in &nodes {
            let node_fields = match node.as_array() {
                Some(f) => f,
                None => continue,
            };
            let node_map = flat_fields_to_map(node_fields);
            let ip = node_map
                .get("ip")
                .or_else(|| node_map.get("endpoint"))
                .and_then(|v| v.as_bulk())
                .map(|b| String::from_utf8_lossy(b).into_owned());
            let port = node_map.get("port").and_then(|v| v.as_int());
            let addr = match (ip, port) {
                (Some(ip), Some(port)) => format!("{}:{}", ip, port).parse::<SocketAddr>().ok(),
                _ => None,
            };
            let addr = match addr {
                Some(a) => a,
                None => continue,
            };
            let role = node_map
                .get("role")
                .and_then(|v| v.as_bulk())
                .map(|b| String::from_utf8_lossy(b).into_owned())
                .unwrap_or_default();
            if role == "master" && primary.is_none() {
                primary = Some(addr);
            } else {
                replicas.push(addr);
            }
        }
        let primary = match primary {
            Some(p) => p,
            None => continue,
        };

        // `slots` is pairs of (start, end): a shard can own disjoint ranges.
        let mut pair_iter = slot_pairs.chunks_exact(2);
        for pair in &mut pair_iter {
            let start = match pair[0].as_int() {
                Some(n) => n as u16,
                None => continue,
            };
            let end = match pair[1].as_int() {
                Some(n) => n as u16,
                None => continue,
            };
            result.push(SlotRange {
                start,
                end,
                primary,
                replicas: replicas.clone(),
            });
        }
    }
    Ok(result)
}

fn flat_fields_to_map(fields: &[Value]) -> std::collections::HashMap<String, &Value> {
    let mut map = std::collections::HashMap::new();
    let mut iter = fields.chunks_exact(2);
    for pair in &mut iter {
        if let Some(key) = pair[0].as_bulk().map(|b| String::from_utf8_lossy(b).into_owned()) {
            map.insert(key, &pair[1]);
        }
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_tag_extracts_braces() {
        assert_eq!(hash_tag(b"{user}.profile"), b"user");
        assert_eq!(hash_tag(b"plainkey"), b"plainkey");
        assert_eq!(hash_tag(b"{}bare"), b"{}bare");
    }

    #[test]
    fn key_slot_is_stable_and_in_range() {
        let slot = key_slot(b"foo");
        assert!(slot < SLOT_COUNT);
        assert_eq!(slot, key_slot(b"foo"));
        assert_eq!(key_slot(b"{foo}bar"), key_slot(b"{foo}baz"));
    }

    #[test]
    fn publish_rejects_incomplete_coverage() {
        let map = SlotMap::empty();
        let ranges = vec![SlotRange {
            start: 0,
            end: 100,
            primary: "127.0.0.1:7000".parse().unwrap(),
            replicas: vec![],
        }];
        assert!(map.publish(ranges).is_err());
        assert!(map.is_empty());
    }

    #[test]
    fn publish_accepts_full_coverage_and_bumps_version() {
        let map = SlotMap::empty();
        let ranges = vec![
            SlotRange {
                start: 0,
                end: 8191,
                primary: "127.0.0.1:7000".parse().unwrap(),
                replicas: vec!["127.0.0.1:7003".parse().unwrap()],
            },
            SlotRange {
                start: 8192,
                end: 16383,
                primary: "127.0.0.1:7001".parse().unwrap(),
                replicas: vec![],
            },
        ];
        map.publish(ranges).unwrap();
        assert_eq!(map.version(), 1);
        assert_eq!(
            map.primary_for_slot(0),
            Some("127.0.0.1:7000".parse().unwrap())
        );
        assert_eq!(
            map.primary_for_slot(16383),
            Some("127.0.0.1:7001".parse().unwrap())
        );
        assert_eq!(map.all_primaries().len(), 2);
    }

    #[test]
    fn parses_cluster_slots_reply() {
        let reply = Value::Array(vec![Value::Array(vec![
            Value::Int(0),
            Value::Int(16383),
            Value::Array(vec![Value::Bulk(b"127.0.0.1".to_vec()), Value::Int(7000)]),
            Value::Array(vec![Value::Bulk(b"127.0.0.1".to_vec()), Value::Int(7003)]),
        ])]);
        let ranges = parse_cluster_slots(&reply).unwrap();
        assert_eq!(ranges.len(), 1);
        assert_eq!(ranges[0].start, 0);
        assert_eq!(ranges[0].end, 16383);
        assert_eq!(ranges[0].replicas.len(), 1);
    }
}
