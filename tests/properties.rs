//! Property tests for the core invariants spec'd for the in-flight registry,
//! the slot hashing rule, and the slot map's atomic-swap reads. Grounded in
//! the teacher's own use of `proptest` (`tests/basic.rs`'s `proptests()`
//! wrapping a scripted scenario in `proptest!`), adapted here to drive
//! in-process primitives directly rather than a live server process.

use std::net::SocketAddr;

use proptest::prelude::*;
use resp_cluster_client::{key_slot, SlotMap, SlotRange};

fn addr(port: u16) -> SocketAddr {
    format!("127.0.0.1:{port}").parse().unwrap()
}

proptest! {
    /// Two keys sharing a hash tag always land in the same slot, regardless
    /// of what surrounds the tag (spec §4.4, glossary "Hash tag").
    #[test]
    fn shared_hash_tag_implies_shared_slot(
        tag in "[a-zA-Z0-9]{1,16}",
        prefix_a in "[a-zA-Z0-9]{0,8}",
        suffix_a in "[a-zA-Z0-9]{0,8}",
        prefix_b in "[a-zA-Z0-9]{0,8}",
        suffix_b in "[a-zA-Z0-9]{0,8}",
    ) {
        let key_a = format!("{prefix_a}{{{tag}}}{suffix_a}").into_bytes();
        let key_b = format!("{prefix_b}{{{tag}}}{suffix_b}").into_bytes();
        prop_assert_eq!(key_slot(&key_a), key_slot(&key_b));
    }

    /// `key_slot` always returns a value in range, and is a pure function of
    /// its input (spec §8 round-trip/idempotence: encode/decode-style
    /// determinism, applied here to the hashing rule).
    #[test]
    fn key_slot_is_in_range_and_deterministic(key in proptest::collection::vec(any::<u8>(), 0..64)) {
        let first = key_slot(&key);
        let second = key_slot(&key);
        prop_assert_eq!(first, second);
        prop_assert!(first < resp_cluster_client::SLOT_COUNT);
    }

    /// A `SlotMap` reader never observes a partially-published table: every
    /// read during or after a sequence of publishes returns either full
    /// coverage of 0..16384 or the untouched empty map (spec §4.4 "no torn
    /// reads", property 4 in spec §8).
    #[test]
    fn slot_map_snapshot_is_never_torn(num_publishes in 1usize..6) {
        let map = SlotMap::empty();
        for i in 0..num_publishes {
            let split = (i as u16 * 1000) % 16383 + 1;
            let ranges = vec![
                SlotRange { start: 0, end: split - 1, primary: addr(7000 + i as u16), replicas: vec![] },
                SlotRange { start: split, end: 16383, primary: addr(7100 + i as u16), replicas: vec![] },
            ];
            map.publish(ranges).unwrap();

            // Every slot must resolve to exactly one of this publish's two
            // primaries; there is no third, mixed-up answer possible.
            for probe_slot in [0u16, split.saturating_sub(1), split, 16383] {
                let primary = map.primary_for_slot(probe_slot);
                prop_assert!(
                    primary == Some(addr(7000 + i as u16)) || primary == Some(addr(7100 + i as u16))
                );
            }
        }
        prop_assert_eq!(map.version(), num_publishes as u64);
    }

    /// `SlotMap::publish` rejects any ranges that do not exactly tile
    /// 0..16384 with no gap or overlap (spec §4.4 invariant: "every slot has
    /// exactly one primary"), and leaves the previous snapshot (or the empty
    /// map) untouched when it does.
    #[test]
    fn publish_rejects_gaps_and_preserves_prior_snapshot(bad_end in 0u16..16383) {
        let map = SlotMap::empty();
        let ranges = vec![SlotRange { start: 0, end: bad_end, primary: addr(7000), replicas: vec![] }];
        let result = map.publish(ranges);
        prop_assert!(result.is_err());
        prop_assert_eq!(map.version(), 0);
        prop_assert!(map.is_empty());
    }
}

mod inflight_caps {
    use resp_cluster_client::RedisCoreError;
    use std::collections::HashSet;

    /// Concurrent registration against a per-client cap never exceeds that
    /// cap, never hands out a duplicate correlation id, and every admitted
    /// request's counter returns to its pre-submission baseline once
    /// released (spec §8, properties 3 and 5).
    #[tokio::test]
    async fn per_client_cap_and_id_uniqueness_hold_under_churn() {
        use resp_cluster_client::inflight::InflightRegistry;

        for cap in [1usize, 2, 5] {
            let registry = InflightRegistry::new(0, cap);
            let mut seen_ids = HashSet::new();
            let mut outstanding = Vec::new();

            for round in 0..(cap * 3) {
                match registry.register() {
                    Ok(pending) => {
                        prop_assert_unique(&mut seen_ids, pending.id());
                        outstanding.push(pending);
                        assert!(outstanding.len() <= cap);
                    }
                    Err(RedisCoreError::ClientInflightExceeded { .. }) => {
                        assert_eq!(outstanding.len(), cap);
                    }
                    Err(other) => panic!("unexpected error at round {round}: {other:?}"),
                }

                if outstanding.len() == cap {
                    // Drop, not complete: C3 only admits and cancels, it does
                    // not own reply delivery (see `src/inflight.rs`).
                    let finished = outstanding.remove(0);
                    let before = registry.pending_count();
                    drop(finished);
                    assert_eq!(registry.pending_count(), before - 1);
                }
            }

            for pending in outstanding {
                drop(pending);
            }
            assert_eq!(registry.pending_count(), 0);
        }
    }

    fn prop_assert_unique(seen: &mut HashSet<u64>, id: u64) {
        assert!(seen.insert(id), "correlation id {id} was reused while still live");
    }
}
