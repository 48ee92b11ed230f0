// SPDX-License-Identifier: MIT OR Apache-2.0

//! Property tests for the canonical hasher and the entropy boundary.

use acp_hash::{DigestAuthority, ENGINE_VERSION, canonical_bytes, entropy_check};
use proptest::prelude::*;
use serde_json::{Map, Value, json};

// ── Strategies ──────────────────────────────────────────────────────

/// Strings that cannot be mistaken for RFC 3339 timestamps.
fn arb_plain_string() -> impl Strategy<Value = String> {
    "[a-z_][a-z0-9_ -]{0,24}"
}

/// Arbitrary values from the entropy-safe domain: maps, arrays, plain
/// strings, integers, booleans, null.
fn arb_safe_value() -> impl Strategy<Value = Value> {
    let leaf = prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(|i| json!(i)),
        arb_plain_string().prop_map(Value::String),
    ];
    leaf.prop_recursive(4, 32, 8, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..6).prop_map(Value::Array),
            prop::collection::btree_map(arb_plain_string(), inner, 0..6).prop_map(|m| {
                Value::Object(m.into_iter().collect::<Map<String, Value>>())
            }),
        ]
    })
}

fn authority() -> DigestAuthority {
    DigestAuthority::new(ENGINE_VERSION)
}

// ── Canonical form laws ─────────────────────────────────────────────

proptest! {
    /// Law 1: the hash of a map is stable under key-order permutation.
    /// serde_json objects are insertion-ordered only with the
    /// `preserve_order` feature; either way the canonical form sorts, so
    /// rebuilding a map in reverse insertion order must hash identically.
    #[test]
    fn map_hash_stable_under_reordering(
        entries in prop::collection::btree_map(arb_plain_string(), arb_safe_value(), 0..8)
    ) {
        let forward: Map<String, Value> = entries.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        let reversed: Map<String, Value> =
            entries.iter().rev().map(|(k, v)| (k.clone(), v.clone())).collect();

        let a = authority().hash(&Value::Object(forward)).unwrap();
        let b = authority().hash(&Value::Object(reversed)).unwrap();
        prop_assert_eq!(a, b);
    }

    /// Law 2: array order is part of the canonical form.
    #[test]
    fn distinct_array_orders_hash_differently(
        mut items in prop::collection::vec(any::<i64>(), 2..10)
    ) {
        let original = Value::Array(items.iter().map(|i| json!(i)).collect());
        items.reverse();
        let reversed = Value::Array(items.iter().map(|i| json!(i)).collect());

        let a = authority().hash(&original).unwrap();
        let b = authority().hash(&reversed).unwrap();
        if original != reversed {
            prop_assert_ne!(a, b);
        } else {
            prop_assert_eq!(a, b);
        }
    }

    /// Law 4 (no false positives): safe values always pass the boundary
    /// and always canonicalize.
    #[test]
    fn safe_values_pass_entropy_check(v in arb_safe_value()) {
        prop_assert!(entropy_check(&v, "$").is_ok());
        prop_assert!(canonical_bytes(&v).is_ok());
        prop_assert!(authority().hash(&v).is_ok());
    }

    /// Hashing is a pure function: same value, same digest.
    #[test]
    fn hashing_is_deterministic(v in arb_safe_value()) {
        let a = authority().hash(&v).unwrap();
        let b = authority().hash(&v).unwrap();
        prop_assert_eq!(a, b);
    }

    /// Canonical bytes are themselves valid JSON that parses back to a
    /// value with the same hash.
    #[test]
    fn canonical_bytes_reparse_to_same_hash(v in arb_safe_value()) {
        let bytes = canonical_bytes(&v).unwrap();
        let reparsed: Value = serde_json::from_slice(&bytes).unwrap();
        prop_assert_eq!(
            authority().hash(&v).unwrap(),
            authority().hash(&reparsed).unwrap()
        );
    }

    /// Law 4 (true positives): a float at any depth is rejected.
    #[test]
    fn float_anywhere_fails(v in arb_safe_value(), key in arb_plain_string()) {
        let mut map = Map::new();
        map.insert("wrapped".into(), v);
        map.insert(key, json!(0.25));
        prop_assert!(entropy_check(&Value::Object(map), "$").is_err());
    }
}
