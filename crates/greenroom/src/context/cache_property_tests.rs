//! Property-based tests for the context cache.
//!
//! These tests validate the cache bookkeeping guarantees using the proptest
//! framework: capacity bounds hold under arbitrary insertion sequences,
//! byte accounting matches the live entries, tag invalidation removes
//! exactly the overlapping entries, and fingerprints are stable.

#[cfg(test)]
mod property_tests {
    use crate::context::cache::{CacheConfig, ContextCache, EvictionStrategy};
    use crate::context::types::{
        AgentContext, ContextRequest, TddPhase, TokenBudget, TokenUsage,
    };
    use chrono::Utc;
    use proptest::prelude::*;
    use std::collections::{BTreeMap, BTreeSet};
    use std::time::Duration;

    // ============================================================================
    // Strategies and helpers
    // ============================================================================

    fn context_for(key: &str, payload: &str) -> AgentContext {
        AgentContext {
            context_id: format!("ctx-{key}"),
            task_context: payload.to_string(),
            relevant_files: Vec::new(),
            file_contents: Default::default(),
            dependencies: String::new(),
            history: String::new(),
            agent_memory: String::new(),
            budget: TokenBudget::allocate(1000),
            usage: TokenUsage::new(1, 0, 0),
            metadata: BTreeMap::new(),
            created_at: Utc::now(),
            cache_key: key.to_string(),
        }
    }

    fn key_strategy() -> impl Strategy<Value = String> {
        "[a-f0-9]{8}"
    }

    fn tag_set_strategy() -> impl Strategy<Value = BTreeSet<String>> {
        prop::collection::btree_set("[a-c]", 0..3)
    }

    fn request_strategy() -> impl Strategy<Value = ContextRequest> {
        ("[a-z]{1,8}", "[a-z]{1,8}", 0usize..3).prop_map(|(story, agent, phase)| {
            let phase = match phase {
                0 => TddPhase::Red,
                1 => TddPhase::Green,
                _ => TddPhase::Refactor,
            };
            ContextRequest::new(story, agent, phase)
        })
    }

    // ============================================================================
    // Capacity and Accounting Properties
    // ============================================================================

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(50))]

        /// Entry count never exceeds the configured maximum, whatever the
        /// insertion order, under either eviction strategy.
        #[test]
        fn entry_cap_holds(
            keys in prop::collection::vec(key_strategy(), 1..30),
            max_entries in 1usize..8,
            lru in any::<bool>()
        ) {
            let cache = ContextCache::new(CacheConfig {
                max_entries,
                eviction: if lru { EvictionStrategy::Lru } else { EvictionStrategy::Predictive },
                ..CacheConfig::default()
            });

            for key in &keys {
                cache.put(key, context_for(key, "payload"), BTreeSet::new()).unwrap();
                prop_assert!(cache.stats().entries <= max_entries);
            }
        }

        /// Total bytes always equal the sum of the live contexts' sizes.
        #[test]
        fn byte_accounting_is_coherent(
            keys in prop::collection::vec(key_strategy(), 1..20)
        ) {
            let cache = ContextCache::new(CacheConfig {
                max_entries: 8,
                ..CacheConfig::default()
            });

            let mut model: BTreeMap<String, usize> = BTreeMap::new();
            for key in &keys {
                let context = context_for(key, "payload");
                let size = context.size_bytes();
                cache.put(key, context, BTreeSet::new()).unwrap();
                model.insert(key.clone(), size);

                let stats = cache.stats();
                let live: usize = model
                    .iter()
                    .filter(|(k, _)| cache.get(k).is_some())
                    .map(|(_, s)| s)
                    .sum();
                prop_assert_eq!(stats.total_bytes, live);
                model.retain(|k, _| cache.get(k).is_some());
            }
        }

        /// Tag invalidation removes exactly the entries sharing a tag.
        #[test]
        fn tag_invalidation_matches_model(
            entries in prop::collection::vec((key_strategy(), tag_set_strategy()), 1..15),
            victim_tags in tag_set_strategy()
        ) {
            let cache = ContextCache::new(CacheConfig {
                max_entries: 64,
                ..CacheConfig::default()
            });

            let mut model: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
            for (key, tags) in &entries {
                cache.put(key, context_for(key, "payload"), tags.clone()).unwrap();
                model.insert(key.clone(), tags.clone());
            }

            let removed = cache.invalidate_by_tags(&victim_tags);
            let expected = model
                .values()
                .filter(|tags| !tags.is_disjoint(&victim_tags))
                .count();
            prop_assert_eq!(removed, expected);

            for (key, tags) in &model {
                let should_survive = tags.is_disjoint(&victim_tags);
                prop_assert_eq!(cache.get(key).is_some(), should_survive);
            }
        }
    }

    // ============================================================================
    // Fingerprint Properties
    // ============================================================================

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        /// Equal requests always fingerprint identically.
        #[test]
        fn fingerprint_is_stable(request in request_strategy()) {
            prop_assert_eq!(request.fingerprint(), request.clone().fingerprint());
        }

        /// Changing any identity field changes the fingerprint.
        #[test]
        fn fingerprint_is_sensitive(request in request_strategy()) {
            let mut other = request.clone();
            other.story_id.push('x');
            prop_assert_ne!(request.fingerprint(), other.fingerprint());

            let mut other = request.clone();
            other.max_tokens += 1;
            prop_assert_ne!(request.fingerprint(), other.fingerprint());
        }

        /// A cached request is always retrievable under its own fingerprint
        /// while the entry is live.
        #[test]
        fn fingerprint_roundtrips_through_cache(request in request_strategy()) {
            let cache = ContextCache::new(CacheConfig {
                ttl: Duration::from_secs(600),
                ..CacheConfig::default()
            });
            let key = request.fingerprint();
            cache.put(&key, context_for(&key, "payload"), BTreeSet::new()).unwrap();
            prop_assert!(cache.get(&key).is_some());
        }
    }
}
