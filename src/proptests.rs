use std::collections::HashMap;

use proptest::prelude::*;
use proptest_derive::Arbitrary;

use crate::{FilterConfig, MortonFilter};

/// Operations to run against both the filter and the model.
#[derive(Arbitrary, Debug, Clone)]
enum Action {
    Insert(u64),
    Lookup(u64),
    Delete(u64),
}

/// Multiset model of every key whose insertion the filter accepted.
#[derive(Default)]
struct Model {
    counts: HashMap<u64, u32>,
}

impl Model {
    fn add(&mut self, key: u64) {
        *self.counts.entry(key).or_insert(0) += 1;
    }

    fn remove(&mut self, key: u64) {
        if let Some(count) = self.counts.get_mut(&key) {
            *count -= 1;
            if *count == 0 {
                self.counts.remove(&key);
            }
        }
    }

    fn contains(&self, key: u64) -> bool {
        self.counts.contains_key(&key)
    }

    /// Deterministically picks a present key near `hint`. Deletions only
    /// target keys the filter is known to hold, because deleting an aliased
    /// absent key may legitimately strip another key's fingerprint.
    fn pick_near(&self, hint: u64) -> Option<u64> {
        self.counts.keys().min_by_key(|&&key| key ^ hint).copied()
    }

    fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }
}

struct Harness {
    filter: MortonFilter,
    model: Model,
}

impl Harness {
    fn new() -> Self {
        Self {
            filter: MortonFilter::new(512, FilterConfig::default())
                .expect("filter should build"),
            model: Model::default(),
        }
    }

    fn run(&mut self, action: Action) {
        match action {
            Action::Insert(key) => {
                if self.filter.insert(key) {
                    self.model.add(key);
                }
            }
            Action::Lookup(key) => {
                if self.model.contains(key) {
                    assert!(
                        self.filter.likely_contains(key),
                        "false negative for present key {key}"
                    );
                }
            }
            Action::Delete(hint) => match self.model.pick_near(hint) {
                Some(key) => {
                    assert!(
                        self.filter.delete(key),
                        "failed to delete present key {key}"
                    );
                    self.model.remove(key);
                }
                None => {
                    // Model empty means the filter is empty too.
                    assert!(!self.filter.delete(hint));
                }
            },
        }
    }
}

proptest! {
    #[test]
    fn filter_tracks_model(actions in prop::collection::vec(any::<Action>(), 1..200)) {
        let mut harness = Harness::new();
        for action in actions {
            harness.run(action);
        }
        harness.filter.check_invariants();
        for &key in harness.model.counts.keys() {
            prop_assert!(
                harness.filter.likely_contains(key),
                "false negative for present key {}", key
            );
        }
        if harness.model.is_empty() {
            prop_assert!(harness.filter.is_empty());
        }
    }

    #[test]
    fn batched_insertion_matches_scalar(keys in prop::collection::vec(any::<u64>(), 1..300)) {
        let mut batched = MortonFilter::new(256, FilterConfig::default())
            .expect("filter should build");
        let mut scalar = MortonFilter::new(256, FilterConfig::default())
            .expect("filter should build");
        let batch_status = batched.insert_many(&keys);
        let scalar_status: Vec<bool> = keys.iter().map(|&key| scalar.insert(key)).collect();
        prop_assert_eq!(batch_status, scalar_status);
        prop_assert_eq!(&batched.blocks, &scalar.blocks);
    }

    #[test]
    fn delete_round_trips(keys in prop::collection::vec(any::<u64>(), 1..100)) {
        let mut filter = MortonFilter::new(1024, FilterConfig::default())
            .expect("filter should build");
        let mut accepted = Vec::new();
        for &key in &keys {
            if filter.insert(key) {
                accepted.push(key);
            }
        }
        for &key in &accepted {
            prop_assert!(filter.delete(key), "failed to delete inserted key {}", key);
        }
        prop_assert!(filter.is_empty());
        filter.check_invariants();
    }

    #[test]
    fn involution_holds(fp_seed in any::<u64>(), bucket_seed in any::<u64>()) {
        let filter = MortonFilter::new(1024, FilterConfig::default())
            .expect("filter should build");
        let fp = filter.fingerprint_of(crate::splitmix64(fp_seed));
        let bucket = bucket_seed % filter.bucket_count();
        let alt = filter.alt_bucket(bucket, fp);
        prop_assert!(alt < filter.bucket_count());
        prop_assert_eq!(filter.alt_bucket(alt, fp), bucket);
    }
}
