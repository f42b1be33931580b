use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use std::hash::Hash;

use podseidon_k8s_api::labels;

/// An index from pod labels to the tracked selectors that match them.
///
/// Every equality requirement `k=v` of a tracked selector is posted into an
/// inverted `key -> value -> selectors` map. A query walks the posting lists
/// of the pod's actual labels and counts hits per selector: a selector whose
/// equality requirements are all satisfied is a candidate, and only
/// candidates are verified against the full selector (set-membership
/// requirements, `DoesNotExist`, and the like). Query cost is bounded by the
/// posting lists touched, not by the tracked-selector count.
///
/// Selectors with no equality requirement at all cannot be posted and are
/// verified on every query.
pub struct Selectors<K> {
    tracked: HashMap<K, Tracked>,
    by_label: HashMap<String, HashMap<String, HashSet<K>>>,
    unindexed: HashSet<K>,
}

struct Tracked {
    selector: labels::Selector,
    exact: usize,
}

impl<K> Default for Selectors<K> {
    fn default() -> Self {
        Self {
            tracked: HashMap::new(),
            by_label: HashMap::new(),
            unindexed: HashSet::new(),
        }
    }
}

impl<K: Clone + Eq + Hash> Selectors<K> {
    /// Tracks a selector under a key, replacing any previous entry for the
    /// same key. Subsequent queries reflect the new selector. Ill-formed
    /// selectors are rejected and the previous entry, if any, is dropped.
    pub fn track(&mut self, key: K, selector: labels::Selector) -> Result<(), labels::InvalidSelector> {
        self.untrack(&key);
        selector.validate()?;

        let mut exact = 0;
        for (k, v) in selector.exact_matches() {
            self.by_label
                .entry(k.to_string())
                .or_default()
                .entry(v.to_string())
                .or_default()
                .insert(key.clone());
            exact += 1;
        }
        if exact == 0 {
            self.unindexed.insert(key.clone());
        }
        self.tracked.insert(key, Tracked { selector, exact });
        Ok(())
    }

    /// Removes a key from the index. Idempotent.
    pub fn untrack(&mut self, key: &K) {
        let Some(tracked) = self.tracked.remove(key) else {
            return;
        };
        self.unindexed.remove(key);
        for (k, v) in tracked.selector.exact_matches() {
            let Some(values) = self.by_label.get_mut(k) else {
                continue;
            };
            if let Some(keys) = values.get_mut(v) {
                keys.remove(key);
                if keys.is_empty() {
                    values.remove(v);
                }
            }
            if values.is_empty() {
                self.by_label.remove(k);
            }
        }
    }

    /// Yields every tracked key whose selector matches the given labels.
    /// Order is unspecified but stable within a single query.
    pub fn query<'a>(&'a self, labels: &labels::Labels) -> impl Iterator<Item = &'a K> {
        let mut hits: HashMap<&K, usize> = HashMap::new();
        for (k, v) in labels.as_ref() {
            if let Some(keys) = self.by_label.get(k.as_str()).and_then(|vs| vs.get(v.as_str())) {
                for key in keys {
                    *hits.entry(key).or_insert(0) += 1;
                }
            }
        }

        let candidates = hits
            .into_iter()
            .filter(|(key, n)| {
                self.tracked
                    .get(*key)
                    .is_some_and(|tracked| tracked.exact == *n)
            })
            .map(|(key, _)| key)
            .chain(self.unindexed.iter());

        let matched: Vec<&K> = candidates
            .filter(|key| {
                self.tracked
                    .get(*key)
                    .is_some_and(|tracked| tracked.selector.matches(labels))
            })
            .collect();
        matched.into_iter()
    }

    pub fn len(&self) -> usize {
        self.tracked.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracked.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use podseidon_k8s_api::labels::{Expression, Labels, Operator, Selector};
    use std::iter::FromIterator;

    fn sorted<'a>(iter: impl Iterator<Item = &'a &'static str>) -> Vec<&'static str> {
        let mut keys: Vec<_> = iter.copied().collect();
        keys.sort_unstable();
        keys
    }

    #[test]
    fn query_resolves_exact_requirements() {
        let mut index = Selectors::default();
        index
            .track("store", Selector::from_iter(vec![("app", "store")]))
            .unwrap();
        index
            .track(
                "store-cache",
                Selector::from_iter(vec![("app", "store"), ("tier", "cache")]),
            )
            .unwrap();
        index
            .track("web", Selector::from_iter(vec![("app", "web")]))
            .unwrap();

        let labels = Labels::from_iter(vec![("app", "store"), ("tier", "cache")]);
        assert_eq!(sorted(index.query(&labels)), vec!["store", "store-cache"]);

        let labels = Labels::from_iter(vec![("app", "store")]);
        assert_eq!(sorted(index.query(&labels)), vec!["store"]);
    }

    #[test]
    fn expression_only_selectors_are_verified_every_query() {
        let mut index = Selectors::default();
        index
            .track(
                "has-tier",
                Selector::from_iter(vec![Expression::new("tier", Operator::Exists, &[])]),
            )
            .unwrap();

        let labels = Labels::from_iter(vec![("tier", "cache")]);
        assert_eq!(sorted(index.query(&labels)), vec!["has-tier"]);
        assert_eq!(index.query(&Labels::default()).count(), 0);
    }

    #[test]
    fn candidates_are_verified_against_the_full_selector() {
        let mut index = Selectors::default();
        let full = Selector::new(
            [("app".to_string(), "store".to_string())].into_iter().collect(),
            vec![Expression::new("tier", Operator::NotIn, &["cache"])],
        );
        index.track("not-cache", full).unwrap();

        let cache = Labels::from_iter(vec![("app", "store"), ("tier", "cache")]);
        assert_eq!(index.query(&cache).count(), 0);

        let db = Labels::from_iter(vec![("app", "store"), ("tier", "db")]);
        assert_eq!(sorted(index.query(&db)), vec!["not-cache"]);
    }

    #[test]
    fn unlabeled_pod_matches_only_empty_selectors() {
        let mut index = Selectors::default();
        index.track("everything", Selector::default()).unwrap();
        index
            .track("store", Selector::from_iter(vec![("app", "store")]))
            .unwrap();

        assert_eq!(sorted(index.query(&Labels::default())), vec!["everything"]);
    }

    #[test]
    fn track_untrack_track_is_equivalent_to_track() {
        let selector = Selector::from_iter(vec![("app", "store")]);
        let labels = Labels::from_iter(vec![("app", "store")]);

        let mut direct = Selectors::default();
        direct.track("store", selector.clone()).unwrap();
        let expected = sorted(direct.query(&labels));

        let mut cycled = Selectors::default();
        cycled.track("store", selector.clone()).unwrap();
        cycled.untrack(&"store");
        cycled.untrack(&"store");
        cycled.track("store", selector).unwrap();
        assert_eq!(sorted(cycled.query(&labels)), expected);
    }

    #[test]
    fn invalid_selector_is_rejected_and_untracked() {
        let mut index = Selectors::default();
        index
            .track("store", Selector::from_iter(vec![("app", "store")]))
            .unwrap();

        let invalid = Selector::from_iter(vec![Expression {
            key: "tier".into(),
            operator: Operator::In,
            values: None,
        }]);
        assert!(index.track("store", invalid).is_err());

        let labels = Labels::from_iter(vec![("app", "store")]);
        assert_eq!(index.query(&labels).count(), 0);
        assert!(index.is_empty());
    }

    #[test]
    fn retrack_replaces_the_previous_selector() {
        let mut index = Selectors::default();
        index
            .track("store", Selector::from_iter(vec![("app", "store")]))
            .unwrap();
        index
            .track("store", Selector::from_iter(vec![("app", "web")]))
            .unwrap();

        assert_eq!(
            index
                .query(&Labels::from_iter(vec![("app", "store")]))
                .count(),
            0,
        );
        assert_eq!(
            sorted(index.query(&Labels::from_iter(vec![("app", "web")]))),
            vec!["store"],
        );
    }
}
