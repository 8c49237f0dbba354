//! Dependency bookkeeping between flags, prerequisites and segments.
//!
//! The tracker mirrors store contents as a pair of edge maps and answers
//! one question: after some item changed, which flags may now evaluate
//! differently? It also provides the dependency-safe ordering used when
//! writing a full data set to a persistent store.

use crate::models::{Clause, Flag, Op, Segment};
use crate::store::{AllData, DataKind, ItemDescriptor, StoreItem};
use std::collections::{HashMap, HashSet};

/// Identifies one stored item.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ItemKey {
    pub kind: DataKind,
    pub key: String,
}

impl ItemKey {
    pub fn flag<K: Into<String>>(key: K) -> Self {
        ItemKey {
            kind: DataKind::Flag,
            key: key.into(),
        }
    }

    pub fn segment<K: Into<String>>(key: K) -> Self {
        ItemKey {
            kind: DataKind::Segment,
            key: key.into(),
        }
    }
}

fn clause_segment_keys<'a>(clauses: &'a [Clause]) -> impl Iterator<Item = ItemKey> + 'a {
    clauses
        .iter()
        .filter(|clause| clause.op == Op::SegmentMatch)
        .flat_map(|clause| clause.values.iter())
        .filter_map(|value| value.as_str().map(ItemKey::segment))
}

/// The items this item directly depends on: a flag depends on its
/// prerequisite flags and any segments named in `segmentMatch` clauses;
/// a segment depends on segments named by its own rules.
pub fn compute_dependencies(item: &StoreItem) -> HashSet<ItemKey> {
    match item {
        StoreItem::Flag(flag) => flag_dependencies(flag),
        StoreItem::Segment(segment) => segment_dependencies(segment),
    }
}

fn flag_dependencies(flag: &Flag) -> HashSet<ItemKey> {
    let mut out: HashSet<ItemKey> = flag
        .prerequisites
        .iter()
        .map(|p| ItemKey::flag(p.key.clone()))
        .collect();
    for rule in &flag.rules {
        out.extend(clause_segment_keys(&rule.clauses));
    }
    out
}

fn segment_dependencies(segment: &Segment) -> HashSet<ItemKey> {
    let mut out = HashSet::new();
    for rule in &segment.rules {
        out.extend(clause_segment_keys(&rule.clauses));
    }
    out
}

/// Live mirror of the dependency graph.
///
/// `from` holds out-edges (what an item depends on), `to` the reverse.
/// Consistency invariant: for every stored item, the out-edges recorded
/// here are exactly those derived from its current definition.
#[derive(Debug, Default)]
pub struct DependencyTracker {
    from: HashMap<ItemKey, HashSet<ItemKey>>,
    to: HashMap<ItemKey, HashSet<ItemKey>>,
}

impl DependencyTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Re-derive the out-edges of `key` from `item` (`None` for a
    /// deletion), updating both maps.
    pub fn update_dependencies_of(&mut self, key: ItemKey, item: Option<&StoreItem>) {
        if let Some(old) = self.from.remove(&key) {
            for dep in old {
                if let Some(reverse) = self.to.get_mut(&dep) {
                    reverse.remove(&key);
                }
            }
        }

        let deps = match item {
            Some(item) => compute_dependencies(item),
            None => HashSet::new(),
        };
        for dep in &deps {
            self.to.entry(dep.clone()).or_default().insert(key.clone());
        }
        if !deps.is_empty() {
            self.from.insert(key, deps);
        }
    }

    /// Add `seed` and everything that transitively depends on it to
    /// `out`. Revisits are pruned by membership, so reference cycles
    /// terminate.
    pub fn add_affected_items(&self, out: &mut HashSet<ItemKey>, seed: &ItemKey) {
        if !out.insert(seed.clone()) {
            return;
        }
        let mut stack = vec![seed.clone()];
        while let Some(current) = stack.pop() {
            if let Some(dependents) = self.to.get(&current) {
                for dependent in dependents {
                    if out.insert(dependent.clone()) {
                        stack.push(dependent.clone());
                    }
                }
            }
        }
    }

    pub fn reset(&mut self) {
        self.from.clear();
        self.to.clear();
    }

    /// Rebuild the whole graph from a full data set.
    pub fn reset_from(&mut self, data: &AllData) {
        self.reset();
        for kind in &[DataKind::Flag, DataKind::Segment] {
            for (key, item) in data.live(*kind) {
                self.update_dependencies_of(
                    ItemKey {
                        kind: *kind,
                        key,
                    },
                    Some(&item),
                );
            }
        }
    }
}

/// Order a full data set so that writing it item by item never stores an
/// item before its dependencies: segments first, then flags with
/// prerequisites topologically ahead of their dependents.
///
/// Keys are visited in sorted order so the output is stable; an
/// already-visited set breaks reference cycles instead of recursing
/// forever on adversarial input.
pub fn sorted_collections(data: &AllData) -> Vec<(DataKind, Vec<(String, ItemDescriptor)>)> {
    let mut out = Vec::with_capacity(2);
    for kind in &[DataKind::Segment, DataKind::Flag] {
        let collection = data.collection(*kind);
        let mut keys: Vec<&String> = collection.keys().collect();
        keys.sort();

        let mut ordered = Vec::with_capacity(collection.len());
        let mut visited = HashSet::new();
        for key in keys {
            add_with_dependencies_first(*kind, key, collection, &mut visited, &mut ordered);
        }
        out.push((*kind, ordered));
    }
    out
}

fn add_with_dependencies_first(
    kind: DataKind,
    key: &str,
    collection: &HashMap<String, ItemDescriptor>,
    visited: &mut HashSet<String>,
    ordered: &mut Vec<(String, ItemDescriptor)>,
) {
    if !visited.insert(key.to_string()) {
        return;
    }
    let descriptor = match collection.get(key) {
        Some(descriptor) => descriptor,
        None => return,
    };
    if let Some(item) = descriptor.item() {
        for dep in compute_dependencies(item) {
            // only same-kind edges order within a collection
            if dep.kind == kind {
                add_with_dependencies_first(kind, &dep.key, collection, visited, ordered);
            }
        }
    }
    ordered.push((key.to_string(), descriptor.clone()));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{basis_of, FlagBuilder, SegmentBuilder};

    fn item(flag: Flag) -> StoreItem {
        flag.into()
    }

    #[test]
    fn extracts_flag_dependencies() {
        let flag = FlagBuilder::new("f")
            .prerequisite("p1", 0)
            .prerequisite("p2", 1)
            .segment_match_rule(&["seg-a", "seg-b"])
            .build();
        let deps = compute_dependencies(&item(flag));
        assert_eq!(
            deps,
            vec![
                ItemKey::flag("p1"),
                ItemKey::flag("p2"),
                ItemKey::segment("seg-a"),
                ItemKey::segment("seg-b"),
            ]
            .into_iter()
            .collect()
        );
    }

    #[test]
    fn extracts_segment_dependencies() {
        let segment = SegmentBuilder::new("s").segment_match_rule(&["inner"]).build();
        let deps = compute_dependencies(&segment.into());
        assert_eq!(deps, vec![ItemKey::segment("inner")].into_iter().collect());
    }

    #[test]
    fn fan_out_covers_direct_dependents() {
        // scenario: flag A prerequisites flag B; a change to B affects both
        let mut tracker = DependencyTracker::new();
        tracker.update_dependencies_of(
            ItemKey::flag("A"),
            Some(&item(FlagBuilder::new("A").prerequisite("B", 0).build())),
        );
        tracker.update_dependencies_of(ItemKey::flag("B"), Some(&item(FlagBuilder::new("B").build())));

        let mut affected = HashSet::new();
        tracker.add_affected_items(&mut affected, &ItemKey::flag("B"));
        assert_eq!(
            affected,
            vec![ItemKey::flag("A"), ItemKey::flag("B")].into_iter().collect()
        );
    }

    #[test]
    fn fan_out_is_transitive_through_flags_and_segments() {
        let mut tracker = DependencyTracker::new();
        // C -> B -> A, and F references segment S
        tracker.update_dependencies_of(
            ItemKey::flag("B"),
            Some(&item(FlagBuilder::new("B").prerequisite("A", 0).build())),
        );
        tracker.update_dependencies_of(
            ItemKey::flag("C"),
            Some(&item(FlagBuilder::new("C").prerequisite("B", 0).build())),
        );
        tracker.update_dependencies_of(
            ItemKey::flag("F"),
            Some(&item(FlagBuilder::new("F").segment_match_rule(&["S"]).build())),
        );

        let mut affected = HashSet::new();
        tracker.add_affected_items(&mut affected, &ItemKey::flag("A"));
        assert!(affected.contains(&ItemKey::flag("B")));
        assert!(affected.contains(&ItemKey::flag("C")));
        assert!(!affected.contains(&ItemKey::flag("F")));

        let mut affected = HashSet::new();
        tracker.add_affected_items(&mut affected, &ItemKey::segment("S"));
        assert_eq!(
            affected,
            vec![ItemKey::segment("S"), ItemKey::flag("F")].into_iter().collect()
        );
    }

    #[test]
    fn updating_an_item_replaces_its_edges() {
        let mut tracker = DependencyTracker::new();
        tracker.update_dependencies_of(
            ItemKey::flag("A"),
            Some(&item(FlagBuilder::new("A").prerequisite("B", 0).build())),
        );
        // new definition no longer depends on B
        tracker.update_dependencies_of(ItemKey::flag("A"), Some(&item(FlagBuilder::new("A").build())));

        let mut affected = HashSet::new();
        tracker.add_affected_items(&mut affected, &ItemKey::flag("B"));
        assert_eq!(affected, vec![ItemKey::flag("B")].into_iter().collect());
    }

    #[test]
    fn deletion_removes_edges() {
        let mut tracker = DependencyTracker::new();
        tracker.update_dependencies_of(
            ItemKey::flag("A"),
            Some(&item(FlagBuilder::new("A").prerequisite("B", 0).build())),
        );
        tracker.update_dependencies_of(ItemKey::flag("A"), None);

        let mut affected = HashSet::new();
        tracker.add_affected_items(&mut affected, &ItemKey::flag("B"));
        assert_eq!(affected, vec![ItemKey::flag("B")].into_iter().collect());
    }

    #[test]
    fn fan_out_terminates_on_cycles() {
        let mut tracker = DependencyTracker::new();
        tracker.update_dependencies_of(
            ItemKey::flag("A"),
            Some(&item(FlagBuilder::new("A").prerequisite("B", 0).build())),
        );
        tracker.update_dependencies_of(
            ItemKey::flag("B"),
            Some(&item(FlagBuilder::new("B").prerequisite("A", 0).build())),
        );
        let mut affected = HashSet::new();
        tracker.add_affected_items(&mut affected, &ItemKey::flag("A"));
        assert_eq!(affected.len(), 2);
    }

    #[test]
    fn sorter_puts_segments_first_and_orders_flags() {
        let data = basis_of(
            vec![
                FlagBuilder::new("a").prerequisite("b", 0).build(),
                FlagBuilder::new("b").prerequisite("c", 0).build(),
                FlagBuilder::new("c").build(),
            ],
            vec![SegmentBuilder::new("s").build()],
        );
        let sorted = sorted_collections(&data);
        assert_eq!(sorted[0].0, DataKind::Segment);
        assert_eq!(sorted[1].0, DataKind::Flag);

        let flag_order: Vec<&str> = sorted[1].1.iter().map(|(k, _)| k.as_str()).collect();
        let pos = |k: &str| flag_order.iter().position(|x| *x == k).unwrap();
        assert!(pos("c") < pos("b"));
        assert!(pos("b") < pos("a"));
    }

    #[test]
    fn sorter_survives_dependency_cycles() {
        let data = basis_of(
            vec![
                FlagBuilder::new("x").prerequisite("y", 0).build(),
                FlagBuilder::new("y").prerequisite("x", 0).build(),
            ],
            vec![],
        );
        let sorted = sorted_collections(&data);
        assert_eq!(sorted[1].1.len(), 2);
    }
}
