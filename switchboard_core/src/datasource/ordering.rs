//! Initialization ordering for full data snapshots.
//!
//! Stores (persistent ones in particular) must see segments before the flags
//! that may reference them, and prerequisite flags before their dependents,
//! so that a reader racing with `init` never observes a dangling reference.
use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::store::{AllData, DataKind, StoreItem};

use super::SnapshotData;

/// Order a snapshot for `store.init`: segments first, then flags topologically
/// sorted so prerequisites precede dependents (Kahn's algorithm).
///
/// Prerequisite cycles cannot abort initialization: flags involved in one are
/// appended at the end and will evaluate as malformed instead.
pub fn sort_snapshot(snapshot: SnapshotData) -> AllData {
    let SnapshotData { flags, segments } = snapshot;

    let mut segment_items: Vec<(String, StoreItem)> = segments
        .into_iter()
        .map(|(key, segment)| (key, StoreItem::Segment(segment)))
        .collect();
    segment_items.sort_by(|(a, _), (b, _)| a.cmp(b));

    // Dependency edges restricted to flags present in this snapshot.
    let mut remaining_degree: BTreeMap<&str, usize> = BTreeMap::new();
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
    for (key, flag) in &flags {
        let degree = flag
            .prerequisites
            .iter()
            .filter(|p| flags.contains_key(&p.key))
            .count();
        remaining_degree.insert(key, degree);
        for prerequisite in &flag.prerequisites {
            if flags.contains_key(&prerequisite.key) {
                dependents
                    .entry(prerequisite.key.as_str())
                    .or_default()
                    .push(key);
            }
        }
    }

    let mut ready: BTreeSet<&str> = remaining_degree
        .iter()
        .filter(|(_, degree)| **degree == 0)
        .map(|(key, _)| *key)
        .collect();
    let mut order: Vec<&str> = Vec::with_capacity(flags.len());

    while let Some(key) = ready.pop_first() {
        remaining_degree.remove(key);
        order.push(key);
        for dependent in dependents.remove(key).unwrap_or_default() {
            if let Some(degree) = remaining_degree.get_mut(dependent) {
                *degree -= 1;
                if *degree == 0 {
                    ready.insert(dependent);
                }
            }
        }
    }

    if !remaining_degree.is_empty() {
        let cyclic: Vec<&str> = remaining_degree.keys().copied().collect();
        log::warn!(target: "switchboard",
            "prerequisite cycle among flags {:?}; they will evaluate as malformed", cyclic);
        order.extend(cyclic);
    }

    let order: Vec<String> = order.into_iter().map(str::to_owned).collect();
    drop(remaining_degree);
    drop(dependents);
    let mut flags = flags;
    let flag_items: Vec<(String, StoreItem)> = order
        .into_iter()
        .map(|key| {
            let flag = flags.remove(&key).expect("ordered key came from the map");
            (key, StoreItem::Flag(flag))
        })
        .collect();

    AllData {
        data: vec![
            (DataKind::Segments, segment_items),
            (DataKind::Features, flag_items),
        ],
    }
}
