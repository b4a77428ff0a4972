//! Snapshot differ
//!
//! Maps between two finished reports built from two images of the same
//! process at different times. Comparison is by address and type; neither
//! graph is mutated.

use crate::report::AnalysisReport;
use serde::Serialize;
use std::collections::BTreeMap;

/// Structural difference between two snapshots.
#[derive(Debug, Default, Serialize, PartialEq, Eq)]
pub struct SnapshotDiff {
    /// Allocation bases present only in the second snapshot
    pub added_allocations: Vec<u64>,
    /// Allocation bases present only in the first
    pub removed_allocations: Vec<u64>,
    /// (base, first size, second size) for allocations present in both
    pub resized_allocations: Vec<(u64, u64, u64)>,
    /// Leaked bases present in the second snapshot's leak set but absent
    /// from the first's
    pub new_leaks: Vec<u64>,
    /// Leaked bases the second snapshot no longer reports
    pub resolved_leaks: Vec<u64>,
    /// (address, type) object keys present only in the second snapshot
    pub added_objects: Vec<(u64, String)>,
    /// (address, type) object keys present only in the first
    pub removed_objects: Vec<(u64, String)>,
}

impl SnapshotDiff {
    pub fn is_empty(&self) -> bool {
        self == &SnapshotDiff::default()
    }
}

/// Diff two reports: `first` is the earlier snapshot.
pub fn diff_reports(first: &AnalysisReport, second: &AnalysisReport) -> SnapshotDiff {
    let mut diff = SnapshotDiff::default();

    let first_allocs: BTreeMap<u64, u64> = first
        .graph
        .allocations()
        .iter()
        .map(|a| (a.base, a.size))
        .collect();
    let second_allocs: BTreeMap<u64, u64> = second
        .graph
        .allocations()
        .iter()
        .map(|a| (a.base, a.size))
        .collect();

    for (&base, &size) in &second_allocs {
        match first_allocs.get(&base) {
            None => diff.added_allocations.push(base),
            Some(&old) if old != size => diff.resized_allocations.push((base, old, size)),
            Some(_) => {}
        }
    }
    for &base in first_allocs.keys() {
        if !second_allocs.contains_key(&base) {
            diff.removed_allocations.push(base);
        }
    }

    let first_leaks = first.leak_addresses();
    let second_leaks = second.leak_addresses();
    diff.new_leaks = second_leaks.difference(&first_leaks).copied().collect();
    diff.resolved_leaks = first_leaks.difference(&second_leaks).copied().collect();

    let object_keys = |report: &AnalysisReport| -> BTreeMap<(u64, String), ()> {
        report
            .graph
            .objects()
            .iter()
            .map(|o| {
                (
                    (o.address, o.best_type().unwrap_or_default().to_string()),
                    (),
                )
            })
            .collect()
    };
    let first_objects = object_keys(first);
    let second_objects = object_keys(second);
    for key in second_objects.keys() {
        if !first_objects.contains_key(key) {
            diff.added_objects.push(key.clone());
        }
    }
    for key in first_objects.keys() {
        if !second_objects.contains_key(key) {
            diff.removed_objects.push(key.clone());
        }
    }

    diff
}
