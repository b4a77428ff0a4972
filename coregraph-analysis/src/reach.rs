//! Reachability, leak classification and retention ranking
//!
//! Reachability propagates over validated edges only. An edge whose source
//! lies outside every known allocation originates from the root set (globals,
//! stacks, registers); edges between allocations propagate. Unreached used
//! allocations split into definite leaks (no edge to their base address at
//! all) and possible leaks (referenced only at a non-zero offset, including
//! one-past-the-end, or only from memory that is itself unreachable).

use crate::config::AnalysisConfig;
use crate::findings::{Finding, FindingKind};
use crate::graph::{AllocationId, ChunkState, EdgeValidity, ObjectGraph, TargetRef};
use std::collections::{HashMap, HashSet, VecDeque};
use tracing::debug;

/// Mark reachable allocations, classify leaks, and append the leak findings.
/// Re-running on an unchanged graph appends an identical finding set.
pub fn analyze_reachability(graph: &mut ObjectGraph, findings: &mut Vec<Finding>) {
    // source allocation (or None for root provenance) -> target allocations
    let mut from_roots: HashSet<AllocationId> = HashSet::new();
    let mut between: HashMap<AllocationId, Vec<AllocationId>> = HashMap::new();
    // Incoming reference shapes per allocation, for leak classification.
    let mut base_referenced: HashSet<AllocationId> = HashSet::new();
    let mut interior_referenced: HashSet<AllocationId> = HashSet::new();

    for edge in graph.edges() {
        if edge.validity != EdgeValidity::Valid {
            continue;
        }
        let Some(target_ref) = graph.target_ref(edge.target) else {
            continue;
        };
        let (target_id, is_base) = match target_ref {
            TargetRef::Base(id) => (id, true),
            TargetRef::Interior(id, _) => (id, false),
            TargetRef::PastEnd(id) => (id, false),
        };
        if is_base {
            base_referenced.insert(target_id);
        } else {
            // Interior and one-past-the-end references soften the leak
            // verdict but do not confer reachability.
            interior_referenced.insert(target_id);
            continue;
        }

        match graph.allocation_containing(edge.source) {
            Some(source_id) => between.entry(source_id).or_default().push(target_id),
            None => {
                from_roots.insert(target_id);
            }
        }
    }

    // BFS over the allocation graph.
    let mut reachable: HashSet<AllocationId> = HashSet::new();
    let mut queue: VecDeque<AllocationId> = from_roots.iter().copied().collect();
    while let Some(id) = queue.pop_front() {
        if !reachable.insert(id) {
            continue;
        }
        if let Some(targets) = between.get(&id) {
            for &t in targets {
                if !reachable.contains(&t) {
                    queue.push_back(t);
                }
            }
        }
    }
    debug!(
        "{} of {} allocations reachable from the root set",
        reachable.len(),
        graph.allocation_count()
    );

    for idx in 0..graph.allocation_count() {
        let id = AllocationId(idx as u32);
        let is_reachable = reachable.contains(&id);
        let node = graph.allocation_mut(id);
        node.reachable = is_reachable;
        if is_reachable || node.state != ChunkState::Used {
            continue;
        }

        let (base, size) = (node.base, node.size);
        if !base_referenced.contains(&id) && !interior_referenced.contains(&id) {
            findings.push(Finding::new(
                FindingKind::DefiniteLeak,
                base,
                format!("allocation of {size} bytes has no incoming pointer edge"),
            ));
        } else if !base_referenced.contains(&id) {
            findings.push(Finding::new(
                FindingKind::PossibleLeak,
                base,
                format!(
                    "allocation of {size} bytes is referenced only at a non-zero offset"
                ),
            ));
        } else {
            findings.push(Finding::new(
                FindingKind::PossibleLeak,
                base,
                format!(
                    "allocation of {size} bytes is referenced only from unreachable memory"
                ),
            ));
        }
    }
}

/// Rank reachable used allocations by outgoing validated edge count,
/// optionally weighted by size, surfacing the subtrees most responsible for
/// retained memory. Descending; ties broken by address for determinism.
pub fn rank_allocations(graph: &ObjectGraph, config: &AnalysisConfig) -> Vec<(AllocationId, u64)> {
    let mut outgoing: HashMap<AllocationId, u64> = HashMap::new();
    for edge in graph.edges() {
        if edge.validity != EdgeValidity::Valid {
            continue;
        }
        if let Some(source_id) = graph.allocation_containing(edge.source) {
            *outgoing.entry(source_id).or_default() += 1;
        }
    }

    let mut ranked: Vec<(AllocationId, u64)> = graph
        .allocations()
        .iter()
        .enumerate()
        .filter(|(_, a)| a.reachable && a.state == ChunkState::Used)
        .map(|(idx, a)| {
            let id = AllocationId(idx as u32);
            let count = outgoing.get(&id).copied().unwrap_or(0);
            let score = if config.rank_weight_by_size {
                (count + 1) * a.size
            } else {
                count
            };
            (id, score)
        })
        .collect();
    ranked.sort_by_key(|&(id, score)| (std::cmp::Reverse(score), graph.allocation(id).base));
    ranked
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{AllocationNode, PointerEdge};

    fn alloc(base: u64, size: u64, state: ChunkState) -> AllocationNode {
        AllocationNode {
            base,
            size,
            chunk_base: base - 16,
            chunk_size: size + 16,
            state,
            objects: Vec::new(),
            reachable: false,
        }
    }

    fn edge(source: u64, target: u64) -> PointerEdge {
        PointerEdge {
            source,
            source_object: None,
            offset: 0,
            target,
            validity: EdgeValidity::Valid,
        }
    }

    /// Roots at 0x500000 (outside any allocation); heap allocations at
    /// 0x1000 (reached), 0x2000 (reached via 0x1000), 0x3000 (leaked).
    fn graph() -> ObjectGraph {
        let mut g = ObjectGraph::new();
        g.add_allocation(alloc(0x1000, 0x40, ChunkState::Used));
        g.add_allocation(alloc(0x2000, 0x40, ChunkState::Used));
        g.add_allocation(alloc(0x3000, 0x40, ChunkState::Used));
        g.add_edge(edge(0x500000, 0x1000));
        g.add_edge(edge(0x1008, 0x2000));
        g
    }

    #[test]
    fn reachability_propagates_through_allocations() {
        let mut g = graph();
        let mut findings = Vec::new();
        analyze_reachability(&mut g, &mut findings);
        assert!(g.allocation(AllocationId(0)).reachable);
        assert!(g.allocation(AllocationId(1)).reachable);
        assert!(!g.allocation(AllocationId(2)).reachable);
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].kind, FindingKind::DefiniteLeak);
        assert_eq!(findings[0].address, 0x3000);
    }

    #[test]
    fn interior_only_reference_is_a_possible_leak() {
        let mut g = graph();
        // A root-side pointer into the middle of the third allocation.
        g.add_edge(edge(0x500008, 0x3010));
        let mut findings = Vec::new();
        analyze_reachability(&mut g, &mut findings);
        // Interior references do not confer reachability, only soften the
        // leak verdict.
        assert!(!g.allocation(AllocationId(2)).reachable);
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].kind, FindingKind::PossibleLeak);
    }

    #[test]
    fn leak_classification_is_idempotent() {
        let mut g = graph();
        let mut first = Vec::new();
        analyze_reachability(&mut g, &mut first);
        let mut second = Vec::new();
        analyze_reachability(&mut g, &mut second);
        assert_eq!(first, second);
    }

    #[test]
    fn ranking_orders_by_outgoing_edges() {
        let mut g = graph();
        // Give 0x2000 two outgoing edges, 0x1000 has one.
        g.add_edge(edge(0x2000, 0x1000));
        g.add_edge(edge(0x2010, 0x1010));
        let mut findings = Vec::new();
        analyze_reachability(&mut g, &mut findings);
        let ranked = rank_allocations(&g, &AnalysisConfig::default());
        assert_eq!(ranked[0].0, AllocationId(1));
        assert_eq!(ranked[0].1, 2);
        assert_eq!(ranked[1].0, AllocationId(0));
        assert_eq!(ranked[1].1, 1);
    }
}
