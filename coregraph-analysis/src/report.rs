//! The queryable analysis report

use crate::findings::{Finding, FindingKind};
use crate::graph::{ObjectGraph, ObjectNode};
use serde::Serialize;
use std::collections::BTreeSet;

/// Summary counters for one analysis.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AnalysisStats {
    pub modules: usize,
    pub objects: usize,
    pub allocations: usize,
    pub edges: usize,
    pub findings: usize,
    pub lifted_accessors: usize,
}

/// Everything one analysis produced: the graph, the findings, and summary
/// statistics. Wholly derived from one immutable image; a second image
/// produces a wholly independent report.
#[derive(Debug, Serialize)]
pub struct AnalysisReport {
    pub graph: ObjectGraph,
    pub findings: Vec<Finding>,
    pub stats: AnalysisStats,
}

impl AnalysisReport {
    pub fn findings_of_kind(&self, kind: FindingKind) -> impl Iterator<Item = &Finding> {
        self.findings.iter().filter(move |f| f.kind == kind)
    }

    /// All leak findings, definite and possible.
    pub fn leaks(&self) -> impl Iterator<Item = &Finding> {
        self.findings.iter().filter(|f| {
            matches!(f.kind, FindingKind::DefiniteLeak | FindingKind::PossibleLeak)
        })
    }

    /// Base addresses of leaked allocations; the differ's unit of comparison.
    pub fn leak_addresses(&self) -> BTreeSet<u64> {
        self.leaks().map(|f| f.address).collect()
    }

    /// Every live object whose best-known type matches `type_name`.
    pub fn objects_of_type<'a>(&'a self, type_name: &'a str) -> Vec<&'a ObjectNode> {
        self.graph
            .objects_of_type(type_name)
            .map(|(_, node)| node)
            .collect()
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}
