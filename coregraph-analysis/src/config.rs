//! Analysis configuration
//!
//! Every budget here is a correctness requirement, not a performance knob:
//! the subject memory may be corrupted, so every traversal that chases
//! pointers or runs lifted accessor logic must be bounded.

/// Configuration for one analysis run.
#[derive(Debug, Clone)]
pub struct AnalysisConfig {
    /// Step budget for a single accessor evaluation
    pub accessor_step_budget: usize,
    /// Maximum elements walked per container before the walk is reported as
    /// divergent (cyclic or corrupted container)
    pub max_container_iterations: u32,
    /// Cap on discovered objects across the whole graph
    pub max_objects: usize,
    /// Alignment a word must have to be considered a pointer candidate
    pub pointer_alignment: u64,
    /// Conservative aligned-word scan over untyped allocations
    pub conservative_scan: bool,
    /// Blind vtable scan over heap regions for objects with no declared type
    pub blind_scan: bool,
    /// Weight allocation ranking by size in addition to outgoing edge count
    pub rank_weight_by_size: bool,
    /// Concurrency cap for the parallel module indexing phase
    pub max_module_concurrency: usize,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            accessor_step_budget: 4096,
            max_container_iterations: 65536,
            max_objects: 1 << 20,
            pointer_alignment: 8,
            conservative_scan: true,
            blind_scan: false,
            rank_weight_by_size: false,
            max_module_concurrency: num_cpus::get(),
        }
    }
}

impl AnalysisConfig {
    /// Thorough configuration: blind scanning on, size-weighted ranking.
    pub fn exhaustive() -> Self {
        Self {
            blind_scan: true,
            rank_weight_by_size: true,
            ..Default::default()
        }
    }

    /// Cheap configuration for quick triage: typed traversal only.
    pub fn quick() -> Self {
        Self {
            conservative_scan: false,
            max_container_iterations: 4096,
            ..Default::default()
        }
    }

    pub fn accessor_step_budget(mut self, budget: usize) -> Self {
        self.accessor_step_budget = budget;
        self
    }

    pub fn max_container_iterations(mut self, cap: u32) -> Self {
        self.max_container_iterations = cap;
        self
    }

    pub fn max_objects(mut self, cap: usize) -> Self {
        self.max_objects = cap;
        self
    }

    pub fn conservative_scan(mut self, enable: bool) -> Self {
        self.conservative_scan = enable;
        self
    }

    pub fn blind_scan(mut self, enable: bool) -> Self {
        self.blind_scan = enable;
        self
    }

    pub fn rank_weight_by_size(mut self, enable: bool) -> Self {
        self.rank_weight_by_size = enable;
        self
    }

    pub fn max_module_concurrency(mut self, limit: usize) -> Self {
        self.max_module_concurrency = limit.max(1);
        self
    }
}
