//! Unified analysis entry point
//!
//! A [`CoreAnalyzer`] holds the ingredients of one analysis — the immutable
//! image, the descriptor registry and the mapped-module view — and runs the
//! pipeline: allocation reconstruction, root-driven discovery, reachability
//! and integrity. Module indexing is the parallel phase (symbol tables and
//! vtable indexes are independent per module); the graph build itself is
//! single-writer.

use crate::alloc::{AllocationCatalog, AllocatorLayout, HeapArena};
use crate::classify::{CapabilityClassifier, ClassifyContext};
use crate::config::AnalysisConfig;
use crate::reach::analyze_reachability;
use crate::report::{AnalysisReport, AnalysisStats};
use crate::roots::RootReference;
use crate::traverse::GraphBuilder;
use crate::Result;
use coregraph_descriptors::{BuildId, DescriptorRegistry, ModuleCatalog};
use coregraph_image::{MappedModule, MemoryImage, ModuleMap, Symbol, SymbolTable};
use coregraph_lifter::{AccessorCache, AccessorLifter};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task;
use tracing::{info, warn};

/// Where a module's symbols come from.
pub enum ModuleSymbolSource {
    /// Executable bytes of the mapped binary; parsed with `object`
    ObjectBytes(Vec<u8>),
    /// Pre-extracted symbol list (external core readers, tests)
    Symbols(Vec<Symbol>),
    /// No symbol information available; the module degrades to partial
    /// results (no vtable recovery inside it)
    None,
}

/// One mapped binary handed to the indexing phase.
pub struct ModuleInput {
    pub path: PathBuf,
    pub build_id: BuildId,
    pub load_bias: u64,
    pub ranges: Vec<(u64, u64)>,
    pub source: ModuleSymbolSource,
}

/// Events emitted while indexing modules.
#[derive(Debug, Clone)]
pub enum AnalysisEvent {
    ModuleIndexing {
        module_path: String,
        current: usize,
        total: usize,
    },
    ModuleIndexed {
        module_path: String,
        symbols: usize,
        vtables: usize,
        elapsed_ms: u64,
        current: usize,
        total: usize,
    },
}

fn build_module(input: ModuleInput) -> MappedModule {
    let symbols = match input.source {
        ModuleSymbolSource::ObjectBytes(bytes) => match SymbolTable::from_object_bytes(&bytes) {
            Ok(table) => table,
            Err(e) => {
                warn!(
                    "symbol parse failed for {}: {e}; continuing with partial results",
                    input.path.display()
                );
                SymbolTable::from_symbols(Vec::new())
            }
        },
        ModuleSymbolSource::Symbols(list) => SymbolTable::from_symbols(list),
        ModuleSymbolSource::None => SymbolTable::from_symbols(Vec::new()),
    };
    MappedModule::new(
        input.path,
        input.build_id,
        input.load_bias,
        input.ranges,
        symbols,
    )
}

/// Index modules in parallel: per-module symbol tables and vtable indexes are
/// independent work, capped by a semaphore.
pub async fn index_modules(inputs: Vec<ModuleInput>, max_concurrency: usize) -> Result<ModuleMap> {
    index_modules_with_progress(inputs, max_concurrency, |_event| {}).await
}

/// Parallel indexing with a progress callback.
pub async fn index_modules_with_progress<F>(
    inputs: Vec<ModuleInput>,
    max_concurrency: usize,
    progress: F,
) -> Result<ModuleMap>
where
    F: Fn(AnalysisEvent) + Send + Sync + 'static,
{
    let total = inputs.len();
    let semaphore = Arc::new(tokio::sync::Semaphore::new(max_concurrency.max(1)));
    let progress = Arc::new(progress);

    let tasks: Vec<_> = inputs
        .into_iter()
        .enumerate()
        .map(|(index, input)| {
            let semaphore = Arc::clone(&semaphore);
            let progress = Arc::clone(&progress);
            task::spawn(async move {
                let _permit = semaphore.acquire().await?;
                let module_path = input.path.display().to_string();
                progress(AnalysisEvent::ModuleIndexing {
                    module_path: module_path.clone(),
                    current: index + 1,
                    total,
                });

                let start = std::time::Instant::now();
                let module = task::spawn_blocking(move || build_module(input)).await?;

                progress(AnalysisEvent::ModuleIndexed {
                    module_path,
                    symbols: module.symbols.len(),
                    vtables: module.vtables.len(),
                    elapsed_ms: start.elapsed().as_millis() as u64,
                    current: index + 1,
                    total,
                });
                Ok::<_, anyhow::Error>(module)
            })
        })
        .collect();

    let results = futures::future::try_join_all(tasks).await?;
    let modules = results.into_iter().collect::<Result<Vec<_>>>()?;
    info!("indexed {} modules", modules.len());
    Ok(ModuleMap::new(modules))
}

/// Sequential indexing, for callers without an async runtime.
pub fn index_modules_sequential(inputs: Vec<ModuleInput>) -> ModuleMap {
    let modules = inputs.into_iter().map(build_module).collect();
    ModuleMap::new(modules)
}

/// One analysis over one immutable image. Separate analyses share nothing
/// and may run concurrently over the same image.
pub struct CoreAnalyzer {
    image: MemoryImage,
    registry: DescriptorRegistry,
    modules: ModuleMap,
    alternates: HashMap<BuildId, ModuleCatalog>,
    config: AnalysisConfig,
}

impl CoreAnalyzer {
    pub fn new(image: MemoryImage, registry: DescriptorRegistry, modules: ModuleMap) -> Self {
        Self {
            image,
            registry,
            modules,
            alternates: HashMap::new(),
            config: AnalysisConfig::default(),
        }
    }

    pub fn with_config(mut self, config: AnalysisConfig) -> Self {
        self.config = config;
        self
    }

    /// Register an alternate build of a module, used for cross-binary
    /// accessor substitution (and only after the ODR equivalence check).
    pub fn with_alternate(mut self, primary: BuildId, catalog: ModuleCatalog) -> Self {
        self.alternates.insert(primary, catalog);
        self
    }

    pub fn image(&self) -> &MemoryImage {
        &self.image
    }

    pub fn registry(&self) -> &DescriptorRegistry {
        &self.registry
    }

    pub fn modules(&self) -> &ModuleMap {
        &self.modules
    }

    /// Heap arenas guessed from region labels and permissions. Callers with
    /// allocator state descriptors can pass exact arenas instead.
    pub fn detect_heap_arenas(&self) -> Vec<HeapArena> {
        self.image
            .heap_candidate_regions()
            .map(|r| HeapArena {
                start: r.start(),
                end: r.end(),
            })
            .collect()
    }

    /// Allocator layout from whichever module carries the allocator's debug
    /// information, with the glibc default as fallback.
    pub fn allocator_layout(&self) -> AllocatorLayout {
        self.registry
            .modules()
            .find_map(AllocatorLayout::from_catalog)
            .unwrap_or_else(AllocatorLayout::glibc_x86_64)
    }

    /// Run the full pipeline with auto-detected arenas.
    pub fn analyze(&self, roots: &[RootReference]) -> Result<AnalysisReport> {
        let arenas = self.detect_heap_arenas();
        let layout = self.allocator_layout();
        self.analyze_with(roots, &arenas, &layout)
    }

    /// Run the full pipeline over explicit arenas and allocator layout.
    pub fn analyze_with(
        &self,
        roots: &[RootReference],
        arenas: &[HeapArena],
        layout: &AllocatorLayout,
    ) -> Result<AnalysisReport> {
        let lifter = AccessorLifter::new()?;
        let cache = AccessorCache::new();
        let classifier = CapabilityClassifier::new();
        let ctx = ClassifyContext {
            registry: &self.registry,
            lifter: &lifter,
            cache: &cache,
            alternates: &self.alternates,
        };

        let mut allocations = AllocationCatalog::default();
        for arena in arenas {
            allocations.reconstruct_arena(&self.image, *arena, layout);
        }
        info!(
            "reconstructed {} allocations over {} arena bytes",
            allocations.allocations.len(),
            allocations.arena_span
        );

        let builder = GraphBuilder::new(
            &self.image,
            &self.registry,
            &self.modules,
            &classifier,
            ctx,
            &self.config,
        );
        let (mut graph, mut findings) = builder.build(roots, &allocations);
        analyze_reachability(&mut graph, &mut findings);

        let stats = AnalysisStats {
            modules: self.modules.len(),
            objects: graph.object_count(),
            allocations: graph.allocation_count(),
            edges: graph.edge_count(),
            findings: findings.len(),
            lifted_accessors: cache.len(),
        };
        info!(
            "analysis complete: {} objects, {} allocations, {} edges, {} findings",
            stats.objects, stats.allocations, stats.edges, stats.findings
        );
        Ok(AnalysisReport {
            graph,
            findings,
            stats,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coregraph_image::SymbolKind;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn input(name: &str, bias: u64) -> ModuleInput {
        ModuleInput {
            path: PathBuf::from(format!("/usr/lib/{name}.so")),
            build_id: BuildId::new(name),
            load_bias: bias,
            ranges: vec![(bias, bias + 0x10000)],
            source: ModuleSymbolSource::Symbols(vec![Symbol {
                name: "_ZTV6Widget".to_string(),
                address: 0x4000,
                size: 0x20,
                kind: SymbolKind::Data,
            }]),
        }
    }

    #[tokio::test]
    async fn parallel_indexing_reports_progress_per_module() {
        let inputs = vec![
            input("liba", 0x100000000),
            input("libb", 0x200000000),
            input("libc", 0x300000000),
        ];
        let indexed = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&indexed);
        let modules = index_modules_with_progress(inputs, 2, move |event| {
            if let AnalysisEvent::ModuleIndexed { .. } = event {
                seen.fetch_add(1, Ordering::SeqCst);
            }
        })
        .await
        .unwrap();

        assert_eq!(modules.len(), 3);
        assert_eq!(indexed.load(Ordering::SeqCst), 3);
        // Each module's vtable index resolved at its own bias.
        assert!(modules.resolve_vtable(0x100004010).is_some());
        assert!(modules.resolve_vtable(0x300004010).is_some());
    }

    #[test]
    fn unparsable_symbols_degrade_to_partial_results() {
        let module = build_module(ModuleInput {
            path: PathBuf::from("/usr/lib/broken.so"),
            build_id: BuildId::new("broken"),
            load_bias: 0,
            ranges: vec![(0, 0x1000)],
            source: ModuleSymbolSource::ObjectBytes(vec![0xde, 0xad]),
        });
        assert!(module.symbols.is_empty());
        assert!(module.vtables.is_empty());
    }
}
