//! Mapped modules and the per-analysis module map
//!
//! A [`MappedModule`] ties a binary's build identity to where it landed in
//! the dumped address space, its symbol table and its vtable index. The
//! [`ModuleMap`] is built once per analysis and passed by reference, never
//! held in process-wide state.

use crate::symbols::{SymbolTable, VtableHit, VtableIndex};
use coregraph_descriptors::BuildId;
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::info;

/// One binary mapped into the dumped process.
#[derive(Debug)]
pub struct MappedModule {
    pub path: PathBuf,
    pub build_id: BuildId,
    /// Difference between runtime and link-time addresses
    pub load_bias: u64,
    /// Runtime address ranges this module occupies
    pub ranges: Vec<(u64, u64)>,
    pub symbols: SymbolTable,
    pub vtables: VtableIndex,
}

impl MappedModule {
    /// Assemble a module view from its parts; the vtable index is derived
    /// from the symbol table at the module's load bias.
    pub fn new(
        path: impl Into<PathBuf>,
        build_id: BuildId,
        load_bias: u64,
        ranges: Vec<(u64, u64)>,
        symbols: SymbolTable,
    ) -> Self {
        let vtables = VtableIndex::from_symbols(&symbols, load_bias);
        Self {
            path: path.into(),
            build_id,
            load_bias,
            ranges,
            symbols,
            vtables,
        }
    }

    pub fn contains_address(&self, addr: u64) -> bool {
        self.ranges.iter().any(|&(lo, hi)| addr >= lo && addr < hi)
    }
}

/// All modules of one analysis, with address and build-id lookup.
#[derive(Debug, Default)]
pub struct ModuleMap {
    modules: Vec<MappedModule>,
    by_build: HashMap<BuildId, usize>,
}

impl ModuleMap {
    pub fn new(modules: Vec<MappedModule>) -> Self {
        let mut by_build = HashMap::new();
        for (idx, module) in modules.iter().enumerate() {
            by_build.insert(module.build_id.clone(), idx);
        }
        info!("module map with {} modules", modules.len());
        Self { modules, by_build }
    }

    pub fn push(&mut self, module: MappedModule) {
        self.by_build
            .insert(module.build_id.clone(), self.modules.len());
        self.modules.push(module);
    }

    pub fn modules(&self) -> &[MappedModule] {
        &self.modules
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    pub fn by_build_id(&self, build_id: &BuildId) -> Option<&MappedModule> {
        self.by_build.get(build_id).map(|&i| &self.modules[i])
    }

    pub fn module_for_address(&self, addr: u64) -> Option<&MappedModule> {
        self.modules.iter().find(|m| m.contains_address(addr))
    }

    /// Match a candidate vtable word against every module's closed
    /// address-point set. First hit wins; modules do not overlap.
    pub fn resolve_vtable(&self, word: u64) -> Option<VtableHit> {
        self.modules.iter().find_map(|m| m.vtables.resolve(word))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::symbols::{Symbol, SymbolKind};

    #[test]
    fn vtable_resolution_spans_modules() {
        let app = MappedModule::new(
            "/usr/bin/app",
            BuildId::new("app"),
            0,
            vec![(0x1000, 0x5000)],
            SymbolTable::from_symbols(vec![Symbol {
                name: "_ZTV6Widget".to_string(),
                address: 0x4000,
                size: 0x28,
                kind: SymbolKind::Data,
            }]),
        );
        let lib = MappedModule::new(
            "/usr/lib/libfoo.so",
            BuildId::new("libfoo"),
            0x7f0000000000,
            vec![(0x7f0000000000, 0x7f0000010000)],
            SymbolTable::from_symbols(vec![Symbol {
                name: "_ZTV5Gizmo".to_string(),
                address: 0x2000,
                size: 0x20,
                kind: SymbolKind::Data,
            }]),
        );
        let map = ModuleMap::new(vec![app, lib]);

        assert_eq!(map.resolve_vtable(0x4010).unwrap().type_name, "Widget");
        assert_eq!(
            map.resolve_vtable(0x7f0000002010).unwrap().type_name,
            "Gizmo"
        );
        assert!(map.resolve_vtable(0x9000).is_none());
        assert!(map.module_for_address(0x1234).is_some());
        assert!(map.by_build_id(&BuildId::new("libfoo")).is_some());
    }
}
