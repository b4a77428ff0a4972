//! Root references
//!
//! Roots are where discovery starts: module-scope globals and thread-locals
//! enumerated from the descriptor catalogs, plus stack locals supplied by the
//! external unwinder (stack unwinding itself is outside this engine).

use coregraph_descriptors::{
    BuildId, DescriptorRegistry, TypeDescriptor, VariableDescriptor, VariableKind,
};
use coregraph_image::ModuleMap;
use std::collections::HashMap;
use tracing::debug;

#[derive(Debug, Clone, PartialEq)]
pub enum RootKind {
    Global,
    /// A stack local valid at the thread's captured program counter
    Local { pc: u64 },
    ThreadLocal,
}

/// One root: a typed address to start discovery from.
#[derive(Debug, Clone)]
pub struct RootReference {
    pub kind: RootKind,
    pub name: String,
    /// Runtime address of the variable's storage
    pub address: u64,
    pub ty: TypeDescriptor,
}

/// Enumerate global-variable roots across every module, applying each
/// module's load bias to the link-time addresses.
pub fn enumerate_global_roots(
    registry: &DescriptorRegistry,
    modules: &ModuleMap,
) -> Vec<RootReference> {
    let mut roots = Vec::new();
    for catalog in registry.modules() {
        let bias = modules
            .by_build_id(catalog.build_id())
            .map(|m| m.load_bias)
            .unwrap_or(0);
        for var in catalog.variables() {
            if !matches!(var.kind, VariableKind::Global) {
                continue;
            }
            let Some(link) = var.link_address else {
                continue;
            };
            roots.push(RootReference {
                kind: RootKind::Global,
                name: var.name.clone(),
                address: link + bias,
                ty: var.ty.clone(),
            });
        }
    }
    debug!("enumerated {} global roots", roots.len());
    roots
}

/// Enumerate thread-local roots given each module's per-thread TLS block
/// bases (one entry per thread).
pub fn enumerate_thread_local_roots(
    registry: &DescriptorRegistry,
    tls_bases: &HashMap<BuildId, Vec<u64>>,
) -> Vec<RootReference> {
    let mut roots = Vec::new();
    for catalog in registry.modules() {
        let Some(bases) = tls_bases.get(catalog.build_id()) else {
            continue;
        };
        for var in catalog.variables() {
            let VariableKind::ThreadLocal { tls_offset } = var.kind else {
                continue;
            };
            for &base in bases {
                roots.push(RootReference {
                    kind: RootKind::ThreadLocal,
                    name: var.name.clone(),
                    address: base + tls_offset,
                    ty: var.ty.clone(),
                });
            }
        }
    }
    roots
}

/// Build a local-variable root from the unwinder's resolved frame slot,
/// honoring the descriptor's program-counter validity range.
pub fn local_root(
    var: &VariableDescriptor,
    pc: u64,
    resolved_address: u64,
) -> Option<RootReference> {
    if !var.in_scope_at(pc) {
        return None;
    }
    Some(RootReference {
        kind: RootKind::Local { pc },
        name: var.name.clone(),
        address: resolved_address,
        ty: var.ty.clone(),
    })
}
