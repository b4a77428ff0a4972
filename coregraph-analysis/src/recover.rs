//! Dynamic type recovery
//!
//! A machine word is accepted as a vtable pointer only when it matches,
//! exactly and pointer-aligned, the closed set of address points derived from
//! the mapped binaries' vtable symbols. This works through stripped binaries
//! and with runtime type information disabled — the vtable address is the
//! fingerprint, not RTTI. Reference-counted smart pointers whose payload
//! carries no vtable can still be typed through the vtable of their control
//! block, attributing the recovered type to the pointee.

use coregraph_descriptors::demangle;
use coregraph_image::{MemoryImage, ModuleMap, VtableHit};
use tracing::debug;

/// How a dynamic type was recovered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryVia {
    /// The object's own leading word matched a vtable address point
    DirectVtable,
    /// The control block of a reference-counted pointer matched; the type is
    /// attributed to the pointee
    ControlBlock,
    /// Found by the blind aligned-word scan over untyped memory
    BlindScan,
}

/// A successful recovery.
#[derive(Debug, Clone)]
pub struct RecoveredType {
    pub type_name: String,
    pub hit: VtableHit,
    pub via: RecoveryVia,
}

/// Vtable- and control-block-based type refinement over one image.
pub struct TypeRecovery<'a> {
    image: &'a MemoryImage,
    modules: &'a ModuleMap,
}

impl<'a> TypeRecovery<'a> {
    pub fn new(image: &'a MemoryImage, modules: &'a ModuleMap) -> Self {
        Self { image, modules }
    }

    /// Try to recover the dynamic type of an object at `addr` from its
    /// leading word. The primary (offset-zero subobject) vtable occurrence is
    /// what a well-formed object's first word points at; secondary address
    /// points still identify the type for multiple-inheritance layouts.
    pub fn recover_at(&self, addr: u64) -> Option<RecoveredType> {
        let word = self.image.read_pointer(addr).ok()?;
        let hit = self.modules.resolve_vtable(word)?;
        debug!(
            "recovered `{}` at {addr:#x} (vtable {:#x}, primary={})",
            hit.type_name, hit.vtable_base, hit.is_primary
        );
        Some(RecoveredType {
            type_name: hit.type_name.clone(),
            hit,
            via: RecoveryVia::DirectVtable,
        })
    }

    /// Recover a pointee type through a reference-counted pointer's control
    /// block: the control block's vtable names a bookkeeping template whose
    /// first template argument is the managed type.
    pub fn recover_via_control_block(&self, control_addr: u64) -> Option<RecoveredType> {
        let word = self.image.read_pointer(control_addr).ok()?;
        let hit = self.modules.resolve_vtable(word)?;
        let pointee = demangle::first_template_argument(&hit.type_name)?;
        debug!(
            "control block at {control_addr:#x} attributes `{pointee}` (via `{}`)",
            hit.type_name
        );
        Some(RecoveredType {
            type_name: pointee,
            hit,
            via: RecoveryVia::ControlBlock,
        })
    }

    /// Blind scan: every aligned word of `[start, end)` that matches a known
    /// vtable address point yields a candidate object. False positives are
    /// mitigated by the exact-match rule; callers mark results as
    /// recovered-only so consumers can weigh them separately.
    pub fn blind_scan(&self, start: u64, end: u64, alignment: u64) -> Vec<(u64, RecoveredType)> {
        let alignment = alignment.max(1);
        let mut found = Vec::new();
        let mut addr = start.next_multiple_of(alignment);
        while addr + 8 <= end {
            if let Ok(word) = self.image.read_pointer(addr) {
                if let Some(hit) = self.modules.resolve_vtable(word) {
                    // Only the primary address point starts an object; a
                    // secondary match would be an interior subobject.
                    if hit.is_primary {
                        found.push((
                            addr,
                            RecoveredType {
                                type_name: hit.type_name.clone(),
                                hit,
                                via: RecoveryVia::BlindScan,
                            },
                        ));
                    }
                }
            }
            addr += alignment;
        }
        found
    }
}
