//! Allocation catalog: allocator metadata reconstruction
//!
//! The allocator's chunk metadata is reconstructed purely from structure
//! knowledge — field offsets and flag masks taken from the allocator
//! implementation's debug information — applied to the raw image. The
//! allocator code is never executed. Each metadata field is checked against
//! its own invariants; a violation becomes corruption evidence, and the walk
//! of that arena stops only when the chain itself can no longer be followed.

use crate::findings::{Finding, FindingKind};
use crate::graph::ChunkState;
use coregraph_descriptors::ModuleCatalog;
use coregraph_image::MemoryImage;
use tracing::{debug, warn};

/// Allocator structure knowledge: where the size and list fields live inside
/// a chunk and how the flag bits are packed. Derived from the allocator's
/// debug information, with the glibc x86-64 layout as the common default.
#[derive(Debug, Clone)]
pub struct AllocatorLayout {
    /// Bytes of chunk header preceding user data
    pub header_size: u64,
    /// Offset of the size field within the chunk
    pub size_offset: u64,
    /// Bits of the size field that carry flags, not size
    pub flags_mask: u64,
    /// Flag bit meaning "previous chunk is in use"
    pub prev_inuse_bit: u64,
    /// Offset of the forward free-list pointer within the chunk
    pub fd_offset: u64,
    /// Offset of the backward free-list pointer within the chunk
    pub bk_offset: u64,
    pub min_chunk_size: u64,
    pub alignment: u64,
}

impl AllocatorLayout {
    /// The glibc malloc chunk layout on x86-64.
    pub fn glibc_x86_64() -> Self {
        Self {
            header_size: 16,
            size_offset: 8,
            flags_mask: 0x7,
            prev_inuse_bit: 0x1,
            fd_offset: 16,
            bk_offset: 24,
            min_chunk_size: 32,
            alignment: 16,
        }
    }

    /// Derive the layout from the allocator implementation's type
    /// descriptors, falling back field by field to the glibc defaults.
    pub fn from_catalog(catalog: &ModuleCatalog) -> Option<Self> {
        let chunk = catalog.find_struct("malloc_chunk")?;
        let mut layout = Self::glibc_x86_64();
        if let Some(size) = chunk.member("mchunk_size").or_else(|| chunk.member("size")) {
            layout.size_offset = size.offset;
            layout.header_size = size.offset + size.ty.size().max(8);
        }
        if let Some(fd) = chunk.member("fd") {
            layout.fd_offset = fd.offset;
        }
        if let Some(bk) = chunk.member("bk") {
            layout.bk_offset = bk.offset;
        }
        debug!("allocator layout from debug info: {layout:?}");
        Some(layout)
    }
}

/// One heap arena's address span.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapArena {
    pub start: u64,
    pub end: u64,
}

impl HeapArena {
    pub fn span(&self) -> u64 {
        self.end - self.start
    }
}

/// One reconstructed chunk.
#[derive(Debug, Clone)]
pub struct RawAllocation {
    pub chunk_base: u64,
    pub chunk_size: u64,
    /// User data base
    pub base: u64,
    /// User data size
    pub size: u64,
    pub state: ChunkState,
}

/// All chunks reconstructed from one or more arenas, plus the corruption
/// evidence gathered along the way.
#[derive(Debug, Default)]
pub struct AllocationCatalog {
    pub allocations: Vec<RawAllocation>,
    pub findings: Vec<Finding>,
    /// Total bytes spanned by the walked arenas
    pub arena_span: u64,
    pub used_bytes: u64,
    pub free_bytes: u64,
}

impl AllocationCatalog {
    /// Reconstruct the chunk chain of one arena. May be called repeatedly to
    /// accumulate several arenas into one catalog.
    pub fn reconstruct_arena(
        &mut self,
        image: &MemoryImage,
        arena: HeapArena,
        layout: &AllocatorLayout,
    ) {
        self.arena_span += arena.span();
        let mut cursor = arena.start;

        while cursor + layout.header_size <= arena.end {
            let size_addr = cursor + layout.size_offset;
            let size_word = match image.read_u64(size_addr) {
                Ok(w) => w,
                Err(_) => {
                    self.findings.push(Finding::new(
                        FindingKind::CorruptedAllocatorMetadata,
                        cursor,
                        format!("chunk size field at {size_addr:#x} is unmapped"),
                    ));
                    return;
                }
            };
            let chunk_size = size_word & !layout.flags_mask;

            // Size-field invariants. A violation means the chain cannot be
            // followed past this chunk.
            if chunk_size < layout.min_chunk_size {
                self.findings.push(Finding::new(
                    FindingKind::CorruptedAllocatorMetadata,
                    cursor,
                    format!(
                        "chunk size {chunk_size:#x} below minimum {:#x}",
                        layout.min_chunk_size
                    ),
                ));
                return;
            }
            if chunk_size % layout.alignment != 0 {
                self.findings.push(Finding::new(
                    FindingKind::CorruptedAllocatorMetadata,
                    cursor,
                    format!(
                        "chunk size {chunk_size:#x} violates {}-byte alignment",
                        layout.alignment
                    ),
                ));
                return;
            }
            let next = cursor + chunk_size;
            if next > arena.end {
                self.findings.push(Finding::new(
                    FindingKind::CorruptedAllocatorMetadata,
                    cursor,
                    format!("chunk size {chunk_size:#x} runs past the arena end {:#x}", arena.end),
                ));
                return;
            }

            // A chunk's in-use state is recorded in the *next* chunk's
            // prev-inuse flag; the trailing (top) chunk counts as free and
            // sits on no bin list.
            let is_top = next + layout.size_offset + 8 > arena.end;
            let state = if is_top {
                ChunkState::Free
            } else {
                match image.read_u64(next + layout.size_offset) {
                    Ok(next_size) if next_size & layout.prev_inuse_bit != 0 => ChunkState::Used,
                    _ => ChunkState::Free,
                }
            };

            if state == ChunkState::Free && !is_top {
                self.check_free_list_pointers(image, arena, layout, cursor, chunk_size);
            }

            self.allocations.push(RawAllocation {
                chunk_base: cursor,
                chunk_size,
                base: cursor + layout.header_size,
                size: chunk_size.saturating_sub(layout.header_size),
                state,
            });
            match state {
                ChunkState::Used => self.used_bytes += chunk_size,
                ChunkState::Free => self.free_bytes += chunk_size,
            }

            cursor = next;
            if cursor == arena.end {
                return;
            }
        }

        if cursor != arena.end {
            warn!(
                "arena walk stopped at {cursor:#x}, {} bytes before the end",
                arena.end - cursor
            );
        }
    }

    /// Free chunks sit on doubly linked bins; their fd/bk words must point at
    /// chunks within the arena. A violation is evidence, not a walk abort.
    fn check_free_list_pointers(
        &mut self,
        image: &MemoryImage,
        arena: HeapArena,
        layout: &AllocatorLayout,
        chunk: u64,
        chunk_size: u64,
    ) {
        if chunk_size < layout.bk_offset + 8 {
            return;
        }
        for (name, offset) in [("fd", layout.fd_offset), ("bk", layout.bk_offset)] {
            let Ok(link) = image.read_u64(chunk + offset) else {
                continue;
            };
            // Bin list heads live in the allocator's own data segment; only
            // reject links that are neither in the arena nor mapped at all.
            let in_arena = link >= arena.start && link < arena.end;
            if link == 0 || (!in_arena && !image.is_mapped(link)) {
                self.findings.push(Finding::new(
                    FindingKind::CorruptedAllocatorMetadata,
                    chunk,
                    format!("free chunk {name} pointer {link:#x} is invalid"),
                ));
            } else if in_arena && link % layout.alignment != 0 {
                self.findings.push(Finding::new(
                    FindingKind::CorruptedAllocatorMetadata,
                    chunk,
                    format!("free chunk {name} pointer {link:#x} is misaligned"),
                ));
            }
        }
    }

    /// Used chunks, the ones that can host live objects or leaks.
    pub fn used(&self) -> impl Iterator<Item = &RawAllocation> {
        self.allocations
            .iter()
            .filter(|a| a.state == ChunkState::Used)
    }
}
