//! The immutable memory image
//!
//! All reads are bounds-checked; a dereference outside any region is an
//! explicit [`ImageError::Unmapped`], never a panic, because unmapped
//! targets are evidence (dangling pointers), not bugs.

use memmap2::Mmap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

/// Region permissions as recorded in the core dump.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Permissions {
    pub read: bool,
    pub write: bool,
    pub execute: bool,
}

impl Permissions {
    pub const R: Permissions = Permissions {
        read: true,
        write: false,
        execute: false,
    };
    pub const RW: Permissions = Permissions {
        read: true,
        write: true,
        execute: false,
    };
    pub const RX: Permissions = Permissions {
        read: true,
        write: false,
        execute: true,
    };

    /// Parse a proc-maps style string like `rw-p`.
    pub fn parse(s: &str) -> Self {
        let b = s.as_bytes();
        Permissions {
            read: b.first() == Some(&b'r'),
            write: b.get(1) == Some(&b'w'),
            execute: b.get(2) == Some(&b'x'),
        }
    }
}

impl fmt::Display for Permissions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}{}",
            if self.read { 'r' } else { '-' },
            if self.write { 'w' } else { '-' },
            if self.execute { 'x' } else { '-' },
        )
    }
}

#[derive(Debug)]
enum RegionBacking {
    Owned(Vec<u8>),
    /// Slice of a memory-mapped file; the mmap is kept alive for the life of
    /// the image.
    Mapped {
        map: Arc<Mmap>,
        offset: usize,
        len: usize,
    },
}

/// One mapped region of the dumped address space.
#[derive(Debug)]
pub struct MemoryRegion {
    start: u64,
    permissions: Permissions,
    /// Pathname or pseudo-label (`[heap]`, `[stack]`) when the dump recorded
    /// one
    label: Option<String>,
    backing: RegionBacking,
}

impl MemoryRegion {
    pub fn new(start: u64, permissions: Permissions, bytes: Vec<u8>) -> Self {
        Self {
            start,
            permissions,
            label: None,
            backing: RegionBacking::Owned(bytes),
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Map `len` bytes at `file_offset` of `path` as the region's contents.
    pub fn from_file(
        path: &Path,
        file_offset: u64,
        len: usize,
        start: u64,
        permissions: Permissions,
    ) -> Result<Self, ImageError> {
        let file = std::fs::File::open(path)?;
        // Safety: the file is opened read-only and the mapping is never
        // exposed mutably.
        let map = unsafe { Mmap::map(&file)? };
        let offset = file_offset as usize;
        if offset + len > map.len() {
            return Err(ImageError::Truncated {
                addr: start,
                len: len as u64,
            });
        }
        Ok(Self {
            start,
            permissions,
            label: Some(path.display().to_string()),
            backing: RegionBacking::Mapped {
                map: Arc::new(map),
                offset,
                len,
            },
        })
    }

    pub fn start(&self) -> u64 {
        self.start
    }

    pub fn len(&self) -> u64 {
        self.bytes().len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.bytes().is_empty()
    }

    pub fn end(&self) -> u64 {
        self.start + self.len()
    }

    pub fn permissions(&self) -> Permissions {
        self.permissions
    }

    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    pub fn bytes(&self) -> &[u8] {
        match &self.backing {
            RegionBacking::Owned(v) => v,
            RegionBacking::Mapped { map, offset, len } => &map[*offset..*offset + *len],
        }
    }

    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.start && addr < self.end()
    }
}

/// Error types for image access
#[derive(thiserror::Error, Debug)]
pub enum ImageError {
    #[error("address {addr:#x} is not mapped")]
    Unmapped { addr: u64 },
    #[error("read of {len} bytes at {addr:#x} runs past the end of its region")]
    Truncated { addr: u64, len: u64 },
    #[error("regions at {a:#x} and {b:#x} overlap")]
    OverlappingRegions { a: u64, b: u64 },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// The immutable memory image: sorted, non-overlapping regions. Multiple
/// read-only analyses may share one image concurrently.
#[derive(Debug)]
pub struct MemoryImage {
    regions: Vec<MemoryRegion>,
}

impl MemoryImage {
    /// Build an image from regions, sorting them and rejecting overlaps.
    pub fn from_regions(mut regions: Vec<MemoryRegion>) -> Result<Self, ImageError> {
        regions.sort_by_key(|r| r.start);
        for pair in regions.windows(2) {
            if pair[1].start < pair[0].end() {
                return Err(ImageError::OverlappingRegions {
                    a: pair[0].start,
                    b: pair[1].start,
                });
            }
        }
        debug!("memory image with {} regions", regions.len());
        Ok(Self { regions })
    }

    pub fn regions(&self) -> &[MemoryRegion] {
        &self.regions
    }

    pub fn region_containing(&self, addr: u64) -> Option<&MemoryRegion> {
        let idx = self
            .regions
            .partition_point(|r| r.start <= addr)
            .checked_sub(1)?;
        let region = &self.regions[idx];
        region.contains(addr).then_some(region)
    }

    pub fn is_mapped(&self, addr: u64) -> bool {
        self.region_containing(addr).is_some()
    }

    /// Read `len` bytes at `addr`. Reads never cross a region boundary; a
    /// region gap inside the range is a truncation error.
    pub fn read_bytes(&self, addr: u64, len: u64) -> Result<&[u8], ImageError> {
        let region = self
            .region_containing(addr)
            .ok_or(ImageError::Unmapped { addr })?;
        let offset = (addr - region.start) as usize;
        let end = offset
            .checked_add(len as usize)
            .ok_or(ImageError::Truncated { addr, len })?;
        if end > region.bytes().len() {
            return Err(ImageError::Truncated { addr, len });
        }
        Ok(&region.bytes()[offset..end])
    }

    pub fn read_u8(&self, addr: u64) -> Result<u8, ImageError> {
        Ok(self.read_bytes(addr, 1)?[0])
    }

    pub fn read_u16(&self, addr: u64) -> Result<u16, ImageError> {
        let b = self.read_bytes(addr, 2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn read_u32(&self, addr: u64) -> Result<u32, ImageError> {
        let b = self.read_bytes(addr, 4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_u64(&self, addr: u64) -> Result<u64, ImageError> {
        let b = self.read_bytes(addr, 8)?;
        Ok(u64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    /// Read a pointer-sized word. Targets are 64-bit little-endian.
    pub fn read_pointer(&self, addr: u64) -> Result<u64, ImageError> {
        self.read_u64(addr)
    }

    /// Regions that plausibly hold heap data: writable, non-executable, and
    /// either labeled `[heap]` or anonymous.
    pub fn heap_candidate_regions(&self) -> impl Iterator<Item = &MemoryRegion> {
        self.regions.iter().filter(|r| {
            let p = r.permissions;
            let anon_or_heap = match r.label() {
                Some(l) => l == "[heap]",
                None => true,
            };
            p.read && p.write && !p.execute && anon_or_heap
        })
    }
}
