//! The object/allocation graph
//!
//! Nodes live in arenas addressed by stable index newtypes, so cyclic and
//! self-referential pointer structures are ordinary data. Objects never
//! overlap except through explicit nesting (`parent`); an allocation may host
//! zero, one or several objects. Edges are recorded with their validity —
//! an edge that fails validation is flagged, never dropped.

use crate::classify::CapabilityTag;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ObjectId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct AllocationId(pub u32);

/// Allocator chunk state reconstructed from metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ChunkState {
    Used,
    Free,
}

/// One discovered object.
#[derive(Debug, Clone, Serialize)]
pub struct ObjectNode {
    pub address: u64,
    pub size: u64,
    /// Declared type, when discovery started from typed information
    pub static_type: Option<String>,
    /// Dynamic type recovered through vtable or control-block matching
    pub recovered_type: Option<String>,
    pub capability: CapabilityTag,
    /// Enclosing object for declared members/subobjects; nesting, not a
    /// second top-level object
    pub parent: Option<ObjectId>,
    pub allocation: Option<AllocationId>,
    /// Found purely by blind scanning, with no declared static type
    pub recovered_only: bool,
}

impl ObjectNode {
    /// Best available type name: recovered over static.
    pub fn best_type(&self) -> Option<&str> {
        self.recovered_type
            .as_deref()
            .or(self.static_type.as_deref())
    }
}

/// One reconstructed allocation.
#[derive(Debug, Clone, Serialize)]
pub struct AllocationNode {
    /// User data base address
    pub base: u64,
    /// User data size
    pub size: u64,
    /// Allocator chunk base (header included)
    pub chunk_base: u64,
    /// Full chunk size as accounted by the allocator
    pub chunk_size: u64,
    pub state: ChunkState,
    pub objects: Vec<ObjectId>,
    /// Filled by the reachability pass
    pub reachable: bool,
}

impl AllocationNode {
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.base && addr < self.base + self.size
    }
}

/// Validity of a pointer edge. Invalid edges stay in the graph, flagged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EdgeValidity {
    /// Aligned and resolves into a mapped region or known allocation
    Valid,
    /// Target is not mapped
    Dangling,
    /// Source word was not pointer-aligned
    Unaligned,
}

/// A pointer edge: (source address + offset) -> target.
#[derive(Debug, Clone, Serialize)]
pub struct PointerEdge {
    /// Address the pointer value was read from
    pub source: u64,
    /// Object the source lies in, when known
    pub source_object: Option<ObjectId>,
    /// Offset of the pointer within its source object or allocation
    pub offset: u64,
    pub target: u64,
    pub validity: EdgeValidity,
}

/// How an edge target relates to an allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetRef {
    /// Exactly the allocation's user base
    Base(AllocationId),
    /// Inside the allocation at the given non-zero offset
    Interior(AllocationId, u64),
    /// One byte past the allocation's end (one-past-the-end pointers)
    PastEnd(AllocationId),
}

/// Arena-of-nodes graph over one memory image.
#[derive(Debug, Default, Serialize)]
pub struct ObjectGraph {
    objects: Vec<ObjectNode>,
    allocations: Vec<AllocationNode>,
    edges: Vec<PointerEdge>,
    #[serde(skip)]
    object_key_index: HashMap<(u64, String), ObjectId>,
    #[serde(skip)]
    object_addresses: HashSet<u64>,
    #[serde(skip)]
    alloc_by_base: BTreeMap<u64, AllocationId>,
}

impl ObjectGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn objects(&self) -> &[ObjectNode] {
        &self.objects
    }

    pub fn allocations(&self) -> &[AllocationNode] {
        &self.allocations
    }

    pub fn edges(&self) -> &[PointerEdge] {
        &self.edges
    }

    pub fn object(&self, id: ObjectId) -> &ObjectNode {
        &self.objects[id.0 as usize]
    }

    pub fn object_mut(&mut self, id: ObjectId) -> &mut ObjectNode {
        &mut self.objects[id.0 as usize]
    }

    pub fn allocation(&self, id: AllocationId) -> &AllocationNode {
        &self.allocations[id.0 as usize]
    }

    pub fn allocation_mut(&mut self, id: AllocationId) -> &mut AllocationNode {
        &mut self.allocations[id.0 as usize]
    }

    /// Insert an object, linking it to its containing allocation. Returns the
    /// existing id when the same (address, type) was already discovered.
    pub fn add_object(&mut self, mut node: ObjectNode) -> ObjectId {
        let key = (
            node.address,
            node.static_type.clone().unwrap_or_default(),
        );
        if let Some(&existing) = self.object_key_index.get(&key) {
            return existing;
        }
        let id = ObjectId(self.objects.len() as u32);
        if node.allocation.is_none() {
            node.allocation = self.allocation_containing(node.address);
        }
        if let Some(alloc_id) = node.allocation {
            self.allocations[alloc_id.0 as usize].objects.push(id);
        }
        self.object_key_index.insert(key, id);
        self.object_addresses.insert(node.address);
        self.objects.push(node);
        id
    }

    pub fn find_object(&self, address: u64, static_type: Option<&str>) -> Option<ObjectId> {
        let key = (address, static_type.unwrap_or_default().to_string());
        self.object_key_index.get(&key).copied()
    }

    /// True when any object, of any type, starts at `addr`.
    pub fn has_object_at(&self, addr: u64) -> bool {
        self.object_addresses.contains(&addr)
    }

    pub fn add_allocation(&mut self, node: AllocationNode) -> AllocationId {
        let id = AllocationId(self.allocations.len() as u32);
        self.alloc_by_base.insert(node.base, id);
        self.allocations.push(node);
        id
    }

    pub fn add_edge(&mut self, edge: PointerEdge) {
        self.edges.push(edge);
    }

    /// Allocation whose user range contains `addr`.
    pub fn allocation_containing(&self, addr: u64) -> Option<AllocationId> {
        let (_, &id) = self.alloc_by_base.range(..=addr).next_back()?;
        let node = self.allocation(id);
        node.contains(addr).then_some(id)
    }

    /// Classify an edge target against the known allocations. A target equal
    /// to `base + size` of one allocation counts as past-the-end of it —
    /// unless it is exactly the base of another allocation, in which case the
    /// base interpretation wins.
    pub fn target_ref(&self, addr: u64) -> Option<TargetRef> {
        if let Some(&id) = self.alloc_by_base.get(&addr) {
            return Some(TargetRef::Base(id));
        }
        let (_, &id) = self.alloc_by_base.range(..addr).next_back()?;
        let node = self.allocation(id);
        if node.contains(addr) {
            Some(TargetRef::Interior(id, addr - node.base))
        } else if addr == node.base + node.size {
            Some(TargetRef::PastEnd(id))
        } else {
            None
        }
    }

    /// Every live object whose best-known type matches `type_name`.
    pub fn objects_of_type<'a>(
        &'a self,
        type_name: &'a str,
    ) -> impl Iterator<Item = (ObjectId, &'a ObjectNode)> {
        self.objects
            .iter()
            .enumerate()
            .filter(move |(_, o)| o.best_type() == Some(type_name))
            .map(|(i, o)| (ObjectId(i as u32), o))
    }

    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    pub fn allocation_count(&self) -> usize {
        self.allocations.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }
}
