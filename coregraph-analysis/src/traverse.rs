//! Root-driven object discovery
//!
//! Discovery walks from the roots through classified containers and
//! pointers, refining dynamic types along the way, and records every pointer
//! edge it sees — valid or flagged. All expansion is budgeted: the object
//! cap, the container iteration cap and the accessor step budget each bound a
//! different way corrupted input could otherwise run away.

use crate::alloc::AllocationCatalog;
use crate::classify::{Capability, CapabilityClassifier, CapabilityTag, ClassifyContext};
use crate::config::AnalysisConfig;
use crate::findings::{Finding, FindingKind};
use crate::graph::{
    AllocationNode, EdgeValidity, ObjectGraph, ObjectId, ObjectNode, PointerEdge, TargetRef,
};
use crate::iterate::walk_container;
use crate::recover::TypeRecovery;
use crate::roots::RootReference;
use coregraph_descriptors::{DescriptorRegistry, StructDescriptor, TypeDescriptor};
use coregraph_image::{MemoryImage, ModuleMap};
use coregraph_lifter::{EvalError, Evaluator};
use std::collections::{HashSet, VecDeque};
use tracing::{debug, warn};

struct Pending {
    addr: u64,
    ty: TypeDescriptor,
    parent: Option<ObjectId>,
    recovered_hint: Option<String>,
    recovered_only: bool,
}

/// Single-writer graph builder: partitioned discovery would merge here.
pub struct GraphBuilder<'a> {
    image: &'a MemoryImage,
    registry: &'a DescriptorRegistry,
    classifier: &'a CapabilityClassifier,
    ctx: ClassifyContext<'a>,
    recovery: TypeRecovery<'a>,
    config: &'a AnalysisConfig,
    graph: ObjectGraph,
    findings: Vec<Finding>,
    queue: VecDeque<Pending>,
    object_budget_hit: bool,
}

impl<'a> GraphBuilder<'a> {
    pub fn new(
        image: &'a MemoryImage,
        registry: &'a DescriptorRegistry,
        modules: &'a ModuleMap,
        classifier: &'a CapabilityClassifier,
        ctx: ClassifyContext<'a>,
        config: &'a AnalysisConfig,
    ) -> Self {
        Self {
            image,
            registry,
            classifier,
            ctx,
            recovery: TypeRecovery::new(image, modules),
            config,
            graph: ObjectGraph::new(),
            findings: Vec::new(),
            queue: VecDeque::new(),
            object_budget_hit: false,
        }
    }

    /// Build the graph: seed allocations, walk from roots, then run the
    /// conservative and blind scans the configuration asks for.
    pub fn build(
        mut self,
        roots: &[RootReference],
        allocations: &AllocationCatalog,
    ) -> (ObjectGraph, Vec<Finding>) {
        self.findings.extend(allocations.findings.iter().cloned());
        for raw in &allocations.allocations {
            self.graph.add_allocation(AllocationNode {
                base: raw.base,
                size: raw.size,
                chunk_base: raw.chunk_base,
                chunk_size: raw.chunk_size,
                state: raw.state,
                objects: Vec::new(),
                reachable: false,
            });
        }

        for root in roots {
            self.queue.push_back(Pending {
                addr: root.address,
                ty: root.ty.clone(),
                parent: None,
                recovered_hint: None,
                recovered_only: false,
            });
        }
        self.drain_queue();

        if self.config.blind_scan {
            self.blind_scan_heap_regions();
            self.drain_queue();
        }
        if self.config.conservative_scan {
            self.conservative_scan_untyped_allocations();
        }

        (self.graph, self.findings)
    }

    fn drain_queue(&mut self) {
        while let Some(pending) = self.queue.pop_front() {
            if self.graph.object_count() >= self.config.max_objects {
                if !self.object_budget_hit {
                    warn!(
                        "object budget of {} reached; discovery truncated",
                        self.config.max_objects
                    );
                    self.object_budget_hit = true;
                }
                return;
            }
            self.discover(pending);
        }
    }

    fn discover(&mut self, pending: Pending) {
        let ty = self.registry.resolve(&pending.ty).clone();
        let type_name = ty.type_name();
        if self
            .graph
            .find_object(pending.addr, Some(&type_name))
            .is_some()
        {
            return;
        }

        let capability = match ty.as_struct() {
            Some(_) => self.classifier.classify(&type_name, &self.ctx),
            None => std::sync::Arc::new(Capability::Opaque),
        };

        let (recovered_type, mut size) = self.refine(&pending, &ty);
        if size == 0 {
            size = ty.size();
        }

        let id = self.graph.add_object(ObjectNode {
            address: pending.addr,
            size,
            static_type: Some(type_name.clone()),
            recovered_type,
            capability: capability.tag(),
            parent: pending.parent,
            allocation: None,
            recovered_only: pending.recovered_only,
        });

        match ty.strip() {
            TypeDescriptor::Pointer { target } => {
                let pointee = self.registry.resolve(target).clone();
                match self.image.read_pointer(pending.addr) {
                    Ok(word) => self.handle_pointer(pending.addr, 0, Some(id), word, Some(pointee)),
                    Err(_) => debug!("pointer storage at {:#x} unreadable", pending.addr),
                }
            }
            TypeDescriptor::Struct(sd) => {
                let sd = sd.clone();
                match capability.as_ref() {
                    Capability::Iterable(shape) => {
                        let shape = shape.clone();
                        self.walk_iterable(pending.addr, id, &shape);
                    }
                    Capability::SmartPointer(shape) => {
                        let shape = shape.clone();
                        self.walk_smart_pointer(pending.addr, id, &sd, &shape);
                    }
                    Capability::TaggedUnion(shape) => {
                        let shape = shape.clone();
                        self.walk_tagged_union(pending.addr, id, &shape);
                    }
                    Capability::Opaque => self.walk_members(pending.addr, id, &sd),
                }
            }
            TypeDescriptor::Array { element, count, .. } => {
                let element = self.registry.resolve(element).clone();
                let stride = element.size();
                if stride > 0 {
                    let cap = self.config.max_container_iterations as u64;
                    let n = count.unwrap_or(0).min(cap);
                    for i in 0..n {
                        self.queue.push_back(Pending {
                            addr: pending.addr + i * stride,
                            ty: element.clone(),
                            parent: Some(id),
                            recovered_hint: None,
                            recovered_only: false,
                        });
                    }
                }
            }
            // Unions are opaque without an external discriminant; base types,
            // enums and unresolved references are leaves.
            _ => {}
        }
    }

    /// Vtable-based refinement plus the integrity checks hanging off it.
    /// Returns the recovered type name (if any) and the refined size.
    fn refine(&mut self, pending: &Pending, ty: &TypeDescriptor) -> (Option<String>, u64) {
        let static_size = ty.size();
        if let Some(hint) = &pending.recovered_hint {
            let size = self
                .registry
                .find_struct(hint)
                .map(|s| s.size)
                .unwrap_or(static_size);
            return (Some(hint.clone()), size.max(static_size));
        }

        let Some(sd) = ty.as_struct() else {
            return (None, static_size);
        };
        if !sd.has_vtable {
            return (None, static_size);
        }

        let Some(recovered) = self.recovery.recover_at(pending.addr) else {
            self.findings.push(Finding::new(
                FindingKind::InvalidVtable,
                pending.addr,
                format!(
                    "object of `{}` carries no word matching a known vtable address point",
                    sd.name
                ),
            ));
            return (None, static_size);
        };

        if recovered.type_name == sd.name {
            return (None, static_size);
        }

        let related = self.is_derived_of(&recovered.type_name, &sd.name)
            || self.is_derived_of(&sd.name, &recovered.type_name);
        if !related {
            self.findings.push(Finding::new(
                FindingKind::TypeConfusion,
                pending.addr,
                format!(
                    "static type `{}` but vtable resolves to unrelated `{}`",
                    sd.name, recovered.type_name
                ),
            ));
        }

        let recovered_size = self
            .registry
            .find_struct(&recovered.type_name)
            .map(|s| s.size)
            .unwrap_or(0);
        (
            Some(recovered.type_name),
            recovered_size.max(static_size),
        )
    }

    /// Transitive base-class relation, bounded against cyclic descriptors.
    fn is_derived_of(&self, derived: &str, base: &str) -> bool {
        let mut seen = HashSet::new();
        let mut stack = vec![derived.to_string()];
        while let Some(name) = stack.pop() {
            if seen.len() > 64 || !seen.insert(name.clone()) {
                continue;
            }
            let Some(sd) = self.registry.find_struct(&name) else {
                continue;
            };
            for bc in &sd.base_classes {
                if bc.name == base {
                    return true;
                }
                stack.push(bc.name.clone());
            }
        }
        false
    }

    fn walk_iterable(&mut self, addr: u64, id: ObjectId, shape: &crate::classify::IterableShape) {
        let walk = walk_container(self.image, shape, addr, self.config);
        if walk.diverged {
            self.findings.push(Finding::new(
                FindingKind::EvaluationDivergence,
                addr,
                format!(
                    "container walk exceeded {} iterations; cyclic or corrupted container",
                    self.config.max_container_iterations
                ),
            ));
        }
        if let Some(failure) = &walk.failure {
            self.finding_from_eval_error(addr, failure);
        }
        let element_ty = self
            .registry
            .find_type(&shape.element_type)
            .map(|(_, t)| t.clone())
            .unwrap_or(TypeDescriptor::Named {
                name: shape.element_type.clone(),
            });
        for element in walk.elements {
            self.handle_pointer(addr, 0, Some(id), element, Some(element_ty.clone()));
        }
    }

    fn walk_smart_pointer(
        &mut self,
        addr: u64,
        id: ObjectId,
        sd: &StructDescriptor,
        shape: &crate::classify::SmartPointerShape,
    ) {
        let ev = Evaluator::new(self.image, self.config.accessor_step_budget);
        if let Some(bool_check) = &shape.bool_check {
            match ev.evaluate(bool_check, &[addr]) {
                Ok(0) => return, // empty pointer
                Ok(_) => {}
                Err(e) => {
                    self.finding_from_eval_error(addr, &e);
                    return;
                }
            }
        }
        let pointee_addr = match ev.evaluate(&shape.accessor, &[addr]) {
            Ok(v) => v,
            Err(e) => {
                self.finding_from_eval_error(addr, &e);
                return;
            }
        };
        if pointee_addr == 0 {
            return;
        }

        // Reference-counted pointers without a vtable on the payload can
        // still be typed through their control block; any other pointer
        // member of the handle is the control-block candidate.
        let mut hint = None;
        if self.recovery.recover_at(pointee_addr).is_none() {
            for member in &sd.members {
                if member.ty.size() != 8 {
                    continue;
                }
                let Ok(word) = self.image.read_pointer(addr + member.offset) else {
                    continue;
                };
                if word == 0 || word == pointee_addr {
                    continue;
                }
                if let Some(recovered) = self.recovery.recover_via_control_block(word) {
                    hint = Some(recovered.type_name);
                    break;
                }
            }
        }

        let pointee_ty = self
            .registry
            .find_type(&shape.pointee_type)
            .map(|(_, t)| t.clone())
            .unwrap_or(TypeDescriptor::Named {
                name: shape.pointee_type.clone(),
            });
        self.record_edge(addr, 0, Some(id), pointee_addr);
        self.enqueue_typed(pointee_addr, pointee_ty, hint);
    }

    fn walk_tagged_union(
        &mut self,
        addr: u64,
        id: ObjectId,
        shape: &crate::classify::TaggedUnionShape,
    ) {
        let ev = Evaluator::new(self.image, self.config.accessor_step_budget);
        for alternative in &shape.alternatives {
            match ev.evaluate(&alternative.accessor, &[addr]) {
                Ok(0) => {}
                Ok(active) => {
                    let alt_ty = self
                        .registry
                        .find_type(&alternative.alternative_type)
                        .map(|(_, t)| t.clone())
                        .unwrap_or(TypeDescriptor::Named {
                            name: alternative.alternative_type.clone(),
                        });
                    self.record_edge(addr, 0, Some(id), active);
                    self.enqueue_typed(active, alt_ty, None);
                }
                Err(e) => self.finding_from_eval_error(addr, &e),
            }
        }
    }

    /// Member-by-member walk of an opaque struct: pointer members become
    /// edges, embedded aggregates become nested child objects.
    fn walk_members(&mut self, addr: u64, id: ObjectId, sd: &StructDescriptor) {
        for member in &sd.members {
            let member_addr = addr + member.offset;
            let member_ty = self.registry.resolve(&member.ty);
            match member_ty.strip() {
                TypeDescriptor::Pointer { target } => {
                    let pointee = self.registry.resolve(target).clone();
                    match self.image.read_pointer(member_addr) {
                        Ok(word) => {
                            self.handle_pointer(addr, member.offset, Some(id), word, Some(pointee))
                        }
                        Err(_) => debug!(
                            "member `{}` of object at {addr:#x} unreadable",
                            member.name
                        ),
                    }
                }
                TypeDescriptor::Struct(_)
                | TypeDescriptor::Union { .. }
                | TypeDescriptor::Array { .. } => {
                    let ty = member_ty.clone();
                    self.queue.push_back(Pending {
                        addr: member_addr,
                        ty,
                        parent: Some(id),
                        recovered_hint: None,
                        recovered_only: false,
                    });
                }
                _ => {}
            }
        }
    }

    /// Validate a pointer value and record its edge; a valid target with a
    /// known pointee type continues discovery.
    fn handle_pointer(
        &mut self,
        source: u64,
        offset: u64,
        source_object: Option<ObjectId>,
        target: u64,
        pointee: Option<TypeDescriptor>,
    ) {
        if target == 0 {
            return;
        }
        let valid = self.record_edge(source, offset, source_object, target);
        if !valid {
            return;
        }
        if let Some(pointee) = pointee {
            match pointee.strip() {
                TypeDescriptor::Function { .. } | TypeDescriptor::Unknown { .. } => {}
                TypeDescriptor::Base { size: 0, .. } => {} // void*
                _ => self.enqueue_typed(target, pointee, None),
            }
        }
    }

    /// Record an edge with its validity; returns true when the edge is valid.
    fn record_edge(
        &mut self,
        source: u64,
        offset: u64,
        source_object: Option<ObjectId>,
        target: u64,
    ) -> bool {
        let validity = if target % self.config.pointer_alignment != 0 {
            EdgeValidity::Unaligned
        } else if !self.image.is_mapped(target)
            && !matches!(self.graph.target_ref(target), Some(TargetRef::PastEnd(_)))
        {
            self.findings.push(Finding::new(
                FindingKind::DanglingPointer,
                target,
                format!("pointer at {source:#x}+{offset:#x} targets unmapped memory"),
            ));
            EdgeValidity::Dangling
        } else {
            if let Some(alloc_id) = self.graph.allocation_containing(target) {
                let alloc = self.graph.allocation(alloc_id);
                if alloc.state == crate::graph::ChunkState::Free {
                    self.findings.push(Finding::new(
                        FindingKind::UseAfterFree,
                        target,
                        format!(
                            "pointer at {source:#x}+{offset:#x} targets free chunk {:#x}",
                            alloc.chunk_base
                        ),
                    ));
                }
            }
            EdgeValidity::Valid
        };
        let valid = validity == EdgeValidity::Valid;
        self.graph.add_edge(PointerEdge {
            source,
            source_object,
            offset,
            target,
            validity,
        });
        valid
    }

    fn enqueue_typed(&mut self, addr: u64, ty: TypeDescriptor, hint: Option<String>) {
        self.queue.push_back(Pending {
            addr,
            ty,
            parent: None,
            recovered_hint: hint,
            recovered_only: false,
        });
    }

    fn finding_from_eval_error(&mut self, addr: u64, error: &EvalError) {
        let finding = match error {
            EvalError::InvalidMemoryReference { addr: target } => Finding::new(
                FindingKind::DanglingPointer,
                *target,
                format!("accessor walk from {addr:#x} dereferenced unmapped memory"),
            ),
            other => Finding::new(
                FindingKind::EvaluationDivergence,
                addr,
                format!("accessor evaluation failed: {other}"),
            ),
        };
        self.findings.push(finding);
    }

    /// Blind aligned-word scan over heap regions: words matching known
    /// vtable address points become recovered-only objects.
    fn blind_scan_heap_regions(&mut self) {
        let regions: Vec<(u64, u64)> = self
            .image
            .heap_candidate_regions()
            .map(|r| (r.start(), r.end()))
            .collect();
        for (start, end) in regions {
            for (addr, recovered) in
                self.recovery
                    .blind_scan(start, end, self.config.pointer_alignment)
            {
                if self.graph.has_object_at(addr) {
                    continue;
                }
                match self.registry.find_struct(&recovered.type_name) {
                    Some(sd) => {
                        let ty = TypeDescriptor::Struct(sd.clone());
                        self.queue.push_back(Pending {
                            addr,
                            ty,
                            parent: None,
                            recovered_hint: Some(recovered.type_name.clone()),
                            recovered_only: true,
                        });
                    }
                    None => {
                        self.graph.add_object(ObjectNode {
                            address: addr,
                            size: 0,
                            static_type: None,
                            recovered_type: Some(recovered.type_name),
                            capability: CapabilityTag::Opaque,
                            parent: None,
                            allocation: None,
                            recovered_only: true,
                        });
                    }
                }
            }
        }
    }

    /// Conservative scan: any sufficiently aligned word of an untyped used
    /// allocation that lands in mapped memory is treated as a pointer. This
    /// over-approximates reachability — a false pointer never loses a real
    /// leak, only suppresses one.
    fn conservative_scan_untyped_allocations(&mut self) {
        let align = self.config.pointer_alignment.max(1);
        let scan_targets: Vec<(u64, u64)> = self
            .graph
            .allocations()
            .iter()
            .filter(|a| a.state == crate::graph::ChunkState::Used && a.objects.is_empty())
            .map(|a| (a.base, a.size))
            .collect();

        for (base, size) in scan_targets {
            let mut addr = base.next_multiple_of(align);
            while addr + 8 <= base + size {
                if let Ok(word) = self.image.read_pointer(addr) {
                    let is_candidate = word != 0
                        && word % align == 0
                        && (self.graph.target_ref(word).is_some() || self.image.is_mapped(word));
                    if is_candidate {
                        self.graph.add_edge(PointerEdge {
                            source: addr,
                            source_object: None,
                            offset: addr - base,
                            target: word,
                            validity: EdgeValidity::Valid,
                        });
                    }
                }
                addr += align;
            }
        }
    }
}
