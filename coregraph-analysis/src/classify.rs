//! Capability classification
//!
//! Each type is assigned one capability from its member-function signature
//! shapes: Iterable (a `begin`/`end` pair over a shared iterator type),
//! SmartPointer (dereference + `get` + boolean conversion, and no `value`
//! accessor — that shape marks Optional/Expected-likes, which stay out),
//! TaggedUnion (a selector-templated accessor returning a nullable pointer to
//! the active alternative), or Opaque. Overlaps resolve by shape, not name:
//! pointer-like access plus iteration semantics is Iterable; pointer-like
//! access alone is SmartPointer.
//!
//! The decision is made once per type and cached; it is never re-derived per
//! object. A type whose required accessors cannot all be lifted is Opaque —
//! partially iterable types are not walked at all.

use coregraph_descriptors::{
    demangle, BuildId, DescriptorRegistry, FunctionDescriptor, MethodKind, ModuleCatalog,
};
use coregraph_lifter::{
    resolve_function_body, AccessorCache, AccessorKey, AccessorLifter, AccessorOp,
    AccessorProgram, Cond, MemRef, RValue, Reg,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::debug;

/// Serializable capability tag carried by graph nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CapabilityTag {
    Iterable,
    SmartPointer,
    TaggedUnion,
    Opaque,
}

/// How to iterate an Iterable type: the lifted accessors plus the equality
/// operator located corpus-wide.
#[derive(Clone)]
pub struct IterableShape {
    pub begin: Arc<AccessorProgram>,
    pub end: Arc<AccessorProgram>,
    pub deref: Arc<AccessorProgram>,
    pub increment: Arc<AccessorProgram>,
    pub equality: Arc<AccessorProgram>,
    /// True when `equality` is an `operator!=`; the walk inverts its result
    pub equality_is_negated: bool,
    pub iterator_type: String,
    pub element_type: String,
    pub element_size: u64,
}

#[derive(Clone)]
pub struct SmartPointerShape {
    /// Accessor yielding the pointee address (`get` preferred, `operator*`
    /// otherwise)
    pub accessor: Arc<AccessorProgram>,
    /// The boolean-conveys-non-null conversion, when liftable
    pub bool_check: Option<Arc<AccessorProgram>>,
    pub pointee_type: String,
}

#[derive(Clone)]
pub struct AlternativeAccessor {
    pub accessor: Arc<AccessorProgram>,
    pub alternative_type: String,
}

#[derive(Clone)]
pub struct TaggedUnionShape {
    pub alternatives: Vec<AlternativeAccessor>,
}

/// The capability decision for one type.
#[derive(Clone)]
pub enum Capability {
    Iterable(IterableShape),
    SmartPointer(SmartPointerShape),
    TaggedUnion(TaggedUnionShape),
    Opaque,
}

impl Capability {
    pub fn tag(&self) -> CapabilityTag {
        match self {
            Capability::Iterable(_) => CapabilityTag::Iterable,
            Capability::SmartPointer(_) => CapabilityTag::SmartPointer,
            Capability::TaggedUnion(_) => CapabilityTag::TaggedUnion,
            Capability::Opaque => CapabilityTag::Opaque,
        }
    }
}

/// Everything classification needs to find and lift accessors.
pub struct ClassifyContext<'a> {
    pub registry: &'a DescriptorRegistry,
    pub lifter: &'a AccessorLifter,
    pub cache: &'a AccessorCache,
    /// Alternate builds for cross-binary substitution, keyed by the build id
    /// of the module they substitute for
    pub alternates: &'a HashMap<BuildId, ModuleCatalog>,
}

impl ClassifyContext<'_> {
    /// Lift an accessor, borrowing the alternate build's body when the
    /// primary inlined it away. Any failure makes the accessor unavailable.
    fn lift(&self, build_id: &BuildId, func: &FunctionDescriptor) -> Option<Arc<AccessorProgram>> {
        let primary = self.registry.module(build_id)?;
        let alternate = self.alternates.get(build_id);
        let body = match resolve_function_body(func, primary, alternate) {
            Ok(body) => body,
            Err(err) => {
                debug!("accessor `{}` unavailable: {err}", func.linkage_name);
                return None;
            }
        };
        let owner = if body.has_body() && !func.has_body() {
            alternate.map(|c| c.build_id()).unwrap_or(build_id)
        } else {
            build_id
        };
        let key = AccessorKey::new(owner, body.low_address);
        match self.cache.get_or_lift(key, body, self.lifter) {
            Ok(program) => Some(program),
            Err(err) => {
                debug!("accessor `{}` unavailable: {err}", func.linkage_name);
                None
            }
        }
    }
}

/// Decide-once-per-type classifier with an append-only cache keyed by type
/// name.
#[derive(Default)]
pub struct CapabilityClassifier {
    cache: RwLock<HashMap<String, Arc<Capability>>>,
}

impl CapabilityClassifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn classify(&self, type_name: &str, ctx: &ClassifyContext<'_>) -> Arc<Capability> {
        if let Some(cached) = self
            .cache
            .read()
            .expect("capability cache poisoned")
            .get(type_name)
        {
            return Arc::clone(cached);
        }
        let capability = Arc::new(classify_uncached(type_name, ctx));
        debug!("classified `{type_name}` as {:?}", capability.tag());
        self.cache
            .write()
            .expect("capability cache poisoned")
            .entry(type_name.to_string())
            .or_insert_with(|| Arc::clone(&capability))
            .clone()
    }
}

fn classify_uncached(type_name: &str, ctx: &ClassifyContext<'_>) -> Capability {
    if let Some(cap) = try_iterable(type_name, ctx) {
        return cap;
    }
    if let Some(cap) = try_smart_pointer(type_name, ctx) {
        return cap;
    }
    if let Some(cap) = try_tagged_union(type_name, ctx) {
        return cap;
    }
    Capability::Opaque
}

fn method<'a>(
    ctx: &'a ClassifyContext<'_>,
    type_name: &str,
    kind: MethodKind,
) -> Option<(&'a BuildId, &'a FunctionDescriptor)> {
    ctx.registry
        .methods_of(type_name)
        .into_iter()
        .find(|(_, f)| f.method_kind() == kind)
}

fn has_method(ctx: &ClassifyContext<'_>, type_name: &str, kind: MethodKind) -> bool {
    method(ctx, type_name, kind).is_some()
}

fn try_iterable(type_name: &str, ctx: &ClassifyContext<'_>) -> Option<Capability> {
    let (begin_build, begin) = method(ctx, type_name, MethodKind::Begin)?;
    let (end_build, end) = method(ctx, type_name, MethodKind::End)?;

    let begin_ret = begin.return_type.as_ref()?;
    let end_ret = end.return_type.as_ref()?;
    if !begin_ret.same_named_type(end_ret) {
        return None;
    }

    // Raw-pointer iterators (contiguous containers) need no lifted iterator
    // methods; dereference is the identity and increment is an element step.
    if let Some(element) = begin_ret.strip_ref().pointee() {
        let element = ctx.registry.resolve(element);
        let element_size = element.size();
        if element_size == 0 {
            return None;
        }
        let shape = IterableShape {
            begin: ctx.lift(begin_build, begin)?,
            end: ctx.lift(end_build, end)?,
            deref: Arc::new(synth_identity()),
            increment: Arc::new(synth_add(element_size as i64)),
            equality: Arc::new(synth_equal()),
            equality_is_negated: false,
            iterator_type: begin_ret.strip_ref().type_name(),
            element_type: element.type_name(),
            element_size,
        };
        return Some(Capability::Iterable(shape));
    }

    // Struct iterators: the iterator type must expose a dereference yielding
    // a reference and an increment yielding the iterator type again.
    let iterator_type = begin_ret.strip_ref().type_name();
    let (deref_build, deref) = method(ctx, &iterator_type, MethodKind::Deref)?;
    let element = ctx
        .registry
        .resolve(deref.return_type.as_ref()?.pointee()?);
    let element_size = element.size();
    if element_size == 0 {
        return None;
    }

    let (inc_build, increment) = ctx
        .registry
        .methods_of(&iterator_type)
        .into_iter()
        .find(|(_, f)| {
            f.method_kind() == MethodKind::Increment
                && f.return_type
                    .as_ref()
                    .is_some_and(|r| r.strip_ref().type_name() == iterator_type)
        })?;

    let (eq_build, equality, negated) = find_equality_operator(ctx, &iterator_type)?;

    let shape = IterableShape {
        begin: ctx.lift(begin_build, begin)?,
        end: ctx.lift(end_build, end)?,
        deref: ctx.lift(deref_build, deref)?,
        increment: ctx.lift(inc_build, increment)?,
        equality: ctx.lift(eq_build, equality)?,
        equality_is_negated: negated,
        iterator_type,
        element_type: element.type_name(),
        element_size,
    };
    Some(Capability::Iterable(shape))
}

/// Locate the best-matching equality/inequality operator for an iterator type
/// in the whole descriptor corpus. Candidates must take exactly two values of
/// the iterator type (member or free form). Tie-break: prefer an operator
/// declared in the iterator's namespace (the iterator class itself counts),
/// then `operator==` over `operator!=`, then the first structural match in
/// registry order.
fn find_equality_operator<'a>(
    ctx: &'a ClassifyContext<'_>,
    iterator_type: &str,
) -> Option<(&'a BuildId, &'a FunctionDescriptor, bool)> {
    let iterator_ns = demangle::namespace_of(iterator_type).to_string();

    let structural: Vec<(&BuildId, &FunctionDescriptor, bool)> = ctx
        .registry
        .all_functions()
        .filter_map(|(build, f)| {
            let negated = match f.method_kind() {
                MethodKind::EqualOp => false,
                MethodKind::NotEqualOp => true,
                _ => return None,
            };
            if f.parameters.len() != 2 {
                return None;
            }
            let both_iterators = f.parameters.iter().all(|p| {
                let t = p.ty.strip_ref();
                let t = match t.pointee() {
                    Some(inner) if p.artificial => inner,
                    _ => t,
                };
                t.type_name() == iterator_type
            });
            both_iterators.then_some((build, f, negated))
        })
        .collect();

    let same_namespace = |f: &FunctionDescriptor| {
        let ns = demangle::namespace_of(&f.qualified_name()).to_string();
        ns == iterator_ns || ns == iterator_type
    };

    structural
        .iter()
        .find(|(_, f, negated)| !negated && same_namespace(f))
        .or_else(|| structural.iter().find(|(_, f, _)| same_namespace(f)))
        .or_else(|| structural.iter().find(|(_, _, negated)| !negated))
        .or_else(|| structural.first())
        .copied()
}

fn try_smart_pointer(type_name: &str, ctx: &ClassifyContext<'_>) -> Option<Capability> {
    // A `value` accessor marks Optional/Expected-like types; those are not
    // smart pointers.
    if has_method(ctx, type_name, MethodKind::Value) {
        return None;
    }
    if !has_method(ctx, type_name, MethodKind::BoolConversion) {
        return None;
    }

    let deref = method(ctx, type_name, MethodKind::Deref)
        .filter(|(_, f)| returns_pointer_like(f));
    let get = method(ctx, type_name, MethodKind::Get).filter(|(_, f)| returns_pointer_like(f));
    if deref.is_none() || get.is_none() {
        return None;
    }

    // Prefer `get`: it returns the raw pointer directly.
    let (build, accessor_fn) = get.or(deref)?;
    let pointee = ctx
        .registry
        .resolve(accessor_fn.return_type.as_ref()?.pointee()?)
        .type_name();

    let accessor = ctx.lift(build, accessor_fn)?;
    let bool_check = method(ctx, type_name, MethodKind::BoolConversion)
        .and_then(|(b, f)| ctx.lift(b, f));

    Some(Capability::SmartPointer(SmartPointerShape {
        accessor,
        bool_check,
        pointee_type: pointee,
    }))
}

fn returns_pointer_like(f: &FunctionDescriptor) -> bool {
    f.return_type.as_ref().is_some_and(|r| r.pointee().is_some())
}

fn try_tagged_union(type_name: &str, ctx: &ClassifyContext<'_>) -> Option<Capability> {
    let mut alternatives = Vec::new();
    for (build, f) in ctx.registry.all_functions() {
        // Selector-templated accessor taking the container by pointer and
        // returning a nullable pointer to one alternative.
        if f.template_args.is_empty() {
            continue;
        }
        let explicit: Vec<_> = f.explicit_parameters().collect();
        let takes_container = match (f.receiver_type(), explicit.as_slice()) {
            (None, [only]) => only
                .ty
                .strip_ref()
                .pointee()
                .is_some_and(|t| t.type_name() == type_name),
            (Some(receiver), []) => receiver.type_name() == type_name,
            _ => false,
        };
        if !takes_container {
            continue;
        }
        let Some(alt) = f.return_type.as_ref().and_then(|r| r.strip().pointee()) else {
            continue;
        };
        let program = ctx.lift(build, f)?;
        alternatives.push(AlternativeAccessor {
            accessor: program,
            alternative_type: ctx.registry.resolve(alt).type_name(),
        });
    }
    if alternatives.is_empty() {
        return None;
    }
    Some(Capability::TaggedUnion(TaggedUnionShape { alternatives }))
}

/// `rax = rdi` — dereference of a raw-pointer iterator.
fn synth_identity() -> AccessorProgram {
    AccessorProgram {
        linkage_name: "<builtin:identity>".to_string(),
        function_address: 0,
        ops: vec![
            AccessorOp::Move {
                dst: Reg::RAX,
                src: RValue::Reg {
                    reg: Reg::RDI,
                    width: 8,
                },
                width: 8,
            },
            AccessorOp::Return,
        ],
    }
}

/// `rax = rdi + disp` — element step of a raw-pointer iterator.
fn synth_add(disp: i64) -> AccessorProgram {
    AccessorProgram {
        linkage_name: "<builtin:advance>".to_string(),
        function_address: 0,
        ops: vec![
            AccessorOp::Lea {
                dst: Reg::RAX,
                mem: MemRef::base_disp(Reg::RDI, disp),
            },
            AccessorOp::Return,
        ],
    }
}

/// `rax = (rdi == rsi)` — raw-pointer iterator comparison.
fn synth_equal() -> AccessorProgram {
    AccessorProgram {
        linkage_name: "<builtin:equal>".to_string(),
        function_address: 0,
        ops: vec![
            AccessorOp::Compare {
                a: RValue::Reg {
                    reg: Reg::RDI,
                    width: 8,
                },
                b: RValue::Reg {
                    reg: Reg::RSI,
                    width: 8,
                },
            },
            AccessorOp::SetCond {
                dst: Reg::RAX,
                cond: Cond::Eq,
            },
            AccessorOp::Return,
        ],
    }
}
