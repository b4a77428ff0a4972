//! Function descriptors
//!
//! A [`FunctionDescriptor`] is the immutable view of one compiled function:
//! its address range, raw instruction bytes, and typed signature including the
//! artificial (hidden) receiver parameter. The accessor lifter consumes the
//! bytes; the capability classifier consumes the signature shape.

use crate::demangle;
use crate::types::{TemplateArg, TypeDescriptor};

/// One compiled function from a module's debug information. Immutable.
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionDescriptor {
    /// Mangled linkage name; the identity used for cross-binary substitution
    pub linkage_name: String,
    /// Demangled or source-level name, when the producer has one
    pub display_name: String,
    pub low_address: u64,
    pub high_address: u64,
    /// Raw instruction bytes of `[low_address, high_address)`. Empty when the
    /// producing binary inlined the function away.
    pub bytes: Vec<u8>,
    pub parameters: Vec<ParameterDescriptor>,
    pub return_type: Option<TypeDescriptor>,
    /// Template arguments of function template instantiations; a
    /// tagged-union accessor carries its alternative selector here
    pub template_args: Vec<TemplateArg>,
}

/// A single formal parameter. `artificial` marks compiler-synthesized
/// parameters, most importantly the receiver.
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterDescriptor {
    pub name: Option<String>,
    pub ty: TypeDescriptor,
    pub artificial: bool,
}

/// Signature-shape role of a member function, derived from its leaf name.
/// Classification matches on these shapes, never on full names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MethodKind {
    Begin,
    End,
    Deref,
    Increment,
    Get,
    GetIf,
    BoolConversion,
    Value,
    EqualOp,
    NotEqualOp,
    Other,
}

impl FunctionDescriptor {
    /// The receiver type this function is a method of: the stripped pointee
    /// of the first artificial parameter. Free functions return None.
    pub fn receiver_type(&self) -> Option<&TypeDescriptor> {
        self.parameters
            .iter()
            .find(|p| p.artificial)
            .and_then(|p| p.ty.pointee())
    }

    /// Name of the receiver type, when this is a method.
    pub fn receiver_type_name(&self) -> Option<String> {
        self.receiver_type().map(|t| t.type_name())
    }

    /// Parameters excluding artificial ones.
    pub fn explicit_parameters(&self) -> impl Iterator<Item = &ParameterDescriptor> {
        self.parameters.iter().filter(|p| !p.artificial)
    }

    /// Leaf name used for signature-shape matching. Prefers the display name;
    /// falls back to demangling the linkage name.
    pub fn leaf_name(&self) -> String {
        if !self.display_name.is_empty() {
            return demangle::demangled_leaf(&self.display_name);
        }
        match demangle::demangle(&self.linkage_name) {
            Some(d) => demangle::demangled_leaf(&d),
            None => demangle::demangled_leaf(&self.linkage_name),
        }
    }

    /// Fully qualified demangled name, for namespace tie-breaking.
    pub fn qualified_name(&self) -> String {
        if !self.display_name.is_empty() {
            return self.display_name.clone();
        }
        demangle::demangle(&self.linkage_name).unwrap_or_else(|| self.linkage_name.clone())
    }

    pub fn method_kind(&self) -> MethodKind {
        match self.leaf_name().as_str() {
            "begin" | "cbegin" => MethodKind::Begin,
            "end" | "cend" => MethodKind::End,
            "operator*" | "operator->" => MethodKind::Deref,
            "operator++" => MethodKind::Increment,
            "get" => MethodKind::Get,
            "get_if" => MethodKind::GetIf,
            "operator bool" => MethodKind::BoolConversion,
            "value" => MethodKind::Value,
            "operator==" => MethodKind::EqualOp,
            "operator!=" => MethodKind::NotEqualOp,
            _ => MethodKind::Other,
        }
    }

    pub fn contains_address(&self, addr: u64) -> bool {
        addr >= self.low_address && addr < self.high_address
    }

    pub fn byte_len(&self) -> u64 {
        self.high_address - self.low_address
    }

    /// True when the producing binary kept an out-of-line body we can lift.
    pub fn has_body(&self) -> bool {
        !self.bytes.is_empty()
    }

    /// Structural signature equivalence: same parameter shapes and return
    /// type by stripped name and size. This is the function half of the ODR
    /// check guarding cross-binary substitution.
    pub fn signature_equivalent(&self, other: &FunctionDescriptor) -> bool {
        if self.parameters.len() != other.parameters.len() {
            return false;
        }
        let same_type = |a: &TypeDescriptor, b: &TypeDescriptor| {
            a.strip().type_name() == b.strip().type_name() && a.size() == b.size()
        };
        let params_match = self
            .parameters
            .iter()
            .zip(other.parameters.iter())
            .all(|(a, b)| a.artificial == b.artificial && same_type(&a.ty, &b.ty));
        let returns_match = match (&self.return_type, &other.return_type) {
            (Some(a), Some(b)) => same_type(a, b),
            (None, None) => true,
            _ => false,
        };
        params_match && returns_match
    }
}
