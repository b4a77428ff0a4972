//! Type descriptors with full member/layout fidelity
//!
//! A [`TypeDescriptor`] preserves everything the engine needs from a module's
//! type graph: member offsets, base-class subobjects, template arguments with
//! their defaulted flags, typedef chains and virtual-table presence. Nested
//! references are embedded; a producer that needs to cut a recursive layout
//! emits [`TypeDescriptor::Named`] and the catalog resolves it by name on
//! demand.

use gimli::DwAte;
use std::fmt;

/// Pointer width of the analyzed targets. Only 64-bit images are supported.
pub const POINTER_SIZE: u64 = 8;

/// Type information for a single type, keyed externally by
/// (module build identity, debug-info identity).
#[derive(Debug, Clone, PartialEq)]
pub enum TypeDescriptor {
    /// Base/primitive type (int, float, char, bool)
    Base {
        name: String,
        size: u64,
        encoding: DwAte,
    },

    /// Pointer to another type
    Pointer { target: Box<TypeDescriptor> },

    /// C++ reference; layout-identical to a pointer
    Reference { target: Box<TypeDescriptor> },

    /// Fixed or unknown-length array
    Array {
        element: Box<TypeDescriptor>,
        count: Option<u64>,
        total_size: Option<u64>,
    },

    /// Struct or class with full layout
    Struct(StructDescriptor),

    /// Union; members all at overlapping offsets
    Union {
        name: String,
        size: u64,
        members: Vec<MemberDescriptor>,
    },

    /// Enumeration with its underlying integer type
    Enum {
        name: String,
        size: u64,
        base: Box<TypeDescriptor>,
        variants: Vec<EnumVariant>,
    },

    /// Type alias
    Typedef {
        name: String,
        underlying: Box<TypeDescriptor>,
    },

    /// const/volatile/restrict qualified type
    Qualified {
        qualifier: TypeQualifier,
        underlying: Box<TypeDescriptor>,
    },

    /// Function type (used for parameter/return descriptions)
    Function {
        return_type: Option<Box<TypeDescriptor>>,
        parameters: Vec<TypeDescriptor>,
    },

    /// By-name reference to a type defined elsewhere; used to cut recursive
    /// layouts. Resolved through the catalog when layout is required.
    Named { name: String },

    /// Unresolved or unrepresentable type
    Unknown { name: String },
}

/// Struct/class descriptor with everything capability classification and
/// traversal need.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct StructDescriptor {
    pub name: String,
    pub size: u64,
    pub members: Vec<MemberDescriptor>,
    /// Base-class subobjects (name + offset within this type)
    pub base_classes: Vec<BaseClass>,
    pub template_args: Vec<TemplateArg>,
    /// True when the layout starts with (or contains) a virtual table pointer
    pub has_vtable: bool,
}

/// A named data member at a byte offset
#[derive(Debug, Clone, PartialEq)]
pub struct MemberDescriptor {
    pub name: String,
    pub ty: TypeDescriptor,
    pub offset: u64,
    pub bit_offset: Option<u8>,
    pub bit_size: Option<u8>,
}

/// Base-class subobject reference
#[derive(Debug, Clone, PartialEq)]
pub struct BaseClass {
    pub name: String,
    pub offset: u64,
}

/// Template argument with the defaulted flag debug info carries
#[derive(Debug, Clone, PartialEq)]
pub struct TemplateArg {
    pub name: Option<String>,
    pub value: TemplateArgValue,
    pub is_defaulted: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TemplateArgValue {
    Type(TypeDescriptor),
    Integral(i64),
}

#[derive(Debug, Clone, PartialEq)]
pub struct EnumVariant {
    pub name: String,
    pub value: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeQualifier {
    Const,
    Volatile,
    Restrict,
}

impl TypeDescriptor {
    /// Byte size of this type, following typedefs and qualifiers.
    pub fn size(&self) -> u64 {
        match self {
            TypeDescriptor::Base { size, .. } => *size,
            TypeDescriptor::Pointer { .. } | TypeDescriptor::Reference { .. } => POINTER_SIZE,
            TypeDescriptor::Array {
                element,
                count,
                total_size,
            } => total_size.unwrap_or_else(|| element.size() * count.unwrap_or(0)),
            TypeDescriptor::Struct(s) => s.size,
            TypeDescriptor::Union { size, .. } => *size,
            TypeDescriptor::Enum { size, .. } => *size,
            TypeDescriptor::Typedef { underlying, .. } => underlying.size(),
            TypeDescriptor::Qualified { underlying, .. } => underlying.size(),
            TypeDescriptor::Function { .. } => POINTER_SIZE,
            TypeDescriptor::Named { .. } | TypeDescriptor::Unknown { .. } => 0,
        }
    }

    /// Display name of the type.
    pub fn type_name(&self) -> String {
        match self {
            TypeDescriptor::Base { name, .. } => name.clone(),
            TypeDescriptor::Pointer { target } => format!("{}*", target.type_name()),
            TypeDescriptor::Reference { target } => format!("{}&", target.type_name()),
            TypeDescriptor::Array { element, count, .. } => match count {
                Some(n) => format!("{}[{n}]", element.type_name()),
                None => format!("{}[]", element.type_name()),
            },
            TypeDescriptor::Struct(s) => s.name.clone(),
            TypeDescriptor::Union { name, .. } => name.clone(),
            TypeDescriptor::Enum { name, .. } => name.clone(),
            TypeDescriptor::Typedef { name, .. } => name.clone(),
            TypeDescriptor::Qualified {
                qualifier,
                underlying,
            } => format!("{} {}", qualifier, underlying.type_name()),
            TypeDescriptor::Function { .. } => "fn".to_string(),
            TypeDescriptor::Named { name } => name.clone(),
            TypeDescriptor::Unknown { name } => name.clone(),
        }
    }

    /// Strip typedefs and qualifiers down to the structural type.
    pub fn strip(&self) -> &TypeDescriptor {
        match self {
            TypeDescriptor::Typedef { underlying, .. } => underlying.strip(),
            TypeDescriptor::Qualified { underlying, .. } => underlying.strip(),
            _ => self,
        }
    }

    /// Strip typedefs, qualifiers and one level of reference. The result is
    /// what an accessor returning `T&` actually points at.
    pub fn strip_ref(&self) -> &TypeDescriptor {
        match self.strip() {
            TypeDescriptor::Reference { target } => target.strip(),
            other => other,
        }
    }

    pub fn is_pointer_like(&self) -> bool {
        matches!(
            self.strip(),
            TypeDescriptor::Pointer { .. } | TypeDescriptor::Reference { .. }
        )
    }

    /// Target of a pointer or reference, stripped.
    pub fn pointee(&self) -> Option<&TypeDescriptor> {
        match self.strip() {
            TypeDescriptor::Pointer { target } | TypeDescriptor::Reference { target } => {
                Some(target.strip())
            }
            _ => None,
        }
    }

    pub fn as_struct(&self) -> Option<&StructDescriptor> {
        match self.strip() {
            TypeDescriptor::Struct(s) => Some(s),
            _ => None,
        }
    }

    pub fn is_bool(&self) -> bool {
        matches!(
            self.strip(),
            TypeDescriptor::Base { encoding, .. } if *encoding == gimli::DW_ATE_boolean
        )
    }

    /// Structural name equality after peeling typedefs, qualifiers and
    /// references. Used to decide whether two accessors share an iterator
    /// type.
    pub fn same_named_type(&self, other: &TypeDescriptor) -> bool {
        let a = self.strip_ref();
        let b = other.strip_ref();
        !a.type_name().is_empty() && a.type_name() == b.type_name()
    }
}

impl fmt::Display for TypeQualifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypeQualifier::Const => write!(f, "const"),
            TypeQualifier::Volatile => write!(f, "volatile"),
            TypeQualifier::Restrict => write!(f, "restrict"),
        }
    }
}

impl fmt::Display for TypeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}B)", self.type_name(), self.size())
    }
}

impl StructDescriptor {
    /// Look up a member by name.
    pub fn member(&self, name: &str) -> Option<&MemberDescriptor> {
        self.members.iter().find(|m| m.name == name)
    }

    /// A shallow layout fingerprint: (name, offset, size) per member. Two
    /// modules that disagree on this disagree on the type's definition.
    pub fn layout_fingerprint(&self) -> Vec<(String, u64, u64)> {
        self.members
            .iter()
            .map(|m| (m.name.clone(), m.offset, m.ty.size()))
            .collect()
    }
}

/// Convenience constructors used across the workspace and its tests.
impl TypeDescriptor {
    pub fn signed_int(name: &str, size: u64) -> Self {
        TypeDescriptor::Base {
            name: name.to_string(),
            size,
            encoding: gimli::DW_ATE_signed,
        }
    }

    pub fn unsigned_int(name: &str, size: u64) -> Self {
        TypeDescriptor::Base {
            name: name.to_string(),
            size,
            encoding: gimli::DW_ATE_unsigned,
        }
    }

    pub fn boolean() -> Self {
        TypeDescriptor::Base {
            name: "bool".to_string(),
            size: 1,
            encoding: gimli::DW_ATE_boolean,
        }
    }

    pub fn pointer_to(target: TypeDescriptor) -> Self {
        TypeDescriptor::Pointer {
            target: Box::new(target),
        }
    }

    pub fn reference_to(target: TypeDescriptor) -> Self {
        TypeDescriptor::Reference {
            target: Box::new(target),
        }
    }
}
