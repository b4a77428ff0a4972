//! Variable descriptors: globals, PC-scoped locals, thread-locals

use crate::types::TypeDescriptor;

/// Storage class of a variable, with the location detail each class needs.
#[derive(Debug, Clone, PartialEq)]
pub enum VariableKind {
    /// Module-scope variable at a link-time address (bias applied by the
    /// module map)
    Global,
    /// Stack local, valid only while the program counter is inside the range
    Local { scope_start: u64, scope_end: u64 },
    /// Thread-local; `tls_offset` is added to a thread's TLS block base
    ThreadLocal { tls_offset: u64 },
}

/// One variable from a module's debug information. Immutable.
#[derive(Debug, Clone, PartialEq)]
pub struct VariableDescriptor {
    pub name: String,
    pub ty: TypeDescriptor,
    /// Link-time address for globals; None for locals (the external unwinder
    /// supplies concrete frame addresses) and for TLS variables.
    pub link_address: Option<u64>,
    pub kind: VariableKind,
}

impl VariableDescriptor {
    pub fn global(name: &str, ty: TypeDescriptor, link_address: u64) -> Self {
        Self {
            name: name.to_string(),
            ty,
            link_address: Some(link_address),
            kind: VariableKind::Global,
        }
    }

    pub fn thread_local(name: &str, ty: TypeDescriptor, tls_offset: u64) -> Self {
        Self {
            name: name.to_string(),
            ty,
            link_address: None,
            kind: VariableKind::ThreadLocal { tls_offset },
        }
    }

    /// True when a local variable is visible at the given program counter.
    pub fn in_scope_at(&self, pc: u64) -> bool {
        match self.kind {
            VariableKind::Local {
                scope_start,
                scope_end,
            } => pc >= scope_start && pc < scope_end,
            _ => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_scope_is_half_open() {
        let v = VariableDescriptor {
            name: "it".to_string(),
            ty: TypeDescriptor::signed_int("int", 4),
            link_address: None,
            kind: VariableKind::Local {
                scope_start: 0x100,
                scope_end: 0x200,
            },
        };
        assert!(!v.in_scope_at(0xff));
        assert!(v.in_scope_at(0x100));
        assert!(v.in_scope_at(0x1ff));
        assert!(!v.in_scope_at(0x200));
    }
}
