//! Cross-binary accessor substitution
//!
//! When the production binary inlined an accessor away, its machine code may
//! be borrowed from an alternate build of the same sources under the same
//! mangled name — but only after a structural equivalence check across the
//! two modules. Two builds that disagree on the signature or on the receiver
//! type's layout violate the one-definition rule; substitution is then
//! refused with an explicit error, never applied silently.

use crate::error::LiftError;
use coregraph_descriptors::{FunctionDescriptor, ModuleCatalog};
use tracing::{debug, warn};

/// Resolve the machine code to lift for `func`. Returns `func` itself when it
/// has an out-of-line body; otherwise tries the identically-mangled function
/// of `alternate`, gated on the ODR equivalence check.
pub fn resolve_function_body<'a>(
    func: &'a FunctionDescriptor,
    primary: &ModuleCatalog,
    alternate: Option<&'a ModuleCatalog>,
) -> Result<&'a FunctionDescriptor, LiftError> {
    if func.has_body() {
        return Ok(func);
    }

    let Some(alternate) = alternate else {
        return Err(LiftError::MissingBody {
            linkage: func.linkage_name.clone(),
        });
    };

    let candidate = alternate
        .find_function_by_linkage(&func.linkage_name)
        .filter(|f| f.has_body())
        .ok_or_else(|| LiftError::MissingBody {
            linkage: func.linkage_name.clone(),
        })?;

    check_equivalence(func, candidate, primary, alternate)?;

    debug!(
        "substituting `{}` from module {}",
        func.linkage_name,
        alternate.build_id()
    );
    Ok(candidate)
}

fn check_equivalence(
    func: &FunctionDescriptor,
    candidate: &FunctionDescriptor,
    primary: &ModuleCatalog,
    alternate: &ModuleCatalog,
) -> Result<(), LiftError> {
    if !func.signature_equivalent(candidate) {
        warn!(
            "refusing substitution of `{}`: signatures differ across builds",
            func.linkage_name
        );
        return Err(LiftError::OdrMismatch {
            symbol: func.linkage_name.clone(),
            reason: "function signatures differ across builds".to_string(),
        });
    }

    // The receiver type must have the same layout in both modules; an
    // accessor compiled against a different layout would read the wrong
    // offsets.
    if let Some(receiver) = func.receiver_type_name() {
        match (primary.find_struct(&receiver), alternate.find_struct(&receiver)) {
            (Some(a), Some(b)) => {
                if a.size != b.size || a.layout_fingerprint() != b.layout_fingerprint() {
                    warn!(
                        "refusing substitution of `{}`: `{receiver}` layouts differ",
                        func.linkage_name
                    );
                    return Err(LiftError::OdrMismatch {
                        symbol: func.linkage_name.clone(),
                        reason: format!("type `{receiver}` has different layouts across builds"),
                    });
                }
            }
            _ => {
                return Err(LiftError::OdrMismatch {
                    symbol: func.linkage_name.clone(),
                    reason: format!(
                        "type `{receiver}` is not defined in both builds, equivalence unverifiable"
                    ),
                });
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use coregraph_descriptors::{
        BuildId, MemberDescriptor, ParameterDescriptor, StructDescriptor, TypeDescriptor,
    };

    fn ring_struct(value_offset: u64) -> TypeDescriptor {
        TypeDescriptor::Struct(StructDescriptor {
            name: "ring".to_string(),
            size: 16,
            members: vec![MemberDescriptor {
                name: "head".to_string(),
                ty: TypeDescriptor::unsigned_int("unsigned long", 8),
                offset: value_offset,
                bit_offset: None,
                bit_size: None,
            }],
            ..Default::default()
        })
    }

    fn begin_fn(bytes: Vec<u8>) -> FunctionDescriptor {
        FunctionDescriptor {
            linkage_name: "_ZN4ring5beginEv".to_string(),
            display_name: "ring::begin()".to_string(),
            low_address: 0x1000,
            high_address: 0x1000 + bytes.len().max(1) as u64,
            bytes,
            parameters: vec![ParameterDescriptor {
                name: Some("this".to_string()),
                ty: TypeDescriptor::pointer_to(TypeDescriptor::Named {
                    name: "ring".to_string(),
                }),
                artificial: true,
            }],
            return_type: Some(TypeDescriptor::pointer_to(TypeDescriptor::unsigned_int(
                "unsigned long",
                8,
            ))),
            template_args: Vec::new(),
        }
    }

    fn catalog(id: &str, value_offset: u64, func: FunctionDescriptor) -> ModuleCatalog {
        let mut c = ModuleCatalog::new(BuildId::new(id));
        c.add_type(ring_struct(value_offset));
        c.add_function(func);
        c
    }

    #[test]
    fn substitution_borrows_matching_alternate_body() {
        let inlined = begin_fn(vec![]);
        let primary = catalog("prod", 0, inlined.clone());
        let alternate = catalog("debugbuild", 0, begin_fn(vec![0x48, 0x8b, 0x07, 0xc3]));

        let resolved = resolve_function_body(&inlined, &primary, Some(&alternate)).unwrap();
        assert!(resolved.has_body());
    }

    #[test]
    fn layout_disagreement_is_an_odr_mismatch() {
        let inlined = begin_fn(vec![]);
        let primary = catalog("prod", 0, inlined.clone());
        // Same symbol, but the receiver layout moved.
        let alternate = catalog("debugbuild", 8, begin_fn(vec![0x48, 0x8b, 0x47, 0x08, 0xc3]));

        let err = resolve_function_body(&inlined, &primary, Some(&alternate)).unwrap_err();
        assert!(matches!(err, LiftError::OdrMismatch { .. }));
    }

    #[test]
    fn out_of_line_body_needs_no_substitution() {
        let func = begin_fn(vec![0x48, 0x8b, 0x07, 0xc3]);
        let primary = catalog("prod", 0, func.clone());
        let resolved = resolve_function_body(&func, &primary, None).unwrap();
        assert_eq!(resolved.bytes, func.bytes);
    }
}
