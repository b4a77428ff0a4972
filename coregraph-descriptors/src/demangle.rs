//! Demangling helpers for Rust and C++ symbols
//!
//! Beyond plain demangling, this module extracts the pieces the engine keys
//! on: method leaf names (for signature-shape classification), the type named
//! by a vtable symbol, and template arguments of demangled names (for
//! control-block pointee attribution).

use gimli::DwLang;

/// Demangle a symbol string using a language hint when available.
/// Returns None if demangling fails or is not applicable.
pub fn demangle_by_lang(lang: Option<DwLang>, s: &str) -> Option<String> {
    match lang {
        Some(gimli::DW_LANG_Rust) => {
            if let Some(d) = demangle_rust(s) {
                return Some(d);
            }
        }
        Some(gimli::DW_LANG_C_plus_plus)
        | Some(gimli::DW_LANG_C_plus_plus_11)
        | Some(gimli::DW_LANG_C_plus_plus_14)
        | Some(gimli::DW_LANG_C_plus_plus_17)
        | Some(gimli::DW_LANG_C_plus_plus_20) => {
            if let Some(d) = demangle_cpp(s) {
                return Some(d);
            }
        }
        _ => {}
    }

    if is_rust_mangled(s) {
        demangle_rust(s)
    } else if is_itanium_cpp_mangled(s) {
        demangle_cpp(s)
    } else {
        None
    }
}

/// Demangle with heuristics only (no language hint).
pub fn demangle(s: &str) -> Option<String> {
    demangle_by_lang(None, s)
}

/// Return the leaf name of a demangled qualified name: the last `::` segment
/// with any template arguments and parameter list removed, Rust hash suffixes
/// stripped. `std::vector<int>::begin()` becomes `begin`,
/// `ns::operator==(it, it)` becomes `operator==`.
pub fn demangled_leaf(full: &str) -> String {
    let trimmed = strip_rust_hash(full);
    // Drop a trailing parameter list, but keep "operator()" intact.
    let without_params = match trimmed.rfind('(') {
        Some(pos) if !trimmed[..pos].ends_with("operator") => trimmed[..pos].trim_end(),
        _ => trimmed,
    };
    let without_templates = strip_trailing_template_args(without_params);
    // Split on `::` outside template brackets; operators like `operator<`
    // must not be cut at their punctuation.
    last_path_segment(without_templates).to_string()
}

/// Namespace portion of a qualified name: everything before the final path
/// segment. `std::__1::vector<int>` yields `std::__1`.
pub fn namespace_of(qualified: &str) -> &str {
    let name = strip_trailing_template_args(qualified);
    match split_last_segment(name) {
        Some((ns, _)) => ns,
        None => "",
    }
}

/// If `symbol` is an Itanium vtable symbol (`_ZTV...`), return the name of
/// the type it belongs to.
pub fn vtable_type_name(symbol: &str) -> Option<String> {
    if !symbol.starts_with("_ZTV") {
        return None;
    }
    let demangled = demangle_cpp(symbol)?;
    demangled
        .strip_prefix("vtable for ")
        .map(|s| s.trim().to_string())
}

/// First template argument of a demangled type name, with any trailing `*`
/// stripped: `std::_Sp_counted_ptr<Widget*, ...>` yields `Widget`.
pub fn first_template_argument(name: &str) -> Option<String> {
    let open = name.find('<')?;
    let inner = &name[open + 1..];
    let mut depth = 0usize;
    let mut end = inner.len();
    for (i, c) in inner.char_indices() {
        match c {
            '<' | '(' => depth += 1,
            '>' | ')' if depth > 0 => depth -= 1,
            '>' | ',' if depth == 0 => {
                end = i;
                break;
            }
            _ => {}
        }
    }
    let arg = inner[..end].trim().trim_end_matches('*').trim();
    if arg.is_empty() {
        None
    } else {
        Some(arg.to_string())
    }
}

/// Heuristic: Rust mangling (v0 `_R` or legacy `_ZN...17h...E`).
pub fn is_rust_mangled(s: &str) -> bool {
    s.starts_with("_R") || (s.starts_with("_ZN") && s.contains("17h") && s.ends_with('E'))
}

/// Heuristic: Itanium C++ mangling starts with `_Z`.
pub fn is_itanium_cpp_mangled(s: &str) -> bool {
    s.starts_with("_Z")
}

fn strip_rust_hash(full: &str) -> &str {
    match full.rfind("::h") {
        Some(pos) => {
            let suffix = &full[pos + 3..];
            if suffix.len() >= 8 && suffix.chars().all(|c| c.is_ascii_hexdigit()) {
                &full[..pos]
            } else {
                full
            }
        }
        None => full,
    }
}

fn strip_trailing_template_args(name: &str) -> &str {
    if !name.ends_with('>') {
        return name;
    }
    let mut depth = 0usize;
    for (i, c) in name.char_indices().rev() {
        match c {
            '>' => depth += 1,
            '<' => {
                depth -= 1;
                if depth == 0 {
                    return &name[..i];
                }
            }
            _ => {}
        }
    }
    name
}

fn split_last_segment(name: &str) -> Option<(&str, &str)> {
    let mut depth = 0usize;
    let bytes = name.as_bytes();
    let mut i = bytes.len();
    while i >= 2 {
        match bytes[i - 1] {
            b'>' | b')' => depth += 1,
            b'<' | b'(' if depth > 0 => depth -= 1,
            b':' if depth == 0 && bytes[i - 2] == b':' => {
                return Some((&name[..i - 2], &name[i..]));
            }
            _ => {}
        }
        i -= 1;
    }
    None
}

fn last_path_segment(name: &str) -> &str {
    match split_last_segment(name) {
        Some((_, leaf)) => leaf,
        None => name,
    }
}

fn demangle_rust(s: &str) -> Option<String> {
    match rustc_demangle::try_demangle(s) {
        Ok(sym) => Some(sym.to_string()),
        Err(_) => None,
    }
}

fn demangle_cpp(s: &str) -> Option<String> {
    match cpp_demangle::Symbol::new(s) {
        Ok(sym) => Some(sym.to_string()),
        Err(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leaf_of_qualified_template_method() {
        assert_eq!(demangled_leaf("std::vector<int>::begin()"), "begin");
        assert_eq!(demangled_leaf("std::vector<int>::operator*()"), "operator*");
        assert_eq!(
            demangled_leaf("ns::operator==(ns::it const&, ns::it const&)"),
            "operator=="
        );
        assert_eq!(demangled_leaf("intrusive_list::end"), "end");
    }

    #[test]
    fn leaf_strips_rust_hash() {
        assert_eq!(
            demangled_leaf("mylib::table::iter::h0123456789abcdef"),
            "iter"
        );
    }

    #[test]
    fn namespace_ignores_template_brackets() {
        assert_eq!(namespace_of("std::__1::vector<a::b>"), "std::__1");
        assert_eq!(namespace_of("plain"), "");
    }

    #[test]
    fn first_template_argument_strips_pointer() {
        assert_eq!(
            first_template_argument("std::_Sp_counted_ptr<Widget*, (__gnu_cxx::_Lock_policy)2>"),
            Some("Widget".to_string())
        );
        assert_eq!(first_template_argument("no_templates"), None);
    }

    #[test]
    fn vtable_symbol_yields_type_name() {
        // _ZTV6Widget == "vtable for Widget"
        assert_eq!(vtable_type_name("_ZTV6Widget"), Some("Widget".to_string()));
        assert_eq!(vtable_type_name("_ZN4main17h0000000000000000E"), None);
    }
}
