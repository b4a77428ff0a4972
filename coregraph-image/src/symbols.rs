//! Per-module symbol tables and the vtable address-point index
//!
//! Symbol tables come from the mapped binaries (via `object`) or from an
//! explicit list supplied by an external core reader. The [`VtableIndex`]
//! derived from them is the closed set of addresses dynamic type recovery is
//! allowed to match against: a word is a vtable pointer only if it lands,
//! exactly and pointer-aligned, inside a known vtable symbol's address-point
//! range.

use coregraph_descriptors::demangle;
use object::{Object, ObjectSymbol};
use std::collections::HashMap;
use tracing::{debug, info};

/// Itanium vtable layout: two pointer-sized words (offset-to-top, typeinfo)
/// precede the first address point.
const VTABLE_ADDRESS_POINT_OFFSET: u64 = 16;

/// Coarse symbol classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolKind {
    Function,
    Data,
    Other,
}

impl From<object::SymbolKind> for SymbolKind {
    fn from(kind: object::SymbolKind) -> Self {
        match kind {
            object::SymbolKind::Text => SymbolKind::Function,
            object::SymbolKind::Data => SymbolKind::Data,
            _ => SymbolKind::Other,
        }
    }
}

/// A symbol in a module, at its link-time address (bias not applied).
#[derive(Debug, Clone)]
pub struct Symbol {
    pub name: String,
    pub address: u64,
    pub size: u64,
    pub kind: SymbolKind,
}

/// Symbol table with name and address-ordered indexes.
#[derive(Debug, Default)]
pub struct SymbolTable {
    symbols: Vec<Symbol>,
    name_index: HashMap<String, usize>,
    /// Indices sorted by address
    address_sorted: Vec<usize>,
}

impl SymbolTable {
    /// Parse the symbol table out of a module's executable bytes.
    pub fn from_object_bytes(data: &[u8]) -> Result<Self, object::Error> {
        let object_file = object::File::parse(data)?;

        let mut symbols = Vec::new();
        for symbol in object_file.dynamic_symbols().chain(object_file.symbols()) {
            let Ok(name) = symbol.name() else { continue };
            if name.is_empty() || name.starts_with('$') {
                continue;
            }
            symbols.push(Symbol {
                name: name.to_string(),
                address: symbol.address(),
                size: symbol.size(),
                kind: SymbolKind::from(symbol.kind()),
            });
        }

        info!("parsed {} symbols", symbols.len());
        Ok(Self::from_symbols(symbols))
    }

    /// Build a table from an explicit symbol list (external core readers,
    /// tests).
    pub fn from_symbols(symbols: Vec<Symbol>) -> Self {
        let mut name_index = HashMap::new();
        for (idx, sym) in symbols.iter().enumerate() {
            // Prefer the first occurrence; dynamic symbols come first when
            // parsing from an object file.
            name_index.entry(sym.name.clone()).or_insert(idx);
        }
        let mut address_sorted: Vec<usize> = (0..symbols.len()).collect();
        address_sorted.sort_by_key(|&i| symbols[i].address);
        Self {
            symbols,
            name_index,
            address_sorted,
        }
    }

    pub fn find_by_name(&self, name: &str) -> Option<&Symbol> {
        self.name_index.get(name).map(|&idx| &self.symbols[idx])
    }

    /// Closest symbol at or before the given address.
    pub fn find_closest(&self, addr: u64) -> Option<&Symbol> {
        let idx = self
            .address_sorted
            .partition_point(|&i| self.symbols[i].address <= addr)
            .checked_sub(1)?;
        Some(&self.symbols[self.address_sorted[idx]])
    }

    pub fn symbols(&self) -> &[Symbol] {
        &self.symbols
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }
}

/// A successful vtable address-point match.
#[derive(Debug, Clone, PartialEq)]
pub struct VtableHit {
    /// Name of the type the vtable belongs to
    pub type_name: String,
    /// Runtime address of the vtable symbol start
    pub vtable_base: u64,
    /// Byte offset of the matched word inside the vtable symbol
    pub offset: u64,
    /// True for the first (offset-zero subobject) address point; preferred
    /// for multiple-inheritance layouts
    pub is_primary: bool,
}

#[derive(Debug, Clone)]
struct VtableSpan {
    start: u64,
    end: u64,
    type_name: String,
}

/// The closed set of known vtable address points of one module, at runtime
/// addresses (load bias applied).
#[derive(Debug, Default)]
pub struct VtableIndex {
    /// Spans sorted by start address
    spans: Vec<VtableSpan>,
}

impl VtableIndex {
    /// Collect `_ZTV*` data symbols and record their runtime spans.
    pub fn from_symbols(table: &SymbolTable, load_bias: u64) -> Self {
        let mut spans = Vec::new();
        for sym in table.symbols() {
            if sym.size == 0 {
                continue;
            }
            let Some(type_name) = demangle::vtable_type_name(&sym.name) else {
                continue;
            };
            spans.push(VtableSpan {
                start: sym.address + load_bias,
                end: sym.address + load_bias + sym.size,
                type_name,
            });
        }
        spans.sort_by_key(|s| s.start);
        debug!("vtable index with {} spans", spans.len());
        Self { spans }
    }

    pub fn is_empty(&self) -> bool {
        self.spans.is_empty()
    }

    pub fn len(&self) -> usize {
        self.spans.len()
    }

    /// Match a candidate word against the closed address-point set. Accepts
    /// only pointer-aligned words at or past the first address point of a
    /// known vtable span; the primary address point is the preferred (and
    /// flagged) occurrence.
    pub fn resolve(&self, word: u64) -> Option<VtableHit> {
        if word % 8 != 0 {
            return None;
        }
        let idx = self
            .spans
            .partition_point(|s| s.start <= word)
            .checked_sub(1)?;
        let span = &self.spans[idx];
        if word >= span.end {
            return None;
        }
        let offset = word - span.start;
        if offset < VTABLE_ADDRESS_POINT_OFFSET {
            // Inside the offset-to-top/typeinfo prelude; not an address point.
            return None;
        }
        Some(VtableHit {
            type_name: span.type_name.clone(),
            vtable_base: span.start,
            offset,
            is_primary: offset == VTABLE_ADDRESS_POINT_OFFSET,
        })
    }
}
