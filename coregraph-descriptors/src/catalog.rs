//! Per-module descriptor catalogs and the analysis-wide registry
//!
//! A [`ModuleCatalog`] owns every descriptor parsed out of one module and the
//! name indexes over them; a [`DescriptorRegistry`] maps build identities to
//! catalogs and is passed by reference through every component of an
//! analysis. Registry iteration is ordered, so corpus-wide searches are
//! deterministic.

use crate::error::DescriptorError;
use crate::functions::{FunctionDescriptor, MethodKind};
use crate::types::{StructDescriptor, TypeDescriptor};
use crate::variables::VariableDescriptor;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use tracing::debug;

/// Build identity of one module: build-id hex string or, failing that, the
/// canonical path of the binary. Keys every per-module artifact.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BuildId(pub String);

impl BuildId {
    pub fn new(id: impl Into<String>) -> Self {
        BuildId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BuildId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Descriptor store for a single module, with name/receiver/linkage indexes.
#[derive(Debug, Default)]
pub struct ModuleCatalog {
    build_id: BuildId,
    types: Vec<TypeDescriptor>,
    functions: Vec<FunctionDescriptor>,
    variables: Vec<VariableDescriptor>,
    /// type name -> indexes into `types`; definitions and declarations mixed
    type_index: BTreeMap<String, Vec<usize>>,
    /// receiver type name -> method indexes into `functions`
    method_index: BTreeMap<String, Vec<usize>>,
    /// linkage name -> function index
    linkage_index: HashMap<String, usize>,
}

impl ModuleCatalog {
    pub fn new(build_id: BuildId) -> Self {
        Self {
            build_id,
            ..Default::default()
        }
    }

    pub fn build_id(&self) -> &BuildId {
        &self.build_id
    }

    pub fn add_type(&mut self, ty: TypeDescriptor) {
        let name = ty.type_name();
        let idx = self.types.len();
        self.types.push(ty);
        if !name.is_empty() {
            self.type_index.entry(name).or_default().push(idx);
        }
    }

    pub fn add_function(&mut self, func: FunctionDescriptor) {
        let idx = self.functions.len();
        if let Some(receiver) = func.receiver_type_name() {
            self.method_index.entry(receiver).or_default().push(idx);
        }
        if !func.linkage_name.is_empty() {
            self.linkage_index.insert(func.linkage_name.clone(), idx);
        }
        self.functions.push(func);
    }

    pub fn add_variable(&mut self, var: VariableDescriptor) {
        self.variables.push(var);
    }

    /// Find a type by name, preferring a definition (non-empty layout) over a
    /// bare declaration.
    pub fn find_type(&self, name: &str) -> Option<&TypeDescriptor> {
        let candidates = self.type_index.get(name)?;
        let is_definition = |t: &TypeDescriptor| match t.strip() {
            TypeDescriptor::Struct(s) => !s.members.is_empty() || s.has_vtable,
            TypeDescriptor::Union { members, .. } => !members.is_empty(),
            _ => true,
        };
        if let Some(&idx) = candidates.iter().find(|&&i| is_definition(&self.types[i])) {
            return Some(&self.types[idx]);
        }
        debug!("catalog {}: only declarations for `{}`", self.build_id, name);
        candidates.first().map(|&i| &self.types[i])
    }

    pub fn find_struct(&self, name: &str) -> Option<&StructDescriptor> {
        self.find_type(name).and_then(|t| t.as_struct())
    }

    pub fn find_function_by_linkage(&self, linkage: &str) -> Option<&FunctionDescriptor> {
        self.linkage_index.get(linkage).map(|&i| &self.functions[i])
    }

    /// All methods whose receiver is the named type.
    pub fn methods_of(&self, type_name: &str) -> impl Iterator<Item = &FunctionDescriptor> {
        self.method_index
            .get(type_name)
            .into_iter()
            .flatten()
            .map(move |&i| &self.functions[i])
    }

    /// First method of the named type with the given signature role.
    pub fn method_of_kind(&self, type_name: &str, kind: MethodKind) -> Option<&FunctionDescriptor> {
        self.methods_of(type_name).find(|f| f.method_kind() == kind)
    }

    pub fn functions(&self) -> &[FunctionDescriptor] {
        &self.functions
    }

    pub fn variables(&self) -> &[VariableDescriptor] {
        &self.variables
    }

    pub fn types(&self) -> &[TypeDescriptor] {
        &self.types
    }

    /// (types, functions, variables) counts for load statistics.
    pub fn stats(&self) -> (usize, usize, usize) {
        (self.types.len(), self.functions.len(), self.variables.len())
    }
}

/// Remote debug-info retrieval contract: given a build identity, return the
/// module's catalog or nothing. Used only to fill gaps for system libraries.
pub trait DebugInfoProvider: Send + Sync {
    fn fetch(&self, build_id: &BuildId) -> Option<ModuleCatalog>;
}

/// Analysis-wide registry of module catalogs, constructed once per analysis
/// and passed by reference everywhere. Ordered iteration keeps corpus-wide
/// searches deterministic.
#[derive(Debug, Default)]
pub struct DescriptorRegistry {
    modules: BTreeMap<BuildId, ModuleCatalog>,
}

impl DescriptorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, catalog: ModuleCatalog) {
        self.modules.insert(catalog.build_id().clone(), catalog);
    }

    pub fn module(&self, build_id: &BuildId) -> Option<&ModuleCatalog> {
        self.modules.get(build_id)
    }

    pub fn modules(&self) -> impl Iterator<Item = &ModuleCatalog> {
        self.modules.values()
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    /// Fetch a missing module's catalog through the remote provider. Modules
    /// the provider does not know stay missing; analysis degrades to partial
    /// results for them.
    pub fn fill_gap(
        &mut self,
        build_id: &BuildId,
        provider: &dyn DebugInfoProvider,
    ) -> Result<(), DescriptorError> {
        if self.modules.contains_key(build_id) {
            return Ok(());
        }
        match provider.fetch(build_id) {
            Some(catalog) => {
                debug!("filled descriptor gap for module {}", build_id);
                self.insert(catalog);
                Ok(())
            }
            None => Err(DescriptorError::MissingDebugInfo {
                build_id: build_id.to_string(),
                what: "remote provider returned not-found".to_string(),
            }),
        }
    }

    /// Find a type across all modules, preferring definitions. First match in
    /// registry order wins.
    pub fn find_type(&self, name: &str) -> Option<(&BuildId, &TypeDescriptor)> {
        for catalog in self.modules.values() {
            if let Some(t) = catalog.find_type(name) {
                return Some((catalog.build_id(), t));
            }
        }
        None
    }

    pub fn find_struct(&self, name: &str) -> Option<&StructDescriptor> {
        self.find_type(name).and_then(|(_, t)| t.as_struct())
    }

    /// Resolve a by-name type reference to its definition, if any module has
    /// one; otherwise hand back the reference unchanged.
    pub fn resolve<'a>(&'a self, ty: &'a TypeDescriptor) -> &'a TypeDescriptor {
        if let TypeDescriptor::Named { name } = ty.strip() {
            if let Some((_, resolved)) = self.find_type(name) {
                return resolved;
            }
        }
        ty
    }

    /// Methods of the named type across every module, in registry order.
    pub fn methods_of(&self, type_name: &str) -> Vec<(&BuildId, &FunctionDescriptor)> {
        self.modules
            .values()
            .flat_map(|catalog| {
                catalog
                    .methods_of(type_name)
                    .map(move |f| (catalog.build_id(), f))
            })
            .collect()
    }

    /// All functions in every module, in registry order. Used for corpus-wide
    /// operator searches.
    pub fn all_functions(&self) -> impl Iterator<Item = (&BuildId, &FunctionDescriptor)> {
        self.modules.values().flat_map(|catalog| {
            catalog
                .functions()
                .iter()
                .map(move |f| (catalog.build_id(), f))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{MemberDescriptor, StructDescriptor};

    fn declaration(name: &str) -> TypeDescriptor {
        TypeDescriptor::Struct(StructDescriptor {
            name: name.to_string(),
            size: 0,
            ..Default::default()
        })
    }

    fn definition(name: &str) -> TypeDescriptor {
        TypeDescriptor::Struct(StructDescriptor {
            name: name.to_string(),
            size: 8,
            members: vec![MemberDescriptor {
                name: "head".to_string(),
                ty: TypeDescriptor::unsigned_int("unsigned long", 8),
                offset: 0,
                bit_offset: None,
                bit_size: None,
            }],
            ..Default::default()
        })
    }

    #[test]
    fn find_type_prefers_definitions_over_declarations() {
        let mut catalog = ModuleCatalog::new(BuildId::new("m0"));
        catalog.add_type(declaration("list"));
        catalog.add_type(definition("list"));
        let found = catalog.find_struct("list").unwrap();
        assert_eq!(found.members.len(), 1);
    }

    #[test]
    fn registry_resolves_named_references() {
        let mut catalog = ModuleCatalog::new(BuildId::new("m0"));
        catalog.add_type(definition("list"));
        let mut registry = DescriptorRegistry::new();
        registry.insert(catalog);

        let named = TypeDescriptor::Named {
            name: "list".to_string(),
        };
        let resolved = registry.resolve(&named);
        assert!(resolved.as_struct().is_some());
    }

    struct NeverFound;
    impl DebugInfoProvider for NeverFound {
        fn fetch(&self, _build_id: &BuildId) -> Option<ModuleCatalog> {
            None
        }
    }

    #[test]
    fn gap_fill_reports_missing_debug_info() {
        let mut registry = DescriptorRegistry::new();
        let err = registry
            .fill_gap(&BuildId::new("libmissing"), &NeverFound)
            .unwrap_err();
        assert!(matches!(err, DescriptorError::MissingDebugInfo { .. }));
    }
}
