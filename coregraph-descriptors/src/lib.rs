//! Descriptor model for postmortem core analysis
//!
//! Descriptors are the pre-parsed view of a module's debug information:
//! types with member layouts, functions with their raw instruction bytes, and
//! variables with their storage locations. Binary/DWARF parsing itself lives
//! outside this workspace; external readers construct descriptors and hand
//! them to a [`DescriptorRegistry`], which the analysis engine threads through
//! every component instead of any process-wide state.

pub mod catalog;
pub mod demangle;
pub mod error;
pub mod functions;
pub mod types;
pub mod variables;

pub use catalog::{BuildId, DebugInfoProvider, DescriptorRegistry, ModuleCatalog};
pub use error::{DescriptorError, Result};
pub use functions::{FunctionDescriptor, MethodKind, ParameterDescriptor};
pub use types::{
    BaseClass, EnumVariant, MemberDescriptor, StructDescriptor, TemplateArg, TemplateArgValue,
    TypeDescriptor, TypeQualifier,
};
pub use variables::{VariableDescriptor, VariableKind};
