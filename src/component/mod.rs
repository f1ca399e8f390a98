/// Component Registry
///
/// Resolves `(namespace, name)` references to versioned code plus a declared
/// input/output schema, validates call inputs and hands execution to the process
/// sandbox.

// Manifest parsing and validation
pub mod manifest;

// Hot-reload registry using ArcSwap snapshots
pub mod registry;

pub use manifest::{ComponentManifest, InputSpec, Namespace};
pub use registry::{CachedComponent, ComponentRegistry, ComponentSummary, USER_COMPONENT_ROOT};
