/// Workflow definitions
///
/// Type definitions for workflows, their trigger binding and ordered step list.
/// Persistence lives behind the `DocumentStore` trait in `crate::store`.

// Core workflow type definitions
pub mod types;

// Re-export commonly used types
pub use types::{ComponentRef, Step, TriggerConfig, TriggerType, Workflow, WorkflowSummary};
