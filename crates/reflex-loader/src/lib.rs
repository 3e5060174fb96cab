//! JSON workflow definitions: load a [`reflex_core::Workflow`] from JSON
//! text, or serialize one back out. Loaded workflows are plain data — the
//! caller still runs them through `Registry::register` for structural
//! validation; this crate only concerns itself with the JSON schema.

mod loader;
mod serializer;

pub use loader::{load_workflow, GuardRegistry, LoadOptions};
pub use serializer::{serialize_workflow, GuardNameMap, SerializeOptions};
