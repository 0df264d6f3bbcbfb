//! Context assembly for the Switchyard run orchestrator.
//!
//! [`ContextAssembler`] resolves a trigger into an [`ExecutionContext`]:
//! project, domain version, workflow, agents merged with their project
//! overlays, the tool set and a budget snapshot. [`overlay::resolve`] is the
//! pure merge of a core agent with an overlay.
//!
//! [`ExecutionContext`]: switchyard_types::ExecutionContext

pub mod assembler;
pub mod error;
pub mod memory;
pub mod overlay;

pub use assembler::ContextAssembler;
pub use error::{AssemblerError, AssemblyError, AssemblyFailure, Result};
pub use memory::MemoryConfigStore;
