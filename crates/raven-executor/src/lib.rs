//! Routine execution for raven workers.
//!
//! Provides:
//! - `ScriptRegistry` - resolve script identifiers and run requests
//! - Built-in routines (`add`, `echo`, `sys_info`)
//! - Staged scripts run through a configured interpreter

pub mod builtins;
pub mod command;
pub mod registry;
pub mod staged;

pub use builtins::FnExecutable;
pub use command::{CommandBuilder, CommandParts};
pub use registry::ScriptRegistry;
pub use staged::{StagedScript, StagedScripts};
