//! Worker registry implementations.

pub mod file;
pub mod memory;

pub use file::JsonFileRegistry;
pub use memory::MemoryRegistry;
