//! Linux guest adapter for the slatrace engine.
//!
//! Resolves kernel symbols from a System.map, locates the post-dispatch
//! return point by disassembling the syscall entry handler, attributes
//! page-table roots to processes by walking the task list, and ships a
//! default callback table that logs common syscalls.

mod adapter;
mod profile;
mod symbols;

pub use self::{adapter::LinuxOs, profile::LinuxOffsets, symbols::SymbolTable};
