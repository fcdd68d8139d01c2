//! Kernel structure layout profile.

use std::path::Path;

use serde::{Deserialize, Serialize};
use slatrace_core::Error;

/// Field offsets into the traced kernel's structures.
///
/// These vary per kernel build; they are loaded from a small JSON profile
/// generated alongside the kernel (or lifted from its debug info):
///
/// ```json
/// {
///     "task_struct_tasks": 1000,
///     "task_struct_pid": 1256,
///     "task_struct_mm": 1104,
///     "mm_struct_pgd": 80
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinuxOffsets {
    /// `offsetof(struct task_struct, tasks)`
    pub task_struct_tasks: u64,

    /// `offsetof(struct task_struct, pid)`
    pub task_struct_pid: u64,

    /// `offsetof(struct task_struct, mm)`
    pub task_struct_mm: u64,

    /// `offsetof(struct mm_struct, pgd)`
    pub mm_struct_pgd: u64,
}

impl LinuxOffsets {
    /// Loads a profile from a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, Error> {
        let content = std::fs::read_to_string(path)?;
        serde_json::from_str(&content)
            .map_err(|err| Error::Config(format!("invalid offsets profile: {err}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_json() {
        let offsets = LinuxOffsets {
            task_struct_tasks: 0x3E8,
            task_struct_pid: 0x4E8,
            task_struct_mm: 0x450,
            mm_struct_pgd: 0x50,
        };

        let json = serde_json::to_string(&offsets).unwrap();
        let parsed: LinuxOffsets = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.task_struct_pid, 0x4E8);
    }

    #[test]
    fn rejects_incomplete_profiles() {
        let result: Result<LinuxOffsets, _> = serde_json::from_str(r#"{"task_struct_pid": 1}"#);
        assert!(result.is_err());
    }
}
