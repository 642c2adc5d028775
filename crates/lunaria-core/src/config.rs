//! Runtime configuration.

use serde::{Deserialize, Serialize};

/// Tunables for one runtime instance. Every field has a default, so a
/// partial document deserializes cleanly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Percentage of live memory to wait for before starting a new cycle.
    pub gc_pause: u32,
    /// Collector speed relative to allocation, in percent.
    pub gc_stepmul: u32,
    /// Hard cap on accounted bytes. Allocations past it trigger an
    /// emergency collection and then fail with a memory error.
    pub memory_limit: Option<usize>,
    /// Fixed string hash seed. Random per instance when absent.
    pub seed: Option<u32>,
    /// Maximum number of stack slots per thread.
    pub max_stack: usize,
    /// Maximum nesting of host calls.
    pub max_ccalls: u16,
    /// Initial number of string table buckets (a power of two).
    pub string_table_min: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            gc_pause: 200,
            gc_stepmul: 200,
            memory_limit: None,
            seed: None,
            max_stack: 1_000_000,
            max_ccalls: 200,
            string_table_min: crate::string::MIN_STRTAB_SIZE,
        }
    }
}

impl RuntimeConfig {
    /// Bucket count actually used for the string table.
    pub fn string_table_size(&self) -> usize {
        self.string_table_min.max(1).next_power_of_two()
    }
}
