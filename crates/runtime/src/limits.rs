//! Host-tunable machine limits (§1 ambient configuration, SPEC_FULL.md).
//!
//! Mirrors the numeric caps in `miniscript_core::limits`, but as fields a
//! host (or the `repl` binary's `clap` flags) can override per `Machine`
//! instance rather than compile-time constants.

use miniscript_core::arithmetic::SizeLimits;
use miniscript_core::limits;

#[derive(Debug, Clone, Copy)]
pub struct MachineLimits {
    pub max_string_len: usize,
    pub max_list_len: usize,
    pub max_map_len: usize,
    pub isa_chain_limit: usize,
    pub max_pending_arguments: usize,
    /// Maximum number of `Line`s a single `Machine::run` call will execute
    /// before yielding control back to the host, bounding a runaway script
    /// without requiring preemptive interruption (§5 "Cancellation &
    /// timeouts").
    pub step_budget_per_run: usize,
}

impl Default for MachineLimits {
    fn default() -> Self {
        MachineLimits {
            max_string_len: limits::DEFAULT_MAX_STRING_LEN,
            max_list_len: limits::DEFAULT_MAX_LIST_LEN,
            max_map_len: limits::DEFAULT_MAX_MAP_LEN,
            isa_chain_limit: limits::ISA_CHAIN_LIMIT,
            max_pending_arguments: limits::MAX_PENDING_ARGUMENTS,
            step_budget_per_run: 100_000,
        }
    }
}

impl MachineLimits {
    /// The subset of these limits `miniscript_core::arithmetic` consults for
    /// string/list/map size caps.
    pub fn size_limits(&self) -> SizeLimits {
        SizeLimits {
            max_string_len: self.max_string_len,
            max_list_len: self.max_list_len,
            max_map_len: self.max_map_len,
        }
    }
}
