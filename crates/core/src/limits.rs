//! Size and recursion caps shared by the value model, the evaluator, and the
//! machine. Centralized here so a host can see (and in `MachineLimits`,
//! override) every numeric invariant the specification names in one place.

/// Default cap on a `String` value's length, in UTF-8 code units (~16 Mi).
pub const DEFAULT_MAX_STRING_LEN: usize = 16 * 1024 * 1024;

/// Default cap on a `List` value's element count.
pub const DEFAULT_MAX_LIST_LEN: usize = 16 * 1024 * 1024;

/// Default cap on a `Map` value's entry count.
pub const DEFAULT_MAX_MAP_LEN: usize = 16 * 1024 * 1024;

/// Maximum number of `__isa` links walked before a prototype lookup fails
/// with a key error, guarding against (and not detecting) reference cycles.
pub const ISA_CHAIN_LIMIT: usize = 1000;

/// Recursion depth at which structural equality/hash give up and return an
/// "inconclusive" result rather than looping forever on cyclic structures.
pub const EQUALITY_RECURSION_LIMIT: usize = 16;

/// Default recursion depth `to_ms_string`/`code_form` descend into nested
/// lists/maps before giving up on a reference cycle (§4.1 "configurable
/// recursion depth", §9 "must not crash printing").
pub const PRINT_RECURSION_LIMIT: usize = 16;

/// Maximum number of arguments that may be staged for a single call.
pub const MAX_PENDING_ARGUMENTS: usize = 255;

/// Reserved key on a `Map` designating its prototype parent.
pub const ISA_KEY: &str = "__isa";
