//! Exit codes for the memview CLI.
//! These codes are part of the public contract.

pub const EXIT_SUCCESS: i32 = 0;
pub const EXIT_BAD_INPUT: i32 = 1; // Unknown document, missing or malformed snapshot
pub const EXIT_INTERNAL_ERROR: i32 = 2; // I/O or export failure
