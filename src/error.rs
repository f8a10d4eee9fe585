//! Shared `anyhow` helpers for the programming-error / I/O boundary (§7).
//!
//! Data errors (out-of-range integer, a write on a frozen store, a bad REF
//! index mid-stream, a failed unification, a lookup of an unbound symbol)
//! are never routed through here — those are sentinel return values
//! (`Handle::error()`, `Handle::nil()`, `-1` node index) as the base spec
//! requires. This module exists for the other half: invariant violations
//! and the wire codec's I/O layer, the same split the teacher keeps between
//! `anyhow::Result` parsing errors and `Option`-returning "value absent"
//! accessors.

use anyhow::{anyhow, Result};

/// Programming-error constructor for GC/heap invariant violations — things
/// that indicate a bug in this crate, not a malformed caller input.
pub fn invariant(message: impl std::fmt::Display) -> anyhow::Error {
    anyhow!("frame store invariant violated: {message}")
}

pub fn ensure_not_frozen(frozen: bool, operation: &str) -> Result<()> {
    anyhow::ensure!(!frozen, "cannot {operation} on a frozen store");
    Ok(())
}
