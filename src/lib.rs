#![forbid(unsafe_code)]
//! A SLING-style frame store: a tagged-handle heap of frames, strings,
//! symbols and arrays, with a two-layer frozen-global + writable-local
//! inheritance model, a compact binary wire codec, and a typed
//! feature-structure unifier for schema compilation. See `SPEC_FULL.md`.

pub mod codec;
pub mod error;
pub mod handle;
pub mod heap;
pub mod object;
pub mod store;
pub mod unify;

#[cfg(test)]
mod test;

pub use handle::Handle;
pub use object::{ArrayRef, FrameRef, Object, StringRef, SymbolRef};
pub use store::{Builder, NameTable, Store, StoreOptions};
