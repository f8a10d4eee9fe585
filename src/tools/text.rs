//! The textual convenience format (spec §6: "a convenience, not the source
//! of truth... grammar mirrors the wire format one-to-one"). `TextValue` is
//! a `serde_json`-printable tree with one variant per wire `Tag`/`SpecialOp`
//! (`src/codec.rs`), so a JSON file reads as a direct transliteration of the
//! bytes `Encoder`/`Decoder` would produce, not a generic struct dump.
//!
//! This lives under `src/tools/` rather than the library, same as the base
//! spec's own framing: the textual format is explicitly a caller concern,
//! not part of the core contract.

use std::collections::HashMap;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

use framestore::handle::Handle;
use framestore::heap::{Kind, Slot};
use framestore::store::Store;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "tag", rename_all = "snake_case")]
pub enum TextValue {
    Nil,
    Id,
    Isa,
    Is,
    Ref(u32),
    Int(i32),
    Float(f32),
    Index(u32),
    Symbol(String),
    String { text: String, qualifier: Option<Box<TextValue>> },
    Array(Vec<TextValue>),
    Frame(Vec<(TextValue, TextValue)>),
}

/// Converts `root` and everything reachable from it into a `TextValue` tree,
/// assigning each heap object a ref-table index the first time it's visited
/// (mirroring `Encoder`'s `seen` table) so shared structure and cycles round
/// trip through `from_text`.
pub fn to_text(store: &Store, root: Handle) -> TextValue {
    let mut seen: HashMap<Handle, u32> = HashMap::new();
    emit(store, root, &mut seen)
}

fn emit(store: &Store, h: Handle, seen: &mut HashMap<Handle, u32>) -> TextValue {
    if h.is_nil() {
        return TextValue::Nil;
    }
    if h.is_id() {
        return TextValue::Id;
    }
    if h.is_isa() {
        return TextValue::Isa;
    }
    if h.is_is() {
        return TextValue::Is;
    }
    if let Some(v) = h.as_int() {
        return TextValue::Int(v);
    }
    if let Some(v) = h.as_float() {
        return TextValue::Float(v);
    }
    if let Some(idx) = h.as_index() {
        return TextValue::Index(idx);
    }
    if let Some(&idx) = seen.get(&h) {
        return TextValue::Ref(idx);
    }
    let next_index = seen.len() as u32;
    match store.kind_of(h) {
        Some(Kind::Symbol) => {
            seen.insert(h, next_index);
            TextValue::Symbol(store.symbol_name_text(h))
        }
        Some(Kind::String) => {
            let text = String::from_utf8_lossy(store.string_bytes(h)).into_owned();
            let qualifier = store.string_qualifier(h);
            let qualifier = if qualifier.is_nil() { None } else { Some(Box::new(emit(store, qualifier, seen))) };
            seen.insert(h, next_index);
            TextValue::String { text, qualifier }
        }
        Some(Kind::Array) => {
            let elements: Vec<TextValue> = (0..store.array_len(h)).map(|i| emit(store, store.array_element(h, i), seen)).collect();
            seen.insert(h, next_index);
            TextValue::Array(elements)
        }
        Some(Kind::Frame) | None => {
            seen.insert(h, next_index);
            let slots: Vec<(TextValue, TextValue)> =
                store.frame_slots(h).iter().map(|s| (emit(store, s.name, seen), emit(store, s.value, seen))).collect();
            TextValue::Frame(slots)
        }
    }
}

/// Builds `value` into `store`, returning the root handle. The inverse of
/// `to_text`: `Ref` entries resolve against a table of handles registered in
/// the same order `emit` assigned them, and `Frame` placeholders are
/// registered before their slots are decoded so cyclic input round-trips.
pub fn from_text(store: &mut Store, value: &TextValue) -> Result<Handle> {
    let mut refs: Vec<Handle> = Vec::new();
    build(store, value, &mut refs)
}

fn build(store: &mut Store, value: &TextValue, refs: &mut Vec<Handle>) -> Result<Handle> {
    match value {
        TextValue::Nil => Ok(Handle::nil()),
        TextValue::Id => Ok(Handle::id()),
        TextValue::Isa => Ok(Handle::isa()),
        TextValue::Is => Ok(Handle::is()),
        TextValue::Ref(idx) => refs.get(*idx as usize).copied().ok_or_else(|| anyhow!("text-format error: ref {idx} out of range")),
        TextValue::Int(v) => Handle::integer(*v).ok_or_else(|| anyhow!("text-format error: integer {v} out of range")),
        TextValue::Float(v) => Ok(Handle::float(*v)),
        TextValue::Index(v) => Handle::index(*v).ok_or_else(|| anyhow!("text-format error: index {v} out of range")),
        TextValue::Symbol(name) => {
            let h = store.lookup(name.as_bytes());
            refs.push(h);
            Ok(h)
        }
        TextValue::String { text, qualifier } => {
            let qualifier = match qualifier {
                Some(q) => build(store, q, refs)?,
                None => Handle::nil(),
            };
            let h = store.allocate_string(text.as_bytes(), qualifier);
            refs.push(h);
            Ok(h)
        }
        TextValue::Array(elements) => {
            let mut built = Vec::with_capacity(elements.len());
            for e in elements {
                built.push(build(store, e, refs)?);
            }
            let h = store.allocate_array(&built);
            refs.push(h);
            Ok(h)
        }
        TextValue::Frame(slots) => {
            let placeholder = store.allocate_frame(&[]);
            refs.push(placeholder);
            let mut built = Vec::with_capacity(slots.len());
            for (name, value) in slots {
                let name = build(store, name, refs)?;
                let value = build(store, value, refs)?;
                built.push(Slot { name, value });
            }
            Ok(store.update_frame(placeholder, &built))
        }
    }
}
