//! Wire encoder (§4.3), the dual of `decoder.rs`. Walks a frame graph,
//! assigning each heap object (frame, string, symbol, array) a
//! reference-table index the first time it is emitted and a `REF` record
//! on every subsequent occurrence, so shared structure and cycles survive
//! the round trip.

use std::collections::HashMap;
use std::io::Write;

use anyhow::{ensure, Result};

use crate::codec::{write_tagged, write_varint, zigzag_encode, SpecialOp, Tag};
use crate::handle::Handle;
use crate::heap::Kind;
use crate::store::Store;

/// Whether `encode` walks into a handle's own slot values (`Full`, the
/// default) or only encodes identified top-level objects by id and
/// substitutes `LINK` for everything nested inside them (`Shallow`, §4.3
/// "A shallow mode emits only top-level objects by id...").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodeMode {
    Full,
    Shallow,
}

pub struct Encoder<'s> {
    store: &'s Store,
    seen: HashMap<Handle, u32>,
    mode: EncodeMode,
    depth: u32,
}

impl<'s> Encoder<'s> {
    pub fn new(store: &'s Store) -> Self {
        Encoder { store, seen: HashMap::new(), mode: EncodeMode::Full, depth: 0 }
    }

    pub fn shallow(store: &'s Store) -> Self {
        Encoder { store, seen: HashMap::new(), mode: EncodeMode::Shallow, depth: 0 }
    }

    pub fn encode(&mut self, out: &mut impl Write, root: Handle) -> Result<()> {
        self.emit(out, root)
    }

    fn next_index(&self) -> u32 {
        self.seen.len() as u32
    }

    fn emit(&mut self, out: &mut impl Write, h: Handle) -> Result<()> {
        if h.is_nil() {
            return write_special(out, SpecialOp::Nil);
        }
        if h.is_id() {
            return write_special(out, SpecialOp::Id);
        }
        if h.is_isa() {
            return write_special(out, SpecialOp::Isa);
        }
        if h.is_is() {
            return write_special(out, SpecialOp::Is);
        }
        ensure!(!h.is_error(), "cannot encode an error handle");
        if let Some(v) = h.as_int() {
            return write_tagged(out, Tag::Integer, zigzag_encode(v));
        }
        if h.as_float().is_some() {
            return write_tagged(out, Tag::Float, (h.raw() >> 2) as u64);
        }
        if let Some(idx) = h.as_index() {
            write_special(out, SpecialOp::Index)?;
            return write_varint(out, idx as u64);
        }
        ensure!(h.is_ref(), "unencodable handle kind");

        if let Some(&idx) = self.seen.get(&h) {
            return write_tagged(out, Tag::Ref, idx as u64);
        }

        let kind = self.store.kind_of(h).ok_or_else(|| anyhow::anyhow!("handle has no heap kind"))?;
        match kind {
            Kind::Symbol => self.emit_symbol(out, h),
            Kind::String => self.emit_string(out, h),
            Kind::Array => self.emit_array(out, h),
            Kind::Frame => self.emit_frame(out, h),
        }
    }

    fn emit_symbol(&mut self, out: &mut impl Write, h: Handle) -> Result<()> {
        self.seen.insert(h, self.next_index());
        let name = self.store.symbol_name(h);
        let bytes = self.store.string_bytes(name);
        write_tagged(out, Tag::Link, bytes.len() as u64)?;
        out.write_all(bytes)?;
        Ok(())
    }

    fn emit_string(&mut self, out: &mut impl Write, h: Handle) -> Result<()> {
        let bytes = self.store.string_bytes(h).to_vec();
        let qualifier = self.store.string_qualifier(h);
        if qualifier.is_nil() {
            write_tagged(out, Tag::String, bytes.len() as u64)?;
            out.write_all(&bytes)?;
        } else {
            write_special(out, SpecialOp::Qstring)?;
            write_varint(out, bytes.len() as u64)?;
            out.write_all(&bytes)?;
            self.emit(out, qualifier)?;
        }
        // Registered after the qualifier so reference-table indices match
        // the decoder's post-order registration of a QSTRING's own handle.
        self.seen.insert(h, self.next_index());
        Ok(())
    }

    fn emit_array(&mut self, out: &mut impl Write, h: Handle) -> Result<()> {
        let elements: Vec<Handle> = (0..self.store.array_len(h)).map(|i| self.store.array_element(h, i)).collect();
        write_special(out, SpecialOp::Array)?;
        write_varint(out, elements.len() as u64)?;
        for e in elements {
            self.emit(out, e)?;
        }
        self.seen.insert(h, self.next_index());
        Ok(())
    }

    fn emit_frame(&mut self, out: &mut impl Write, h: Handle) -> Result<()> {
        self.seen.insert(h, self.next_index());
        let mut slots = self.store.frame_slots(h);
        slots.sort_by_key(|s| if s.name.is_id() { 0 } else { 1 });

        write_tagged(out, Tag::Frame, slots.len() as u64)?;

        self.depth += 1;
        let shallow_nested = self.mode == EncodeMode::Shallow && self.depth > 1;
        for slot in &slots {
            self.emit(out, slot.name)?;
            if shallow_nested && self.store.kind_of(slot.value) == Some(Kind::Frame) {
                // Shallow mode: nested frame values are referenced by their
                // id symbol (LINK) rather than walked into.
                let nested_id = self.store.frame_slots(slot.value).into_iter().find(|s| s.name.is_id()).map(|s| s.value);
                if let Some(id) = nested_id {
                    self.emit(out, id)?;
                    continue;
                }
            }
            self.emit(out, slot.value)?;
        }
        self.depth -= 1;
        Ok(())
    }
}

fn write_special(out: &mut impl Write, op: SpecialOp) -> Result<()> {
    write_tagged(out, Tag::Special, op as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoreOptions;

    #[test]
    fn encodes_a_simple_frame_without_panicking() {
        use crate::heap::Slot;

        let mut store = Store::new(StoreOptions::default());
        let sym = store.lookup(b"Thing");
        let frame = store.allocate_frame(&[
            Slot { name: Handle::id(), value: sym },
            Slot { name: Handle::isa(), value: Handle::integer(1).unwrap() },
        ]);
        let mut bytes = Vec::new();
        Encoder::new(&store).encode(&mut bytes, frame).unwrap();
        assert!(!bytes.is_empty());
    }
}
