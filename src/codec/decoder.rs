//! Wire decoder (§4.3). Transliterated from `examples/original_source/
//! sling/frame/decoder.cc`'s `DecodeFrame`/`DecodeObject` structure: a
//! zero-based reference table of every decoded heap object in emission
//! order, composite objects registered before their children so cyclic
//! graphs resolve, and the proxy replacement-in-place dance for `id`
//! slots bound through LINK.
//!
//! This crate's `Store::update_frame` already preserves a frame's handle
//! across a slot-count change (§8), so the "register a placeholder, decode
//! children, then fill it in" cycle-support trick needs no special-casing
//! here beyond calling `update_frame` — the store does the forwarding.

use std::io::Read;

use anyhow::{anyhow, ensure, Result};

use crate::codec::{read_tagged, read_varint, zigzag_decode, SpecialOp, Tag, STREAM_MARKER};
use crate::handle::Handle;
use crate::heap::gc::{Root, RootHandle};
use crate::heap::Slot;
use crate::store::Store;

/// Resolves base spec §9 Open Question (b): whether decoding a frame whose
/// `id` slot already names a symbol bound to a *real* (non-proxy) frame
/// should still decode and replace it, or discard the incoming content and
/// re-point the reference table at the frame that's already there.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DuplicateFramePolicy {
    AlwaysDecode,
    SkipIfBound,
}

pub struct Decoder<'s> {
    store: &'s mut Store,
    refs: RootHandle,
    policy: DuplicateFramePolicy,
}

impl<'s> Decoder<'s> {
    /// The reference table is a registered GC root for the lifetime of the
    /// decoder (§5 point 2): a decode can span many allocations, and any of
    /// them may trigger a collection, so entries already in `refs` must be
    /// tracked and rewritten like any other live handle rather than held in
    /// a plain `Vec` the collector never sees.
    pub fn new(store: &'s mut Store, policy: DuplicateFramePolicy) -> Self {
        let refs = store.add_root(Root::Vec(Vec::new()));
        Decoder { store, refs, policy }
    }

    fn refs_len(&self) -> usize {
        match &*self.refs.borrow() {
            Root::Vec(v) => v.len(),
            _ => unreachable!("Decoder::refs is always a Root::Vec"),
        }
    }

    fn refs_get(&self, idx: usize) -> Option<Handle> {
        match &*self.refs.borrow() {
            Root::Vec(v) => v.get(idx).copied(),
            _ => unreachable!("Decoder::refs is always a Root::Vec"),
        }
    }

    fn refs_set(&self, idx: usize, h: Handle) {
        match &mut *self.refs.borrow_mut() {
            Root::Vec(v) => v[idx] = h,
            _ => unreachable!("Decoder::refs is always a Root::Vec"),
        }
    }

    /// Decodes one stream, returning the root object's handle. Skips a
    /// leading `STREAM_MARKER` byte if present (§6).
    ///
    /// Decoding writes into `store` via `allocate_frame`/`update_frame`, so a
    /// frozen target is a caller misuse rather than ordinary data the decoder
    /// should just sentinel its way past — this is checked eagerly with a
    /// `Context`-bearing error instead of letting the first write silently
    /// come back `Handle::error()` deep in `decode_frame` (§7 "programming
    /// errors... abort").
    pub fn decode(&mut self, input: &mut impl Read) -> Result<Handle> {
        crate::error::ensure_not_frozen(self.store.is_frozen(), "decode a wire stream into")?;
        let mut peek = [0u8; 1];
        let mut input: Box<dyn Read + '_> = if input.read(&mut peek)? == 1 {
            if peek[0] == STREAM_MARKER {
                Box::new(input)
            } else {
                Box::new(std::io::Cursor::new(peek).chain(input))
            }
        } else {
            return Ok(Handle::nil());
        };
        self.decode_value(&mut input)
    }

    fn register(&mut self, h: Handle) -> usize {
        match &mut *self.refs.borrow_mut() {
            Root::Vec(v) => {
                let idx = v.len();
                v.push(h);
                idx
            }
            _ => unreachable!("Decoder::refs is always a Root::Vec"),
        }
    }

    fn decode_value(&mut self, input: &mut impl Read) -> Result<Handle> {
        let (tag, argument) = read_tagged(input)?;
        match tag {
            Tag::Ref => {
                let idx = argument as usize;
                self.refs_get(idx).ok_or_else(|| anyhow!("decode-error: REF index {idx} out of range"))
            }
            Tag::Integer => {
                let value = zigzag_decode(argument);
                Handle::integer(value).ok_or_else(|| anyhow!("decode-error: integer {value} out of range"))
            }
            Tag::Float => Ok(Handle::from_float_bits(argument as u32)),
            Tag::String => {
                let len = argument as usize;
                let mut bytes = vec![0u8; len];
                input.read_exact(&mut bytes)?;
                let h = self.store.allocate_string(&bytes, Handle::nil());
                self.register(h);
                Ok(h)
            }
            Tag::Symbol => {
                let len = argument as usize;
                let mut bytes = vec![0u8; len];
                input.read_exact(&mut bytes)?;
                let sym = self.store.lookup(&bytes);
                self.register(sym);
                Ok(sym)
            }
            Tag::Link => {
                let len = argument as usize;
                let mut bytes = vec![0u8; len];
                input.read_exact(&mut bytes)?;
                let sym = self.store.lookup(&bytes);
                if self.store.symbol_value(sym).is_nil() {
                    self.store.allocate_frame(&[Slot { name: Handle::id(), value: sym }]);
                }
                self.register(sym);
                Ok(sym)
            }
            Tag::Frame => self.decode_frame(input, argument as usize),
            Tag::Special => self.decode_special(input, argument),
        }
    }

    fn decode_frame(&mut self, input: &mut impl Read, slot_count: usize) -> Result<Handle> {
        let placeholder = self.store.allocate_frame(&[]);
        let ref_index = self.register(placeholder);

        let mut slots = Vec::with_capacity(slot_count);
        for _ in 0..slot_count {
            let name = self.decode_value(input)?;
            let value = self.decode_value(input)?;
            slots.push(Slot { name, value });
        }

        if self.policy == DuplicateFramePolicy::SkipIfBound {
            if let Some(existing) = self.already_bound_to_real_frame(&slots) {
                self.refs_set(ref_index, existing);
                return Ok(existing);
            }
        }

        let frame = self.store.update_frame(placeholder, &slots);
        self.refs_set(ref_index, frame);
        Ok(frame)
    }

    fn already_bound_to_real_frame(&self, slots: &[Slot]) -> Option<Handle> {
        for slot in slots {
            if slot.name.is_id() {
                let bound = self.store.symbol_value(slot.value);
                if !bound.is_nil() && !self.store.is_proxy(bound) {
                    return Some(bound);
                }
            }
        }
        None
    }

    fn decode_special(&mut self, input: &mut impl Read, sub_op: u64) -> Result<Handle> {
        let op = SpecialOp::try_from(sub_op as u8).map_err(|_| anyhow!("decode-error: unknown SPECIAL sub-op {sub_op}"))?;
        match op {
            SpecialOp::Nil => Ok(Handle::nil()),
            SpecialOp::Id => Ok(Handle::id()),
            SpecialOp::Isa => Ok(Handle::isa()),
            SpecialOp::Is => Ok(Handle::is()),
            SpecialOp::Index => {
                let value = read_varint(input)?;
                Handle::index(value as u32).ok_or_else(|| anyhow!("decode-error: index {value} out of range"))
            }
            SpecialOp::Array => {
                let n = read_varint(input)? as usize;
                let mut elements = Vec::with_capacity(n);
                for _ in 0..n {
                    elements.push(self.decode_value(input)?);
                }
                let h = self.store.allocate_array(&elements);
                self.register(h);
                Ok(h)
            }
            SpecialOp::Qstring => {
                let len = read_varint(input)? as usize;
                let mut bytes = vec![0u8; len];
                input.read_exact(&mut bytes)?;
                let qualifier = self.decode_value(input)?;
                let h = self.store.allocate_string(&bytes, qualifier);
                self.register(h);
                Ok(h)
            }
            SpecialOp::Resolve => {
                let replace = read_varint(input)? as usize;
                let slot_count = read_varint(input)? as usize;
                ensure!(replace < self.refs_len(), "decode-error: RESOLVE target {replace} out of range");
                let target = self.refs_get(replace).expect("checked by ensure! above");
                let mut slots = Vec::with_capacity(slot_count);
                for _ in 0..slot_count {
                    let name = self.decode_value(input)?;
                    let value = self.decode_value(input)?;
                    slots.push(Slot { name, value });
                }
                let frame = self.store.update_frame(target, &slots);
                self.refs_set(replace, frame);
                Ok(frame)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::encoder::Encoder;
    use crate::store::{Store, StoreOptions};

    #[test]
    fn decodes_a_plain_frame_with_an_id_slot() {
        let mut store = Store::new(StoreOptions::default());
        let sym = store.lookup(b"Thing");
        let original = store.allocate_frame(&[
            Slot { name: Handle::id(), value: sym },
            Slot { name: Handle::isa(), value: Handle::integer(1).unwrap() },
        ]);
        let mut bytes = Vec::new();
        Encoder::new(&store).encode(&mut bytes, original).unwrap();

        let mut target = Store::new(StoreOptions::default());
        let mut decoder = Decoder::new(&mut target, DuplicateFramePolicy::AlwaysDecode);
        let decoded = decoder.decode(&mut &bytes[..]).unwrap();
        assert_eq!(target.frame_size(decoded), 2);
    }

    #[test]
    fn decoding_into_a_frozen_store_is_rejected() {
        let mut target = Store::new(StoreOptions::default());
        target.freeze();
        let mut decoder = Decoder::new(&mut target, DuplicateFramePolicy::AlwaysDecode);
        assert!(decoder.decode(&mut &b""[..]).is_err());
    }
}
