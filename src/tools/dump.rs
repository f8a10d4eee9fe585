//! `frame-tools dump`: decodes a wire-format file and prints its frame
//! graph as indented text (spec §6's textual convenience format, in its
//! "print a store's frames" incarnation — a direct, no-tags-round-trip
//! rendering rather than `encode`/`decode`'s lossless JSON tree).
//!
//! Grounded on the teacher's `dump_functions`/`dump_segments` style: read
//! one input, walk it, `println!` an indented tree, nothing returned but a
//! `Result<()>` for I/O errors.

use std::collections::HashSet;
use std::fs::File;
use std::io::BufReader;

use anyhow::Result;

use framestore::codec::decoder::{Decoder, DuplicateFramePolicy};
use framestore::handle::Handle;
use framestore::heap::Kind;
use framestore::store::{Store, StoreOptions};

use super::Args;

pub fn dump(args: &Args) -> Result<()> {
    let mut input = BufReader::new(File::open(&args.input)?);
    let mut store = Store::new(StoreOptions::default());
    let mut decoder = Decoder::new(&mut store, DuplicateFramePolicy::AlwaysDecode);
    let root = decoder.decode(&mut input)?;

    let mut seen = HashSet::new();
    print_value(&store, root, 0, &mut seen);
    Ok(())
}

fn print_value(store: &Store, h: Handle, depth: usize, seen: &mut HashSet<Handle>) {
    let pad = "  ".repeat(depth);
    if h.is_nil() {
        println!("{pad}nil");
        return;
    }
    if h.is_id() {
        println!("{pad}id:");
        return;
    }
    if h.is_isa() {
        println!("{pad}isa:");
        return;
    }
    if h.is_is() {
        println!("{pad}is:");
        return;
    }
    if let Some(v) = h.as_int() {
        println!("{pad}{v}");
        return;
    }
    if let Some(v) = h.as_float() {
        println!("{pad}{v}");
        return;
    }
    if let Some(idx) = h.as_index() {
        println!("{pad}#{idx}");
        return;
    }
    match store.kind_of(h) {
        Some(Kind::Symbol) => {
            println!("{pad}{}", store.symbol_name_text(h));
        }
        Some(Kind::String) => {
            let text = String::from_utf8_lossy(store.string_bytes(h));
            println!("{pad}\"{text}\"");
        }
        Some(Kind::Array) => {
            println!("{pad}[");
            for i in 0..store.array_len(h) {
                print_value(store, store.array_element(h, i), depth + 1, seen);
            }
            println!("{pad}]");
        }
        Some(Kind::Frame) | None => {
            if !seen.insert(h) {
                println!("{pad}{{ ...already printed... }}");
                return;
            }
            println!("{pad}{{");
            for slot in store.frame_slots(h) {
                print_value(store, slot.name, depth + 1, seen);
                print_value(store, slot.value, depth + 1, seen);
            }
            println!("{pad}}}");
        }
    }
}
