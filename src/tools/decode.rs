//! `frame-tools decode`: the inverse of `encode` — reads a wire-format file
//! and prints it back out as the textual convenience format JSON.

use std::fs::File;
use std::io::BufReader;

use anyhow::Result;

use framestore::codec::decoder::{Decoder, DuplicateFramePolicy};
use framestore::store::{Store, StoreOptions};

use super::text::to_text;
use super::Args;

pub fn decode(args: &Args) -> Result<()> {
    let mut input = BufReader::new(File::open(&args.input)?);
    let mut store = Store::new(StoreOptions::default());
    let mut decoder = Decoder::new(&mut store, DuplicateFramePolicy::AlwaysDecode);
    let root = decoder.decode(&mut input)?;

    let value = to_text(&store, root);
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}
