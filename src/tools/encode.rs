//! `frame-tools encode`: reads a textual convenience format JSON file
//! (`super::text::TextValue`) and writes its wire-format encoding.

use std::fs::File;
use std::io::BufWriter;

use anyhow::{Context, Result};

use framestore::codec::encoder::Encoder;
use framestore::store::{Store, StoreOptions};

use super::text::{from_text, TextValue};
use super::Args;

pub fn encode(args: &Args, shallow: bool, output: &std::path::Path) -> Result<()> {
    let text = std::fs::read_to_string(&args.input).with_context(|| format!("reading {}", args.input.display()))?;
    let value: TextValue = serde_json::from_str(&text).with_context(|| format!("parsing {} as the textual convenience format", args.input.display()))?;

    let mut store = Store::new(StoreOptions::default());
    let root = from_text(&mut store, &value)?;

    let mut out = BufWriter::new(File::create(output)?);
    let mut encoder = if shallow { Encoder::shallow(&store) } else { Encoder::new(&store) };
    encoder.encode(&mut out, root)?;
    Ok(())
}
