//! `frame-tools`: a small multi-tool CLI binary over the frame store, wire
//! codec and feature-structure unifier. Per spec §6 ("No file formats, no
//! CLI... are mandated by the core; those belong to callers"), this binary
//! is a caller like any other — it exercises the library's public surface,
//! it does not extend it.
//!
//! Dispatcher shape (one `Args`/`Subcommand` over small per-operation
//! modules) grounded on `examples/Vector35-idb-rs/src/tools/tools.rs`.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

mod decode;
mod dump;
mod encode;
mod text;

use decode::decode;
use dump::dump;
use encode::encode;

#[derive(Clone, Debug, Parser)]
struct Args {
    /// Input file: a wire-format stream for `decode`/`dump`, or a textual
    /// convenience format JSON file for `encode`.
    input: PathBuf,

    #[command(subcommand)]
    operation: Operation,
}

#[derive(Clone, Debug, Subcommand)]
enum Operation {
    /// Reads the textual convenience format and writes its wire encoding.
    Encode {
        /// Output path for the wire-format stream.
        output: PathBuf,
        /// Emit in shallow mode (§4.3): nested frames are referenced by
        /// their `id` symbol rather than walked into.
        #[arg(long)]
        shallow: bool,
    },
    /// Reads a wire-format stream and prints the textual convenience
    /// format (JSON, mirroring the wire grammar one-to-one, §6).
    Decode,
    /// Reads a wire-format stream and prints its frame graph as indented
    /// text.
    Dump,
}

fn main() -> Result<()> {
    let args = Args::parse();

    match &args.operation {
        Operation::Encode { output, shallow } => encode(&args, *shallow, output),
        Operation::Decode => decode(&args),
        Operation::Dump => dump(&args),
    }
}
