//! Analysis core of a Blu-ray audio muxer front end.
//!
//! ## Technical Overview
//!
//! Elementary streams of three codec families are parsed at the bit level,
//! validated against BDAV application constraints and turned into an external
//! remux script describing how the downstream muxer should assemble PES
//! packets:
//!
//! - **Dolby AC-3 / Enhanced AC-3** sync frames, including the EC3 type A
//!   extension (Dolby Atmos) carried in additional BSI.
//! - **Dolby TrueHD (MLP)** access units with major/minor sync, substream
//!   directories, restart headers, Huffman-coded block data and the
//!   EXTRA_DATA trailer.
//! - **DTS** Core substream frames and Extension Substreams carrying XBR,
//!   LBR and XLL coding components, with DTS-HD container support.
//!
//! ## Script Generation
//!
//! Every access unit becomes one PES record in the output script, built from
//! *cells*: byte ranges copied from the source file or synthesized literal
//! blocks (rewritten Extension Substream headers, re-sliced XLL payload).
//!
//! ## DTS-XLL Peak Bit-Rate Smoothing
//!
//! Lossless XLL frames of variable size are re-sliced across access units in
//! a two-pass process so that every smoothed frame fits the 240 KiB PBR
//! buffer. The first pass records per-frame sizes, the planner redistributes
//! bytes from last frame to first, and the second pass rewrites Extension
//! Substream headers and emits replacement cells realizing the new slicing.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use bdamux::dts::{DtsContext, DtsOptions};
//! use bdamux::script::ScriptWriter;
//!
//! let data = std::fs::read("stream.dtshd")?;
//! let mut script = ScriptWriter::new(Vec::new());
//! let ctx = DtsContext::new(&data, &mut script, DtsOptions::default())?;
//! ctx.process()?;
//! # Ok::<(), anyhow::Error>(())
//! ```

/// AC-3 and Enhanced AC-3 bitstream parsing, the TrueHD interleave driver.
pub mod ac3;

/// Access-unit assembly from copy and replacement cells.
pub mod frame;

/// Dolby TrueHD (MLP) access unit parsing.
pub mod mlp;

/// DTS Core, Extension Substream and XLL parsing, PBR smoothing, the DTS
/// driver loop.
pub mod dts;

/// Remux script records consumed by the downstream PES/TS muxer.
pub mod script;

/// Bit-level I/O, CRC validation and error types.
pub mod utils;
