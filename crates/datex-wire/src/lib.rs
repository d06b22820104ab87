//! DATEX Wire Protocol - Binary block format
//!
//! This crate implements the wire format for DATEX blocks:
//! - Block header (magic, routing, sender/receivers, signature, session)
//! - Opcode table for the block body
//! - Value encoding into opcode streams
//! - Block splitting for large scopes
//! - A debug decompiler

pub mod block;
pub mod decompiler;
pub mod encoder;
pub mod flags;
pub mod header;
pub mod opcode;
pub mod reader;
pub mod target_codec;

pub use block::*;
pub use decompiler::*;
pub use encoder::*;
pub use flags::*;
pub use header::*;
pub use opcode::*;
pub use reader::*;
pub use target_codec::*;
