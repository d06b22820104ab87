//! DATEX VM - Resumable scope machine
//!
//! This crate executes opcode streams:
//! - Instruction decoding with short-read detection
//! - Frame stack for brackets and subscopes
//! - Operators, casts and property access
//! - Closures and first-class suspensions
//! - A call stack driving nested executions
//! - `decode` for complete value streams

pub mod context;
pub mod decode;
pub mod execution;
pub mod instruction;
pub mod machine;
pub mod ops;

pub use context::*;
pub use decode::*;
pub use execution::*;
pub use instruction::*;
pub use machine::*;
pub use ops::*;
