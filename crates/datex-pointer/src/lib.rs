//! DATEX Pointer Registry - Distributed mutable references
//!
//! This crate implements the pointer side of the substrate:
//! - Pointer model and observable container access
//! - Registry arena with generation-checked handles
//! - Labels and external pointer sources
//! - Mutation propagation with update exclusion
//! - Subscriber-driven garbage collection
//! - Update batching and compilation to update programs

pub mod pointer;
pub mod registry;
pub mod scheduler;
pub mod source;
pub mod update;

pub use pointer::*;
pub use registry::*;
pub use scheduler::*;
pub use source::*;
pub use update::*;
