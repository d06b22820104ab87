//! DATEX Test Harness - simulated networks and end-to-end scenarios
//!
//! This crate provides:
//! - A simulated multi-endpoint network with loss, duplication and reordering
//! - Scenario builders for meshed and chained topologies
//! - Compiled programs shared by tests and benches
//! - End-to-end integration tests

pub mod integration;
pub mod network;
pub mod programs;

pub use integration::*;
pub use network::*;
pub use programs::*;
