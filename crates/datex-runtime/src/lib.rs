//! DATEX Runtime - Endpoint orchestration
//!
//! This crate ties the codec, security layer, pointer registry and scope
//! machine together:
//! - Reassembly of multi-block scopes in increment order
//! - Request/response correlation with timeouts
//! - Flood relay and redirection of foreign blocks
//! - Pointer subscriptions and remote execution
//! - One injectable send hook as the transport seam

pub mod config;
pub mod runtime;
pub mod scope;

pub use config::*;
pub use runtime::*;
pub use scope::*;
