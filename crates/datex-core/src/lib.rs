//! DATEX Core - Fundamental types and primitives
//!
//! This crate defines the types shared by every layer of the substrate:
//! - Identifiers (PointerId, EndpointId, SessionId)
//! - Timestamps relative to the protocol epoch
//! - Targets and the CNF filter algebra used for routing and permissions
//! - The value model and type descriptors
//! - The error taxonomy

pub mod error;
pub mod filter;
pub mod id;
pub mod target;
pub mod time;
pub mod types;
pub mod value;

pub use error::*;
pub use filter::*;
pub use id::*;
pub use target::*;
pub use time::*;
pub use types::*;
pub use value::*;
