//! `courier-core`: identifiers and errors shared by the delivery pipeline.
//!
//! This crate contains **pure** primitives (no threads, no IO).

pub mod error;
pub mod id;

pub use error::{CoreError, CoreResult};
pub use id::{DestinationKey, DestinationType};
