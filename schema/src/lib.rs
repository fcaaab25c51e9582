//! Schema definitions for Chaperone
//!
//! This crate contains the shared data structures used by the process
//! supervision engine and its command-line front end. All types here derive
//! `Serialize`/`Deserialize` and implement JSON Schema generation so they can
//! be read from configuration files and emitted as structured events.

pub mod events;
pub mod process;

pub use events::*;
pub use process::*;

#[cfg(test)]
mod json_roundtrip_tests;
