//! Database models for courier.
//!
//! These models map directly to the database schema.

pub mod dead_letter;

pub use dead_letter::*;
