//! Repository layer for database access.
//!
//! Repositories abstract all database interactions behind async traits so the
//! engine can be exercised against in-memory implementations.

pub mod dead_letter;

pub use dead_letter::*;
