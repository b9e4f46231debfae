//! Docent Storage crate - durable session snapshots.
//!
//! All sessions live in one JSON document, rewritten as a unit through a
//! temporary file and an atomic rename.

pub mod store;

pub use store::{SessionStore, STORE_FILE_NAME};
