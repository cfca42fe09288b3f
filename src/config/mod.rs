//! Configuration loading and schema.

pub mod loader;
pub mod schema;
