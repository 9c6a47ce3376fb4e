//! System configuration
//!
//! Loading (`loader`), the document types (`types`) and validation into the
//! set of entries the system is built from (`validation`).

mod loader;
mod types;
mod validation;

pub use loader::*;
pub use types::*;
pub use validation::*;
