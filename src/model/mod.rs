//! Model Weight Store
//!
//! The live parameters a worker serves from:
//! - Parameter registry with per-name tensor specs
//! - Validated, all-or-nothing weight loading
//! - Version counter bumped on every load

pub mod store;

pub use store::{InMemoryModel, ModelStats, ParameterStore};
