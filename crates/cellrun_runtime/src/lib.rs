//! In-process evaluation engine runtime for `cellrun`.
//!
//! The [`engine`] module loads engine modules once per process, starts
//! instances on dedicated runtime threads, and serializes evaluation calls
//! against each instance.

pub mod engine;
mod error;

pub use error::{RuntimeError, RuntimeResult};
