//! deskchat shared types and utilities
//!
//! This crate contains the enums, id wrappers, errors and database helpers
//! shared by the chat engine, the API server and the worker.

pub mod db;
pub mod error;
pub mod types;

pub use db::*;
pub use error::*;
pub use types::*;
