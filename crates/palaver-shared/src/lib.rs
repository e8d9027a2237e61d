//! # palaver-shared
//!
//! Domain types, broadcast protocol payloads, tuning constants, and the
//! error taxonomy shared by every Palaver crate.

pub mod constants;
pub mod models;
pub mod protocol;
pub mod types;

mod error;

pub use error::{ChatError, Result};
pub use models::*;
