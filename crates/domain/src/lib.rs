//! `bd-domain` — shared types for the browserd daemon.
//!
//! Everything the other crates agree on lives here: the error type, the
//! wire response envelope, configuration, and structured trace events.

pub mod config;
pub mod error;
pub mod response;
pub mod trace;

pub use error::{Error, Result};
pub use response::{Response, Status};
