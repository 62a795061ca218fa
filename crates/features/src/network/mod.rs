//! Network features: capture, mocking, HAR export.

pub mod capture;
pub mod har;
pub mod mocking;
