//! `bd-browser` — the seam between the daemon core and the browser.
//!
//! The core consumes browsers through the trait family in [`driver`]:
//! a [`driver::BrowserDriver`] launches a browser, a browser opens
//! contexts, a context opens pages. Two implementations ship:
//!
//! - [`cdp`]: drives a real Chromium over the DevTools protocol.
//! - [`stub`]: a deterministic in-memory driver used by the test suites.

pub mod cdp;
pub mod driver;
pub mod storage;
pub mod stub;

pub use driver::{
    BrowserDriver, BrowserHandle, ConsoleEvent, ConsoleLevel, ContextHandle, ContextOptions,
    LaunchOptions, MockFulfillment, NetworkEvent, PageHandle, RecordVideoOptions, RouteDecider,
    RouteRequest, Viewport, WaitUntil,
};
pub use storage::{validate_storage_state, StorageRejection};
