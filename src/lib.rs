//! Renders the live image of one physical monitor inside a
//! host-provided child window.
//!
//! The crate is built as a DLL exporting three C entry points
//! (`CreateView`, `ChangeScreen`, `SetLogHandler`). Behind that surface
//! sit two capture strategies: desktop duplication on Windows 8+, and,
//! on Windows 7, a cooperative agent injected into the compositor that
//! copies each presented back buffer into a cross-process shared
//! texture which the viewer renders from.

pub mod api;
pub mod cursor;
pub(crate) mod env_config;
pub mod error;
pub mod logging;
pub mod monitor;
pub mod pacing;
mod platform;
pub mod protocol;

pub use error::{ErrorClass, ViewError, ViewResult};
pub use logging::LogHandler;
pub use monitor::MonitorRect;
