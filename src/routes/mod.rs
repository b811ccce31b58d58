//! HTTP route handlers.
//!
//! Each sub-module corresponds to an API endpoint group: liveness probe,
//! quick-session lifecycle, and the file-management surface.

pub mod health;
pub mod session;
pub mod storage;
