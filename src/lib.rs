#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::unused_async)]
#![allow(clippy::implicit_hasher)]
#![allow(clippy::redundant_closure_for_method_calls)]

//! quickgate library — browser remote-access gateway building blocks.
//!
//! - `guacamole` — instruction codec, guacd tunnel client, connection
//!   configuration
//! - `sessions` — live session registry, observers, teardown
//! - `terminal` — native SSH backend, bridge pumps, session recorder
//! - `ws` — WebSocket endpoints and client frame protocol
//! - `routes` — REST API route handlers
//! - `config` — configuration loading

pub mod config;
pub mod guacamole;
pub mod routes;
pub mod sessions;
pub mod terminal;
pub mod util;
pub mod ws;

// Re-export key types at crate root for convenience.
pub use config::Config;
pub use sessions::SessionRegistry;

use std::sync::Arc;
use std::time::Instant;

/// Shared state cloned into every handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub registry: SessionRegistry,
    pub started_at: Instant,
}
