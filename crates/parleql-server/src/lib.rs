//! HTTP and SSE surface for the ParleQL gateway.
//!
//! This crate owns the nine query endpoints, the SSE stream, error →
//! status-code mapping, and server assembly. All pipeline behavior
//! lives in `parleql-core`; the handlers here translate between HTTP
//! shapes and the orchestrator's types.

#![forbid(unsafe_code)]
#![allow(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::uninlined_format_args)]

pub mod config;
pub mod error;
pub mod extractors;
pub mod logging;
pub mod routes;
pub mod state;

pub use config::ServerConfig;
pub use routes::router;
pub use state::AppState;
