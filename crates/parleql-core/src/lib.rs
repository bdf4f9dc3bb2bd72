//! # ParleQL Core
//!
//! Query orchestration pipeline for ParleQL: free-form business
//! questions in, safe SQL against Oracle / Postgres / Doris out.
//!
//! ## Architecture
//!
//! ```text
//!  HTTP boundary (parleql-server)
//!        ↓ SubmitParams
//!   Orchestrator ──────────────── durable, resumable state machine
//!    ↓        ↓         ↓
//!  Router   Skills   Synthesizer ── LLM provider (trait)
//!    ↓        ↓         ↓
//!        Validator ──────────────── injection / scope / cost / RLS / HITL
//!             ↓
//!       Executor facade ─────────── pools, breaker, result cache
//!             ↓
//!        DB drivers (trait)
//! ```
//!
//! Every stage transition is checkpointed, published on the per-ticket
//! event bus, and traced. Collaborators (LLM, KV store, checkpointer,
//! cost estimator, RLS, drivers) are traits wired at the composition
//! root ([`core::Core`]); tests substitute in-memory fakes.
//!
//! ## Example
//!
//! ```ignore
//! use parleql_core::config::CoreConfig;
//! use parleql_core::core::Core;
//! use parleql_core::dialect::DatabaseKind;
//! use parleql_core::orchestrator::SubmitParams;
//!
//! # async fn example(llm: std::sync::Arc<dyn parleql_core::llm::LlmProvider>) {
//! let core = Core::builder(CoreConfig::default()).llm(llm).build();
//! // core.executor.register_backend(DatabaseKind::Postgres, driver, None);
//! let outcome = core
//!     .orchestrator()
//!     .submit(SubmitParams {
//!         user: "alice".into(),
//!         role: "analyst".into(),
//!         session_id: "s1".into(),
//!         ip: String::new(),
//!         user_agent: String::new(),
//!         database: DatabaseKind::Postgres,
//!         auto_approve: Some(true),
//!         text: "total sales by region for 2024".into(),
//!         history: Vec::new(),
//!     })
//!     .await;
//! # let _ = outcome;
//! # }
//! ```

#![forbid(unsafe_code)]
// Missing docs allowed for internal items - public API is fully documented
#![allow(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_sign_loss)]

pub mod analyze;
pub mod approval;
pub mod checkpoint;
pub mod config;
pub mod core;
pub mod cost;
pub mod dialect;
pub mod driver;
pub mod error;
pub mod events;
pub mod executor;
pub mod kv;
pub mod llm;
pub mod orchestrator;
pub mod rls;
pub mod router;
pub mod schema;
pub mod sentiment;
pub mod skills;
pub mod synth;
pub mod types;
pub mod validate;

pub use config::CoreConfig;
pub use core::Core;
pub use dialect::DatabaseKind;
pub use error::{ParleQLError, Result};

/// Version of the core library.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
