//! Incremental, fault-tolerant translation of JSON locale files.
//!
//! The pipeline is layered bottom-up:
//!
//! - [`rate_limiter`]: per-provider queues with RPM windows, concurrency
//!   slots and adaptive throttling
//! - [`fallback`]: ordered provider chain with circuit breaking and
//!   performance-based reranking
//! - [`cache`]: LRU response cache with stale-while-revalidate refresh
//! - [`state`]: content hashes of the source locale between runs
//! - [`orchestrator`]: validation, caching and bounded batch concurrency
//! - [`sync`]: end-to-end run over source and target locale files

pub mod cache;
pub mod config;
pub mod error;
pub mod fallback;
pub mod languages;
pub mod locale;
pub mod orchestrator;
pub mod providers;
pub mod rate_limiter;
pub mod retry;
pub mod state;
pub mod stats;
pub mod sync;
pub mod validation;

pub use error::{ErrorKind, ProviderError, SyncError};
pub use fallback::{FallbackChain, FallbackConfig};
pub use orchestrator::{Orchestrator, OrchestratorConfig, TranslationContext, TranslationResult};
pub use providers::{TranslateOptions, TranslationProvider};
pub use rate_limiter::{RateLimiter, RateLimiterConfig};
