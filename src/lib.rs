//! cachet: a static content server with a gzip response cache,
//! conditional GET support and a multi-process worker pool.
//!
//! ```text
//! connection ─▶ dispatcher ─(round-robin, fd handoff)─▶ worker
//!                                                        │
//!                     store ◀─ handler ─▶ negotiate ─▶ cache
//! ```

pub mod cache;
pub mod compression;
pub mod config;
pub mod console;
pub mod dispatcher;
pub mod error;
pub mod handler;
pub mod handoff;
pub mod http;
pub mod listing;
pub mod logging;
pub mod mime;
pub mod negotiate;
pub mod store;
pub mod worker;

pub use cache::{CacheEntry, CacheOptions, CacheStats, ObjectCache, SharedCache};
pub use config::{Args, Config};
pub use error::{Error, Result};
pub use handler::RequestHandler;
pub use negotiate::{Decision, RequestValidators};
pub use store::ContentStore;
