#![forbid(unsafe_code)]

pub mod addresses;
pub mod backend;
pub mod cancel;
pub mod config;
pub mod error;
pub mod gitdir;
pub mod janitor;
pub mod jitter;
pub mod metrics;
pub mod objects;
pub mod optimizer;
pub mod plan;
pub mod queue;
pub mod repair;
pub mod repofs;
pub mod stats;
pub mod store;
pub mod telemetry;

pub use error::{Error, Transience};
pub type Result<T> = std::result::Result<T, Error>;

// Re-export the identity types at the crate root for convenience.
pub use crate::gitdir::{GitDir, RepoName};
