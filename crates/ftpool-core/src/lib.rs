//! Connection configuration for the ftpool connection pool.
//!
//! A [`ConnectionConfig`] is built once through [`ConnectionConfigBuilder`],
//! validated at construction, and never mutated afterwards. The pool, the
//! connection manager and the health manager all share it behind an `Arc`.

pub mod config;
pub mod error;
pub mod file;

pub use config::*;
pub use error::ConfigError;
pub use file::{FileConfig, parse_duration};
