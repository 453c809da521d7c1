//! An embedded relational database runtime built on an SQLite-compatible
//! engine: handle pooling, reversible per-handle configuration, live
//! cross-database migration, and corruption recovery.
//!
//! Callers hand this crate finished SQL text and bound parameters; it never
//! builds or rewrites a query AST, and it is not a network-facing server —
//! see [`Database`] for the facade that composes everything below.

pub mod config;
pub mod database;
pub mod engine;
pub mod error;
pub mod handle;
pub mod migration;
pub mod observability;
pub mod pool;
pub mod repair;
pub mod txn;
pub mod value;

pub use config::{Config as ConfigEntry, ConfigRegistry, Priority};
pub use database::{CheckpointMode, Config, Database};
pub use error::{Error, ErrorKind, Result, Severity};
pub use handle::{HandleBase, HandleCategory};
pub use migration::StepOutcome;
pub use pool::{HandlePool, Recyclable};
pub use value::{Row, Value};
