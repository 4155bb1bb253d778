//! Database driver implementations.
//!
//! - [`postgres`]: PostgreSQL source reader and import target
//! - [`memory`]: in-memory database implementing the same traits
//!
//! Each driver implements [`SourceReader`](crate::core::SourceReader) for
//! export and [`ImportTarget`](crate::core::ImportTarget) for import.

pub mod memory;
pub mod postgres;

pub use memory::{MemoryDatabase, MemoryRow, MemoryTarget};
pub use postgres::{PostgresReader, PostgresTarget, SslMode, TlsBuilder};
