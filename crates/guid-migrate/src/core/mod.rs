//! Core abstractions shared by the exporter, the importer and the drivers.
//!
//! - [`schema`]: table descriptors (columns, identity, foreign keys)
//! - [`value`]: typed SQL values and their portable JSON form
//! - [`traits`]: [`SourceReader`], [`ImportTarget`] and [`ProgressSink`]
//! - [`identifier`]: identifier validation and quoting for dynamic SQL

pub mod identifier;
pub mod schema;
pub mod traits;
pub mod value;

pub use schema::{Column, ColumnType, ForeignKey, TableDescriptor, TableDomain};
pub use traits::{
    IdentityKey, ImportTarget, NoProgress, ProgressSink, SelfReferenceUpdate, SourceBatch,
    SourceReader, SourceReference, SourceRow, StagedRow, DEFAULT_BATCH_SIZE,
};
pub use value::SqlValue;
