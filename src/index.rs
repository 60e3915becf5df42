//! Index lifecycle: segments, flush contexts, consolidation and the writer.
//!
//! This module owns the on-disk side of the engine:
//! - [`meta`]: segment and index metadata
//! - [`file_refs`]: reference-counted file lifecycle
//! - [`segment_writer`]: the in-RAM accumulator for one segment
//! - [`segment_reader`]: immutable segment readers
//! - [`readers`]: the per-segment reader cache
//! - [`flush`]: the flush-context ring
//! - [`merge`]: the merge writer used by consolidation and import
//! - [`policy`]: consolidation policies
//! - [`writer`]: the public [`writer::IndexWriter`]

pub mod file_refs;
pub mod flush;
pub mod merge;
pub mod meta;
pub mod policy;
pub mod readers;
pub mod segment_reader;
pub mod segment_writer;
pub mod writer;
