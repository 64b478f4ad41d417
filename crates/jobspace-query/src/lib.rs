//! Query layer for jobspace: filter evaluation and schema detection.
//!
//! Both halves work on flattened views of parameter documents:
//!
//! - `filter`: a small MongoDB-flavored expression language
//!   (`$and`/`$or`/`$not`, comparison operators, operator-suffix
//!   shorthand) evaluated against a document with dotted or nested
//!   key-path resolution
//! - `schema`: key-path → observed-value-set accumulation over a job
//!   subset, with constant-key exclusion and structural diffing

pub mod filter;
pub mod schema;

pub use filter::{Filter, FilterError};
pub use schema::{flatten, KeyPath, ProjectSchema, TypedValue, ValueType};
