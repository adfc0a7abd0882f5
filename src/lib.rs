//! # annocache
//!
//! Annotation scanning and caching for Java class files.
//!
//! ## Architecture
//!
//! - **container**: classpath containers (directories, archives, nested archives) and the provider that reads them
//! - **identity**: container fingerprints deciding whether a stored index is still valid
//! - **classfile**: structural class-file decoder producing [`record::ClassRecord`]s
//! - **index**: per-container table of decoded records
//! - **codec**: framed on-disk form of an index
//! - **store**: LMDB, directory and in-memory stores with atomic replace
//! - **manager**: load-or-rebuild per container with single-flight rebuilds
//! - **view**: module views merging containers with first-wins shadowing and hierarchy closures
//! - **query**: annotation, assignability and package queries over a view
//! - **engine**: facade driving the manager on a worker pool
//! - **events**: observation hooks for cache traffic and queries

pub mod classfile;
pub mod cli;
pub mod codec;
pub mod config;
pub mod container;
pub mod engine;
pub mod error;
pub mod events;
pub mod identity;
pub mod index;
pub mod manager;
pub mod query;
pub mod record;
pub mod scan;
pub mod store;
pub mod view;

pub use container::{ContainerLocation, ContainerSpec, ScanPolicy};
pub use engine::AnnotationEngine;
pub use error::{ScanError, ScanResult};
pub use view::ModuleView;
