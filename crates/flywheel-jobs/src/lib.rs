//! Data model and job-control filesystem protocol for the Flywheel model-run
//! server.
//!
//! This crate is deliberately free of async machinery: it defines the types
//! that describe model runs (requests, jobs, resource envelopes) and the
//! on-disk rendezvous protocol that cooperating server instances use to queue,
//! promote, and retire those runs. All state transitions are realized as
//! atomic renames within a shared directory tree; a given control file is only
//! ever mutated by the instance that owns it.

mod error;

pub mod files;
pub mod job;
pub mod request;
pub mod stamp;

pub use error::JobError;
pub use error::Result;
