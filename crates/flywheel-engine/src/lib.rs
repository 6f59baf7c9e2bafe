//! Run catalog, scheduler, and compute-fleet engine for the Flywheel
//! model-run server.
//!
//! The engine owns every side effect of scheduling: it scans the shared
//! rendezvous tree defined by `flywheel-jobs`, elects a leader among
//! cooperating instances, places MPI jobs across compute hosts, launches and
//! supervises model processes, and records run outcomes in the model
//! databases.
//!
//! All of that state lives inside one actor task; [`spawn_catalog`] starts it
//! and returns a cheap [`Catalog`] handle for clients.

pub mod catalog;
pub mod config;
pub mod db;
pub mod diskuse;
pub mod fleet;
pub mod launch;
pub mod models;
pub mod placement;
pub mod runlog;
pub mod scheduler;
pub mod state;
pub mod template;

pub use catalog::Catalog;
pub use catalog::actor::spawn_catalog;
pub use config::Config;
