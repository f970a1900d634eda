//! Pure domain logic for the render worker.
//!
//! Nothing in this crate spawns processes or talks to the network:
//! configuration, manifest parsing, model inventory snapshots, workflow
//! graph reconciliation, and the job wire types all live here so the
//! other crates can share them and test them without I/O fixtures.

pub mod config;
pub mod error;
pub mod images;
pub mod inventory;
pub mod job;
pub mod manifest;
pub mod workflow;
