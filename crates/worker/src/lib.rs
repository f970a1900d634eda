//! Render job worker.
//!
//! Ties the model cache, engine supervisor and output handling together
//! into a per-job pipeline served over a JSON-lines stdin/stdout loop.

pub mod collector;
pub mod diagnostics;
pub mod handler;
pub mod poller;
pub mod runtime;
