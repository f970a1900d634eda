//! ComfyUI engine process supervision and REST client.
//!
//! Provides invocation templates with flag fallbacks, a supervisor that
//! launches the engine, detects readiness or an early crash, and tears it
//! down, plus the HTTP wrapper for prompt submission.

pub mod api;
pub mod command;
pub mod logs;
pub mod model_paths;
pub mod supervisor;
