//! Orchard - detachable sessions and bounded delegation for coding agents

pub mod adapter;
pub mod cancel;
pub mod commands;
pub mod config;
pub mod delegation;
pub mod engine;
pub mod error;
pub mod paths;
pub mod prompt;
pub mod push;
pub mod recorder;
pub mod registry;
pub mod session;
pub mod store;
pub mod subprocess;
pub mod telemetry;
pub mod worktree;
