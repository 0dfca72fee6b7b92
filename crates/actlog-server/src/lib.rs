//! actlog server library - the ingest service, hook adapter and one-shot
//! commands behind the `actlog` binary.
//!
//! Separated from main.rs to enable integration testing.

pub mod commands;
pub mod config;
pub mod hook;
pub mod logging;
pub mod service;
