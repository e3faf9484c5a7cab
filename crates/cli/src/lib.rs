//! hvconsole CLI
//!
//! Operator tooling for the console relay: credential key management,
//! node registration and credential storage.

pub mod commands;
pub mod output;
