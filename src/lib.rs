// ABOUTME: Library crate for changeset-replicator
// ABOUTME: Exposes configuration loading, file helpers and command implementations

pub mod commands;
pub mod config;
pub mod utils;
