//! # stagehand-common
//!
//! Shared types, error definitions, configuration models, and constants
//! used across the entire Stagehand workspace.
//!
//! This crate is the leaf of the dependency graph. It depends on no other
//! internal crate and holds the primitives every role process agrees on:
//! the error enum, the fixed capacities of the shared configuration block,
//! and the JSON wrapper that carries an engine configuration.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod config;
pub mod constants;
pub mod error;
pub mod types;
