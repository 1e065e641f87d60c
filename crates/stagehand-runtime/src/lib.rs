//! Launch orchestration for the Stagehand starter.
//!
//! A container launch is split across role processes that no longer share
//! memory once they diverge: stage one prepares the shared configuration,
//! the RPC server performs privileged operations from inside the container
//! namespaces, stage two execs the payload, and the master supervises the
//! whole thing. Every role drives the same [`engine::Engine`], selected by
//! name from the JSON payload.

#![allow(unsafe_code)]
#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod engine;
pub mod exit;
pub mod master;
pub mod rpc;
pub mod stage;
