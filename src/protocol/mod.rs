//! # Protocol Module
//!
//! This file is part of the SCS Transport project.
//!
//! It groups the message-level pieces of the stack:
//! - `message`: the message envelope and its variants
//! - `wire`: how a message becomes a frame payload
//! - `heartbeat` / `keepalive`: ping construction and the idle policy
//! - `dispatcher`: server-side routing of remote invocations
pub mod dispatcher;
pub mod heartbeat;
pub mod keepalive;
pub mod message;
pub mod wire;
