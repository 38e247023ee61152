//! Connection managers and the call layer built on them.
pub mod client;
pub mod daemon;
pub mod messenger;
pub mod proxy;
