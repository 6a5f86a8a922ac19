//! Shared types, adapter traits, and core utilities for Boardsync.
//!
//! This crate contains the foundational types that are shared between the
//! store core, the session layer, and all gateway adapter implementations.

pub mod error;
pub mod gateway_adapter;
pub mod model;
pub mod prelude;
pub mod types;
pub mod utils;

// vim: ts=4
