//! Shared domain types for Faultline: records, frames, LLM message types,
//! the common error enum, and configuration.
//!
//! Everything here is plain data — no I/O, no async. The stores, providers,
//! and the gateway all speak these types.

pub mod chat;
pub mod config;
pub mod error;
pub mod frame;
pub mod job;
pub mod session;
pub mod turn;

pub use error::{Error, Result};
