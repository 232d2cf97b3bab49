//! Database layer for skynet
//!
//! This module provides the storage layer using SQLite with:
//! - Schema migrations
//! - Repository functions for sessions, messages and cursors
//! - The notification delivery ledger tables

pub mod repo;
pub mod schema;

pub use repo::{Database, SessionFilter, SourceFileRecord};
