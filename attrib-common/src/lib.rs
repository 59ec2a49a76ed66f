//! # Attribution Common Library
//!
//! Shared code for the attribution engine:
//! - Record store adapter trait and backends (in-memory, SQLite)
//! - Error and result types
//! - Bootstrap configuration loading
//! - Timestamp utilities

pub mod config;
pub mod error;
pub mod store;
pub mod time;

pub use error::{Error, Result};
pub use store::{RecordStore, ScanPage, TERMINAL_CURSOR};
