//! # Attribution Engine
//!
//! Links conversions to the visits that preceded them:
//! - Builds per-signal indexes over raw visit records (resumable, budgeted)
//! - Resolves a conversion through ordered matching tiers, falling back to
//!   geographic correlation
//! - Assembles the journey of touchpoints leading to the conversion
//! - Runs pending and recovery passes over stored conversions

pub mod config;
pub mod context;
pub mod error;
pub mod models;
pub mod services;
pub mod signals;

pub use config::EngineConfig;
pub use context::RunContext;
pub use error::{EngineError, EngineResult};
pub use services::AttributionEngine;
