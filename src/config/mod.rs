//! # Configuration Module
//!
//! This module centralizes tidepool's configuration constants. Constants are
//! grouped by their functional area and interdependencies are documented and
//! enforced through compile-time assertions where possible.
//!
//! ## Module Organization
//!
//! - [`constants`]: All numeric configuration values with dependency notes

pub mod constants;
pub use constants::*;
