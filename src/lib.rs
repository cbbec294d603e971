//! Gated onboarding journey engine.
//!
//! Drives per-user, per-stage workflow state through a small state machine,
//! evaluates composable admission gates before stage progression, and records
//! every legally significant action as a hash-stamped, independently
//! verifiable audit entry.

pub mod audit;
pub mod error;
pub mod gates;
pub mod journey;
pub mod registration;
pub mod signature;
pub mod stage;
pub mod time;
pub mod utils;
