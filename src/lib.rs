//! GreenLedger Backend Library
//!
//! Exposes the aggregation engine, API surface, and domain models for use
//! by the binaries and integration tests.

pub mod api;
pub mod models;
pub mod tracker;
