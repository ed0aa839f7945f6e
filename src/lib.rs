//! Tickstream Library
//!
//! Market-data distribution core: stream gateway, ingestion worker,
//! multi-broker price fusion and a loss-limit circuit breaker

pub mod config;
pub mod decoder;
pub mod error;
pub mod fusion;
pub mod gateway;
pub mod indicators;
pub mod logging;
pub mod risk;
pub mod sched;
pub mod store;
pub mod types;
pub mod upstream;
pub mod worker;
