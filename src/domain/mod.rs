//! Core domain types and logic.

pub mod config;
pub mod engine;
pub mod error;
pub mod indicator;
pub mod limits;
pub mod metrics;
pub mod ohlcv;
pub mod outcome;
pub mod sandbox;
pub mod script;
pub mod simulator;
pub mod validator;
