//! HTTP API Module
//!
//! Provides a REST API for record reads, coordinated writes and recovery.

mod http;

pub use http::{ApiError, AppState, HttpServer, RecoveryGate};
