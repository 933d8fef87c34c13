//! HTTP API Module
//!
//! Provides a REST API for node status and readiness.

mod http;

pub use http::{HealthResponse, HttpServer, ReadyResponse};
