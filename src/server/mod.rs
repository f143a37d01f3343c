//! HTTP front end for the proxy.
//!
//! This module provides:
//! - Configuration types and file loading (`config`)
//! - The axum router (`routes`): `POST /v1/chat/completions`,
//!   `POST /v1/completions`, `GET /metrics`, `GET /stats`, `GET /health`

pub mod config;
mod routes;

pub use routes::{AppState, router};
