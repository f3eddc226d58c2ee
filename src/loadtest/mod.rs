//! Load generation and measurement engine.
//!
//! Provides typed TOML configuration, HTTP and WebSocket protocol executors,
//! `${var}` workflows with extraction, response validation, a shared rate
//! limiter, and sharded HdrHistogram-based metrics.

pub mod auth;
pub mod config;
pub mod csv_export;
pub mod display;
pub mod engine;
pub mod error;
pub mod executor;
pub mod html_report;
pub mod http;
pub mod jsonpath;
pub mod metrics;
pub mod rate;
pub mod report;
pub mod summary;
pub mod template;
pub mod validator;
pub mod vu;
pub mod websocket;
pub mod workflow;
