//! HTTP server.
//!
//! - [`api`]: Request/response types and route handlers

pub mod api;
