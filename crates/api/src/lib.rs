//! HTTP surface of the job manager: configuration, routing and wiring.

pub mod app;
pub mod config;
pub mod middleware;
