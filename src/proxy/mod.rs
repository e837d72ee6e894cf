//! Dynamic Reverse-Proxy Orchestrator (§4.5 C5).
//!
//! This process never terminates TLS or forwards application traffic
//! itself — that is the fronting proxy's job (§1 Non-goals). This module
//! only maintains the dynamic route set and regenerates/reloads the
//! fronting proxy's configuration file.

pub mod orchestrator;

pub use orchestrator::{DynamicRoute, ProxyError, ProxyOrchestrator};
