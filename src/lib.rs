//! Per-user sandbox orchestration.
//!
//! Callers are mapped to stable sandbox ids, sandboxes are provisioned on a
//! container runtime (directly or through a privileged broker) and browser
//! traffic is proxied into them.

pub mod api;
pub mod app;
pub mod broker;
pub mod config;
pub mod control;
pub mod proxy;
pub mod runtime;
pub mod sandbox;
pub mod security;
