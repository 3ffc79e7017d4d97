//! Reverse proxy from browsers into sandboxes.

pub mod forward;
pub mod ownership;
pub mod pages;

pub use forward::{ProxyRequest, ProxyResponse, SandboxProxy};
pub use ownership::resolve_ownership;
