//! bundle-service - coalescing build cache for front-end bundles
//!
//! Equivalent requests share one installation and one compilation. Slow
//! builds are handed back to the client as redirects so no request waits
//! longer than a fixed budget.

pub mod bundle;
pub mod cache;
pub mod cli;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod identity;
pub mod install;
pub mod request;
pub mod ui;

pub use error::{ServiceError, ServiceResult};
