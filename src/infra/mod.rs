//! Infrastructure adapters and runtime bootstrap.

pub mod auth;
pub mod error;
pub mod http;
pub mod origin;
pub mod telemetry;
pub mod transient;
