//! Application-level error surface shared by the binary and HTTP handlers.

pub mod error;
