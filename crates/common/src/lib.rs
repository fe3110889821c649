//! Common utilities and types shared across relay components.

#![warn(clippy::pedantic)]

/// Module for identifier newtypes
pub mod types;

/// Module for observability configuration and tracing setup
pub mod config;

/// Module for secret types that prevent accidental logging
pub mod secret;
