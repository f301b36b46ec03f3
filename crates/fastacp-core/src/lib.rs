//! Core types for FastACP.
//!
//! This crate provides the pieces every other FastACP crate leans on:
//! - [`AcpError`] and [`ErrorCode`], the wire-level error model
//! - Logging targets and helper macros over the [`log`] facade
//! - Environment-driven configuration for the engine and paginator
//!
//! # Design Principles
//!
//! - No runtime dependency: this crate is usable from sync and async code
//! - All types support `Send + Sync`
//! - Errors carry the exact code/message/data that travels on the wire

#![forbid(unsafe_code)]

pub mod config;
mod error;
pub mod logging;

pub use config::{LoggingConfig, PaginationConfig, ProtocolConfig};
pub use error::{AcpError, AcpResult, ErrorCode};
