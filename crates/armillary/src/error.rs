//! Error types for Armillary operations.
//!
//! This module provides the main error type [`ArmillaryError`] which wraps
//! kernel failures together with the I/O, JSON and configuration errors met
//! while loading and saving documents.

use std::io;

use thiserror::Error;

use armillary_core::error::KernelError;

/// The main error type for Armillary operations.
#[derive(Debug, Error)]
pub enum ArmillaryError {
    #[error(transparent)]
    Kernel(#[from] KernelError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("round trip of package `{package_id}` changed its CRC from {expected:#010x} to {actual:#010x}")]
    RoundTrip {
        package_id: String,
        expected: u32,
        actual: u32,
    },
}

impl ArmillaryError {
    /// Returns a stable code identifying the error kind.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Kernel(err) => err.code(),
            Self::Io(_) => "armillary::io",
            Self::Json(_) => "armillary::json",
            Self::Config(_) => "armillary::config",
            Self::RoundTrip { .. } => "armillary::round-trip",
        }
    }
}
