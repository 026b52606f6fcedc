//! Configuration types for Armillary documents and history.
//!
//! This module provides configuration structures that control how documents
//! are written and how much undo history is kept. All types implement
//! [`serde::Deserialize`] for loading from external sources.
//!
//! # Overview
//!
//! - [`AppConfig`] - Top-level application configuration.
//! - [`HistoryConfig`] - Controls the undo/redo stack bound per entry.
//! - [`DocumentConfig`] - Controls how portable documents are emitted and checked.
//!
//! # Example
//!
//! ```
//! # use armillary::config::AppConfig;
//! let config = AppConfig::default();
//! assert_eq!(config.history().limit(), 100);
//! assert!(config.document().pretty());
//! ```

use serde::Deserialize;

/// Top-level application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    /// History configuration section.
    #[serde(default)]
    history: HistoryConfig,

    /// Document configuration section.
    #[serde(default)]
    document: DocumentConfig,
}

impl AppConfig {
    /// Creates a new [`AppConfig`] with the specified sections.
    ///
    /// # Arguments
    ///
    /// * `history` - Undo/redo history settings.
    /// * `document` - Portable document settings.
    pub fn new(history: HistoryConfig, document: DocumentConfig) -> Self {
        Self { history, document }
    }

    /// Returns the history configuration.
    pub fn history(&self) -> &HistoryConfig {
        &self.history
    }

    /// Returns the document configuration.
    pub fn document(&self) -> &DocumentConfig {
        &self.document
    }
}

/// Undo/redo history configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HistoryConfig {
    /// Maximum number of `(undo, redo)` records kept per trackable entry.
    #[serde(default = "HistoryConfig::default_limit")]
    limit: usize,
}

impl HistoryConfig {
    /// Creates a new [`HistoryConfig`]. A limit of zero is raised to one.
    pub fn new(limit: usize) -> Self {
        Self {
            limit: limit.max(1),
        }
    }

    /// Returns the per-entry history bound.
    pub fn limit(&self) -> usize {
        self.limit.max(1)
    }

    fn default_limit() -> usize {
        100
    }
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            limit: Self::default_limit(),
        }
    }
}

/// Portable document configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DocumentConfig {
    /// Pretty-print emitted documents.
    #[serde(default = "default_true")]
    pretty: bool,

    /// Re-decode emitted documents and compare CRCs before writing.
    #[serde(default = "default_true")]
    verify_round_trip: bool,
}

impl DocumentConfig {
    /// Creates a new [`DocumentConfig`].
    pub fn new(pretty: bool, verify_round_trip: bool) -> Self {
        Self {
            pretty,
            verify_round_trip,
        }
    }

    pub fn pretty(&self) -> bool {
        self.pretty
    }

    pub fn verify_round_trip(&self) -> bool {
        self.verify_round_trip
    }
}

impl Default for DocumentConfig {
    fn default() -> Self {
        Self::new(true, true)
    }
}

fn default_true() -> bool {
    true
}
