//! Error types for kernel operations.
//!
//! Every failure the kernel can detect is raised immediately as a
//! [`KernelError`] carrying the structured context needed to diagnose it:
//! entity id, field name, package id and type name as applicable.

use std::fmt;

use thiserror::Error;

/// A type alias for `Result<T, KernelError>`.
pub type Result<T> = std::result::Result<T, KernelError>;

/// Why a `(package id, type name)` pair could not be resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveFailure {
    /// No package with the requested id is loaded.
    PackageNotLoaded,
    /// The package is loaded but does not define the type.
    TypeNotInPackage,
}

impl fmt::Display for ResolveFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResolveFailure::PackageNotLoaded => write!(f, "package is not loaded"),
            ResolveFailure::TypeNotInPackage => write!(f, "type is not defined in the package"),
        }
    }
}

/// The error type for all kernel operations.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum KernelError {
    /// A constructor rejected its named fields, or a tree edit would break the
    /// single-owner invariant.
    #[error("cannot construct `{class}`{}: {reason}", describe_target(.entity, .field))]
    ConstructionViolation {
        class: String,
        entity: Option<String>,
        field: Option<String>,
        reason: String,
    },

    /// CRC, encode, clone or hydrate met a data shape it does not handle.
    #[error("{operation} does not support {shape}{}", describe_target(.entity, .field))]
    UnsupportedShape {
        operation: &'static str,
        shape: String,
        entity: Option<String>,
        field: Option<String>,
    },

    /// Hydration could not map a `(package id, type name)` pair to a class.
    #[error("cannot resolve type `{type_name}` in package `{package_id}`: {cause}")]
    UnresolvedType {
        package_id: String,
        type_name: String,
        cause: ResolveFailure,
    },

    /// Serialization was attempted on a package that contains code-defined classes.
    #[error("package `{package_id}` contains code-defined classes ({}) and cannot be persisted", .classes.join(", "))]
    NonPersistablePackage {
        package_id: String,
        classes: Vec<String>,
    },

    /// Undo or redo was requested without matching history.
    #[error("history error for entry `{entry_id}`: {reason}")]
    HistoryMisuse { entry_id: String, reason: String },

    /// A package id was registered twice.
    #[error("package `{package_id}` is already registered")]
    DuplicatePackage { package_id: String },
}

fn describe_target(entity: &Option<String>, field: &Option<String>) -> String {
    match (entity, field) {
        (Some(entity), Some(field)) => format!(" (entity `{entity}`, field `{field}`)"),
        (Some(entity), None) => format!(" (entity `{entity}`)"),
        (None, Some(field)) => format!(" (field `{field}`)"),
        (None, None) => String::new(),
    }
}

impl KernelError {
    /// Creates a [`KernelError::ConstructionViolation`] without entity or field context.
    pub fn construction(class: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ConstructionViolation {
            class: class.into(),
            entity: None,
            field: None,
            reason: reason.into(),
        }
    }

    /// Creates a [`KernelError::UnsupportedShape`] without entity or field context.
    pub fn unsupported(operation: &'static str, shape: impl Into<String>) -> Self {
        Self::UnsupportedShape {
            operation,
            shape: shape.into(),
            entity: None,
            field: None,
        }
    }

    /// Creates a [`KernelError::HistoryMisuse`].
    pub fn history(entry_id: impl fmt::Display, reason: impl Into<String>) -> Self {
        Self::HistoryMisuse {
            entry_id: entry_id.to_string(),
            reason: reason.into(),
        }
    }

    /// Attaches an entity id to errors that carry one, unless already set.
    pub fn with_entity(mut self, id: impl fmt::Display) -> Self {
        match &mut self {
            Self::ConstructionViolation { entity, .. } | Self::UnsupportedShape { entity, .. } => {
                entity.get_or_insert_with(|| id.to_string());
            }
            _ => {}
        }
        self
    }

    /// Attaches a field name to errors that carry one, unless already set.
    pub fn with_field(mut self, name: &str) -> Self {
        match &mut self {
            Self::ConstructionViolation { field, .. } | Self::UnsupportedShape { field, .. } => {
                field.get_or_insert_with(|| name.to_string());
            }
            _ => {}
        }
        self
    }

    /// Returns a stable code identifying the error kind.
    pub fn code(&self) -> &'static str {
        match self {
            Self::ConstructionViolation { .. } => "armillary::construction",
            Self::UnsupportedShape { .. } => "armillary::unsupported-shape",
            Self::UnresolvedType { .. } => "armillary::unresolved-type",
            Self::NonPersistablePackage { .. } => "armillary::non-persistable",
            Self::HistoryMisuse { .. } => "armillary::history",
            Self::DuplicatePackage { .. } => "armillary::duplicate-package",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_construction_display_with_context() {
        let err = KernelError::construction("Valve", "unknown field")
            .with_entity("v1")
            .with_field("pressure");

        assert_eq!(
            err.to_string(),
            "cannot construct `Valve` (entity `v1`, field `pressure`): unknown field"
        );
    }

    #[test]
    fn test_context_is_not_overwritten() {
        let err = KernelError::unsupported("encode", "a class reference")
            .with_field("inner")
            .with_field("outer");

        assert_eq!(
            err,
            KernelError::UnsupportedShape {
                operation: "encode",
                shape: "a class reference".to_string(),
                entity: None,
                field: Some("inner".to_string()),
            }
        );
    }

    #[test]
    fn test_unresolved_type_names_both_values() {
        let err = KernelError::UnresolvedType {
            package_id: "pkgA".to_string(),
            type_name: "Valve".to_string(),
            cause: ResolveFailure::PackageNotLoaded,
        };

        let message = err.to_string();
        assert!(message.contains("pkgA"));
        assert!(message.contains("Valve"));
        assert!(message.contains("not loaded"));
    }

    #[test]
    fn test_non_persistable_lists_classes() {
        let err = KernelError::NonPersistablePackage {
            package_id: "components".to_string(),
            classes: vec!["Pump".to_string(), "Valve".to_string()],
        };
        assert!(err.to_string().contains("(Pump, Valve)"));
        assert_eq!(err.code(), "armillary::non-persistable");
    }

    #[test]
    fn test_with_entity_ignored_for_history() {
        let err = KernelError::history("plant", "no history").with_entity("x");
        assert_eq!(err.to_string(), "history error for entry `plant`: no history");
    }
}
