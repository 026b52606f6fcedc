//! Error adapter for converting ArmillaryError to miette diagnostics.
//!
//! This module provides the bridge between the library's error type and
//! miette's report rendering used in the CLI.

use std::fmt;

use miette::{Diagnostic as MietteDiagnostic, LabeledSpan};

use armillary::ArmillaryError;
use armillary_core::error::{KernelError, ResolveFailure};

/// Adapter giving an [`ArmillaryError`] a stable diagnostic code and, where
/// one applies, a hint for fixing the document.
pub struct ErrorAdapter<'a>(pub &'a ArmillaryError);

impl fmt::Debug for ErrorAdapter<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.0, f)
    }
}

impl fmt::Display for ErrorAdapter<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl std::error::Error for ErrorAdapter<'_> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        std::error::Error::source(self.0)
    }
}

impl MietteDiagnostic for ErrorAdapter<'_> {
    fn code<'a>(&'a self) -> Option<Box<dyn fmt::Display + 'a>> {
        Some(Box::new(self.0.code()))
    }

    fn help<'a>(&'a self) -> Option<Box<dyn fmt::Display + 'a>> {
        help_for(self.0).map(|h| Box::new(h) as Box<dyn fmt::Display>)
    }

    fn source_code(&self) -> Option<&dyn miette::SourceCode> {
        None
    }

    fn labels(&self) -> Option<Box<dyn Iterator<Item = LabeledSpan> + '_>> {
        None
    }
}

fn help_for(err: &ArmillaryError) -> Option<String> {
    match err {
        ArmillaryError::Kernel(KernelError::UnresolvedType {
            package_id,
            cause: ResolveFailure::PackageNotLoaded,
            ..
        }) => Some(format!(
            "load the document defining package `{package_id}` before this one"
        )),
        ArmillaryError::Kernel(KernelError::UnresolvedType {
            cause: ResolveFailure::TypeNotInPackage,
            ..
        }) => Some("check the `smartType` spelling or add the missing master".to_string()),
        ArmillaryError::Kernel(KernelError::NonPersistablePackage { .. }) => {
            Some("code-defined packages are rebuilt at startup and never saved".to_string())
        }
        ArmillaryError::RoundTrip { .. } => {
            Some("set `document.verify_round_trip = false` to write the document anyway".to_string())
        }
        _ => None,
    }
}

/// A reportable error that can be rendered by miette.
pub type Reportable<'a> = ErrorAdapter<'a>;

/// Convert an [`ArmillaryError`] into the list of errors to render.
pub fn to_reportables(err: &ArmillaryError) -> Vec<Reportable<'_>> {
    vec![ErrorAdapter(err)]
}
