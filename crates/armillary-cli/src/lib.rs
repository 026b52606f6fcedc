//! CLI logic for the Armillary document tool.
//!
//! Loads a portable document, reports the state of its trackable entries and
//! writes the normalized document back out.

pub mod error_adapter;

mod args;
mod config;

pub use args::Args;

use log::{info, warn};

use armillary::{ArmillaryError, Workspace};

/// Run the Armillary CLI application
///
/// The input document is hydrated against the component library, each
/// trackable entry's CRC is logged, and the document is saved to the output
/// path (verifying the round trip when configured).
///
/// # Arguments
///
/// * `args` - Command-line arguments
///
/// # Errors
///
/// Returns `ArmillaryError` for:
/// - File I/O errors
/// - Configuration loading errors
/// - Malformed JSON
/// - Hydration and persistence errors
pub fn run(args: &Args) -> Result<(), ArmillaryError> {
    info!(
        input_path = args.input,
        output_path = args.output;
        "Processing document"
    );

    let app_config = config::load_config(args.config.as_ref())?;

    let mut workspace = Workspace::new(app_config)?;
    let package = workspace.load_file(&args.input)?;

    for entry in workspace.report(&package)? {
        info!(key:% = entry.key, crc:% = format!("{:#010x}", entry.crc), dirty = entry.dirty; "Entry");
    }
    for instance in workspace.stale_instances(&package)? {
        warn!(
            entity_id:% = instance.id(),
            type_name = instance.type_name();
            "Instance is out of sync with its master"
        );
    }

    workspace.save_file(&package, &args.output)?;

    info!(output_file = args.output; "Document written successfully");

    Ok(())
}
