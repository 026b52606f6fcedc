//! Armillary - persistence, hydration and undo/redo for component diagrams.
//!
//! Packages of diagram entities are loaded from portable JSON documents,
//! edited through a change manager that keeps per-entry undo history, and
//! written back as normalized documents.

pub mod changes;
pub mod config;
pub mod library;
pub mod package;
pub mod registry;

mod error;

pub use armillary_core::{class, entity, fields, identifier, portable, propagation, value};

pub use error::ArmillaryError;

use std::{fs, path::Path, rc::Rc};

use log::{debug, info, trace};

use armillary_core::{entity::Entity, identifier::Id};

use changes::ChangeManager;
use config::AppConfig;
use package::PackageContainer;
use registry::ClassRegistry;

/// CRC and sync state of one trackable entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryReport {
    /// History key of the entry.
    pub key: Id,
    /// Current CRC of the entry.
    pub crc: u32,
    /// `true` when the entry changed since it was loaded or saved.
    pub dirty: bool,
}

/// Composition root owning the registry and the change manager.
///
/// The component library is registered on creation.
///
/// # Examples
///
/// ```rust
/// use armillary::{Workspace, config::AppConfig};
///
/// let mut workspace = Workspace::new(AppConfig::default()).unwrap();
/// let package = workspace
///     .load_str(r#"{"smartType": "Package", "smartPkg": "kernel", "id": "plant", "entries": []}"#)
///     .unwrap();
///
/// let document = workspace.render(&package).unwrap();
/// assert!(document.contains("\"plant\""));
/// ```
#[derive(Debug)]
pub struct Workspace {
    config: AppConfig,
    registry: ClassRegistry,
    changes: ChangeManager,
}

impl Workspace {
    /// Create a workspace with the given configuration.
    ///
    /// # Arguments
    ///
    /// * `config` - History and document settings.
    pub fn new(config: AppConfig) -> Result<Self, ArmillaryError> {
        let mut registry = ClassRegistry::new();
        registry.register(library::components_package()?)?;
        let changes = ChangeManager::new(config.history());
        Ok(Self {
            config,
            registry,
            changes,
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn registry(&self) -> &ClassRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut ClassRegistry {
        &mut self.registry
    }

    pub fn changes(&self) -> &ChangeManager {
        &self.changes
    }

    /// Hydrate a package from document text and register it.
    ///
    /// # Errors
    ///
    /// Returns an error if the text is not JSON, if hydration fails, or if a
    /// package with the same id is already registered.
    pub fn load_str(&mut self, source: &str) -> Result<Rc<PackageContainer>, ArmillaryError> {
        let document: serde_json::Value = serde_json::from_str(source)?;
        trace!(document:?; "Parsed document");
        let package = PackageContainer::from_portable_form(&document, &self.registry)?;
        Ok(self.registry.register(package)?)
    }

    /// Read a document from disk, hydrate it and register it.
    pub fn load_file(&mut self, path: impl AsRef<Path>) -> Result<Rc<PackageContainer>, ArmillaryError> {
        let path = path.as_ref();
        info!(path:% = path.display(); "Loading document");
        let source = fs::read_to_string(path)?;
        self.load_str(&source)
    }

    /// Save a package and return its document text.
    ///
    /// With `document.verify_round_trip` enabled the emitted document is
    /// hydrated again and its CRC compared with the package's.
    pub fn render(&self, package: &PackageContainer) -> Result<String, ArmillaryError> {
        let document = package.save()?;
        self.changes.mark_saved(package.root())?;

        if self.config.document().verify_round_trip() {
            let expected = package.root().compute_crc()?;
            let reloaded = PackageContainer::from_portable_form(&document, &self.registry)?;
            let actual = reloaded.root().compute_crc()?;
            if actual != expected {
                return Err(ArmillaryError::RoundTrip {
                    package_id: package.id().to_string(),
                    expected,
                    actual,
                });
            }
            debug!(package_id:% = package.id(), crc = actual; "Verified round trip");
        }

        let text = if self.config.document().pretty() {
            serde_json::to_string_pretty(&document)?
        } else {
            serde_json::to_string(&document)?
        };
        Ok(text)
    }

    /// Save a package to a file.
    pub fn save_file(
        &self,
        package: &PackageContainer,
        path: impl AsRef<Path>,
    ) -> Result<(), ArmillaryError> {
        let path = path.as_ref();
        let text = self.render(package)?;
        fs::write(path, text)?;
        info!(path:% = path.display(), package_id:% = package.id(); "Wrote document");
        Ok(())
    }

    /// CRC and dirty state of the package root and each trackable entry.
    pub fn report(&self, package: &PackageContainer) -> Result<Vec<EntryReport>, ArmillaryError> {
        package
            .trackable_entries()
            .into_iter()
            .filter_map(|entry| entry.tracking_key().map(|key| (key, entry)))
            .map(|(key, entry)| -> Result<EntryReport, ArmillaryError> {
                Ok(EntryReport {
                    key,
                    crc: entry.compute_crc()?,
                    dirty: entry.is_dirty()?,
                })
            })
            .collect()
    }

    /// Instances in the package whose master changed since they were created.
    pub fn stale_instances(&self, package: &PackageContainer) -> Result<Vec<Entity>, ArmillaryError> {
        Ok(package.stale_instances()?)
    }
}
