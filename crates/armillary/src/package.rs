//! Package containers and two-phase hydration.
//!
//! A [`PackageContainer`] is backed by a root entity of the kernel `Package`
//! class whose single `entries` field holds the package's top-level entities
//! and, for code-defined libraries, its real classes. Construction walks the
//! entries once and builds two catalogs:
//!
//! - entries by id (every top-level entity)
//! - classes by type name (real classes and top-level pseudo-class masters)
//!
//! A package holding real classes is never persistable; saving it fails up
//! front through [`PackageContainer::ensure_persistable`].
//!
//! # Hydration
//!
//! Instances in a document may name a master defined by the same document,
//! so a single decode pass cannot resolve them. [`PackageContainer::from_portable_form`]
//! decodes in two phases:
//!
//! 1. Every node flagged as a master is decoded on its own, innermost first,
//!    and recorded by id. Masters waiting on another master are retried until
//!    no more progress is made.
//! 2. The whole document is decoded with a resolver that serves the recorded
//!    masters as templates, and every master node is replaced by its recorded
//!    entity so instance back-references point into the final tree.

use std::{cell::RefCell, collections::HashMap, rc::Rc};

use indexmap::IndexMap;
use log::{debug, info, trace, warn};
use serde_json::{Map, Value as JsonValue};

use armillary_core::{
    class::{ClassReference, RealClass},
    entity::{Entity, EntityRole},
    error::{KernelError, ResolveFailure, Result},
    identifier::Id,
    portable::{ClassResolver, Decoder, IS_PSEUDO_CLASS_MASTER, SMART_PKG, SMART_TYPE},
    value::{FieldMap, Value},
};

/// Package id owning the `Package` class itself.
pub const KERNEL_PACKAGE_ID: &str = "kernel";
/// Type name of package root entities.
pub const PACKAGE_TYPE: &str = "Package";
/// Field of the package root holding the entry tree.
pub const ENTRIES_FIELD: &str = "entries";

/// The class of package root entities.
pub fn package_class() -> Result<ClassReference> {
    let class = RealClass::new(PACKAGE_TYPE)
        .with_required(ENTRIES_FIELD)
        .with_role(EntityRole::Package)
        .trackable();
    ClassReference::real(Rc::new(class), Id::new(KERNEL_PACKAGE_ID))
}

#[derive(Debug, Default)]
struct Catalog {
    entries: IndexMap<Id, Entity>,
    classes: IndexMap<String, ClassReference>,
    code_classes: Vec<String>,
}

impl Catalog {
    fn build(root: &Entity) -> Result<Self> {
        let mut catalog = Self::default();
        if let Some(entries) = root.field(ENTRIES_FIELD) {
            catalog.visit(&entries, root.id())?;
        }
        Ok(catalog)
    }

    fn visit(&mut self, value: &Value, package_id: Id) -> Result<()> {
        match value {
            Value::Entity(entity) => self.add_entity(entity, package_id),
            Value::Class(class) => self.add_class(class.clone(), package_id),
            Value::Array(items) => items.iter().try_for_each(|item| self.visit(item, package_id)),
            Value::Map(map) => map.values().try_for_each(|item| self.visit(item, package_id)),
            _ => Ok(()),
        }
    }

    fn add_entity(&mut self, entity: &Entity, package_id: Id) -> Result<()> {
        let id = entity.id();
        if self.entries.contains_key(&id) {
            return Err(KernelError::construction(PACKAGE_TYPE, format!("duplicate entry id `{id}`"))
                .with_entity(package_id)
                .with_field(ENTRIES_FIELD));
        }
        entity.set_top_level(true);
        if entity.is_pseudo_class_master() {
            self.add_class(ClassReference::template(entity.clone(), package_id)?, package_id)?;
        }
        self.entries.insert(id, entity.clone());
        Ok(())
    }

    fn add_class(&mut self, class: ClassReference, package_id: Id) -> Result<()> {
        let type_name = class.type_name();
        if self.classes.contains_key(&type_name) {
            return Err(KernelError::construction(
                PACKAGE_TYPE,
                format!("duplicate type name `{type_name}`"),
            )
            .with_entity(package_id)
            .with_field(ENTRIES_FIELD));
        }
        if !class.is_template() {
            self.code_classes.push(type_name.clone());
        }
        self.classes.insert(type_name, class);
        Ok(())
    }
}

/// A named collection of top-level entities and classes.
#[derive(Debug)]
pub struct PackageContainer {
    root: Entity,
    catalog: RefCell<Catalog>,
}

impl PackageContainer {
    /// Creates a package from its entries.
    ///
    /// Each entry is an entity (a top-level entry) or a class reference (a
    /// code-defined class, which makes the package non-persistable).
    ///
    /// # Errors
    ///
    /// Returns [`KernelError::ConstructionViolation`] for duplicate entry ids,
    /// duplicate type names or entries that already belong to another tree.
    pub fn new(id: &str, entries: Vec<Value>) -> Result<Self> {
        let mut fields = FieldMap::new();
        fields.insert("id".to_string(), Value::from(id));
        fields.insert(ENTRIES_FIELD.to_string(), Value::Array(entries));
        let root = package_class()?.create_smart_object(fields)?;
        Self::from_root(root)
    }

    fn from_root(root: Entity) -> Result<Self> {
        if !root.is_package() {
            return Err(KernelError::unsupported(
                "hydrate",
                format!("a `{}` node as the document root", root.type_name()),
            )
            .with_entity(root.id()));
        }
        let catalog = Catalog::build(&root)?;
        debug!(
            package_id:% = root.id(),
            entries = catalog.entries.len(),
            classes = catalog.classes.len();
            "Built package catalogs"
        );
        let package = Self {
            root,
            catalog: RefCell::new(catalog),
        };
        package.reset_baselines()?;
        Ok(package)
    }

    /// Reconstructs a package from its portable document.
    ///
    /// Types are resolved against the document's own masters first and then
    /// through `resolver`.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError::UnresolvedType`] naming the package id and type
    /// name that could not be resolved, or any error raised while decoding.
    pub fn from_portable_form(document: &JsonValue, resolver: &dyn ClassResolver) -> Result<Self> {
        Self::hydrate(document, resolver, None)
    }

    /// Like [`PackageContainer::from_portable_form`], consulting `external`
    /// after the document's own masters and before `resolver`.
    pub fn from_portable_form_with(
        document: &JsonValue,
        resolver: &dyn ClassResolver,
        external: &dyn ClassResolver,
    ) -> Result<Self> {
        Self::hydrate(document, resolver, Some(external))
    }

    fn hydrate(
        document: &JsonValue,
        resolver: &dyn ClassResolver,
        external: Option<&dyn ClassResolver>,
    ) -> Result<Self> {
        let package_id = document_package_id(document)?;
        info!(package_id:%; "Hydrating package");

        let masters = hydrate_masters(document, package_id, resolver, external)?;
        debug!(package_id:%, masters = masters.len(); "Phase 1 complete");

        let local = LocalResolver {
            package_id,
            masters: &masters,
            fallback: external,
        };
        let root = Decoder::new(resolver)
            .with_external(&local)
            .with_hydrated(&masters)
            .decode_entity(document)?;
        debug!(package_id:%; "Phase 2 complete");

        let package = Self::from_root(root)?;
        for stale in package.stale_instances()? {
            warn!(package_id:%, entity:% = stale.id(); "Instance is out of sync with its master");
        }
        Ok(package)
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn id(&self) -> Id {
        self.root.id()
    }

    pub fn name(&self) -> String {
        self.root.name()
    }

    /// The root entity backing this package.
    pub fn root(&self) -> &Entity {
        &self.root
    }

    /// Looks up a top-level entry by id.
    pub fn entry(&self, id: Id) -> Option<Entity> {
        self.catalog.borrow().entries.get(&id).cloned()
    }

    /// Top-level entries, in document order.
    pub fn entries(&self) -> Vec<Entity> {
        self.catalog.borrow().entries.values().cloned().collect()
    }

    /// Alias of [`PackageContainer::entries`] matching the catalog's name.
    pub fn top_level_entities(&self) -> Vec<Entity> {
        self.entries()
    }

    /// The package root and every trackable top-level entry.
    pub fn trackable_entries(&self) -> Vec<Entity> {
        std::iter::once(self.root.clone())
            .chain(self.entries().into_iter().filter(Entity::is_trackable))
            .collect()
    }

    /// Looks up a class (real or template) defined by this package.
    pub fn class_reference(&self, type_name: &str) -> Option<ClassReference> {
        self.catalog.borrow().classes.get(type_name).cloned()
    }

    /// Type names of every class defined by this package.
    pub fn class_names(&self) -> Vec<String> {
        self.catalog.borrow().classes.keys().cloned().collect()
    }

    /// Finds any entity of the package tree by id.
    pub fn find_entity(&self, id: Id) -> Option<Entity> {
        self.root.find_descendant(id)
    }

    /// `true` once a code-defined class was cataloged.
    pub fn contains_code(&self) -> bool {
        !self.catalog.borrow().code_classes.is_empty()
    }

    /// Instances anywhere in the package whose master changed since they were
    /// created.
    pub fn stale_instances(&self) -> Result<Vec<Entity>> {
        let mut stale = Vec::new();
        let mut pending = vec![self.root.clone()];
        while let Some(entity) = pending.pop() {
            if entity.is_out_of_sync()? {
                stale.push(entity.clone());
            }
            pending.extend(entity.children());
        }
        Ok(stale)
    }

    /// Rebuilds the catalogs after the entry tree was edited.
    pub fn refresh(&self) -> Result<()> {
        let catalog = Catalog::build(&self.root)?;
        *self.catalog.borrow_mut() = catalog;
        trace!(package_id:% = self.id(); "Refreshed package catalogs");
        Ok(())
    }

    // =========================================================================
    // Persistence
    // =========================================================================

    /// Fails if the package holds code-defined classes.
    pub fn ensure_persistable(&self) -> Result<()> {
        let catalog = self.catalog.borrow();
        if catalog.code_classes.is_empty() {
            return Ok(());
        }
        Err(KernelError::NonPersistablePackage {
            package_id: self.id().to_string(),
            classes: catalog.code_classes.clone(),
        })
    }

    /// Encodes the package without touching its baseline.
    pub fn to_portable_form(&self) -> Result<JsonValue> {
        self.ensure_persistable()?;
        self.root.to_portable_form()
    }

    /// Encodes the package and records the current state as saved.
    pub fn save(&self) -> Result<JsonValue> {
        let document = self.to_portable_form()?;
        let crc = self.reset_baselines()?;
        info!(package_id:% = self.id(), crc; "Saved package");
        Ok(document)
    }

    /// Records the current state of the root and every trackable entry as
    /// saved. Returns the root CRC.
    fn reset_baselines(&self) -> Result<u32> {
        for entry in self.entries().into_iter().filter(Entity::is_trackable) {
            entry.reset_baseline()?;
        }
        self.root.reset_baseline()
    }

    /// `true` when the package changed since it was built, loaded or saved.
    pub fn is_dirty(&self) -> Result<bool> {
        self.root.is_dirty()
    }
}

/// Resolves templates from masters hydrated out of the current document and
/// the kernel `Package` class, then defers to an optional external resolver.
struct LocalResolver<'a> {
    package_id: Id,
    masters: &'a HashMap<Id, Entity>,
    fallback: Option<&'a dyn ClassResolver>,
}

impl ClassResolver for LocalResolver<'_> {
    fn resolve(&self, package_id: Id, type_name: &str) -> Result<ClassReference> {
        if package_id == KERNEL_PACKAGE_ID && type_name == PACKAGE_TYPE {
            return package_class();
        }
        if package_id == self.package_id {
            if let Some(master) = self.masters.get(&Id::new(type_name)) {
                return ClassReference::template(master.clone(), package_id);
            }
        }
        match self.fallback {
            Some(fallback) => fallback.resolve(package_id, type_name),
            None => Err(KernelError::UnresolvedType {
                package_id: package_id.to_string(),
                type_name: type_name.to_string(),
                cause: if package_id == self.package_id {
                    ResolveFailure::TypeNotInPackage
                } else {
                    ResolveFailure::PackageNotLoaded
                },
            }),
        }
    }
}

fn document_package_id(document: &JsonValue) -> Result<Id> {
    let object = document.as_object().ok_or_else(|| {
        KernelError::unsupported("hydrate", "a package document that is not an object")
    })?;
    let tag = |key: &str| object.get(key).and_then(JsonValue::as_str);
    if tag(SMART_TYPE) != Some(PACKAGE_TYPE) || tag(SMART_PKG) != Some(KERNEL_PACKAGE_ID) {
        return Err(KernelError::unsupported(
            "hydrate",
            format!("a document root not tagged `{KERNEL_PACKAGE_ID}/{PACKAGE_TYPE}`"),
        ));
    }
    match tag("id") {
        Some(id) if !id.is_empty() => Ok(Id::new(id)),
        _ => Err(KernelError::construction(PACKAGE_TYPE, "a package requires a non-empty id")
            .with_field("id")),
    }
}

/// Collects master nodes below `node`, innermost first.
fn collect_master_nodes<'d>(node: &'d JsonValue, found: &mut Vec<&'d Map<String, JsonValue>>) {
    match node {
        JsonValue::Array(items) => items.iter().for_each(|item| collect_master_nodes(item, found)),
        JsonValue::Object(object) => {
            object.values().for_each(|item| collect_master_nodes(item, found));
            if object.get(IS_PSEUDO_CLASS_MASTER) == Some(&JsonValue::Bool(true)) {
                found.push(object);
            }
        }
        _ => {}
    }
}

fn hydrate_masters(
    document: &JsonValue,
    package_id: Id,
    resolver: &dyn ClassResolver,
    external: Option<&dyn ClassResolver>,
) -> Result<HashMap<Id, Entity>> {
    let mut pending = Vec::new();
    collect_master_nodes(document, &mut pending);

    let mut masters = HashMap::new();
    while !pending.is_empty() {
        let mut deferred = Vec::new();
        let mut last_error = None;
        for node in pending.iter().copied() {
            let decoded = {
                let local = LocalResolver {
                    package_id,
                    masters: &masters,
                    fallback: external,
                };
                Decoder::new(resolver)
                    .with_external(&local)
                    .with_hydrated(&masters)
                    .decode_entity(&JsonValue::Object(node.clone()))
            };
            match decoded {
                Ok(master) => {
                    trace!(package_id:%, master:% = master.id(); "Hydrated master");
                    masters.insert(master.id(), master);
                }
                Err(err @ KernelError::UnresolvedType { .. }) => {
                    deferred.push(node);
                    last_error = Some(err);
                }
                Err(err) => return Err(err),
            }
        }
        if deferred.len() == pending.len() {
            if let Some(err) = last_error {
                return Err(err);
            }
        }
        pending = deferred;
    }
    Ok(masters)
}
