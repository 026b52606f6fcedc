//! The class registry: every loaded package, keyed by package id.
//!
//! The registry is an explicit service owned by whoever composes the
//! application. It resolves `(package id, type name)` tags for the decoder and
//! locates entities by id for history closures.

use std::{collections::HashMap, rc::Rc};

use log::{debug, info};

use armillary_core::{
    class::ClassReference,
    entity::Entity,
    error::{KernelError, ResolveFailure, Result},
    identifier::Id,
    portable::ClassResolver,
};

use crate::package::PackageContainer;

/// Loaded packages by id.
#[derive(Debug, Default)]
pub struct ClassRegistry {
    packages: HashMap<Id, Rc<PackageContainer>>,
}

impl ClassRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a package.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError::DuplicatePackage`] if a package with the same id
    /// is already registered. The registered package is left untouched.
    pub fn register(&mut self, package: PackageContainer) -> Result<Rc<PackageContainer>> {
        let id = package.id();
        if self.packages.contains_key(&id) {
            return Err(KernelError::DuplicatePackage {
                package_id: id.to_string(),
            });
        }
        let package = Rc::new(package);
        self.packages.insert(id, Rc::clone(&package));
        info!(package_id:% = id, classes = package.class_names().len(); "Registered package");
        Ok(package)
    }

    /// Removes a package, returning it if it was registered.
    pub fn unregister(&mut self, id: Id) -> Option<Rc<PackageContainer>> {
        let removed = self.packages.remove(&id);
        if removed.is_some() {
            debug!(package_id:% = id; "Unregistered package");
        }
        removed
    }

    pub fn package(&self, id: Id) -> Option<Rc<PackageContainer>> {
        self.packages.get(&id).cloned()
    }

    /// Registered packages, ordered by id.
    pub fn packages(&self) -> Vec<Rc<PackageContainer>> {
        let mut packages: Vec<_> = self.packages.values().cloned().collect();
        packages.sort_by_key(|package| package.id().to_string());
        packages
    }

    /// Finds any entity of a registered package by id.
    pub fn find_entity(&self, package_id: Id, entity_id: Id) -> Option<Entity> {
        self.packages.get(&package_id)?.find_entity(entity_id)
    }
}

impl ClassResolver for ClassRegistry {
    fn resolve(&self, package_id: Id, type_name: &str) -> Result<ClassReference> {
        let unresolved = |cause| KernelError::UnresolvedType {
            package_id: package_id.to_string(),
            type_name: type_name.to_string(),
            cause,
        };
        let package = self
            .packages
            .get(&package_id)
            .ok_or_else(|| unresolved(ResolveFailure::PackageNotLoaded))?;
        package
            .class_reference(type_name)
            .ok_or_else(|| unresolved(ResolveFailure::TypeNotInPackage))
    }
}

#[cfg(test)]
mod tests {
    use std::rc::Rc;

    use armillary_core::{class::RealClass, fields, value::Value};

    use super::*;

    fn library() -> PackageContainer {
        let valve = ClassReference::real(Rc::new(RealClass::new("Valve").with_field("x", 0)), Id::new("lib")).unwrap();
        PackageContainer::new("lib", vec![Value::from(valve)]).unwrap()
    }

    #[test]
    fn test_register_and_resolve() {
        let mut registry = ClassRegistry::new();
        registry.register(library()).unwrap();

        let class = registry.resolve(Id::new("lib"), "Valve").unwrap();
        assert_eq!(class.full_type_name(), "lib/Valve");
        assert_eq!(registry.packages().len(), 1);
    }

    #[test]
    fn test_duplicate_register_keeps_original() {
        let mut registry = ClassRegistry::new();
        let first = registry.register(library()).unwrap();

        let err = registry.register(library()).unwrap_err();
        assert_eq!(
            err,
            KernelError::DuplicatePackage {
                package_id: "lib".to_string()
            }
        );
        assert!(Rc::ptr_eq(&registry.package(Id::new("lib")).unwrap(), &first));
    }

    #[test]
    fn test_distinct_resolve_failures() {
        let mut registry = ClassRegistry::new();
        registry.register(library()).unwrap();

        let missing_package = registry.resolve(Id::new("nope"), "Valve").unwrap_err();
        assert!(matches!(
            missing_package,
            KernelError::UnresolvedType {
                cause: ResolveFailure::PackageNotLoaded,
                ..
            }
        ));

        let missing_type = registry.resolve(Id::new("lib"), "Pump").unwrap_err();
        assert!(matches!(
            missing_type,
            KernelError::UnresolvedType {
                cause: ResolveFailure::TypeNotInPackage,
                ..
            }
        ));
    }

    #[test]
    fn test_find_entity_and_unregister() {
        let mut registry = ClassRegistry::new();
        let lib = registry.register(library()).unwrap();
        let valve = lib.class_reference("Valve").unwrap();
        let entity = valve.create_smart_object(fields! { "id" => "v1" }).unwrap();
        registry
            .register(PackageContainer::new("plant", vec![Value::from(entity.clone())]).unwrap())
            .unwrap();

        let found = registry.find_entity(Id::new("plant"), Id::new("v1")).unwrap();
        assert!(found.ptr_eq(&entity));
        assert!(registry.find_entity(Id::new("lib"), Id::new("v1")).is_none());

        assert!(registry.unregister(Id::new("plant")).is_some());
        assert!(registry.unregister(Id::new("plant")).is_none());
        assert!(registry.find_entity(Id::new("plant"), Id::new("v1")).is_none());
    }
}
