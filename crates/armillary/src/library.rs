//! The built-in component library.
//!
//! A code-defined package (id [`COMPONENTS_PACKAGE_ID`]) holding the real
//! classes of component diagrams. Being code, it can be registered and
//! resolved against but never saved.
//!
//! | Class       | Fields after `id`, `name`                                   | Trackable |
//! |-------------|--------------------------------------------------------------|-----------|
//! | `Diagram`   | `components`, `connectors`, `notes`                          | yes       |
//! | `Component` | `kind`, `x`, `y`, `ports`, `children`, `properties`          | no        |
//! | `Port`      | `direction`, `protocol`                                      | no        |
//! | `Connector` | `from`, `to`, `label`                                        | no        |
//! | `Note`      | `text`                                                       | no        |

use std::rc::Rc;

use armillary_core::{
    class::{ClassReference, RealClass},
    error::Result,
    identifier::Id,
    value::{FieldMap, Value},
};

use crate::package::PackageContainer;

/// Id of the component library package.
pub const COMPONENTS_PACKAGE_ID: &str = "components";

const PORT_DIRECTIONS: [&str; 3] = ["in", "out", "inout"];

fn empty_list() -> Value {
    Value::Array(Vec::new())
}

fn validate_port(fields: &FieldMap) -> std::result::Result<(), String> {
    match fields.get("direction").and_then(Value::as_str) {
        Some(direction) if PORT_DIRECTIONS.contains(&direction) => Ok(()),
        Some(direction) => Err(format!(
            "port direction must be one of in, out, inout; found `{direction}`"
        )),
        None => Err("port direction must be a string".to_string()),
    }
}

fn validate_connector(fields: &FieldMap) -> std::result::Result<(), String> {
    for end in ["from", "to"] {
        match fields.get(end) {
            Some(Value::String(id)) if !id.is_empty() => {}
            Some(other) => {
                return Err(format!(
                    "connector `{end}` must name an element id, found {}",
                    other.shape_name()
                ));
            }
            None => return Err(format!("connector `{end}` is missing")),
        }
    }
    Ok(())
}

/// The real classes of the component library, in catalog order.
pub fn component_classes() -> Vec<RealClass> {
    vec![
        RealClass::new("Diagram")
            .with_field("components", empty_list())
            .with_field("connectors", empty_list())
            .with_field("notes", empty_list())
            .trackable(),
        RealClass::new("Component")
            .with_field("kind", "service")
            .with_field("x", 0)
            .with_field("y", 0)
            .with_field("ports", empty_list())
            .with_field("children", empty_list())
            .with_field("properties", Value::Map(FieldMap::new())),
        RealClass::new("Port")
            .with_field("direction", "inout")
            .with_required("protocol")
            .with_validator(validate_port),
        RealClass::new("Connector")
            .with_required("from")
            .with_required("to")
            .with_field("label", "")
            .with_validator(validate_connector),
        RealClass::new("Note").with_field("text", ""),
    ]
}

/// Builds the component library package.
pub fn components_package() -> Result<PackageContainer> {
    let package_id = Id::new(COMPONENTS_PACKAGE_ID);
    let entries = component_classes()
        .into_iter()
        .map(|class| ClassReference::real(Rc::new(class), package_id).map(Value::from))
        .collect::<Result<Vec<_>>>()?;
    PackageContainer::new(COMPONENTS_PACKAGE_ID, entries)
}

#[cfg(test)]
mod tests {
    use armillary_core::{error::KernelError, fields, portable::ClassResolver};

    use super::*;
    use crate::registry::ClassRegistry;

    fn registry() -> ClassRegistry {
        let mut registry = ClassRegistry::new();
        registry.register(components_package().unwrap()).unwrap();
        registry
    }

    fn resolve(registry: &ClassRegistry, type_name: &str) -> ClassReference {
        registry.resolve(Id::new(COMPONENTS_PACKAGE_ID), type_name).unwrap()
    }

    #[test]
    fn test_library_catalog() {
        let package = components_package().unwrap();
        assert_eq!(
            package.class_names(),
            vec!["Diagram", "Component", "Port", "Connector", "Note"]
        );
        assert!(package.contains_code());
        assert!(matches!(
            package.ensure_persistable(),
            Err(KernelError::NonPersistablePackage { .. })
        ));
    }

    #[test]
    fn test_component_defaults() {
        let registry = registry();
        let component = resolve(&registry, "Component")
            .create_smart_object(fields! { "id" => "api" })
            .unwrap();
        assert_eq!(component.field("kind"), Some(Value::from("service")));
        assert_eq!(component.field("properties"), Some(Value::Map(FieldMap::new())));
        assert!(!component.is_trackable());

        let diagram = resolve(&registry, "Diagram")
            .create_smart_object(fields! { "id" => "d" })
            .unwrap();
        assert!(diagram.is_trackable());
    }

    #[test]
    fn test_port_direction_validated() {
        let registry = registry();
        let port = resolve(&registry, "Port");
        assert!(
            port.create_smart_object(fields! { "id" => "p", "protocol" => "http" })
                .is_ok()
        );
        let err = port
            .create_smart_object(fields! { "id" => "p", "direction" => "sideways", "protocol" => "http" })
            .unwrap_err();
        assert!(matches!(err, KernelError::ConstructionViolation { .. }));
        assert!(err.to_string().contains("sideways"));
    }

    #[test]
    fn test_connector_ends_validated() {
        let registry = registry();
        let connector = resolve(&registry, "Connector");
        assert!(
            connector
                .create_smart_object(fields! { "id" => "c", "from" => "a", "to" => "b" })
                .is_ok()
        );
        assert!(
            connector
                .create_smart_object(fields! { "id" => "c", "from" => "a" })
                .is_err()
        );
        assert!(
            connector
                .create_smart_object(fields! { "id" => "c", "from" => "a", "to" => 4 })
                .is_err()
        );
    }
}
