//! Conversion between entity trees and their portable (JSON) form.
//!
//! Every entity node is written as an object tagged with [`SMART_TYPE`] and
//! [`SMART_PKG`]; pseudo-class masters also carry [`IS_PSEUDO_CLASS_MASTER`].
//! Fields equal to their declared default are left out, and the decoder
//! re-applies the same defaults through the class constructor.
//!
//! Decoding resolves each `(package id, type name)` tag through a
//! [`ClassResolver`]. An optional second resolver is consulted first and an
//! optional [`HydratedLookup`] hands back masters decoded by an earlier pass,
//! which is how package hydration keeps instance back-references pointing at
//! the masters of the final tree.

use std::collections::HashMap;

use log::trace;
use serde_json::{Map, Number, Value as JsonValue};

use crate::{
    class::ClassReference,
    entity::Entity,
    error::{KernelError, Result},
    identifier::Id,
    value::{FieldMap, Value},
};

/// Key holding an entity node's type name.
pub const SMART_TYPE: &str = "smartType";
/// Key holding the id of the package defining an entity node's type.
pub const SMART_PKG: &str = "smartPkg";
/// Flag present (and `true`) on pseudo-class master nodes.
pub const IS_PSEUDO_CLASS_MASTER: &str = "isPseudoClassMaster";

// =============================================================================
// Encoding
// =============================================================================

impl Entity {
    /// Encodes this entity and its subtree into a JSON-safe tree.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError::UnsupportedShape`] for class references,
    /// non-finite floats and plain maps using the reserved [`SMART_TYPE`] key.
    pub fn to_portable_form(&self) -> Result<JsonValue> {
        let class = self.class();
        let base = self.base_class();
        let id = self.id();
        let name = self.name();

        let mut node = Map::new();
        node.insert(SMART_TYPE.to_string(), JsonValue::String(class.type_name()));
        node.insert(
            SMART_PKG.to_string(),
            JsonValue::String(class.package_id().to_string()),
        );
        if self.is_pseudo_class_master() {
            node.insert(IS_PSEUDO_CLASS_MASTER.to_string(), JsonValue::Bool(true));
        }
        node.insert("id".to_string(), JsonValue::String(id.to_string()));
        if name != id.to_string() {
            node.insert("name".to_string(), JsonValue::String(name));
        }

        let fields = self.fields();
        for prop in base.encoding_props() {
            let Some(value) = fields.get(prop.name()) else {
                continue;
            };
            if prop.default() == Some(value) {
                continue;
            }
            let encoded = encode_value(value)
                .map_err(|err| err.with_entity(id).with_field(prop.name()))?;
            node.insert(prop.name().to_string(), encoded);
        }

        Ok(JsonValue::Object(node))
    }
}

/// Encodes a single field value.
pub fn encode_value(value: &Value) -> Result<JsonValue> {
    Ok(match value {
        Value::Null => JsonValue::Null,
        Value::Bool(value) => JsonValue::Bool(*value),
        Value::Int(value) => JsonValue::Number(Number::from(*value)),
        Value::Float(value) => Number::from_f64(*value)
            .map(JsonValue::Number)
            .ok_or_else(|| {
                KernelError::unsupported("encode", format!("non-finite float `{value}`"))
            })?,
        Value::String(value) => JsonValue::String(value.clone()),
        Value::Array(items) => {
            JsonValue::Array(items.iter().map(encode_value).collect::<Result<_>>()?)
        }
        Value::Map(map) => {
            if map.contains_key(SMART_TYPE) {
                return Err(KernelError::unsupported(
                    "encode",
                    format!("a plain map using the reserved key `{SMART_TYPE}`"),
                ));
            }
            let mut object = Map::new();
            for (key, item) in map {
                object.insert(
                    key.clone(),
                    encode_value(item).map_err(|err| err.with_field(key))?,
                );
            }
            JsonValue::Object(object)
        }
        Value::Entity(entity) => entity.to_portable_form()?,
        Value::Class(class) => {
            return Err(KernelError::unsupported(
                "encode",
                format!("class reference `{}`", class.full_type_name()),
            ));
        }
    })
}

// =============================================================================
// Decoding
// =============================================================================

/// Maps a `(package id, type name)` tag to a class.
pub trait ClassResolver {
    /// # Errors
    ///
    /// Returns [`KernelError::UnresolvedType`] if the pair is unknown.
    fn resolve(&self, package_id: Id, type_name: &str) -> Result<ClassReference>;
}

/// Source of masters that were decoded before the current pass.
pub trait HydratedLookup {
    fn hydrated_master(&self, master_id: Id) -> Option<Entity>;
}

impl HydratedLookup for HashMap<Id, Entity> {
    fn hydrated_master(&self, master_id: Id) -> Option<Entity> {
        self.get(&master_id).cloned()
    }
}

/// Rebuilds entity trees from their portable form.
///
/// # Examples
///
/// ```
/// use std::rc::Rc;
///
/// use armillary_core::{
///     class::{ClassReference, RealClass},
///     error::{KernelError, ResolveFailure, Result},
///     identifier::Id,
///     portable::{ClassResolver, Decoder},
/// };
/// use serde_json::json;
///
/// struct Valves(ClassReference);
///
/// impl ClassResolver for Valves {
///     fn resolve(&self, package_id: Id, type_name: &str) -> Result<ClassReference> {
///         if package_id == "pkgA" && type_name == "Valve" {
///             return Ok(self.0.clone());
///         }
///         Err(KernelError::UnresolvedType {
///             package_id: package_id.to_string(),
///             type_name: type_name.to_string(),
///             cause: ResolveFailure::PackageNotLoaded,
///         })
///     }
/// }
///
/// let valve = Rc::new(RealClass::new("Valve").with_field("x", 0).with_field("y", 0));
/// let resolver = Valves(ClassReference::real(valve, Id::new("pkgA")).unwrap());
///
/// let document = json!({"smartType": "Valve", "smartPkg": "pkgA", "id": "v1", "y": 20});
/// let entity = Decoder::new(&resolver).decode_entity(&document).unwrap();
///
/// assert_eq!(entity.to_portable_form().unwrap(), document);
/// ```
pub struct Decoder<'a> {
    resolver: &'a dyn ClassResolver,
    external: Option<&'a dyn ClassResolver>,
    hydrated: Option<&'a dyn HydratedLookup>,
}

impl<'a> Decoder<'a> {
    pub fn new(resolver: &'a dyn ClassResolver) -> Self {
        Self {
            resolver,
            external: None,
            hydrated: None,
        }
    }

    /// Adds a resolver consulted before the primary one. Tags it cannot
    /// resolve fall back to the primary resolver.
    pub fn with_external(mut self, external: &'a dyn ClassResolver) -> Self {
        self.external = Some(external);
        self
    }

    /// Adds a source of already decoded masters. A master node whose id is
    /// found there is replaced by the stored entity instead of being decoded.
    pub fn with_hydrated(mut self, hydrated: &'a dyn HydratedLookup) -> Self {
        self.hydrated = Some(hydrated);
        self
    }

    /// Decodes any portable node.
    ///
    /// Arrays are decoded element-wise, tagged objects become entities, plain
    /// objects become maps and primitives pass through.
    pub fn decode(&self, node: &JsonValue) -> Result<Value> {
        Ok(match node {
            JsonValue::Null => Value::Null,
            JsonValue::Bool(value) => Value::Bool(*value),
            JsonValue::Number(number) => decode_number(number)?,
            JsonValue::String(value) => Value::String(value.clone()),
            JsonValue::Array(items) => {
                Value::Array(items.iter().map(|item| self.decode(item)).collect::<Result<_>>()?)
            }
            JsonValue::Object(object) if object.contains_key(SMART_TYPE) => {
                Value::Entity(self.decode_tagged(object)?)
            }
            JsonValue::Object(object) => {
                if object.contains_key(SMART_PKG) {
                    return Err(KernelError::unsupported(
                        "decode",
                        format!("an object with `{SMART_PKG}` but no `{SMART_TYPE}`"),
                    ));
                }
                let mut map = FieldMap::with_capacity(object.len());
                for (key, item) in object {
                    map.insert(
                        key.clone(),
                        self.decode(item).map_err(|err| err.with_field(key))?,
                    );
                }
                Value::Map(map)
            }
        })
    }

    /// Decodes a node that must be a tagged entity node.
    pub fn decode_entity(&self, node: &JsonValue) -> Result<Entity> {
        match node {
            JsonValue::Object(object) if object.contains_key(SMART_TYPE) => {
                self.decode_tagged(object)
            }
            other => Err(KernelError::unsupported(
                "decode",
                format!("{} where an entity node was expected", json_shape(other)),
            )),
        }
    }

    fn decode_tagged(&self, object: &Map<String, JsonValue>) -> Result<Entity> {
        let node_id = object.get("id").and_then(JsonValue::as_str);
        let with_context = |err: KernelError| match node_id {
            Some(id) => err.with_entity(id),
            None => err,
        };

        let type_name = tag_str(object, SMART_TYPE).map_err(with_context)?;
        let package_id = Id::new(tag_str(object, SMART_PKG).map_err(with_context)?);
        let is_master = match object.get(IS_PSEUDO_CLASS_MASTER) {
            None | Some(JsonValue::Bool(false)) => false,
            Some(JsonValue::Bool(true)) => true,
            Some(other) => {
                return Err(with_context(KernelError::unsupported(
                    "decode",
                    format!("{} as `{IS_PSEUDO_CLASS_MASTER}`", json_shape(other)),
                )));
            }
        };

        if is_master {
            if let (Some(lookup), Some(id)) = (self.hydrated, node_id) {
                if let Some(master) = lookup.hydrated_master(Id::new(id)) {
                    trace!(id; "Reusing hydrated master");
                    return Ok(master);
                }
            }
        }

        let class = self.resolve(package_id, type_name)?;

        let mut fields = FieldMap::with_capacity(object.len());
        for (key, item) in object {
            if matches!(key.as_str(), SMART_TYPE | SMART_PKG | IS_PSEUDO_CLASS_MASTER) {
                continue;
            }
            let value = self
                .decode(item)
                .map_err(|err| with_context(err.with_field(key)))?;
            fields.insert(key.clone(), value);
        }

        if class.is_template() {
            restore_omitted_fields(&class, &mut fields);
        }

        trace!(class = class.full_type_name(), id:? = node_id; "Decoding entity node");
        let entity = class.create_smart_object(fields)?;
        if is_master {
            entity.mark_pseudo_class_master()?;
        }
        Ok(entity)
    }

    fn resolve(&self, package_id: Id, type_name: &str) -> Result<ClassReference> {
        if let Some(external) = self.external {
            match external.resolve(package_id, type_name) {
                Err(KernelError::UnresolvedType { .. }) => {}
                resolved => return resolved,
            }
        }
        self.resolver.resolve(package_id, type_name)
    }
}

/// Fills the fields the encoder left out with the values it compared them
/// against: declared defaults, and the id for `name`. Instance nodes need this
/// because a template would otherwise supply the master's values.
fn restore_omitted_fields(class: &ClassReference, fields: &mut FieldMap) {
    for prop in class.base_class().encoding_props() {
        if let Some(default) = prop.default() {
            if !fields.contains_key(prop.name()) {
                fields.insert(prop.name().to_string(), default.clone());
            }
        }
    }
    if !fields.contains_key("name") {
        if let Some(id @ Value::String(_)) = fields.get("id").cloned() {
            fields.insert("name".to_string(), id);
        }
    }
}

fn tag_str<'o>(object: &'o Map<String, JsonValue>, key: &str) -> Result<&'o str> {
    match object.get(key) {
        Some(JsonValue::String(value)) => Ok(value),
        Some(other) => Err(KernelError::unsupported(
            "decode",
            format!("{} as `{key}`", json_shape(other)),
        )),
        None => Err(KernelError::unsupported(
            "decode",
            format!("an entity node without `{key}`"),
        )),
    }
}

fn decode_number(number: &Number) -> Result<Value> {
    if let Some(value) = number.as_i64() {
        return Ok(Value::Int(value));
    }
    if number.is_u64() {
        return Err(KernelError::unsupported(
            "decode",
            format!("integer `{number}` outside the signed 64-bit range"),
        ));
    }
    number
        .as_f64()
        .map(Value::Float)
        .ok_or_else(|| KernelError::unsupported("decode", format!("number `{number}`")))
}

fn json_shape(node: &JsonValue) -> &'static str {
    match node {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "a boolean",
        JsonValue::Number(_) => "a number",
        JsonValue::String(_) => "a string",
        JsonValue::Array(_) => "an array",
        JsonValue::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use std::rc::Rc;

    use serde_json::json;

    use super::*;
    use crate::{class::RealClass, error::ResolveFailure, fields};

    /// Resolves a fixed set of classes keyed by `(package, type)`.
    #[derive(Default)]
    struct TableResolver {
        classes: HashMap<(Id, String), ClassReference>,
    }

    impl TableResolver {
        fn with(mut self, class: ClassReference) -> Self {
            self.classes
                .insert((class.package_id(), class.type_name()), class);
            self
        }
    }

    impl ClassResolver for TableResolver {
        fn resolve(&self, package_id: Id, type_name: &str) -> Result<ClassReference> {
            self.classes
                .get(&(package_id, type_name.to_string()))
                .cloned()
                .ok_or_else(|| KernelError::UnresolvedType {
                    package_id: package_id.to_string(),
                    type_name: type_name.to_string(),
                    cause: ResolveFailure::TypeNotInPackage,
                })
        }
    }

    fn valve_class() -> ClassReference {
        ClassReference::real(
            Rc::new(RealClass::new("Valve").with_field("x", 0).with_field("y", 0)),
            Id::new("pkgA"),
        )
        .unwrap()
    }

    fn rack_class() -> ClassReference {
        ClassReference::real(
            Rc::new(
                RealClass::new("Rack")
                    .with_field("slots", Value::Array(vec![]))
                    .with_field("labels", Value::Map(FieldMap::new()))
                    .with_required("note"),
            ),
            Id::new("pkgA"),
        )
        .unwrap()
    }

    fn resolver() -> TableResolver {
        TableResolver::default().with(valve_class()).with(rack_class())
    }

    #[test]
    fn test_encode_omits_defaults() {
        let valve = valve_class()
            .create_smart_object(fields! { "id" => "v1", "y" => 20 })
            .unwrap();

        let encoded = valve.to_portable_form().unwrap();
        assert_eq!(
            encoded,
            json!({"smartType": "Valve", "smartPkg": "pkgA", "id": "v1", "y": 20})
        );
        let keys: Vec<&str> = encoded
            .as_object()
            .unwrap()
            .keys()
            .map(String::as_str)
            .collect();
        assert_eq!(keys, vec!["smartType", "smartPkg", "id", "y"]);
    }

    #[test]
    fn test_encode_name_and_null_without_default() {
        let rack = rack_class()
            .create_smart_object(fields! { "id" => "r", "name" => "Main rack" })
            .unwrap();
        assert_eq!(
            rack.to_portable_form().unwrap(),
            json!({"smartType": "Rack", "smartPkg": "pkgA", "id": "r", "name": "Main rack", "note": null})
        );
    }

    #[test]
    fn test_encode_master_flag() {
        let master = valve_class()
            .create_smart_object(fields! { "id" => "StdValve" })
            .unwrap();
        master.mark_pseudo_class_master().unwrap();
        let encoded = master.to_portable_form().unwrap();
        assert_eq!(encoded[IS_PSEUDO_CLASS_MASTER], json!(true));

        let template = ClassReference::template(master, Id::new("plant")).unwrap();
        let instance = template
            .create_smart_object(fields! { "id" => "v9" })
            .unwrap();
        assert_eq!(
            instance.to_portable_form().unwrap(),
            json!({"smartType": "StdValve", "smartPkg": "plant", "id": "v9"})
        );
    }

    #[test]
    fn test_encode_rejects_class_reference() {
        let rack = rack_class()
            .create_smart_object(fields! { "id" => "r", "note" => valve_class() })
            .unwrap();
        let err = rack.to_portable_form().unwrap_err();
        assert!(matches!(
            err,
            KernelError::UnsupportedShape { ref entity, ref field, .. }
                if entity.as_deref() == Some("r") && field.as_deref() == Some("note")
        ));
    }

    #[test]
    fn test_encode_rejects_non_finite_and_reserved_key() {
        let valve = valve_class()
            .create_smart_object(fields! { "id" => "v", "x" => f64::INFINITY })
            .unwrap();
        assert!(valve.to_portable_form().is_err());

        let rack = rack_class()
            .create_smart_object(fields! {
                "id" => "r",
                "labels" => fields! { SMART_TYPE => "sneaky" },
            })
            .unwrap();
        assert!(rack.to_portable_form().is_err());
    }

    #[test]
    fn test_decode_nested_tree() {
        let document = json!({
            "smartType": "Rack",
            "smartPkg": "pkgA",
            "id": "r",
            "slots": [
                {"smartType": "Valve", "smartPkg": "pkgA", "id": "a", "x": 1},
                {"smartType": "Valve", "smartPkg": "pkgA", "id": "b", "y": 2.5}
            ],
            "labels": {"inlet": "a", "count": 2},
            "note": null
        });
        let resolver = resolver();
        let rack = Decoder::new(&resolver).decode_entity(&document).unwrap();

        assert_eq!(rack.children().len(), 2);
        let b = rack.find_descendant(Id::new("b")).unwrap();
        assert_eq!(b.field("y"), Some(Value::Float(2.5)));
        assert!(b.parent().unwrap().ptr_eq(&rack));
        assert_eq!(
            rack.field("labels"),
            Some(Value::Map(fields! { "inlet" => "a", "count" => 2 }))
        );
        assert_eq!(rack.to_portable_form().unwrap(), document);
    }

    #[test]
    fn test_decode_unresolved_type() {
        let document = json!({"smartType": "Pump", "smartPkg": "pkgA", "id": "p"});
        let resolver = resolver();
        let err = Decoder::new(&resolver).decode(&document).unwrap_err();
        assert_eq!(
            err,
            KernelError::UnresolvedType {
                package_id: "pkgA".to_string(),
                type_name: "Pump".to_string(),
                cause: ResolveFailure::TypeNotInPackage,
            }
        );
    }

    #[test]
    fn test_decode_rejects_bad_tags_and_numbers() {
        let resolver = resolver();
        let decoder = Decoder::new(&resolver);

        assert!(decoder.decode(&json!({"smartType": 3, "smartPkg": "pkgA"})).is_err());
        assert!(decoder.decode(&json!({"smartPkg": "pkgA"})).is_err());
        assert!(decoder.decode(&json!(u64::MAX)).is_err());
        assert!(decoder.decode_entity(&json!([1, 2])).is_err());
        assert_eq!(decoder.decode(&json!(7)).unwrap(), Value::Int(7));
    }

    #[test]
    fn test_decode_unknown_field_is_construction_violation() {
        let resolver = resolver();
        let err = Decoder::new(&resolver)
            .decode(&json!({"smartType": "Valve", "smartPkg": "pkgA", "id": "v", "z": 1}))
            .unwrap_err();
        assert!(matches!(err, KernelError::ConstructionViolation { .. }));
    }

    #[test]
    fn test_external_resolver_first_then_fallback() {
        let alt = ClassReference::real(
            Rc::new(RealClass::new("Valve").with_field("x", 0).with_field("y", 0).with_field("z", 0)),
            Id::new("pkgA"),
        )
        .unwrap();
        let external = TableResolver::default().with(alt);
        let resolver = resolver();
        let decoder = Decoder::new(&resolver).with_external(&external);

        let valve = decoder
            .decode_entity(&json!({"smartType": "Valve", "smartPkg": "pkgA", "id": "v", "z": 1}))
            .unwrap();
        assert_eq!(valve.field("z"), Some(Value::Int(1)));

        let rack = decoder
            .decode_entity(&json!({"smartType": "Rack", "smartPkg": "pkgA", "id": "r"}))
            .unwrap();
        assert_eq!(rack.type_name(), "Rack");
    }

    #[test]
    fn test_decode_instance_takes_defaults_over_master() {
        let master = valve_class()
            .create_smart_object(fields! { "id" => "StdValve", "name" => "Standard", "x" => 5 })
            .unwrap();
        master.mark_pseudo_class_master().unwrap();
        let template = ClassReference::template(master.clone(), Id::new("plant")).unwrap();
        let resolver = resolver().with(template);

        let node = json!({"smartType": "StdValve", "smartPkg": "plant", "id": "v1", "y": 4});
        let instance = Decoder::new(&resolver).decode_entity(&node).unwrap();
        assert_eq!(instance.field("x"), Some(Value::Int(0)));
        assert_eq!(instance.field("y"), Some(Value::Int(4)));
        assert_eq!(instance.name(), "v1");
        assert!(instance.pseudo_class().unwrap().master().unwrap().ptr_eq(&master));
        assert_eq!(instance.to_portable_form().unwrap(), node);
    }

    #[test]
    fn test_hydrated_master_passes_through() {
        let master = valve_class()
            .create_smart_object(fields! { "id" => "StdValve", "x" => 3 })
            .unwrap();
        master.mark_pseudo_class_master().unwrap();
        let mut hydrated = HashMap::new();
        hydrated.insert(master.id(), master.clone());

        let resolver = resolver();
        let decoded = Decoder::new(&resolver)
            .with_hydrated(&hydrated)
            .decode_entity(&master.to_portable_form().unwrap())
            .unwrap();
        assert!(decoded.ptr_eq(&master));

        let fresh = Decoder::new(&resolver)
            .decode_entity(&master.to_portable_form().unwrap())
            .unwrap();
        assert!(!fresh.ptr_eq(&master));
        assert!(fresh.is_pseudo_class_master());
        assert_eq!(fresh.compute_crc().unwrap(), master.compute_crc().unwrap());
    }
}
