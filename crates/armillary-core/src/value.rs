//! Field values stored on entities.
//!
//! [`Value`] is the closed set of shapes an encoded field may take. Every
//! kernel algorithm (CRC, encode, decode, clone) dispatches on it.

use std::fmt;

use indexmap::IndexMap;

use crate::{class::ClassReference, entity::Entity};

/// Named field values, in insertion order.
pub type FieldMap = IndexMap<String, Value>;

/// A single field value.
///
/// Primitive variants compare structurally, floats by bit pattern as the CRC
/// folds them, so `-0.0` and `0.0` differ. [`Value::Entity`] compares by
/// identity and [`Value::Class`] by full type name.
#[derive(Debug, Clone, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Array(Vec<Value>),
    Map(FieldMap),
    /// An owned child entity.
    Entity(Entity),
    /// A reference to a real class or a pseudo-class template.
    Class(ClassReference),
}

impl Value {
    /// Short human-readable name of the shape, used in diagnostics.
    pub fn shape_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Int(_) => "integer",
            Value::Float(_) => "float",
            Value::String(_) => "string",
            Value::Array(_) => "array",
            Value::Map(_) => "map",
            Value::Entity(_) => "entity",
            Value::Class(_) => "class reference",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(value) => Some(*value),
            _ => None,
        }
    }

    /// Returns the value as a float, widening integers.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(value) => Some(*value as f64),
            Value::Float(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&FieldMap> {
        match self {
            Value::Map(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_entity(&self) -> Option<&Entity> {
        match self {
            Value::Entity(entity) => Some(entity),
            _ => None,
        }
    }

    pub fn as_class(&self) -> Option<&ClassReference> {
        match self {
            Value::Class(class) => Some(class),
            _ => None,
        }
    }

    /// Calls `visit` for every entity directly held by this value.
    ///
    /// Arrays and maps are walked; entities are not descended into.
    pub fn for_each_entity(&self, visit: &mut dyn FnMut(&Entity)) {
        match self {
            Value::Entity(entity) => visit(entity),
            Value::Array(items) => items.iter().for_each(|item| item.for_each_entity(visit)),
            Value::Map(map) => map.values().for_each(|item| item.for_each_entity(visit)),
            _ => {}
        }
    }

    /// Collects the entities directly held by this value.
    pub fn entities(&self) -> Vec<Entity> {
        let mut entities = Vec::new();
        self.for_each_entity(&mut |entity| entities.push(entity.clone()));
        entities
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a.to_bits() == b.to_bits(),
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => a == b,
            (Value::Map(a), Value::Map(b)) => {
                a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| x == y)
            }
            (Value::Entity(a), Value::Entity(b)) => a.ptr_eq(b),
            (Value::Class(a), Value::Class(b)) => a.full_type_name() == b.full_type_name(),
            _ => false,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(value) => write!(f, "{value}"),
            Value::Int(value) => write!(f, "{value}"),
            Value::Float(value) => write!(f, "{value}"),
            Value::String(value) => write!(f, "{value:?}"),
            Value::Array(items) => write!(f, "[{} items]", items.len()),
            Value::Map(map) => write!(f, "{{{} entries}}", map.len()),
            Value::Entity(entity) => write!(f, "<{} {}>", entity.type_name(), entity.id()),
            Value::Class(class) => write!(f, "<class {}>", class.full_type_name()),
        }
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Int(value.into())
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(value)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::Array(items)
    }
}

impl From<FieldMap> for Value {
    fn from(map: FieldMap) -> Self {
        Value::Map(map)
    }
}

impl From<Entity> for Value {
    fn from(entity: Entity) -> Self {
        Value::Entity(entity)
    }
}

impl From<ClassReference> for Value {
    fn from(class: ClassReference) -> Self {
        Value::Class(class)
    }
}

/// Builds a [`FieldMap`] from `name => value` pairs.
///
/// ```
/// use armillary_core::{fields, value::Value};
///
/// let fields = fields! { "id" => "v1", "y" => 20 };
/// assert_eq!(fields["y"], Value::Int(20));
/// ```
#[macro_export]
macro_rules! fields {
    () => { $crate::value::FieldMap::new() };
    ($($name:expr => $value:expr),+ $(,)?) => {{
        let mut map = $crate::value::FieldMap::new();
        $( map.insert(::std::string::String::from($name), $crate::value::Value::from($value)); )+
        map
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_int_and_float_are_distinct() {
        assert_ne!(Value::Int(0), Value::Float(0.0));
        assert_eq!(Value::Float(1.5), Value::Float(1.5));
    }

    #[test]
    fn test_float_equality_is_bitwise() {
        assert_ne!(Value::Float(-0.0), Value::Float(0.0));
        assert_eq!(Value::Float(-0.0), Value::Float(-0.0));
    }

    #[test]
    fn test_map_equality_respects_order() {
        let a: FieldMap = crate::fields! { "a" => 1, "b" => 2 };
        let b: FieldMap = crate::fields! { "b" => 2, "a" => 1 };
        assert_ne!(Value::Map(a.clone()), Value::Map(b));
        assert_eq!(Value::Map(a.clone()), Value::Map(a));
    }

    #[test]
    fn test_accessors() {
        assert_eq!(Value::from("x").as_str(), Some("x"));
        assert_eq!(Value::from(3).as_f64(), Some(3.0));
        assert_eq!(Value::from(3).as_i64(), Some(3));
        assert_eq!(Value::from(true).as_bool(), Some(true));
        assert!(Value::Null.is_null());
        assert!(Value::from(2.5).as_i64().is_none());
    }

    #[test]
    fn test_shape_names() {
        assert_eq!(Value::Null.shape_name(), "null");
        assert_eq!(Value::Array(vec![]).shape_name(), "array");
        assert_eq!(Value::Map(FieldMap::new()).shape_name(), "map");
    }

    #[test]
    fn test_fields_macro_keeps_order() {
        let map = crate::fields! { "z" => 1, "a" => "x", "m" => Value::Null };
        let keys: Vec<&str> = map.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["z", "a", "m"]);
    }
}
