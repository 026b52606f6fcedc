//! Real classes, pseudo-class templates and the reference type unifying them.
//!
//! # Overview
//!
//! - [`RealClass`]: a code-defined class. Declares a stable type name and the
//!   ordered encode-set driving CRC, encoding and cloning.
//! - [`ClassReference`]: either a real class or a pseudo-class template (a
//!   master entity), qualified by the id of the package that owns it. It is
//!   the single factory entry point for creating entities of either kind.
//! - [`PseudoClass`]: the marker attached to masters and their instances.
//!
//! # Example
//!
//! ```
//! use std::rc::Rc;
//!
//! use armillary_core::{
//!     class::{ClassReference, RealClass},
//!     fields,
//!     identifier::Id,
//! };
//!
//! let valve = Rc::new(RealClass::new("Valve").with_field("x", 0).with_field("y", 0));
//! let class = ClassReference::real(valve, Id::new("pkgA")).unwrap();
//!
//! let entity = class.create_smart_object(fields! { "id" => "v1", "y" => 20 }).unwrap();
//! assert_eq!(class.full_type_name(), "pkgA/Valve");
//! assert_eq!(entity.field("x").and_then(|x| x.as_i64()), Some(0));
//! ```

use std::{fmt, rc::Rc};

use log::trace;

use crate::{
    entity::{Entity, EntityRole},
    error::{KernelError, Result},
    identifier::Id,
    value::{FieldMap, Value},
};

/// Field names every entity carries ahead of its class's encode-set.
pub const BUILTIN_FIELDS: [&str; 2] = ["id", "name"];

/// Validation hook run by the constructor after defaults are applied.
pub type FieldValidator = fn(&FieldMap) -> std::result::Result<(), String>;

/// One entry of an encode-set: a field name and its optional default.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodingProp {
    name: String,
    default: Option<Value>,
}

impl EncodingProp {
    /// A field without a declared default. Missing values become `null`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            default: None,
        }
    }

    /// A field with a declared default. Values equal to it are not encoded.
    pub fn with_default(name: impl Into<String>, default: impl Into<Value>) -> Self {
        Self {
            name: name.into(),
            default: Some(default.into()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn default(&self) -> Option<&Value> {
        self.default.as_ref()
    }

    /// The value a constructor stores when the field is not supplied.
    pub fn initial_value(&self) -> Value {
        self.default.clone().unwrap_or(Value::Null)
    }
}

/// A code-defined class.
pub struct RealClass {
    type_name: String,
    props: Vec<EncodingProp>,
    trackable: bool,
    role: EntityRole,
    validator: Option<FieldValidator>,
}

impl RealClass {
    /// Creates a class with the given stable type name and an empty encode-set.
    pub fn new(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            props: Vec::new(),
            trackable: false,
            role: EntityRole::Element,
            validator: None,
        }
    }

    /// Appends a field with a declared default to the encode-set.
    pub fn with_field(mut self, name: impl Into<String>, default: impl Into<Value>) -> Self {
        self.props.push(EncodingProp::with_default(name, default));
        self
    }

    /// Appends a field without a default to the encode-set.
    pub fn with_required(mut self, name: impl Into<String>) -> Self {
        self.props.push(EncodingProp::new(name));
        self
    }

    /// Marks entities of this class as trackable entries.
    pub fn trackable(mut self) -> Self {
        self.trackable = true;
        self
    }

    pub fn with_role(mut self, role: EntityRole) -> Self {
        self.role = role;
        self
    }

    pub fn with_validator(mut self, validator: FieldValidator) -> Self {
        self.validator = Some(validator);
        self
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// The ordered encode-set, excluding the built-in `id` and `name`.
    pub fn encoding_props(&self) -> &[EncodingProp] {
        &self.props
    }

    pub fn prop(&self, name: &str) -> Option<&EncodingProp> {
        self.props.iter().find(|prop| prop.name == name)
    }

    /// Returns `true` if `name` is a built-in field or part of the encode-set.
    pub fn accepts(&self, name: &str) -> bool {
        BUILTIN_FIELDS.contains(&name) || self.prop(name).is_some()
    }

    pub fn is_trackable(&self) -> bool {
        self.trackable
    }

    pub fn role(&self) -> EntityRole {
        self.role
    }

    pub(crate) fn validate(&self, fields: &FieldMap) -> Result<()> {
        match self.validator {
            Some(validator) => {
                validator(fields).map_err(|reason| KernelError::construction(&self.type_name, reason))
            }
            None => Ok(()),
        }
    }

    fn check_declared_name(&self) -> Result<()> {
        let name = &self.type_name;
        if name.trim().is_empty() {
            return Err(KernelError::construction(
                "<unnamed>",
                "a real class must declare a stable type name",
            ));
        }
        if name.contains('/') {
            return Err(KernelError::construction(
                name,
                "type names must not contain `/`",
            ));
        }
        Ok(())
    }
}

impl fmt::Debug for RealClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RealClass")
            .field("type_name", &self.type_name)
            .field("props", &self.props)
            .field("trackable", &self.trackable)
            .field("role", &self.role)
            .finish()
    }
}

/// The two kinds of class a [`ClassReference`] can wrap.
#[derive(Debug, Clone)]
pub enum ClassKind {
    Real(Rc<RealClass>),
    /// A pseudo-class; the wrapped entity is its master.
    Template(Entity),
}

/// A package-qualified reference to a real class or a pseudo-class template.
#[derive(Debug, Clone)]
pub struct ClassReference {
    kind: ClassKind,
    package_id: Id,
}

impl ClassReference {
    /// Wraps a real class owned by `package_id`.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError::ConstructionViolation`] if the class does not
    /// declare a usable stable type name.
    pub fn real(class: Rc<RealClass>, package_id: Id) -> Result<Self> {
        class.check_declared_name()?;
        Ok(Self {
            kind: ClassKind::Real(class),
            package_id,
        })
    }

    /// Wraps a pseudo-class master owned by `package_id`.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError::ConstructionViolation`] if `master` is not
    /// marked as a pseudo-class master.
    pub fn template(master: Entity, package_id: Id) -> Result<Self> {
        if !master.is_pseudo_class_master() {
            return Err(KernelError::construction(
                master.type_name(),
                "only pseudo-class masters can be used as templates",
            )
            .with_entity(master.id()));
        }
        Ok(Self {
            kind: ClassKind::Template(master),
            package_id,
        })
    }

    pub fn kind(&self) -> &ClassKind {
        &self.kind
    }

    pub fn package_id(&self) -> Id {
        self.package_id
    }

    pub fn is_template(&self) -> bool {
        matches!(self.kind, ClassKind::Template(_))
    }

    /// The master entity, for template references.
    pub fn master(&self) -> Option<&Entity> {
        match &self.kind {
            ClassKind::Template(master) => Some(master),
            ClassKind::Real(_) => None,
        }
    }

    /// Stable declared name for real classes; master id for templates.
    pub fn type_name(&self) -> String {
        match &self.kind {
            ClassKind::Real(class) => class.type_name().to_string(),
            ClassKind::Template(master) => master.id().to_string(),
        }
    }

    /// `packageId/typeName`, the on-document type key.
    pub fn full_type_name(&self) -> String {
        format!("{}/{}", self.package_id, self.type_name())
    }

    /// The real class providing the encode-set and constructor.
    pub fn base_class(&self) -> Rc<RealClass> {
        match &self.kind {
            ClassKind::Real(class) => Rc::clone(class),
            ClassKind::Template(master) => master.base_class(),
        }
    }

    /// Creates an entity of this class from named fields.
    ///
    /// Real classes run their constructor. Templates deep-clone the master
    /// with `fields` as overrides and stamp the result as an instance
    /// remembering the master's current CRC.
    pub fn create_smart_object(&self, fields: FieldMap) -> Result<Entity> {
        trace!(class = self.full_type_name(); "Creating smart object");
        match &self.kind {
            ClassKind::Real(_) => Entity::construct(self, fields),
            ClassKind::Template(master) => {
                let master_crc = master.compute_crc()?;
                let instance = master.deep_clone(fields)?;
                instance.stamp_instance(self.clone(), master.clone(), master_crc);
                Ok(instance)
            }
        }
    }
}

/// Role of an entity taking part in a pseudo-class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PseudoRole {
    Type,
    Instance,
}

/// Marker attached to pseudo-class masters and instances.
#[derive(Debug, Clone)]
pub enum PseudoClass {
    /// The entity is a master template.
    Type,
    /// The entity was created from `master`.
    Instance {
        master: Entity,
        master_crc_at_creation: u32,
    },
}

impl PseudoClass {
    pub fn role(&self) -> PseudoRole {
        match self {
            PseudoClass::Type => PseudoRole::Type,
            PseudoClass::Instance { .. } => PseudoRole::Instance,
        }
    }

    pub fn master(&self) -> Option<&Entity> {
        match self {
            PseudoClass::Type => None,
            PseudoClass::Instance { master, .. } => Some(master),
        }
    }

    pub fn master_crc_at_creation(&self) -> Option<u32> {
        match self {
            PseudoClass::Type => None,
            PseudoClass::Instance {
                master_crc_at_creation,
                ..
            } => Some(*master_crc_at_creation),
        }
    }

    /// Returns `true` when the master's CRC no longer matches the one recorded
    /// at instantiation. Always `false` for masters.
    pub fn is_out_of_sync(&self) -> Result<bool> {
        match self {
            PseudoClass::Type => Ok(false),
            PseudoClass::Instance {
                master,
                master_crc_at_creation,
            } => Ok(master.compute_crc()? != *master_crc_at_creation),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fields;

    fn valve() -> Rc<RealClass> {
        Rc::new(
            RealClass::new("Valve")
                .with_field("x", 0)
                .with_field("y", 0),
        )
    }

    #[test]
    fn test_real_class_requires_declared_name() {
        let unnamed = Rc::new(RealClass::new("  "));
        let err = ClassReference::real(unnamed, Id::new("pkgA")).unwrap_err();
        assert!(matches!(err, KernelError::ConstructionViolation { .. }));

        let slashed = Rc::new(RealClass::new("a/b"));
        assert!(ClassReference::real(slashed, Id::new("pkgA")).is_err());
    }

    #[test]
    fn test_type_names() {
        let class = ClassReference::real(valve(), Id::new("pkgA")).unwrap();
        assert_eq!(class.type_name(), "Valve");
        assert_eq!(class.full_type_name(), "pkgA/Valve");
        assert!(!class.is_template());
        assert!(class.master().is_none());
    }

    #[test]
    fn test_template_requires_master() {
        let class = ClassReference::real(valve(), Id::new("pkgA")).unwrap();
        let plain = class.create_smart_object(fields! { "id" => "v1" }).unwrap();
        assert!(ClassReference::template(plain.clone(), Id::new("pkgA")).is_err());

        plain.mark_pseudo_class_master().unwrap();
        let template = ClassReference::template(plain, Id::new("pkgA")).unwrap();
        assert_eq!(template.type_name(), "v1");
        assert_eq!(template.full_type_name(), "pkgA/v1");
        assert_eq!(template.base_class().type_name(), "Valve");
    }

    #[test]
    fn test_template_instance_overrides_and_marker() {
        let class = ClassReference::real(valve(), Id::new("pkgA")).unwrap();
        let master = class
            .create_smart_object(fields! { "id" => "StdValve", "x" => 5 })
            .unwrap();
        master.mark_pseudo_class_master().unwrap();
        let template = ClassReference::template(master.clone(), Id::new("pkgA")).unwrap();

        let instance = template
            .create_smart_object(fields! { "id" => "v7", "y" => 3 })
            .unwrap();

        assert_eq!(instance.id(), "v7");
        assert_eq!(instance.field("x"), Some(Value::Int(5)));
        assert_eq!(instance.field("y"), Some(Value::Int(3)));
        assert_eq!(instance.type_name(), "StdValve");
        assert!(!instance.is_pseudo_class_master());

        let marker = instance.pseudo_class().expect("instance marker");
        assert_eq!(marker.role(), PseudoRole::Instance);
        assert!(marker.master().unwrap().ptr_eq(&master));
        assert_eq!(marker.master_crc_at_creation(), Some(master.compute_crc().unwrap()));
        assert!(!marker.is_out_of_sync().unwrap());
    }

    #[test]
    fn test_encoding_prop_initial_value() {
        assert_eq!(EncodingProp::new("p").initial_value(), Value::Null);
        assert_eq!(
            EncodingProp::with_default("x", 0).initial_value(),
            Value::Int(0)
        );
    }

    #[test]
    fn test_accepts_builtin_and_declared() {
        let class = valve();
        assert!(class.accepts("id"));
        assert!(class.accepts("name"));
        assert!(class.accepts("x"));
        assert!(!class.accepts("pressure"));
    }
}
