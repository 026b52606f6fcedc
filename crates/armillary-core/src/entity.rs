//! The entity base: the persisted, cloned and CRC-tracked tree node.
//!
//! # Overview
//!
//! An [`Entity`] is a shared handle to one node of the containment tree. Its
//! owning parent holds it through a field [`Value`]; the entity itself only
//! keeps non-owning (`Weak`) references to its primary parent and to an
//! optional view parent, so the tree has exactly one owner per node.
//!
//! All generic algorithms are driven by the entity's base [`RealClass`]
//! encode-set:
//!
//! - [`Entity::compute_crc`]: cached structural CRC
//! - [`Entity::deep_clone`]: reconstruction through the ordinary constructor
//! - [`Entity::trickle_up_change`]: the synchronization point after a mutation
//! - [`Entity::to_portable_form`](crate::portable): JSON encoding
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
//!     propagation::NoopSink,
//! };
//!
//! let class = ClassReference::real(
//!     Rc::new(RealClass::new("Valve").with_field("x", 0)),
//!     Id::new("pkgA"),
//! )
//! .unwrap();
//!
//! let valve = class.create_smart_object(fields! { "id" => "v1" }).unwrap();
//! let before = valve.compute_crc().unwrap();
//!
//! valve.set_field("x", 4).unwrap();
//! valve.trickle_up_change(&NoopSink, true).unwrap();
//! assert_ne!(valve.compute_crc().unwrap(), before);
//! ```

use std::{
    cell::RefCell,
    collections::HashSet,
    fmt,
    rc::{Rc, Weak},
};

use log::trace;

use crate::{
    class::{BUILTIN_FIELDS, ClassReference, PseudoClass, RealClass},
    crc::CrcFolder,
    error::{KernelError, Result},
    identifier::Id,
    propagation::{ChangeSink, Size},
    value::{FieldMap, Value},
};

/// Explicit role tag set by an entity's class at construction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum EntityRole {
    /// An ordinary diagram element.
    #[default]
    Element,
    /// The root entity backing a package container.
    Package,
}

/// How an entity is presented by the view layer. Not persisted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DisplayMode {
    #[default]
    Expanded,
    Collapsed,
    Hidden,
}

struct EntityState {
    id: Id,
    name: String,
    class: ClassReference,
    base: Rc<RealClass>,
    fields: FieldMap,
    parent: Weak<RefCell<EntityState>>,
    view_parent: Weak<RefCell<EntityState>>,
    crc: Option<u32>,
    baseline_crc: Option<u32>,
    display_mode: DisplayMode,
    pseudo: Option<PseudoClass>,
    top_level: bool,
    last_size: Option<Size>,
}

/// Shared handle to a tree node.
///
/// Cloning the handle does not clone the node; use [`Entity::deep_clone`]
/// for that. Two handles are the same node when [`Entity::ptr_eq`] holds.
#[derive(Clone)]
pub struct Entity(Rc<RefCell<EntityState>>);

impl fmt::Debug for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.try_borrow() {
            Ok(state) => f
                .debug_struct("Entity")
                .field("id", &state.id)
                .field("class", &state.class.full_type_name())
                .field("fields", &state.fields)
                .finish(),
            Err(_) => f.write_str("Entity { <borrowed> }"),
        }
    }
}

impl Entity {
    // =========================================================================
    // Construction
    // =========================================================================

    /// Runs the ordinary constructor of `class`'s base class.
    ///
    /// Validates the named fields, applies declared defaults for missing
    /// fields, and adopts every entity held by a field value.
    pub(crate) fn construct(class: &ClassReference, mut fields: FieldMap) -> Result<Entity> {
        let base = class.base_class();
        let class_name = base.type_name().to_string();

        let id = match fields.shift_remove("id") {
            Some(Value::String(id)) if !id.is_empty() => Id::new(&id),
            Some(Value::String(_)) | None => {
                return Err(KernelError::construction(&class_name, "an entity requires a non-empty id")
                    .with_field("id"));
            }
            Some(other) => {
                return Err(KernelError::construction(
                    &class_name,
                    format!("id must be a string, found {}", other.shape_name()),
                )
                .with_field("id"));
            }
        };
        let name = match fields.shift_remove("name") {
            Some(Value::String(name)) => name,
            Some(Value::Null) | None => id.to_string(),
            Some(other) => {
                return Err(KernelError::construction(
                    &class_name,
                    format!("name must be a string, found {}", other.shape_name()),
                )
                .with_entity(id)
                .with_field("name"));
            }
        };

        if let Some(unknown) = fields.keys().find(|key| !base.accepts(key)) {
            return Err(KernelError::construction(&class_name, "unknown field")
                .with_entity(id)
                .with_field(unknown));
        }

        let mut ordered = FieldMap::with_capacity(base.encoding_props().len());
        for prop in base.encoding_props() {
            let value = fields
                .shift_remove(prop.name())
                .unwrap_or_else(|| prop.initial_value());
            ordered.insert(prop.name().to_string(), value);
        }

        base.validate(&ordered).map_err(|err| err.with_entity(id))?;

        let mut seen = HashSet::new();
        for (field, value) in &ordered {
            for child in value.entities() {
                if child.parent().is_some() {
                    return Err(KernelError::construction(
                        &class_name,
                        format!("entity `{}` already has a primary parent", child.id()),
                    )
                    .with_entity(id)
                    .with_field(field));
                }
                if !seen.insert(child.id()) {
                    return Err(KernelError::construction(
                        &class_name,
                        format!("duplicate child id `{}`", child.id()),
                    )
                    .with_entity(id)
                    .with_field(field));
                }
            }
        }

        let entity = Entity(Rc::new(RefCell::new(EntityState {
            id,
            name,
            class: class.clone(),
            base,
            fields: ordered,
            parent: Weak::new(),
            view_parent: Weak::new(),
            crc: None,
            baseline_crc: None,
            display_mode: DisplayMode::default(),
            pseudo: None,
            top_level: false,
            last_size: None,
        })));

        for child in entity.children() {
            child.0.borrow_mut().parent = Rc::downgrade(&entity.0);
        }

        trace!(id:% = id, class = class_name; "Constructed entity");
        Ok(entity)
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn id(&self) -> Id {
        self.0.borrow().id
    }

    pub fn name(&self) -> String {
        self.0.borrow().name.clone()
    }

    /// Renames the entity. Call [`Entity::trickle_up_change`] afterwards.
    pub fn set_name(&self, name: impl Into<String>) {
        let mut state = self.0.borrow_mut();
        state.name = name.into();
        state.crc = None;
    }

    /// The class the entity was created from; determines its smart type.
    pub fn class(&self) -> ClassReference {
        self.0.borrow().class.clone()
    }

    /// The real class providing the encode-set and constructor.
    pub fn base_class(&self) -> Rc<RealClass> {
        Rc::clone(&self.0.borrow().base)
    }

    /// The smart type name emitted when encoding.
    pub fn type_name(&self) -> String {
        self.0.borrow().class.type_name()
    }

    pub fn role(&self) -> EntityRole {
        self.0.borrow().base.role()
    }

    pub fn is_package(&self) -> bool {
        self.role() == EntityRole::Package
    }

    pub fn is_trackable(&self) -> bool {
        self.0.borrow().base.is_trackable()
    }

    pub fn is_top_level(&self) -> bool {
        self.0.borrow().top_level
    }

    /// Flags the entity as a top-level entry of a package.
    pub fn set_top_level(&self, top_level: bool) {
        self.0.borrow_mut().top_level = top_level;
    }

    pub fn display_mode(&self) -> DisplayMode {
        self.0.borrow().display_mode
    }

    pub fn set_display_mode(&self, mode: DisplayMode) {
        self.0.borrow_mut().display_mode = mode;
    }

    /// Returns a copy of a field value, or `None` if the field is not in the
    /// encode-set. `id` and `name` are also readable here.
    pub fn field(&self, name: &str) -> Option<Value> {
        let state = self.0.borrow();
        match name {
            "id" => Some(Value::String(state.id.to_string())),
            "name" => Some(Value::String(state.name.clone())),
            _ => state.fields.get(name).cloned(),
        }
    }

    /// Returns a copy of all encode-set field values, in encode-set order.
    pub fn fields(&self) -> FieldMap {
        self.0.borrow().fields.clone()
    }

    /// Replaces the value of an encode-set field.
    ///
    /// Entities held by the new value are adopted; entities held only by the
    /// old value are detached. The entity's own CRC cache is invalidated, but
    /// ancestors are only updated by [`Entity::trickle_up_change`].
    ///
    /// # Errors
    ///
    /// Returns [`KernelError::ConstructionViolation`] if the field is not part
    /// of the encode-set, if the value holds an entity that already has a
    /// primary parent elsewhere, or if the value would make the entity its
    /// own ancestor.
    pub fn set_field(&self, name: &str, value: impl Into<Value>) -> Result<()> {
        let value = value.into();
        let class_name = self.base_class().type_name().to_string();
        match name {
            _ if BUILTIN_FIELDS.contains(&name) => {
                return Err(KernelError::construction(
                    &class_name,
                    "`id` and `name` are not settable through set_field",
                )
                .with_entity(self.id())
                .with_field(name));
            }
            _ if self.0.borrow().fields.get(name).is_none() => {
                return Err(KernelError::construction(&class_name, "unknown field")
                    .with_entity(self.id())
                    .with_field(name));
            }
            _ => {}
        }

        let incoming = value.entities();
        let mut seen = HashSet::new();
        for child in &incoming {
            if self.ptr_eq(child) || self.ancestors().any(|ancestor| ancestor.ptr_eq(child)) {
                return Err(KernelError::construction(
                    &class_name,
                    format!("entity `{}` cannot contain itself", child.id()),
                )
                .with_entity(self.id())
                .with_field(name));
            }
            if let Some(parent) = child.parent() {
                if !parent.ptr_eq(self) {
                    return Err(KernelError::construction(
                        &class_name,
                        format!("entity `{}` already has a primary parent", child.id()),
                    )
                    .with_entity(self.id())
                    .with_field(name));
                }
            }
            if !seen.insert(child.id()) {
                return Err(KernelError::construction(
                    &class_name,
                    format!("duplicate child id `{}`", child.id()),
                )
                .with_entity(self.id())
                .with_field(name));
            }
        }

        let previous = {
            let mut state = self.0.borrow_mut();
            state.crc = None;
            state.fields.insert(name.to_string(), value)
        };

        if let Some(previous) = previous {
            for old in previous.entities() {
                if !incoming.iter().any(|child| child.ptr_eq(&old)) {
                    old.0.borrow_mut().parent = Weak::new();
                }
            }
        }
        for child in incoming {
            child.0.borrow_mut().parent = Rc::downgrade(&self.0);
        }
        Ok(())
    }

    /// The entities directly held by this entity's fields.
    pub fn children(&self) -> Vec<Entity> {
        let state = self.0.borrow();
        let mut children = Vec::new();
        for value in state.fields.values() {
            value.for_each_entity(&mut |child| children.push(child.clone()));
        }
        children
    }

    /// Finds a descendant (or self) by id, depth-first.
    pub fn find_descendant(&self, id: Id) -> Option<Entity> {
        if self.id() == id {
            return Some(self.clone());
        }
        self.children()
            .into_iter()
            .find_map(|child| child.find_descendant(id))
    }

    /// Removes this entity from its primary parent's fields.
    ///
    /// Direct field values become `null`; array elements and map entries
    /// holding the entity are dropped. Returns the former parent, whose CRC
    /// cache is invalidated. Call [`Entity::trickle_up_change`] on it
    /// afterwards.
    pub fn detach(&self) -> Option<Entity> {
        let parent = self.parent()?;
        {
            let mut state = parent.0.borrow_mut();
            for value in state.fields.values_mut() {
                remove_entity(value, self);
            }
            state.crc = None;
        }
        self.0.borrow_mut().parent = Weak::new();
        Some(parent)
    }

    // =========================================================================
    // Tree links
    // =========================================================================

    /// Returns `true` if both handles point at the same node.
    pub fn ptr_eq(&self, other: &Entity) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    pub fn parent(&self) -> Option<Entity> {
        self.0.borrow().parent.upgrade().map(Entity)
    }

    pub fn view_parent(&self) -> Option<Entity> {
        self.0.borrow().view_parent.upgrade().map(Entity)
    }

    /// Sets or clears the secondary containment link.
    pub fn set_view_parent(&self, view_parent: Option<&Entity>) {
        self.0.borrow_mut().view_parent = view_parent
            .map(|parent| Rc::downgrade(&parent.0))
            .unwrap_or_default();
    }

    /// Iterates over primary-tree ancestors, nearest first.
    pub fn ancestors(&self) -> impl Iterator<Item = Entity> {
        std::iter::successors(self.parent(), Entity::parent)
    }

    /// The nearest trackable entry at or above this entity.
    pub fn trackable_entry(&self) -> Option<Entity> {
        std::iter::once(self.clone())
            .chain(self.ancestors())
            .find(Entity::is_trackable)
    }

    /// Key under which history and sync state of this entity's trackable
    /// entry are recorded: the package id for packages, `package::entry` for
    /// entries inside a package.
    pub fn tracking_key(&self) -> Option<Id> {
        let entry = self.trackable_entry()?;
        if entry.is_package() {
            return Some(entry.id());
        }
        match entry.ancestors().find(Entity::is_package) {
            Some(package) => Some(package.id().qualify(entry.id())),
            None => Some(entry.id()),
        }
    }

    // =========================================================================
    // Pseudo-classes
    // =========================================================================

    pub fn pseudo_class(&self) -> Option<PseudoClass> {
        self.0.borrow().pseudo.clone()
    }

    pub fn is_pseudo_class_master(&self) -> bool {
        matches!(self.0.borrow().pseudo, Some(PseudoClass::Type))
    }

    pub fn is_pseudo_class_instance(&self) -> bool {
        matches!(self.0.borrow().pseudo, Some(PseudoClass::Instance { .. }))
    }

    /// Turns this entity into a pseudo-class master.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError::ConstructionViolation`] for pseudo-class
    /// instances.
    pub fn mark_pseudo_class_master(&self) -> Result<()> {
        let mut state = self.0.borrow_mut();
        match state.pseudo {
            Some(PseudoClass::Instance { .. }) => Err(KernelError::construction(
                state.class.type_name(),
                "a pseudo-class instance cannot become a master",
            )
            .with_entity(state.id)),
            _ => {
                state.pseudo = Some(PseudoClass::Type);
                Ok(())
            }
        }
    }

    pub(crate) fn stamp_instance(&self, class: ClassReference, master: Entity, master_crc: u32) {
        let mut state = self.0.borrow_mut();
        state.class = class;
        state.pseudo = Some(PseudoClass::Instance {
            master,
            master_crc_at_creation: master_crc,
        });
    }

    /// `true` when this entity is an instance whose master changed since the
    /// instance was created.
    pub fn is_out_of_sync(&self) -> Result<bool> {
        match self.pseudo_class() {
            Some(marker) => marker.is_out_of_sync(),
            None => Ok(false),
        }
    }

    // =========================================================================
    // CRC
    // =========================================================================

    /// Returns the structural CRC of the encode-set, computing it if needed.
    ///
    /// Child entities contribute their own cached CRC.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError::UnsupportedShape`] for non-finite floats.
    pub fn compute_crc(&self) -> Result<u32> {
        if let Some(crc) = self.0.borrow().crc {
            return Ok(crc);
        }

        let crc = {
            let state = self.0.borrow();
            let mut folder = CrcFolder::new();
            folder.field("id");
            folder.str(&state.id.to_string());
            folder.field("name");
            folder.str(&state.name);
            for (name, value) in &state.fields {
                folder.field(name);
                fold_value(&mut folder, value)
                    .map_err(|err| err.with_entity(state.id).with_field(name))?;
            }
            folder.finish()
        };

        let mut state = self.0.borrow_mut();
        state.crc = Some(crc);
        trace!(id:% = state.id, crc; "Computed CRC");
        Ok(crc)
    }

    /// Drops the cached CRC of this entity only.
    pub fn invalidate_crc(&self) {
        self.0.borrow_mut().crc = None;
    }

    pub fn baseline_crc(&self) -> Option<u32> {
        self.0.borrow().baseline_crc
    }

    /// Records the current CRC as the baseline. Used on construction, load
    /// and save; nothing else moves the baseline.
    pub fn reset_baseline(&self) -> Result<u32> {
        let crc = self.compute_crc()?;
        self.0.borrow_mut().baseline_crc = Some(crc);
        Ok(crc)
    }

    /// `true` when the current CRC differs from the baseline.
    pub fn is_dirty(&self) -> Result<bool> {
        let baseline = self.baseline_crc();
        Ok(baseline != Some(self.compute_crc()?))
    }

    // =========================================================================
    // Cloning
    // =========================================================================

    /// Rebuilds this entity through its ordinary constructor.
    ///
    /// Fields named in `overrides` replace the corresponding values; every
    /// other field is cloned (nested entities recursively, arrays and maps
    /// element-wise, class references shared). The clone keeps the smart type
    /// and the instance marker, but a master's clone is not a master.
    pub fn deep_clone(&self, overrides: FieldMap) -> Result<Entity> {
        let (class, pseudo, display_mode, mut fields) = {
            let state = self.0.borrow();
            let mut fields = FieldMap::with_capacity(state.fields.len() + 2);
            fields.insert("id".to_string(), Value::String(state.id.to_string()));
            fields.insert("name".to_string(), Value::String(state.name.clone()));
            for (name, value) in &state.fields {
                if !overrides.contains_key(name) {
                    fields.insert(
                        name.clone(),
                        clone_value(value).map_err(|err| err.with_entity(state.id).with_field(name))?,
                    );
                }
            }
            (
                state.class.clone(),
                state.pseudo.clone(),
                state.display_mode,
                fields,
            )
        };

        if overrides.contains_key("id") && !overrides.contains_key("name") {
            let old_id = self.id().to_string();
            if self.name() == old_id {
                fields.shift_remove("name");
            }
        }
        fields.extend(overrides);

        let base_class = ClassReference::real(self.base_class(), class.package_id())?;
        let clone = Entity::construct(&base_class, fields)?;
        {
            let mut state = clone.0.borrow_mut();
            state.class = class;
            state.display_mode = display_mode;
            state.pseudo = match pseudo {
                Some(PseudoClass::Type) | None => None,
                instance => instance,
            };
        }
        Ok(clone)
    }

    // =========================================================================
    // Change propagation
    // =========================================================================

    /// Recomputes this entity's CRC and propagates the change to its primary
    /// and view parents.
    ///
    /// Trackable entries whose CRC changed are reported to `sink`. With
    /// `size_hint` set, trackable entries are re-measured through the sink's
    /// [`SizeBinding`](crate::propagation::SizeBinding) and size changes are
    /// reported back to it.
    pub fn trickle_up_change(&self, sink: &dyn ChangeSink, size_hint: bool) -> Result<()> {
        let old = self.0.borrow_mut().crc.take();
        let new = self.compute_crc()?;

        if self.is_trackable() {
            if old != Some(new) {
                sink.entry_changed(self);
            }
            if size_hint {
                if let Some(binding) = sink.size_binding() {
                    let size = binding.size(self);
                    let previous = self.0.borrow_mut().last_size.replace(size);
                    if let Some(previous) = previous.filter(|previous| *previous != size) {
                        binding.bind_size_changes(self, previous, size);
                    }
                }
            }
        }

        if let Some(parent) = self.parent() {
            parent.trickle_up_change(sink, size_hint)?;
        }
        if let Some(view_parent) = self.view_parent() {
            view_parent.trickle_up_change(sink, size_hint)?;
        }
        Ok(())
    }
}

fn fold_value(folder: &mut CrcFolder, value: &Value) -> Result<()> {
    match value {
        Value::Null => folder.null(),
        Value::Bool(value) => folder.bool(*value),
        Value::Int(value) => folder.int(*value),
        Value::Float(value) if value.is_finite() => folder.float(*value),
        Value::Float(value) => {
            return Err(KernelError::unsupported(
                "CRC",
                format!("non-finite float `{value}`"),
            ));
        }
        Value::String(value) => folder.str(value),
        Value::Array(items) => {
            folder.array(items.len());
            for item in items {
                fold_value(folder, item)?;
            }
        }
        Value::Map(map) => {
            folder.map(map.len());
            for (key, item) in map {
                folder.str(key);
                fold_value(folder, item).map_err(|err| err.with_field(key))?;
            }
        }
        Value::Entity(child) => folder.entity(child.compute_crc()?),
        Value::Class(class) => folder.class(&class.type_name()),
    }
    Ok(())
}

fn remove_entity(value: &mut Value, target: &Entity) {
    let holds_target = |item: &Value| matches!(item, Value::Entity(entity) if entity.ptr_eq(target));
    if holds_target(&*value) {
        *value = Value::Null;
        return;
    }
    match value {
        Value::Array(items) => {
            items.retain(|item| !holds_target(item));
            items.iter_mut().for_each(|item| remove_entity(item, target));
        }
        Value::Map(map) => {
            map.retain(|_, item| !holds_target(&*item));
            map.values_mut().for_each(|item| remove_entity(item, target));
        }
        _ => {}
    }
}

fn clone_value(value: &Value) -> Result<Value> {
    Ok(match value {
        Value::Entity(child) => Value::Entity(child.deep_clone(FieldMap::new())?),
        Value::Array(items) => Value::Array(items.iter().map(clone_value).collect::<Result<_>>()?),
        Value::Map(map) => Value::Map(
            map.iter()
                .map(|(key, item)| Ok((key.clone(), clone_value(item)?)))
                .collect::<Result<_>>()?,
        ),
        other => other.clone(),
    })
}
