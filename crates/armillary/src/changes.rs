//! Undo/redo history per trackable entry.
//!
//! Every edit goes through [`ChangeManager::apply_change`], which runs the
//! change, propagates it up the tree and records the `(undo, redo)` pair under
//! the tracking key of the edited entity's nearest trackable entry. Each key
//! owns a bounded stack of records and a cursor separating applied records
//! from redoable ones.
//!
//! # Example
//!
//! ```
//! use std::rc::Rc;
//!
//! use armillary::{
//!     changes::ChangeManager,
//!     config::HistoryConfig,
//!     package::PackageContainer,
//! };
//! use armillary_core::{
//!     class::{ClassReference, RealClass},
//!     fields,
//!     identifier::Id,
//!     value::Value,
//! };
//!
//! let sheet = ClassReference::real(
//!     Rc::new(RealClass::new("Sheet").with_field("title", "").trackable()),
//!     Id::new("lib"),
//! )
//! .unwrap()
//! .create_smart_object(fields! { "id" => "main" })
//! .unwrap();
//! let package = PackageContainer::new("plant", vec![Value::from(sheet.clone())]).unwrap();
//!
//! let manager = ChangeManager::new(&HistoryConfig::default());
//! let (redo_target, undo_target) = (sheet.clone(), sheet.clone());
//! manager
//!     .apply_change(
//!         move |_redo| {
//!             redo_target.set_field("title", "Pumps")?;
//!             Ok(redo_target.clone())
//!         },
//!         move || {
//!             undo_target.set_field("title", "")?;
//!             Ok(undo_target.clone())
//!         },
//!     )
//!     .unwrap();
//!
//! let key = sheet.tracking_key().unwrap();
//! assert!(manager.can_undo(key));
//! manager.apply_undo(key).unwrap();
//! assert!(!package.is_dirty().unwrap());
//! ```

use std::{
    cell::RefCell,
    collections::{HashMap, VecDeque},
    fmt,
    rc::Rc,
};

use log::{debug, trace, warn};

use armillary_core::{
    entity::Entity,
    error::{KernelError, Result},
    identifier::Id,
    propagation::{ChangeSink, SizeBinding},
};

use crate::config::HistoryConfig;

/// Applies a change; the flag is `true` when the change is being redone.
pub type ChangeFn = Rc<dyn Fn(bool) -> Result<Entity>>;
/// Reverts a change.
pub type UndoFn = Rc<dyn Fn() -> Result<Entity>>;

/// Which history moves are currently possible for an entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Availability {
    pub can_undo: bool,
    pub can_redo: bool,
}

/// Receiver of edge-triggered history and sync notifications.
///
/// Every method defaults to doing nothing.
pub trait ChangeObserver {
    /// Undo or redo availability of `entry_id` changed.
    fn availability_changed(&self, _entry_id: Id, _availability: Availability) {}

    /// `entry_id` became dirty (`false`) or returned to its saved state (`true`).
    fn sync_state_changed(&self, _entry_id: Id, _in_sync: bool) {}
}

struct Operation {
    undo: UndoFn,
    redo: ChangeFn,
}

#[derive(Default)]
struct History {
    ops: VecDeque<Operation>,
    /// Number of applied records; records at and after it are redoable.
    cursor: usize,
}

impl History {
    fn availability(&self) -> Availability {
        Availability {
            can_undo: self.cursor > 0,
            can_redo: self.cursor < self.ops.len(),
        }
    }
}

/// Per-entry undo/redo stacks with change propagation.
pub struct ChangeManager {
    limit: usize,
    histories: RefCell<HashMap<Id, History>>,
    published: RefCell<HashMap<Id, Availability>>,
    in_sync: RefCell<HashMap<Id, bool>>,
    observer: Option<Rc<dyn ChangeObserver>>,
    size_binding: Option<Rc<dyn SizeBinding>>,
}

impl fmt::Debug for ChangeManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChangeManager")
            .field("limit", &self.limit)
            .field("entries", &self.histories.borrow().len())
            .finish()
    }
}

impl ChangeManager {
    pub fn new(config: &HistoryConfig) -> Self {
        Self {
            limit: config.limit(),
            histories: RefCell::default(),
            published: RefCell::default(),
            in_sync: RefCell::default(),
            observer: None,
            size_binding: None,
        }
    }

    pub fn with_observer(mut self, observer: Rc<dyn ChangeObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Installs the rendering hook consulted while changes trickle up.
    pub fn with_size_binding(mut self, binding: Rc<dyn SizeBinding>) -> Self {
        self.size_binding = Some(binding);
        self
    }

    // =========================================================================
    // Recording
    // =========================================================================

    /// Runs `change` once, propagates it and records it for undo.
    ///
    /// `change` must return the root of the subtree it edited. It is called
    /// with `false` here and with `true` on every redo.
    ///
    /// # Errors
    ///
    /// Propagates errors from `change` and from change propagation. Returns
    /// [`KernelError::HistoryMisuse`] if the edited entity has no trackable
    /// entry to record the change under; `undo` has then already reverted it.
    pub fn apply_change<C, U>(&self, change: C, undo: U) -> Result<Entity>
    where
        C: Fn(bool) -> Result<Entity> + 'static,
        U: Fn() -> Result<Entity> + 'static,
    {
        let root = change(false)?;
        root.trickle_up_change(self, true)?;
        let Some(key) = root.tracking_key() else {
            debug!(id:% = root.id(); "Reverting change with no trackable entry");
            undo()?.trickle_up_change(self, true)?;
            return Err(KernelError::history(
                root.id(),
                "the changed entity has no trackable entry",
            ));
        };
        self.register_op(key, Rc::new(undo), Rc::new(change));
        Ok(root)
    }

    /// Records an `(undo, redo)` pair for `key`, discarding redoable records.
    pub fn register_op(&self, key: Id, undo: UndoFn, redo: ChangeFn) {
        {
            let mut histories = self.histories.borrow_mut();
            let history = histories.entry(key).or_default();
            history.ops.truncate(history.cursor);
            history.ops.push_back(Operation { undo, redo });
            while history.ops.len() > self.limit {
                history.ops.pop_front();
            }
            history.cursor = history.ops.len();
            trace!(key:%, depth = history.cursor; "Registered operation");
        }
        self.publish_availability(key);
    }

    // =========================================================================
    // Moving through history
    // =========================================================================

    /// Reverts the most recent applied record of `key`.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError::HistoryMisuse`] if `key` has no history or
    /// nothing left to undo. Errors from the undo function leave the history
    /// unchanged.
    pub fn apply_undo(&self, key: Id) -> Result<Entity> {
        let undo = {
            let histories = self.histories.borrow();
            let history = histories
                .get(&key)
                .ok_or_else(|| KernelError::history(key, "no history recorded"))?;
            let Some(cursor) = history.cursor.checked_sub(1) else {
                return Err(KernelError::history(key, "nothing to undo"));
            };
            Rc::clone(&history.ops[cursor].undo)
        };

        let root = undo()?;
        self.move_cursor(key, false);
        root.trickle_up_change(self, true)?;
        debug!(key:%; "Undid operation");
        Ok(root)
    }

    /// Re-applies the next redoable record of `key`.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError::HistoryMisuse`] if `key` has no history or
    /// nothing left to redo. Errors from the redo function leave the history
    /// unchanged.
    pub fn apply_redo(&self, key: Id) -> Result<Entity> {
        let redo = {
            let histories = self.histories.borrow();
            let history = histories
                .get(&key)
                .ok_or_else(|| KernelError::history(key, "no history recorded"))?;
            let Some(operation) = history.ops.get(history.cursor) else {
                return Err(KernelError::history(key, "nothing to redo"));
            };
            Rc::clone(&operation.redo)
        };

        let root = redo(true)?;
        self.move_cursor(key, true);
        root.trickle_up_change(self, true)?;
        debug!(key:%; "Redid operation");
        Ok(root)
    }

    fn move_cursor(&self, key: Id, forward: bool) {
        if let Some(history) = self.histories.borrow_mut().get_mut(&key) {
            if forward {
                history.cursor = (history.cursor + 1).min(history.ops.len());
            } else {
                history.cursor = history.cursor.saturating_sub(1);
            }
        }
        self.publish_availability(key);
    }

    // =========================================================================
    // Queries and bookkeeping
    // =========================================================================

    pub fn availability(&self, key: Id) -> Availability {
        self.histories
            .borrow()
            .get(&key)
            .map(History::availability)
            .unwrap_or_default()
    }

    pub fn can_undo(&self, key: Id) -> bool {
        self.availability(key).can_undo
    }

    pub fn can_redo(&self, key: Id) -> bool {
        self.availability(key).can_redo
    }

    /// Drops the history of `key`.
    pub fn clear(&self, key: Id) {
        self.histories.borrow_mut().remove(&key);
        self.publish_availability(key);
        debug!(key:%; "Cleared history");
    }

    /// Re-evaluates the sync state of `entry` after it was saved.
    pub fn mark_saved(&self, entry: &Entity) -> Result<()> {
        let Some(key) = entry.tracking_key() else {
            return Ok(());
        };
        let in_sync = !entry.is_dirty()?;
        self.publish_sync(key, in_sync);
        Ok(())
    }

    /// Last published sync state of `key`; entries start in sync.
    pub fn is_in_sync(&self, key: Id) -> bool {
        self.in_sync.borrow().get(&key).copied().unwrap_or(true)
    }

    fn publish_availability(&self, key: Id) {
        let current = self.availability(key);
        let previous = self
            .published
            .borrow_mut()
            .insert(key, current)
            .unwrap_or_default();
        if previous != current {
            if let Some(observer) = &self.observer {
                observer.availability_changed(key, current);
            }
        }
    }

    fn publish_sync(&self, key: Id, in_sync: bool) {
        let previous = self.in_sync.borrow_mut().insert(key, in_sync).unwrap_or(true);
        if previous != in_sync {
            trace!(key:%, in_sync; "Sync state changed");
            if let Some(observer) = &self.observer {
                observer.sync_state_changed(key, in_sync);
            }
        }
    }
}

impl ChangeSink for ChangeManager {
    fn entry_changed(&self, entry: &Entity) {
        let Some(key) = entry.tracking_key() else {
            return;
        };
        match entry.is_dirty() {
            Ok(dirty) => self.publish_sync(key, !dirty),
            Err(err) => warn!(key:%, err:%; "Cannot evaluate sync state"),
        }
    }

    fn size_binding(&self) -> Option<&dyn SizeBinding> {
        self.size_binding.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use armillary_core::{
        class::{ClassReference, RealClass},
        fields,
        value::Value,
    };

    use super::*;
    use crate::package::PackageContainer;

    #[derive(Default)]
    struct Recorder {
        events: RefCell<Vec<String>>,
    }

    impl ChangeObserver for Recorder {
        fn availability_changed(&self, entry_id: Id, availability: Availability) {
            self.events.borrow_mut().push(format!(
                "{entry_id} undo={} redo={}",
                availability.can_undo, availability.can_redo
            ));
        }

        fn sync_state_changed(&self, entry_id: Id, in_sync: bool) {
            self.events
                .borrow_mut()
                .push(format!("{entry_id} in_sync={in_sync}"));
        }
    }

    struct Fixture {
        package: PackageContainer,
        valve: Entity,
        key: Id,
    }

    fn fixture() -> Fixture {
        let lib = Id::new("lib");
        let valve_class = ClassReference::real(Rc::new(RealClass::new("Valve").with_field("x", 0)), lib).unwrap();
        let sheet_class = ClassReference::real(
            Rc::new(
                RealClass::new("Sheet")
                    .with_field("items", Value::Array(vec![]))
                    .trackable(),
            ),
            lib,
        )
        .unwrap();

        let valve = valve_class.create_smart_object(fields! { "id" => "v" }).unwrap();
        let sheet = sheet_class
            .create_smart_object(fields! { "id" => "sheet", "items" => vec![Value::from(valve.clone())] })
            .unwrap();
        let package = PackageContainer::new("plant", vec![Value::from(sheet)]).unwrap();
        let key = valve.tracking_key().unwrap();
        Fixture { package, valve, key }
    }

    fn set_x(manager: &ChangeManager, valve: &Entity, value: i64) -> Result<Entity> {
        let previous = valve.field("x").unwrap_or_default();
        let (redo_target, undo_target) = (valve.clone(), valve.clone());
        manager.apply_change(
            move |_redo| {
                redo_target.set_field("x", value)?;
                Ok(redo_target.clone())
            },
            move || {
                undo_target.set_field("x", previous.clone())?;
                Ok(undo_target.clone())
            },
        )
    }

    #[test]
    fn test_key_is_package_qualified() {
        let f = fixture();
        assert_eq!(f.key, "plant::sheet");
        assert_eq!(f.package.root().tracking_key(), Some(Id::new("plant")));
    }

    #[test]
    fn test_undo_redo_round() {
        let f = fixture();
        let manager = ChangeManager::new(&HistoryConfig::default());
        let saved = f.package.root().compute_crc().unwrap();

        set_x(&manager, &f.valve, 5).unwrap();
        let changed = f.package.root().compute_crc().unwrap();
        assert_ne!(changed, saved);
        assert!(manager.can_undo(f.key));
        assert!(!manager.can_redo(f.key));

        manager.apply_undo(f.key).unwrap();
        assert_eq!(f.valve.field("x"), Some(Value::Int(0)));
        assert_eq!(f.package.root().compute_crc().unwrap(), saved);
        assert!(manager.can_redo(f.key));

        manager.apply_redo(f.key).unwrap();
        assert_eq!(f.valve.field("x"), Some(Value::Int(5)));
        assert_eq!(f.package.root().compute_crc().unwrap(), changed);
    }

    #[test]
    fn test_history_misuse() {
        let f = fixture();
        let manager = ChangeManager::new(&HistoryConfig::default());

        let err = manager.apply_undo(f.key).unwrap_err();
        assert_eq!(err.to_string(), "history error for entry `plant::sheet`: no history recorded");

        set_x(&manager, &f.valve, 1).unwrap();
        let err = manager.apply_redo(f.key).unwrap_err();
        assert!(err.to_string().contains("nothing to redo"));

        manager.apply_undo(f.key).unwrap();
        let err = manager.apply_undo(f.key).unwrap_err();
        assert!(err.to_string().contains("nothing to undo"));
    }

    #[test]
    fn test_change_without_trackable_entry() {
        let manager = ChangeManager::new(&HistoryConfig::default());
        let loose = ClassReference::real(Rc::new(RealClass::new("Loose").with_field("x", 0)), Id::new("lib"))
            .unwrap()
            .create_smart_object(fields! { "id" => "loose" })
            .unwrap();
        let crc = loose.compute_crc().unwrap();
        let err = set_x(&manager, &loose, 3).unwrap_err();
        assert!(matches!(err, KernelError::HistoryMisuse { .. }));
        assert_eq!(loose.field("x"), Some(Value::Int(0)));
        assert_eq!(loose.compute_crc().unwrap(), crc);
    }

    #[test]
    fn test_failing_undo_keeps_cursor() {
        let f = fixture();
        let manager = ChangeManager::new(&HistoryConfig::default());
        let fail = Rc::new(Cell::new(true));
        let (target, should_fail) = (f.valve.clone(), Rc::clone(&fail));
        let redo_target = f.valve.clone();
        manager
            .apply_change(
                move |_redo| {
                    redo_target.set_field("x", 9)?;
                    Ok(redo_target.clone())
                },
                move || {
                    if should_fail.get() {
                        return Err(KernelError::history("plant::sheet", "simulated failure"));
                    }
                    target.set_field("x", 0)?;
                    Ok(target.clone())
                },
            )
            .unwrap();

        assert!(manager.apply_undo(f.key).is_err());
        assert!(manager.can_undo(f.key));
        assert!(!manager.can_redo(f.key));

        fail.set(false);
        manager.apply_undo(f.key).unwrap();
        assert!(manager.can_redo(f.key));
    }

    #[test]
    fn test_limit_drops_oldest() {
        let f = fixture();
        let manager = ChangeManager::new(&HistoryConfig::new(2));
        for value in 1..=3 {
            set_x(&manager, &f.valve, value).unwrap();
        }

        manager.apply_undo(f.key).unwrap();
        manager.apply_undo(f.key).unwrap();
        assert_eq!(f.valve.field("x"), Some(Value::Int(1)));
        assert!(!manager.can_undo(f.key));
    }

    #[test]
    fn test_new_change_truncates_redo() {
        let f = fixture();
        let manager = ChangeManager::new(&HistoryConfig::default());
        set_x(&manager, &f.valve, 1).unwrap();
        set_x(&manager, &f.valve, 2).unwrap();
        manager.apply_undo(f.key).unwrap();
        assert!(manager.can_redo(f.key));

        set_x(&manager, &f.valve, 7).unwrap();
        assert!(!manager.can_redo(f.key));
        assert!(manager.apply_redo(f.key).is_err());
        assert_eq!(f.valve.field("x"), Some(Value::Int(7)));
    }

    #[test]
    fn test_observer_is_edge_triggered() {
        let f = fixture();
        let recorder = Rc::new(Recorder::default());
        let manager = ChangeManager::new(&HistoryConfig::default()).with_observer(recorder.clone());

        set_x(&manager, &f.valve, 1).unwrap();
        set_x(&manager, &f.valve, 2).unwrap();
        manager.apply_undo(f.key).unwrap();
        manager.apply_undo(f.key).unwrap();

        let events = recorder.events.borrow().clone();
        assert_eq!(
            events,
            vec![
                "plant::sheet in_sync=false",
                "plant in_sync=false",
                "plant::sheet undo=true redo=false",
                "plant::sheet undo=true redo=true",
                "plant::sheet undo=false redo=true",
                "plant::sheet in_sync=true",
                "plant in_sync=true",
            ]
        );
        assert!(manager.is_in_sync(f.key));
    }

    #[test]
    fn test_clear_and_mark_saved() {
        let f = fixture();
        let manager = ChangeManager::new(&HistoryConfig::default());
        set_x(&manager, &f.valve, 4).unwrap();
        assert!(!manager.is_in_sync(Id::new("plant")));

        f.package.save().unwrap();
        manager.mark_saved(f.package.root()).unwrap();
        assert!(manager.is_in_sync(Id::new("plant")));

        manager.clear(f.key);
        assert_eq!(manager.availability(f.key), Availability::default());
    }
}
