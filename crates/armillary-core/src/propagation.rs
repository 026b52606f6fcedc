//! Collaborator hooks invoked while a change trickles up the containment tree.
//!
//! The kernel never computes visual size and never decides how dirty state is
//! presented. [`Entity::trickle_up_change`](crate::entity::Entity::trickle_up_change)
//! reports both through a [`ChangeSink`].

use crate::entity::Entity;

/// Visual extent of a trackable container, as measured by the rendering layer.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Size {
    pub width: f32,
    pub height: f32,
}

impl Size {
    pub fn new(width: f32, height: f32) -> Self {
        Self { width, height }
    }
}

/// Rendering-layer hook used to keep container sizes in step with content.
pub trait SizeBinding {
    /// Measures `entity` in its current state.
    fn size(&self, entity: &Entity) -> Size;

    /// Called when a trackable container's measured size changed.
    fn bind_size_changes(&self, entity: &Entity, old: Size, new: Size);
}

/// Receiver of change notifications for trackable entries.
pub trait ChangeSink {
    /// Called when the CRC of a trackable entry changed.
    fn entry_changed(&self, entry: &Entity);

    /// Size hook consulted when a change is propagated with a size hint.
    fn size_binding(&self) -> Option<&dyn SizeBinding> {
        None
    }
}

/// A [`ChangeSink`] that ignores every notification.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl ChangeSink for NoopSink {
    fn entry_changed(&self, _entry: &Entity) {}
}
