//! Interned identifiers for entities, packages and qualified history keys.
//!
//! Entity ids, package ids and the `package::entry` keys used to scope undo
//! history are compared and hashed far more often than they are printed, so
//! they are stored as interned symbols.

use std::{
    fmt,
    sync::{Mutex, MutexGuard, OnceLock},
};

use string_interner::{DefaultStringInterner, DefaultSymbol};

/// Separator placed between the segments of a qualified identifier.
pub const QUALIFIER_SEPARATOR: &str = "::";

/// Process-wide string interner backing [`Id`].
static INTERNER: OnceLock<Mutex<DefaultStringInterner>> = OnceLock::new();

fn interner() -> MutexGuard<'static, DefaultStringInterner> {
    INTERNER
        .get_or_init(|| Mutex::new(DefaultStringInterner::new()))
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Interned identifier of an entity, a package, or a qualified entry.
///
/// # Examples
///
/// ```
/// use armillary_core::identifier::Id;
///
/// let package = Id::new("plant");
/// let entry = Id::new("pump_station");
///
/// let key = package.qualify(entry);
/// assert_eq!(key, "plant::pump_station");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Id(DefaultSymbol);

impl Id {
    /// Creates an `Id` from its textual form.
    pub fn new(name: &str) -> Self {
        Self(interner().get_or_intern(name))
    }

    /// Joins this identifier and `child` with [`QUALIFIER_SEPARATOR`].
    ///
    /// Used to scope an entry id by the package that owns it, so that two
    /// packages holding an entry with the same id keep separate histories.
    pub fn qualify(&self, child: Id) -> Self {
        let mut interner = interner();
        let qualified = {
            let parent = interner.resolve(self.0).unwrap_or_default();
            let child = interner.resolve(child.0).unwrap_or_default();
            format!("{parent}{QUALIFIER_SEPARATOR}{child}")
        };
        Self(interner.get_or_intern(qualified))
    }

    /// Returns `true` for the empty identifier.
    pub fn is_empty(&self) -> bool {
        self == ""
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let interner = interner();
        f.write_str(interner.resolve(self.0).unwrap_or_default())
    }
}

impl From<&str> for Id {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<&String> for Id {
    fn from(name: &String) -> Self {
        Self::new(name)
    }
}

impl PartialEq<str> for Id {
    /// Allows direct comparison with string slices: `id == "valve_1"`.
    fn eq(&self, other: &str) -> bool {
        interner().resolve(self.0) == Some(other)
    }
}

impl PartialEq<&str> for Id {
    fn eq(&self, other: &&str) -> bool {
        self == *other
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_text_same_id() {
        let a = Id::new("valve_1");
        let b = Id::new("valve_1");
        let c = Id::new("valve_2");

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a, "valve_1");
    }

    #[test]
    fn test_qualify() {
        let package = Id::new("plant");
        let first = package.qualify(Id::new("boiler"));
        let second = package.qualify(Id::new("chiller"));

        assert_ne!(first, second);
        assert_eq!(first, "plant::boiler");
        assert_eq!(second, "plant::chiller");
    }

    #[test]
    fn test_qualify_is_not_commutative() {
        let a = Id::new("a");
        let b = Id::new("b");
        assert_ne!(a.qualify(b), b.qualify(a));
    }

    #[test]
    fn test_display() {
        let id = Id::new("display_me");
        assert_eq!(format!("{id}"), "display_me");
        assert_eq!(id.to_string(), "display_me");
    }

    #[test]
    fn test_empty() {
        assert!(Id::new("").is_empty());
        assert!(!Id::new("x").is_empty());
    }

    #[test]
    fn test_usable_as_map_key() {
        use std::collections::HashMap;

        let mut map = HashMap::new();
        map.insert(Id::new("k1"), 1);
        map.insert(Id::new("k2"), 2);

        assert_eq!(map.get(&Id::from("k1")), Some(&1));
        assert_eq!(map.len(), 2);
    }
}
