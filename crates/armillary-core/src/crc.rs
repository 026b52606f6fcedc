//! Structural CRC folding.
//!
//! [`CrcFolder`] wraps a CRC-32 hasher with one method per primitive shape.
//! Every fold is prefixed by a shape tag and every variable-length item by its
//! length, so distinct structures never feed the hasher the same byte stream.

use crc32fast::Hasher;

#[derive(Clone, Copy)]
#[repr(u8)]
enum ShapeTag {
    Null = 0,
    Bool = 1,
    Int = 2,
    Float = 3,
    String = 4,
    Array = 5,
    Map = 6,
    Entity = 7,
    Class = 8,
    Field = 9,
}

/// Running CRC-32 over a sequence of tagged folds.
#[derive(Default)]
pub struct CrcFolder {
    hasher: Hasher,
}

impl CrcFolder {
    pub fn new() -> Self {
        Self::default()
    }

    fn tag(&mut self, tag: ShapeTag) {
        self.hasher.update(&[tag as u8]);
    }

    fn len(&mut self, len: usize) {
        self.hasher.update(&(len as u64).to_le_bytes());
    }

    /// Folds a field name ahead of its value.
    pub fn field(&mut self, name: &str) {
        self.tag(ShapeTag::Field);
        self.raw_str(name);
    }

    pub fn null(&mut self) {
        self.tag(ShapeTag::Null);
    }

    pub fn bool(&mut self, value: bool) {
        self.tag(ShapeTag::Bool);
        self.hasher.update(&[u8::from(value)]);
    }

    pub fn int(&mut self, value: i64) {
        self.tag(ShapeTag::Int);
        self.hasher.update(&value.to_le_bytes());
    }

    /// Folds a float by its bit pattern. Callers reject non-finite values first.
    pub fn float(&mut self, value: f64) {
        self.tag(ShapeTag::Float);
        self.hasher.update(&value.to_bits().to_le_bytes());
    }

    pub fn str(&mut self, value: &str) {
        self.tag(ShapeTag::String);
        self.raw_str(value);
    }

    /// Opens an array of `len` elements; the elements are folded afterwards.
    pub fn array(&mut self, len: usize) {
        self.tag(ShapeTag::Array);
        self.len(len);
    }

    /// Opens a map of `len` pairs; each key is folded with [`CrcFolder::str`]
    /// ahead of its value.
    pub fn map(&mut self, len: usize) {
        self.tag(ShapeTag::Map);
        self.len(len);
    }

    /// Folds the already computed CRC of a child entity.
    pub fn entity(&mut self, crc: u32) {
        self.tag(ShapeTag::Entity);
        self.hasher.update(&crc.to_le_bytes());
    }

    /// Folds a class reference by its declared type name.
    pub fn class(&mut self, type_name: &str) {
        self.tag(ShapeTag::Class);
        self.raw_str(type_name);
    }

    fn raw_str(&mut self, value: &str) {
        self.len(value.len());
        self.hasher.update(value.as_bytes());
    }

    pub fn finish(self) -> u32 {
        self.hasher.finalize()
    }
}
