//! Armillary Core Types and Algorithms
//!
//! This crate provides the object-persistence kernel shared by every Armillary
//! package. It includes:
//!
//! - **Identifiers**: Efficient string-interned identifiers ([`identifier::Id`])
//! - **Values**: The closed set of field shapes ([`value::Value`])
//! - **Classes**: Real classes, pseudo-class templates and their references
//!   ([`class`] module)
//! - **Entities**: The tree node with CRC, clone and change propagation
//!   ([`entity::Entity`])
//! - **Portable form**: JSON encoding and decoding ([`portable`] module)
//! - **Errors**: The kernel error taxonomy ([`error::KernelError`])

pub mod class;
pub mod crc;
pub mod entity;
pub mod error;
pub mod identifier;
pub mod portable;
pub mod propagation;
pub mod value;
