//! Value object trait: equality by value, not identity.

/// Marker trait for value objects.
///
/// Value objects are immutable and compared by their attribute values; two
/// value objects with the same values are equal. To "modify" one, create a
/// new value. `Credits { amount: 100 }` is a value object; a `Course` with an
/// id is an entity.
pub trait ValueObject: Clone + PartialEq + core::fmt::Debug {}
