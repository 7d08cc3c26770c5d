//! Densely numbered entity references.
//!
//! Every op, block, spill class and relocation in bjit is addressed by a small
//! index into a per-procedure or per-module arena rather than by a native
//! pointer. This module defines the `EntityRef` trait, the `entity_impl!`
//! macro that stamps out a concrete reference type backed by a fixed-width
//! integer, and the `PrimaryMap`/`SecondaryMap` containers that use those
//! references as keys.
//!
//! Keeping entities as indices instead of pointers means the IR graph -
//! including its back-edges through phi alternatives - can be cloned,
//! serialized, or grown without invalidating any reference, and keeps each
//! `Op` record fixed size regardless of which architecture is targeted.

#![deny(missing_docs)]

mod iter;
mod keys;
mod map;
mod packed_option;
mod primary_map;

pub use crate::iter::{Iter, IterMut};
pub use crate::keys::Keys;
pub use crate::map::SecondaryMap;
pub use crate::packed_option::PackedOption;
pub use crate::primary_map::PrimaryMap;

/// A type that can be used as a key in a dense entity map.
///
/// An entity reference is a thin wrapper around a fixed-width integer. It is
/// required to round-trip through `new`/`index` so that `PrimaryMap` can use
/// the index as a plain vector offset.
pub trait EntityRef: Copy + Eq {
    /// Create a new entity reference from a linear index.
    fn new(index: usize) -> Self;

    /// Get the index of this reference.
    fn index(self) -> usize;
}

/// Generate an `EntityRef` implementation for a type wrapping an integer.
///
/// The `$backing` type determines both the in-memory width of the reference
/// and its maximum value; bjit uses `u16` for `Op` so arenas are capped at
/// 65535 entries per the builder's recoverable `too-many-ops` condition, and
/// `u32` for entities that don't need that bound.
#[macro_export]
macro_rules! entity_impl {
    ($entity:ident, $backing:ty, $prefix:expr) => {
        impl $crate::EntityRef for $entity {
            #[inline]
            fn new(index: usize) -> Self {
                debug_assert!(index < (<$backing>::max_value() as usize));
                $entity(index as $backing)
            }

            #[inline]
            fn index(self) -> usize {
                self.0 as usize
            }
        }

        impl $entity {
            /// Create a reference from its raw numeric value.
            #[allow(dead_code)]
            pub fn from_u32(raw: u32) -> Self {
                $entity(raw as $backing)
            }

            /// Return the raw numeric value of this reference.
            #[allow(dead_code)]
            pub fn as_u32(self) -> u32 {
                u32::from(self.0)
            }

            /// A reserved value standing in for "no entity". Arenas never
            /// allocate an entity at this index.
            #[allow(dead_code)]
            pub const RESERVED: $entity = $entity(<$backing>::max_value());

            #[allow(dead_code)]
            fn is_reserved(self) -> bool {
                self.0 == <$backing>::max_value()
            }
        }

        impl ::core::fmt::Display for $entity {
            fn fmt(&self, f: &mut ::core::fmt::Formatter) -> ::core::fmt::Result {
                write!(f, concat!($prefix, "{}"), self.0)
            }
        }

        impl ::core::fmt::Debug for $entity {
            fn fmt(&self, f: &mut ::core::fmt::Formatter) -> ::core::fmt::Result {
                (self as &dyn ::core::fmt::Display).fmt(f)
            }
        }
    };
    ($entity:ident, $prefix:expr) => {
        entity_impl!($entity, u32, $prefix);
    };
}
