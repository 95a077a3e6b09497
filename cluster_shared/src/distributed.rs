//! Distributed objects.
//!
//! A distributed object is state that must exist identically on the master
//! and every slave. Each object tracks which of its fields changed since the
//! last replication in a [`DirtyMask`], and serializes exactly those fields.
//!
//! Field layout is declared once with [`distributed_fields!`]; the macro
//! generates both the pack and unpack direction from the same `(bit => field)`
//! list, so the two can never disagree on order or membership.
//!
//! Record layout produced by [`Distributed::pack`]:
//!
//! ```text
//! dirty_bits:u64, field… (only fields whose bit is set, in declaration order)
//! ```

use std::{
    any::Any,
    fmt,
    ops::{BitOr, BitOrAssign},
};

use serde::{Deserialize, Serialize};

use crate::{
    error::{ProtocolError, ProtocolResult},
    stream::ByteStream,
};

/// Network-wide object identity. `0` means not registered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectId(pub u64);

impl ObjectId {
    pub const UNDEFINED: ObjectId = ObjectId(0);

    pub fn is_defined(self) -> bool {
        self != Self::UNDEFINED
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Tag identifying a concrete distributed type on the wire.
pub type TypeTag = u32;

/// Set of changed fields. Bit 0 is reserved; concrete types use bits 1..=63.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct DirtyMask(u64);

impl DirtyMask {
    pub const NONE: DirtyMask = DirtyMask(0);
    /// Forces every field to be sent.
    pub const ALL: DirtyMask = DirtyMask(u64::MAX);

    /// Mask with a single field bit set. `index` must be in `1..=63`.
    pub const fn bit(index: u32) -> Self {
        DirtyMask(1 << index)
    }

    pub const fn from_bits(bits: u64) -> Self {
        DirtyMask(bits)
    }

    pub const fn bits(self) -> u64 {
        self.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub const fn is_all(self) -> bool {
        self.0 == u64::MAX
    }

    /// True if any bit of `other` is set in `self`.
    pub const fn intersects(self, other: DirtyMask) -> bool {
        self.0 & other.0 != 0
    }

    pub fn insert(&mut self, other: DirtyMask) {
        self.0 |= other.0;
    }
}

impl BitOr for DirtyMask {
    type Output = DirtyMask;

    fn bitor(self, rhs: Self) -> Self::Output {
        DirtyMask(self.0 | rhs.0)
    }
}

impl BitOrAssign for DirtyMask {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// Identity and dirty state embedded in every distributed object.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectCore {
    id: ObjectId,
    dirty: DirtyMask,
}

impl ObjectCore {
    pub fn id(&self) -> ObjectId {
        self.id
    }

    pub fn set_id(&mut self, id: ObjectId) {
        self.id = id;
    }

    pub fn dirty(&self) -> DirtyMask {
        self.dirty
    }

    pub fn mark(&mut self, bits: DirtyMask) {
        self.dirty |= bits;
    }

    pub fn clear(&mut self) {
        self.dirty = DirtyMask::NONE;
    }
}

/// A value that can be one field of a distributed object.
pub trait Field: Sized {
    fn write_field(&self, stream: &mut ByteStream);
    fn read_field(stream: &mut ByteStream) -> ProtocolResult<Self>;
}

macro_rules! primitive_field {
    ($ty:ty, $write:ident, $read:ident) => {
        impl Field for $ty {
            fn write_field(&self, stream: &mut ByteStream) {
                stream.$write(*self);
            }

            fn read_field(stream: &mut ByteStream) -> ProtocolResult<Self> {
                stream.$read()
            }
        }
    };
}

primitive_field!(u8, write_u8, read_u8);
primitive_field!(u16, write_u16, read_u16);
primitive_field!(u32, write_u32, read_u32);
primitive_field!(u64, write_u64, read_u64);
primitive_field!(i32, write_i32, read_i32);
primitive_field!(i64, write_i64, read_i64);
primitive_field!(f32, write_f32, read_f32);
primitive_field!(f64, write_f64, read_f64);
primitive_field!(bool, write_bool, read_bool);

impl Field for String {
    fn write_field(&self, stream: &mut ByteStream) {
        stream.write_str(self);
    }

    fn read_field(stream: &mut ByteStream) -> ProtocolResult<Self> {
        stream.read_string()
    }
}

impl Field for ObjectId {
    fn write_field(&self, stream: &mut ByteStream) {
        stream.write_u64(self.0);
    }

    fn read_field(stream: &mut ByteStream) -> ProtocolResult<Self> {
        Ok(ObjectId(stream.read_u64()?))
    }
}

impl<T: Field> Field for Vec<T> {
    fn write_field(&self, stream: &mut ByteStream) {
        stream.write_seq(self, |s, item| item.write_field(s));
    }

    fn read_field(stream: &mut ByteStream) -> ProtocolResult<Self> {
        stream.read_seq(T::read_field)
    }
}

/// Replicated state with per-field dirty tracking.
///
/// Implement through [`distributed_fields!`] rather than by hand.
pub trait Distributed: Any + Send {
    fn type_tag(&self) -> TypeTag;
    fn core(&self) -> &ObjectCore;
    fn core_mut(&mut self) -> &mut ObjectCore;

    /// Writes the fields selected by `bits`.
    fn pack_fields(&self, stream: &mut ByteStream, bits: DirtyMask);

    /// Reads the fields selected by `bits`, in the same order.
    fn unpack_fields(&mut self, stream: &mut ByteStream, bits: DirtyMask) -> ProtocolResult<()>;

    /// Runs after a successful unpack; used for one-time "created" effects.
    fn on_unpacked(&mut self, _bits: DirtyMask) {}

    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;

    fn id(&self) -> ObjectId {
        self.core().id()
    }

    fn dirty(&self) -> DirtyMask {
        self.core().dirty()
    }

    fn mark_dirty(&mut self, bits: DirtyMask) {
        self.core_mut().mark(bits);
    }

    fn clear_dirty(&mut self) {
        self.core_mut().clear();
    }

    /// Writes `bits` followed by the selected fields.
    fn pack(&self, stream: &mut ByteStream, bits: DirtyMask) {
        stream.write_u64(bits.bits());
        self.pack_fields(stream, bits);
    }

    /// Reads a dirty word and the fields it selects. Returns the word.
    fn unpack(&mut self, stream: &mut ByteStream) -> ProtocolResult<DirtyMask> {
        let bits = DirtyMask::from_bits(stream.read_u64()?);
        self.unpack_fields(stream, bits)?;
        self.on_unpacked(bits);
        Ok(bits)
    }
}

/// Checks that an incoming record is routed to the matching object.
pub fn check_identity(object: &dyn Distributed, record: ObjectId) -> ProtocolResult<()> {
    if object.id() != record {
        return Err(ProtocolError::IdMismatch {
            record,
            object: object.id(),
        });
    }
    Ok(())
}

/// Implements [`Distributed`] from one declarative field list.
///
/// ```ignore
/// distributed_fields! {
///     Transform, tag = TRANSFORM_TAG, core = core, on_unpacked = realize,
///     {
///         Transform::NAME => name,
///         Transform::POSITION => position,
///     }
/// }
/// ```
#[macro_export]
macro_rules! distributed_fields {
    (
        $ty:ty, tag = $tag:expr, core = $core:ident $(, on_unpacked = $hook:ident)?,
        { $($bit:expr => $field:ident),* $(,)? }
    ) => {
        impl $crate::distributed::Distributed for $ty {
            fn type_tag(&self) -> $crate::distributed::TypeTag {
                $tag
            }

            fn core(&self) -> &$crate::distributed::ObjectCore {
                &self.$core
            }

            fn core_mut(&mut self) -> &mut $crate::distributed::ObjectCore {
                &mut self.$core
            }

            fn pack_fields(
                &self,
                stream: &mut $crate::stream::ByteStream,
                bits: $crate::distributed::DirtyMask,
            ) {
                $(
                    if bits.intersects($bit) {
                        $crate::distributed::Field::write_field(&self.$field, stream);
                    }
                )*
            }

            fn unpack_fields(
                &mut self,
                stream: &mut $crate::stream::ByteStream,
                bits: $crate::distributed::DirtyMask,
            ) -> $crate::error::ProtocolResult<()> {
                $(
                    if bits.intersects($bit) {
                        self.$field = $crate::distributed::Field::read_field(stream)?;
                    }
                )*
                Ok(())
            }

            #[allow(unused_variables)]
            fn on_unpacked(&mut self, bits: $crate::distributed::DirtyMask) {
                $( self.$hook(bits); )?
            }

            fn as_any(&self) -> &dyn ::std::any::Any {
                self
            }

            fn as_any_mut(&mut self) -> &mut dyn ::std::any::Any {
                self
            }
        }
    };
}
