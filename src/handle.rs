//! The 32-bit tagged value that every slot name and slot value in the store
//! is made of. See `SPEC_FULL.md` §C for the chosen bit layout.

use std::fmt;

/// Low two bits of a [`Handle`]'s word.
const TAG_MASK: u32 = 0b11;
const TAG_REF: u32 = 0b00;
const TAG_INDEX: u32 = 0b01;
const TAG_INTEGER: u32 = 0b10;
const TAG_FLOAT: u32 = 0b11;

/// Bits `[31:30]` of a ref-tagged handle: which heap (if any) the offset
/// counts into.
const SCOPE_MASK: u32 = 0b11 << 30;
const SCOPE_SPECIAL: u32 = 0b00 << 30;
const SCOPE_LOCAL: u32 = 0b01 << 30;
const SCOPE_GLOBAL: u32 = 0b10 << 30;

/// Offset payload for ref-tagged handles: bits `[29:2]`, 28 bits.
const REF_OFFSET_BITS: u32 = 28;
const REF_OFFSET_MASK: u32 = (1 << REF_OFFSET_BITS) - 1;

/// Payload for index/integer/float-tagged handles: bits `[31:2]`, 30 bits.
const WIDE_PAYLOAD_BITS: u32 = 30;
const WIDE_PAYLOAD_MASK: u32 = (1 << WIDE_PAYLOAD_BITS) - 1;

/// Smallest and largest inline integer, per §4.1: `[-2^29, 2^29)`.
pub const MIN_INT: i32 = -(1 << 29);
pub const MAX_INT: i32 = (1 << 29) - 1;

/// Special-constant ids, packed into the 28-bit payload of a
/// `Scope::Special` ref handle. Order here is arbitrary; what matters is that
/// `Special` scope sorts before `Local`/`Global` under [`Handle::rank`], so
/// `id`/`isa`/`is` collate before any other name handle regardless of which
/// special id they get.
const SPECIAL_NIL: u32 = 0;
const SPECIAL_ERROR: u32 = 1;
const SPECIAL_ID: u32 = 2;
const SPECIAL_ISA: u32 = 3;
const SPECIAL_IS: u32 = 4;

/// A 32-bit tagged word: either an immediate value (integer, float, index) or
/// a reference into a heap (local, global, or one of the handful of reserved
/// special constants used as slot names).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Handle(u32);

impl Handle {
    #[inline]
    pub const fn from_raw(word: u32) -> Self {
        Handle(word)
    }

    #[inline]
    pub const fn raw(self) -> u32 {
        self.0
    }

    // -- constructors ------------------------------------------------------

    #[inline]
    pub const fn nil() -> Self {
        Handle(SCOPE_SPECIAL | (SPECIAL_NIL << 2) | TAG_REF)
    }

    #[inline]
    pub const fn error() -> Self {
        Handle(SCOPE_SPECIAL | (SPECIAL_ERROR << 2) | TAG_REF)
    }

    #[inline]
    pub const fn id() -> Self {
        Handle(SCOPE_SPECIAL | (SPECIAL_ID << 2) | TAG_REF)
    }

    #[inline]
    pub const fn isa() -> Self {
        Handle(SCOPE_SPECIAL | (SPECIAL_ISA << 2) | TAG_REF)
    }

    #[inline]
    pub const fn is() -> Self {
        Handle(SCOPE_SPECIAL | (SPECIAL_IS << 2) | TAG_REF)
    }

    /// `true` is just the integer `1`; `false` is `0`. There is no separate
    /// boolean tag (the original doesn't have one either, it reuses
    /// integers).
    #[inline]
    pub fn true_() -> Self {
        Handle::integer(1).expect("1 fits in 30 bits")
    }

    #[inline]
    pub fn false_() -> Self {
        Handle::integer(0).expect("0 fits in 30 bits")
    }

    #[inline]
    pub fn zero() -> Self {
        Handle::integer(0).expect("0 fits in 30 bits")
    }

    #[inline]
    pub fn one() -> Self {
        Handle::integer(1).expect("1 fits in 30 bits")
    }

    /// Constructs an inline integer handle. Fails fast (returns `None`) if
    /// `value` is out of `[-2^29, 2^29)`; per §4.1 the caller is responsible
    /// for storing out-of-range values as a float or rejecting them.
    #[inline]
    pub fn integer(value: i32) -> Option<Self> {
        if !(MIN_INT..=MAX_INT).contains(&value) {
            return None;
        }
        let bits = (value as u32) & WIDE_PAYLOAD_MASK;
        Some(Handle((bits << 2) | TAG_INTEGER))
    }

    /// Constructs a float handle, truncating the low two mantissa bits of
    /// `value`'s IEEE-754 bit pattern. This loses precision (documented, see
    /// `SPEC_FULL.md` §C / open question (a)) but preserves sign, exponent,
    /// NaN-ness and infinities exactly, since only mantissa bits are
    /// dropped.
    #[inline]
    pub fn float(value: f32) -> Self {
        let bits = value.to_bits();
        let truncated = bits >> 2;
        Handle((truncated << 2) | TAG_FLOAT)
    }

    /// Constructs a handle directly from a pre-shifted 30-bit float bit
    /// pattern, as carried by the wire codec's FLOAT tag argument.
    #[inline]
    pub fn from_float_bits(arg: u32) -> Self {
        Handle(((arg & WIDE_PAYLOAD_MASK) << 2) | TAG_FLOAT)
    }

    /// Constructs a transient index handle (codec reference-table index, or
    /// feature-structure node index). Fails if `value` doesn't fit in 30
    /// unsigned bits.
    #[inline]
    pub fn index(value: u32) -> Option<Self> {
        if value > WIDE_PAYLOAD_MASK {
            return None;
        }
        Some(Handle((value << 2) | TAG_INDEX))
    }

    #[inline]
    pub(crate) fn local_ref(offset: u32) -> Self {
        debug_assert!(offset <= REF_OFFSET_MASK, "local heap offset overflow");
        Handle(SCOPE_LOCAL | ((offset & REF_OFFSET_MASK) << 2) | TAG_REF)
    }

    #[inline]
    pub(crate) fn global_ref(offset: u32) -> Self {
        debug_assert!(offset <= REF_OFFSET_MASK, "global heap offset overflow");
        Handle(SCOPE_GLOBAL | ((offset & REF_OFFSET_MASK) << 2) | TAG_REF)
    }

    // -- predicates ----------------------------------------------------------

    #[inline]
    pub const fn is_int(self) -> bool {
        self.0 & TAG_MASK == TAG_INTEGER
    }

    #[inline]
    pub const fn is_float(self) -> bool {
        self.0 & TAG_MASK == TAG_FLOAT
    }

    #[inline]
    pub const fn is_index(self) -> bool {
        self.0 & TAG_MASK == TAG_INDEX
    }

    #[inline]
    pub const fn is_ref(self) -> bool {
        self.0 & TAG_MASK == TAG_REF
    }

    #[inline]
    pub const fn is_local_ref(self) -> bool {
        self.is_ref() && self.0 & SCOPE_MASK == SCOPE_LOCAL
    }

    #[inline]
    pub const fn is_global_ref(self) -> bool {
        self.is_ref() && self.0 & SCOPE_MASK == SCOPE_GLOBAL
    }

    #[inline]
    const fn is_special_scope(self) -> bool {
        self.is_ref() && self.0 & SCOPE_MASK == SCOPE_SPECIAL
    }

    #[inline]
    const fn special_id(self) -> u32 {
        (self.0 & REF_OFFSET_MASK << 2) >> 2
    }

    #[inline]
    pub const fn is_special(self) -> bool {
        self.is_special_scope()
    }

    #[inline]
    pub const fn is_nil(self) -> bool {
        self.is_special_scope() && self.special_id() == SPECIAL_NIL
    }

    #[inline]
    pub const fn is_error(self) -> bool {
        self.is_special_scope() && self.special_id() == SPECIAL_ERROR
    }

    #[inline]
    pub const fn is_id(self) -> bool {
        self.is_special_scope() && self.special_id() == SPECIAL_ID
    }

    #[inline]
    pub const fn is_isa(self) -> bool {
        self.is_special_scope() && self.special_id() == SPECIAL_ISA
    }

    #[inline]
    pub const fn is_is(self) -> bool {
        self.is_special_scope() && self.special_id() == SPECIAL_IS
    }

    /// True/false/zero/one are plain integers; these helpers just name the
    /// common comparisons.
    #[inline]
    pub fn is_true(self) -> bool {
        self == Handle::true_()
    }

    #[inline]
    pub fn is_false(self) -> bool {
        self == Handle::false_()
    }

    // -- extractors ------------------------------------------------------

    #[inline]
    pub fn as_int(self) -> Option<i32> {
        if !self.is_int() {
            return None;
        }
        let raw = self.0 >> 2;
        // sign-extend from 30 bits
        let shift = 32 - WIDE_PAYLOAD_BITS;
        Some(((raw << shift) as i32) >> shift)
    }

    #[inline]
    pub fn as_float(self) -> Option<f32> {
        if !self.is_float() {
            return None;
        }
        Some(f32::from_bits((self.0 >> 2) << 2))
    }

    #[inline]
    pub fn as_index(self) -> Option<u32> {
        if !self.is_index() {
            return None;
        }
        Some(self.0 >> 2)
    }

    /// Byte offset into the scope's heap. Only meaningful for local/global
    /// refs (not specials).
    #[inline]
    pub(crate) fn ref_offset(self) -> u32 {
        debug_assert!(self.is_local_ref() || self.is_global_ref());
        (self.0 >> 2) & REF_OFFSET_MASK
    }

    /// Canonical hash / sort key: the raw word rotated right by two bits, so
    /// the low tag bits move to the top. This is the exact formula from the
    /// original's `HandleRank`. For ref-tagged handles, the tag's two zero
    /// bits land at the very top of the rotated word, and the scope bits
    /// land just below them — which is what makes `Special` scope (used by
    /// `id`/`isa`/`is`/`nil`/`error`) sort ahead of `Local`/`Global` refs,
    /// which in turn sort ahead of any Index/Integer/Float handle.
    #[inline]
    pub const fn rank(self) -> u32 {
        self.0.rotate_right(2)
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_nil() {
            write!(f, "nil")
        } else if self.is_error() {
            write!(f, "#error")
        } else if self.is_id() {
            write!(f, "id")
        } else if self.is_isa() {
            write!(f, "isa")
        } else if self.is_is() {
            write!(f, "is")
        } else if self.is_int() {
            write!(f, "{}", self.as_int().unwrap())
        } else if self.is_float() {
            write!(f, "{}", self.as_float().unwrap())
        } else if self.is_index() {
            write!(f, "#{}", self.as_index().unwrap())
        } else if self.is_local_ref() {
            write!(f, "@local+{:#x}", self.ref_offset())
        } else {
            write!(f, "@global+{:#x}", self.ref_offset())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn nil_is_not_int_float_index_or_data_ref() {
        let h = Handle::nil();
        assert!(h.is_nil());
        assert!(h.is_special());
        assert!(!h.is_int());
        assert!(!h.is_float());
        assert!(!h.is_index());
        assert!(!h.is_local_ref());
        assert!(!h.is_global_ref());
    }

    #[rstest]
    #[case(0)]
    #[case(1)]
    #[case(-1)]
    #[case(MAX_INT)]
    #[case(MIN_INT)]
    fn integer_round_trips(#[case] v: i32) {
        let h = Handle::integer(v).unwrap();
        assert!(h.is_int());
        assert_eq!(h.as_int(), Some(v));
    }

    #[test]
    fn integer_out_of_range_rejected() {
        assert!(Handle::integer(MAX_INT + 1).is_none());
        assert!(Handle::integer(MIN_INT - 1).is_none());
    }

    #[test]
    fn float_preserves_nan_and_infinity_as_float_not_ref() {
        for v in [f32::NAN, f32::INFINITY, f32::NEG_INFINITY, 0.0, -0.0, 1.5] {
            let h = Handle::float(v);
            assert!(h.is_float());
            assert!(!h.is_ref());
        }
    }

    #[test]
    fn float_loses_low_mantissa_bits_but_keeps_sign_and_exponent() {
        let v = 1.0f32 + f32::EPSILON; // differs from 1.0 only in low mantissa bits
        let h = Handle::float(v);
        let back = h.as_float().unwrap();
        // Not required to equal v exactly (documented lossy truncation).
        assert_eq!(back.to_bits() & 0b11, 0);
        assert_eq!(v.is_sign_positive(), back.is_sign_positive());
    }

    #[test]
    fn index_round_trips() {
        let h = Handle::index(12345).unwrap();
        assert!(h.is_index());
        assert_eq!(h.as_index(), Some(12345));
        assert!(Handle::index(1 << 30).is_none());
    }

    #[test]
    fn specials_collate_before_refs_and_refs_before_index_integer_float() {
        let specials = [
            Handle::nil(),
            Handle::error(),
            Handle::id(),
            Handle::isa(),
            Handle::is(),
        ];
        let local = Handle::local_ref(0);
        let global = Handle::global_ref(0);
        let index = Handle::index(0).unwrap();
        let int = Handle::integer(0).unwrap();
        let float = Handle::float(0.0);

        for s in specials {
            assert!(s.rank() < local.rank(), "special {:?} must rank before local ref", s);
            assert!(s.rank() < global.rank(), "special {:?} must rank before global ref", s);
        }
        assert!(local.rank() < global.rank());
        assert!(global.rank() < index.rank());
        assert!(index.rank() < int.rank());
        assert!(int.rank() < float.rank());
    }

    #[test]
    fn rank_is_stable_hash_source() {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};
        let h1 = Handle::integer(42).unwrap();
        let h2 = Handle::integer(42).unwrap();
        let mut hasher1 = DefaultHasher::new();
        let mut hasher2 = DefaultHasher::new();
        h1.hash(&mut hasher1);
        h2.hash(&mut hasher2);
        assert_eq!(hasher1.finish(), hasher2.finish());
    }
}
