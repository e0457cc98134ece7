use core::cmp::Ordering;
use core::fmt;
use core::hash::{Hash, Hasher};

use log::warn;
use thiserror::Error;

/// Addressing namespace of a pointer register.
///
/// `0` means "not a pointer". `0xffff` is reserved for the marker pushed by
/// `link` into fresh temporaries.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct SegmentId(pub u16);

impl SegmentId {
    pub const NONE: SegmentId = SegmentId(0);
    pub const UNINITIALIZED: SegmentId = SegmentId(0xffff);

    #[inline(always)]
    pub const fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for SegmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04x}", self.0)
    }
}

impl fmt::Debug for SegmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SegmentId({:04x})", self.0)
    }
}

/// A tagged register: a 16-bit integer or a segment/offset pointer.
///
/// Integers are stored sign-extended from 16 bits, so two registers holding
/// the same word always compare equal. Build them with [`Reg::int`] or
/// [`Reg::word`]. A `Pointer` into segment `0` is the integer `offset`
/// everywhere, even when built by hand.
#[derive(Clone, Copy)]
pub enum Reg {
    Integer(i32),
    Pointer { segment: SegmentId, offset: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("{op}: unsupported operands {left} and {right}")]
pub struct ArithmeticError {
    pub op: &'static str,
    pub left: Reg,
    pub right: Reg,
}

impl Reg {
    pub const NULL: Reg = Reg::Integer(0);
    pub const UNINITIALIZED: Reg = Reg::Pointer {
        segment: SegmentId::UNINITIALIZED,
        offset: 0,
    };

    #[inline(always)]
    pub const fn int(value: i32) -> Reg {
        Reg::Integer(value as i16 as i32)
    }

    #[inline(always)]
    pub const fn word(value: u16) -> Reg {
        Reg::Integer(value as i16 as i32)
    }

    #[inline(always)]
    pub const fn bool(value: bool) -> Reg {
        Reg::Integer(value as i32)
    }

    /// A pointer register. Segment `0` yields the integer `offset`.
    #[inline(always)]
    pub const fn pointer(segment: SegmentId, offset: u32) -> Reg {
        if segment.is_none() {
            Reg::word(offset as u16)
        } else {
            Reg::Pointer { segment, offset }
        }
    }

    /// Fold a `Pointer` into segment `0` back into an integer.
    #[inline(always)]
    pub const fn normalized(self) -> Reg {
        match self {
            Reg::Pointer { segment: SegmentId::NONE, offset } => Reg::word(offset as u16),
            other => other,
        }
    }

    #[inline(always)]
    pub const fn segment(self) -> SegmentId {
        match self {
            Reg::Integer(_) => SegmentId::NONE,
            Reg::Pointer { segment, .. } => segment,
        }
    }

    /// The offset part; for integers the unsigned 16-bit word.
    #[inline(always)]
    pub const fn offset(self) -> u32 {
        match self.normalized() {
            Reg::Integer(v) => v as u16 as u32,
            Reg::Pointer { offset, .. } => offset,
        }
    }

    #[inline(always)]
    pub const fn is_null(self) -> bool {
        matches!(self.normalized(), Reg::Integer(0))
    }

    #[inline(always)]
    pub const fn is_integer(self) -> bool {
        matches!(self.normalized(), Reg::Integer(_))
    }

    #[inline(always)]
    pub const fn is_uninitialized(self) -> bool {
        matches!(self, Reg::Pointer { segment: SegmentId::UNINITIALIZED, .. })
    }

    /// A pointer into a real segment (not the uninitialized marker).
    #[inline(always)]
    pub const fn is_pointer(self) -> bool {
        match self {
            Reg::Pointer { segment, .. } => {
                !segment.is_none() && segment.0 != SegmentId::UNINITIALIZED.0
            }
            Reg::Integer(_) => false,
        }
    }

    #[inline(always)]
    pub const fn as_i16(self) -> Option<i16> {
        match self.normalized() {
            Reg::Integer(v) => Some(v as i16),
            Reg::Pointer { .. } => None,
        }
    }

    #[inline(always)]
    pub const fn as_u16(self) -> Option<u16> {
        match self.normalized() {
            Reg::Integer(v) => Some(v as u16),
            Reg::Pointer { .. } => None,
        }
    }

    /// Truth value as tested by `bt`, `bnt` and `not`.
    #[inline(always)]
    pub const fn is_true(self) -> bool {
        !self.is_null()
    }

    fn ints(self, rhs: Reg, op: &'static str) -> Result<(i16, i16), ArithmeticError> {
        match (self.normalized(), rhs.normalized()) {
            (Reg::Integer(a), Reg::Integer(b)) => Ok((a as i16, b as i16)),
            _ => Err(ArithmeticError { op, left: self, right: rhs }),
        }
    }

    fn unary(self, op: &'static str) -> Result<i16, ArithmeticError> {
        self.as_i16().ok_or(ArithmeticError { op, left: self, right: Reg::NULL })
    }

    // ── arithmetic ─────────────────────────────────────────────────

    pub fn add(self, rhs: Reg) -> Result<Reg, ArithmeticError> {
        match (self.normalized(), rhs.normalized()) {
            (Reg::Integer(a), Reg::Integer(b)) => Ok(Reg::int(a.wrapping_add(b))),
            (Reg::Pointer { segment, offset }, Reg::Integer(n))
            | (Reg::Integer(n), Reg::Pointer { segment, offset })
                if self.is_pointer() || rhs.is_pointer() =>
            {
                Ok(Reg::Pointer {
                    segment,
                    offset: offset.wrapping_add_signed(n),
                })
            }
            _ => Err(ArithmeticError { op: "add", left: self, right: rhs }),
        }
    }

    pub fn sub(self, rhs: Reg) -> Result<Reg, ArithmeticError> {
        match (self.normalized(), rhs.normalized()) {
            (Reg::Integer(a), Reg::Integer(b)) => Ok(Reg::int(a.wrapping_sub(b))),
            (Reg::Pointer { segment, offset }, Reg::Integer(n)) if self.is_pointer() => {
                Ok(Reg::Pointer {
                    segment,
                    offset: offset.wrapping_add_signed(n.wrapping_neg()),
                })
            }
            (Reg::Pointer { segment: s1, offset: o1 }, Reg::Pointer { segment: s2, offset: o2 })
                if s1 == s2 && self.is_pointer() =>
            {
                Ok(Reg::int(o1.wrapping_sub(o2) as i32))
            }
            _ => Err(ArithmeticError { op: "sub", left: self, right: rhs }),
        }
    }

    pub fn mul(self, rhs: Reg) -> Result<Reg, ArithmeticError> {
        let (a, b) = self.ints(rhs, "mul")?;
        Ok(Reg::int(a.wrapping_mul(b) as i32))
    }

    /// Signed division. Division by zero yields `0`.
    pub fn div(self, rhs: Reg) -> Result<Reg, ArithmeticError> {
        let (a, b) = self.ints(rhs, "div")?;
        if b == 0 {
            warn!("division by zero, using 0");
            return Ok(Reg::NULL);
        }
        Ok(Reg::int(a.wrapping_div(b) as i32))
    }

    /// Remainder by `|rhs|`, always non-negative. Modulo zero yields `0`.
    pub fn modulo(self, rhs: Reg) -> Result<Reg, ArithmeticError> {
        let (a, b) = self.ints(rhs, "mod")?;
        let m = (b as i32).abs();
        if m == 0 {
            warn!("modulo by zero, using 0");
            return Ok(Reg::NULL);
        }
        Ok(Reg::int((a as i32).rem_euclid(m)))
    }

    /// Remainder with the sign of `self`, as early interpreters computed
    /// it. Zero yields `0`.
    pub fn remainder(self, rhs: Reg) -> Result<Reg, ArithmeticError> {
        let (a, b) = self.ints(rhs, "mod")?;
        if b == 0 {
            warn!("modulo by zero, using 0");
            return Ok(Reg::NULL);
        }
        Ok(Reg::int(a.wrapping_rem(b) as i32))
    }

    pub fn shr(self, rhs: Reg) -> Result<Reg, ArithmeticError> {
        let (a, b) = self.ints(rhs, "shr")?;
        Ok(Reg::word((a as u16).checked_shr(b as u16 as u32).unwrap_or(0)))
    }

    pub fn shl(self, rhs: Reg) -> Result<Reg, ArithmeticError> {
        let (a, b) = self.ints(rhs, "shl")?;
        Ok(Reg::word((a as u16).checked_shl(b as u16 as u32).unwrap_or(0)))
    }

    pub fn xor(self, rhs: Reg) -> Result<Reg, ArithmeticError> {
        let (a, b) = self.ints(rhs, "xor")?;
        Ok(Reg::word(a as u16 ^ b as u16))
    }

    pub fn and(self, rhs: Reg) -> Result<Reg, ArithmeticError> {
        let (a, b) = self.ints(rhs, "and")?;
        Ok(Reg::word(a as u16 & b as u16))
    }

    pub fn or(self, rhs: Reg) -> Result<Reg, ArithmeticError> {
        let (a, b) = self.ints(rhs, "or")?;
        Ok(Reg::word(a as u16 | b as u16))
    }

    pub fn neg(self) -> Result<Reg, ArithmeticError> {
        Ok(Reg::int(self.unary("neg")?.wrapping_neg() as i32))
    }

    pub fn bnot(self) -> Result<Reg, ArithmeticError> {
        Ok(Reg::word(!(self.unary("bnot")? as u16)))
    }

    // ── comparison ─────────────────────────────────────────────────

    /// Order `self` against `rhs`.
    ///
    /// Integers compare signed, or as unsigned words when `unsigned` is set.
    /// Pointers into the same segment compare by offset. A pointer compares
    /// greater than any integer whose unsigned value is at most
    /// `pointer_limit`; every other mix is an error.
    pub fn compare(
        self,
        rhs: Reg,
        unsigned: bool,
        pointer_limit: u16,
    ) -> Result<Ordering, ArithmeticError> {
        let op = if unsigned { "ucmp" } else { "cmp" };
        match (self.normalized(), rhs.normalized()) {
            (Reg::Integer(a), Reg::Integer(b)) => Ok(if unsigned {
                (a as u16).cmp(&(b as u16))
            } else {
                (a as i16).cmp(&(b as i16))
            }),
            (Reg::Pointer { segment: s1, offset: o1 }, Reg::Pointer { segment: s2, offset: o2 })
                if s1 == s2 =>
            {
                Ok(o1.cmp(&o2))
            }
            (Reg::Pointer { .. }, Reg::Integer(b)) if (b as u16) <= pointer_limit => {
                Ok(Ordering::Greater)
            }
            (Reg::Integer(a), Reg::Pointer { .. }) if (a as u16) <= pointer_limit => {
                Ok(Ordering::Less)
            }
            _ => Err(ArithmeticError { op, left: self, right: rhs }),
        }
    }
}

impl PartialEq for Reg {
    fn eq(&self, other: &Reg) -> bool {
        match (self.normalized(), other.normalized()) {
            (Reg::Integer(a), Reg::Integer(b)) => a == b,
            (Reg::Pointer { segment: s1, offset: o1 }, Reg::Pointer { segment: s2, offset: o2 }) => {
                s1 == s2 && o1 == o2
            }
            _ => false,
        }
    }
}

impl Eq for Reg {}

impl Hash for Reg {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self.normalized() {
            Reg::Integer(v) => (0u8, v).hash(state),
            Reg::Pointer { segment, offset } => (1u8, segment, offset).hash(state),
        }
    }
}

impl Default for Reg {
    fn default() -> Self {
        Reg::NULL
    }
}

impl From<i16> for Reg {
    fn from(value: i16) -> Self {
        Reg::Integer(value as i32)
    }
}

impl From<u16> for Reg {
    fn from(value: u16) -> Self {
        Reg::word(value)
    }
}

impl From<bool> for Reg {
    fn from(value: bool) -> Self {
        Reg::bool(value)
    }
}

impl fmt::Display for Reg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{:04x}", self.segment(), self.offset())
    }
}

impl fmt::Debug for Reg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

// ── Tests ──────────────────────────────────────────────────────────
