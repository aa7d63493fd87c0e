use serde::{Deserialize, Serialize};
use std::fmt::{Debug, Display, Formatter};

/// Number of low-order tag bits in every OOP.
pub const NUM_TAG_BITS: u32 = 3;
const TAG_MASK: u64 = 0b111;
const HEAP_TAG: u64 = 0b001;
const SMALL_INT_TAG: u64 = 0b010;
const SPECIAL_TAG: u64 = 0b100;
const SMALL_DOUBLE_TAG: u64 = 0b110;

const SPECIAL_BYTE_MASK: u64 = 0xFF;
const BOOL_BYTE: u64 = 0x0C;
const NIL_BYTE: u64 = 0x14;
const CHAR_BYTE: u64 = 0x1C;

/// SmallInteger range, 61 bits two-complement.
pub const MIN_SMALL_INT: i64 = -(1 << 60);
pub const MAX_SMALL_INT: i64 = (1 << 60) - 1;

/// Highest unicode code point that can be held by a Character.
pub const MAX_CODE_POINT: u32 = 0x10FFFF;

/// A tagged 64-bit object reference.
///
/// Encoding (low three bits):
/// - `001` heap reference (`0x01` alone is the illegal sentinel),
/// - `010` SmallInteger, value in the high 61 bits,
/// - `100` special: nil, true/false, Character (discriminated by the low byte),
/// - `110` SmallDouble, reduced exponent float.
///
/// An OOP is a plain value: the VM owns object lifetime, nothing here retains it.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
#[repr(transparent)]
pub struct Oop(u64);

impl Oop {
    pub const ILLEGAL: Oop = Oop(0x01);
    pub const NIL: Oop = Oop(NIL_BYTE);
    pub const FALSE: Oop = Oop(BOOL_BYTE);
    pub const TRUE: Oop = Oop(0x100 | BOOL_BYTE);
    pub const ASCII_NUL: Oop = Oop(CHAR_BYTE);

    // classes of special objects
    pub const CLASS_SMALL_INTEGER: Oop = Oop(74241);
    pub const CLASS_CHARACTER: Oop = Oop(68353);
    pub const CLASS_BOOLEAN: Oop = Oop(66817);
    pub const CLASS_UNDEFINED_OBJECT: Oop = Oop(76801);
    pub const CLASS_SMALL_DOUBLE: Oop = Oop(121345);

    #[inline(always)]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    #[inline(always)]
    pub const fn raw(self) -> u64 {
        self.0
    }

    #[inline(always)]
    pub const fn is_illegal(self) -> bool {
        self.0 == Self::ILLEGAL.0
    }

    #[inline(always)]
    pub const fn is_nil(self) -> bool {
        self.0 == Self::NIL.0
    }

    /// True for every immediate (non heap) OOP.
    #[inline(always)]
    pub const fn is_special(self) -> bool {
        self.0 & TAG_MASK != HEAP_TAG
    }

    #[inline(always)]
    pub const fn is_heap_ref(self) -> bool {
        !self.is_special() && !self.is_illegal()
    }

    /// Class OOP of an immediate object, [`Oop::ILLEGAL`] for heap references.
    pub fn special_class(self) -> Oop {
        match self.kind() {
            OopKind::SmallInt(_) => Self::CLASS_SMALL_INTEGER,
            OopKind::Char(_) => Self::CLASS_CHARACTER,
            OopKind::Bool(_) => Self::CLASS_BOOLEAN,
            OopKind::Nil => Self::CLASS_UNDEFINED_OBJECT,
            OopKind::SmallDouble(_) => Self::CLASS_SMALL_DOUBLE,
            OopKind::HeapRef(_) | OopKind::Illegal => Self::ILLEGAL,
        }
    }

    // --------------------------------- SmallInteger ----------------------------------------------

    #[inline(always)]
    pub const fn from_i32(i: i32) -> Self {
        Self((((i as i64) << NUM_TAG_BITS) as u64) | SMALL_INT_TAG)
    }

    /// Encode a 64-bit integer as SmallInteger, `None` when outside the immediate range.
    /// Larger magnitudes are VM heap objects and must be created remotely.
    pub fn from_i64(i: i64) -> Option<Self> {
        (MIN_SMALL_INT..=MAX_SMALL_INT)
            .contains(&i)
            .then(|| Self(((i << NUM_TAG_BITS) as u64) | SMALL_INT_TAG))
    }

    #[inline(always)]
    pub const fn is_small_int(self) -> bool {
        self.0 & TAG_MASK == SMALL_INT_TAG
    }

    pub fn as_i64(self) -> Option<i64> {
        self.is_small_int()
            .then_some((self.0 as i64) >> NUM_TAG_BITS)
    }

    // --------------------------------- Character -------------------------------------------------

    /// Encode a code point, [`Oop::ILLEGAL`] above U+10FFFF.
    pub const fn from_char_code(code_point: u32) -> Self {
        if code_point > MAX_CODE_POINT {
            return Self::ILLEGAL;
        }
        Self(((code_point as u64) << 8) | CHAR_BYTE)
    }

    #[inline(always)]
    pub const fn is_char(self) -> bool {
        self.0 & SPECIAL_BYTE_MASK == CHAR_BYTE
    }

    /// Code point of a Character OOP, -1 for anything else.
    pub const fn char_code(self) -> i64 {
        if self.is_char() {
            (self.0 >> 8) as i64
        } else {
            -1
        }
    }

    // --------------------------------- Boolean ---------------------------------------------------

    pub const fn from_bool(b: bool) -> Self {
        if b {
            Self::TRUE
        } else {
            Self::FALSE
        }
    }

    // --------------------------------- SmallDouble -----------------------------------------------

    /// Inverse of [`Oop::as_f64`]. `None` when the exponent does not fit the reduced 8-bit range.
    ///
    /// New floats are encoded by the VM, see `GemSession::f64_to_oop`.
    pub fn small_double(f: f64) -> Option<Self> {
        let bits = f.to_bits();
        let sign = bits >> 63;
        let ieee_exp = (bits >> 52) & 0x7FF;
        let mantissa = bits & ((1 << 52) - 1);

        let exp8 = if ieee_exp == 0 && mantissa == 0 {
            0
        } else if (SMALL_DOUBLE_EXP_BIAS + 1..=SMALL_DOUBLE_EXP_BIAS + 255).contains(&ieee_exp) {
            ieee_exp - SMALL_DOUBLE_EXP_BIAS
        } else {
            return None;
        };
        Some(Self(
            (mantissa << 12) | (exp8 << 4) | (sign << 3) | SMALL_DOUBLE_TAG,
        ))
    }

    #[inline(always)]
    pub const fn is_small_double(self) -> bool {
        self.0 & TAG_MASK == SMALL_DOUBLE_TAG
    }

    pub fn as_f64(self) -> Option<f64> {
        if !self.is_small_double() {
            return None;
        }
        let mantissa = self.0 >> 12;
        let exp8 = (self.0 >> 4) & 0xFF;
        let sign = (self.0 >> 3) & 1;
        let ieee_exp = if exp8 == 0 {
            0
        } else {
            exp8 + SMALL_DOUBLE_EXP_BIAS
        };
        Some(f64::from_bits((sign << 63) | (ieee_exp << 52) | mantissa))
    }

    /// Decode into the closed set of OOP kinds.
    pub fn kind(self) -> OopKind {
        if self.is_illegal() {
            return OopKind::Illegal;
        }
        match self.0 & TAG_MASK {
            HEAP_TAG => OopKind::HeapRef(self.0),
            SMALL_INT_TAG => OopKind::SmallInt((self.0 as i64) >> NUM_TAG_BITS),
            SMALL_DOUBLE_TAG => self
                .as_f64()
                .map(OopKind::SmallDouble)
                .unwrap_or(OopKind::Illegal),
            SPECIAL_TAG => match self.0 & SPECIAL_BYTE_MASK {
                NIL_BYTE if self.0 == NIL_BYTE => OopKind::Nil,
                BOOL_BYTE if self == Self::TRUE => OopKind::Bool(true),
                BOOL_BYTE if self == Self::FALSE => OopKind::Bool(false),
                CHAR_BYTE if self.char_code() <= MAX_CODE_POINT as i64 => {
                    OopKind::Char(self.char_code() as u32)
                }
                _ => OopKind::Illegal,
            },
            _ => OopKind::Illegal,
        }
    }
}

/// IEEE double exponent bias minus the SmallDouble exponent bias.
const SMALL_DOUBLE_EXP_BIAS: u64 = 1023 - 127;

impl Debug for Oop {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self.kind() {
            OopKind::HeapRef(raw) => write!(f, "Ref({raw})"),
            OopKind::SmallInt(i) => write!(f, "SmallInt({i})"),
            OopKind::Char(c) => write!(f, "Char(U+{c:04X})"),
            OopKind::Bool(b) => write!(f, "Bool({b})"),
            OopKind::Nil => f.write_str("nil"),
            OopKind::SmallDouble(d) => write!(f, "SmallDouble({d})"),
            OopKind::Illegal => write!(f, "Illegal(0x{:x})", self.0),
        }
    }
}

impl Display for Oop {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Decoded view of an [`Oop`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OopKind {
    HeapRef(u64),
    SmallInt(i64),
    Char(u32),
    Bool(bool),
    Nil,
    SmallDouble(f64),
    Illegal,
}

impl OopKind {
    /// Encode back into an OOP. Values that have no immediate form encode as illegal.
    pub fn encode(self) -> Oop {
        match self {
            OopKind::HeapRef(raw) if raw & TAG_MASK == HEAP_TAG => Oop(raw),
            OopKind::HeapRef(_) => Oop::ILLEGAL,
            OopKind::SmallInt(i) => Oop::from_i64(i).unwrap_or(Oop::ILLEGAL),
            OopKind::Char(c) => Oop::from_char_code(c),
            OopKind::Bool(b) => Oop::from_bool(b),
            OopKind::Nil => Oop::NIL,
            OopKind::SmallDouble(d) => Oop::small_double(d).unwrap_or(Oop::ILLEGAL),
            OopKind::Illegal => Oop::ILLEGAL,
        }
    }

    /// Render an immediate value without asking the VM, `None` for heap objects.
    pub fn print_string(self) -> Option<String> {
        match self {
            OopKind::SmallInt(i) => Some(i.to_string()),
            OopKind::Char(c) => Some(match char::from_u32(c) {
                Some(ch) if !ch.is_control() => format!("${ch}"),
                _ => format!("Character codePoint: {c}"),
            }),
            OopKind::Bool(b) => Some(b.to_string()),
            OopKind::Nil => Some("nil".to_string()),
            OopKind::SmallDouble(d) => Some(format!("{d:?}")),
            OopKind::HeapRef(_) | OopKind::Illegal => None,
        }
    }
}

impl From<OopKind> for Oop {
    fn from(kind: OopKind) -> Self {
        kind.encode()
    }
}
