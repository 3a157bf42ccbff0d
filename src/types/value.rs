use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};

use super::error::CompileError;
use super::expr::{ArithOp, RelOp};

/// Bit width of a numeric value. Packet fields up to four bytes are computed
/// at native width; anything wider (IPv6 addresses) uses the 128-bit path.
/// All combinators must behave identically modulo width.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Width {
    W32,
    W128,
}

impl Width {
    #[must_use]
    pub fn bits(self) -> u32 {
        match self {
            Width::W32 => 32,
            Width::W128 => 128,
        }
    }

    #[must_use]
    pub fn mask(self) -> u128 {
        match self {
            Width::W32 => u128::from(u32::MAX),
            Width::W128 => u128::MAX,
        }
    }

    /// Width needed for a field of `bytes` bytes.
    #[must_use]
    pub fn for_bytes(bytes: u8) -> Width {
        if bytes <= 4 {
            Width::W32
        } else {
            Width::W128
        }
    }
}

/// An unsigned number with an explicit width. Arithmetic wraps within the
/// width; shift amounts at or above the width produce zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Num {
    pub value: u128,
    pub width: Width,
}

impl Num {
    #[must_use]
    pub fn new(value: u128, width: Width) -> Num {
        Num {
            value: value & width.mask(),
            width,
        }
    }

    #[must_use]
    pub fn w32(value: u32) -> Num {
        Num::new(u128::from(value), Width::W32)
    }

    #[must_use]
    pub fn w128(value: u128) -> Num {
        Num::new(value, Width::W128)
    }

    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.value == 0
    }

    /// Bit `k` counted from the most significant bit of an `nbits`-wide
    /// window at the bottom of the value.
    #[must_use]
    pub fn bit_msb(&self, k: u32, nbits: u32) -> bool {
        (self.value >> (nbits - 1 - k)) & 1 == 1
    }

    /// Apply a binary arithmetic operator. The result takes the wider of the
    /// two operand widths.
    pub fn apply(op: ArithOp, a: Num, b: Num) -> Result<Num, CompileError> {
        let width = a.width.max(b.width);
        let value = match op {
            ArithOp::Add => a.value.wrapping_add(b.value),
            ArithOp::Sub => a.value.wrapping_sub(b.value),
            ArithOp::Mul => a.value.wrapping_mul(b.value),
            ArithOp::Div => {
                if b.value == 0 {
                    return Err(CompileError::DivisionByZero);
                }
                a.value / b.value
            }
            ArithOp::Mod => {
                if b.value == 0 {
                    return Err(CompileError::DivisionByZero);
                }
                a.value % b.value
            }
            ArithOp::BitAnd => a.value & b.value,
            ArithOp::BitOr => a.value | b.value,
            ArithOp::BitXor => a.value ^ b.value,
            ArithOp::Shl => {
                if b.value >= u128::from(width.bits()) {
                    0
                } else {
                    a.value << b.value
                }
            }
            ArithOp::Shr => {
                if b.value >= u128::from(width.bits()) {
                    0
                } else {
                    a.value >> b.value
                }
            }
        };
        Ok(Num::new(value, width))
    }

    /// Unsigned comparison; widths need not match.
    #[must_use]
    pub fn compare(op: RelOp, a: Num, b: Num) -> bool {
        match op {
            RelOp::Eq => a.value == b.value,
            RelOp::Ne => a.value != b.value,
            RelOp::Lt => a.value < b.value,
            RelOp::Le => a.value <= b.value,
            RelOp::Gt => a.value > b.value,
            RelOp::Ge => a.value >= b.value,
        }
    }
}

impl fmt::Display for Num {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.value)
    }
}

/// A concrete value in the expression graph. Symbolic computations are
/// represented by operator nodes in [`Expr`](super::Expr); evaluating an
/// operator over concrete operands folds back into one of these.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// An unsigned number of explicit width (also the lowered form of
    /// IPv4/IPv6 addresses).
    Num(Num),
    /// A rate in bits per second.
    Rate(f64),
    /// A size in bytes.
    Size(f64),
    /// A time in seconds.
    Time(f64),
    /// A UTF-8 string.
    Str(String),
}

impl Value {
    #[must_use]
    pub fn num(&self) -> Option<Num> {
        match self {
            Value::Num(n) => Some(*n),
            _ => None,
        }
    }

    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Num(_) => "number",
            Value::Rate(_) => "rate",
            Value::Size(_) => "size",
            Value::Time(_) => "time",
            Value::Str(_) => "string",
        }
    }

    /// Compare two concrete values. Mixed kinds are a model error.
    pub fn compare(op: RelOp, a: &Value, b: &Value) -> Result<bool, CompileError> {
        match (a, b) {
            (Value::Num(x), Value::Num(y)) => Ok(Num::compare(op, *x, *y)),
            (Value::Rate(x), Value::Rate(y))
            | (Value::Size(x), Value::Size(y))
            | (Value::Time(x), Value::Time(y)) => Ok(compare_f64(op, *x, *y)),
            (Value::Str(x), Value::Str(y)) => Ok(match op {
                RelOp::Eq => x == y,
                RelOp::Ne => x != y,
                RelOp::Lt => x < y,
                RelOp::Le => x <= y,
                RelOp::Gt => x > y,
                RelOp::Ge => x >= y,
            }),
            _ => Err(CompileError::TypeMismatch {
                expected: a.kind(),
                got: b.kind(),
            }),
        }
    }
}

fn compare_f64(op: RelOp, a: f64, b: f64) -> bool {
    match op {
        RelOp::Eq => a == b,
        RelOp::Ne => a != b,
        RelOp::Lt => a < b,
        RelOp::Le => a <= b,
        RelOp::Gt => a > b,
        RelOp::Ge => a >= b,
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::Num(Num::w32(v))
    }
}

impl From<u128> for Value {
    fn from(v: u128) -> Self {
        Value::Num(Num::w128(v))
    }
}

impl From<Num> for Value {
    fn from(v: Num) -> Self {
        Value::Num(v)
    }
}

impl From<Ipv4Addr> for Value {
    fn from(v: Ipv4Addr) -> Self {
        Value::Num(Num::w32(u32::from(v)))
    }
}

impl From<Ipv6Addr> for Value {
    fn from(v: Ipv6Addr) -> Self {
        Value::Num(Num::w128(u128::from(v)))
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_owned())
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Num(n) => write!(f, "{n}"),
            Value::Rate(v) => write!(f, "{v}bps"),
            Value::Size(v) => write!(f, "{v}B"),
            Value::Time(v) => write!(f, "{v}s"),
            Value::Str(v) => write!(f, "\"{v}\""),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_masks_to_width() {
        let n = Num::new(0x1_0000_0001, Width::W32);
        assert_eq!(n.value, 1);
    }

    #[test]
    fn shift_at_width_is_zero() {
        let a = Num::w32(0xdead_beef);
        let s = Num::w32(32);
        assert_eq!(Num::apply(ArithOp::Shl, a, s).unwrap().value, 0);
        assert_eq!(Num::apply(ArithOp::Shr, a, s).unwrap().value, 0);
    }

    #[test]
    fn shift_behaves_identically_modulo_width() {
        let a32 = Num::w32(1);
        let a128 = Num::w128(1);
        let r32 = Num::apply(ArithOp::Shl, a32, Num::w32(31)).unwrap();
        let r128 = Num::apply(ArithOp::Shl, a128, Num::w128(127)).unwrap();
        assert_eq!(r32.value, 1 << 31);
        assert_eq!(r128.value, 1 << 127);
        assert_eq!(Num::apply(ArithOp::Shl, a32, Num::w32(32)).unwrap().value, 0);
        assert_eq!(
            Num::apply(ArithOp::Shl, a128, Num::w128(128)).unwrap().value,
            0
        );
    }

    #[test]
    fn addition_wraps() {
        let r = Num::apply(ArithOp::Add, Num::w32(u32::MAX), Num::w32(1)).unwrap();
        assert_eq!(r.value, 0);
        let r = Num::apply(ArithOp::Add, Num::w128(u128::MAX), Num::w128(1)).unwrap();
        assert_eq!(r.value, 0);
    }

    #[test]
    fn masks_cancel_to_zero() {
        let r = Num::apply(ArithOp::BitAnd, Num::w32(0xff00), Num::w32(0x00ff)).unwrap();
        assert!(r.is_zero());
    }

    #[test]
    fn mixed_width_takes_wider() {
        let r = Num::apply(ArithOp::Add, Num::w32(1), Num::w128(1 << 64)).unwrap();
        assert_eq!(r.width, Width::W128);
        assert_eq!(r.value, (1 << 64) + 1);
    }

    #[test]
    fn division_by_zero_is_error() {
        let r = Num::apply(ArithOp::Div, Num::w32(1), Num::w32(0));
        assert!(matches!(r, Err(CompileError::DivisionByZero)));
    }

    #[test]
    fn bit_msb_indexing() {
        // 0x80 in an 8-bit window: bit 0 (MSB) set, all others clear.
        let n = Num::w32(0x80);
        assert!(n.bit_msb(0, 8));
        assert!(!n.bit_msb(7, 8));
    }

    #[test]
    fn ipv4_lowers_to_w32() {
        let v = Value::from(Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(v, Value::Num(Num::w32(0x0a00_0001)));
    }

    #[test]
    fn ipv6_lowers_to_w128() {
        let v = Value::from(Ipv6Addr::LOCALHOST);
        assert_eq!(v, Value::Num(Num::w128(1)));
    }

    #[test]
    fn compare_mixed_kinds_is_type_mismatch() {
        let r = Value::compare(RelOp::Eq, &Value::from(1_u32), &Value::from("x"));
        assert!(matches!(r, Err(CompileError::TypeMismatch { .. })));
    }

    #[test]
    fn compare_numbers_across_widths() {
        assert!(
            Value::compare(RelOp::Eq, &Value::Num(Num::w32(7)), &Value::Num(Num::w128(7)))
                .unwrap()
        );
    }
}
