use std::fmt;
use std::ops::Not;

use super::action::ActionId;
use super::bucket::BucketId;
use super::decision::Decision;
use super::field::{FieldRef, GroupId, MetaField};
use super::value::{Num, Value, Width};

/// Binary arithmetic operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    BitAnd,
    BitOr,
    BitXor,
    Shl,
    Shr,
}

/// Relational operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RelOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl RelOp {
    /// The operator with its operands swapped (`a OP b` == `b OP.mirror() a`).
    #[must_use]
    pub fn mirror(self) -> RelOp {
        match self {
            RelOp::Eq => RelOp::Eq,
            RelOp::Ne => RelOp::Ne,
            RelOp::Lt => RelOp::Gt,
            RelOp::Le => RelOp::Ge,
            RelOp::Gt => RelOp::Lt,
            RelOp::Ge => RelOp::Le,
        }
    }
}

/// The canonical stateless match: `(field & mask) == value`. Every
/// relational test is rewritten into one or more of these by the arithmetic
/// optimizer; the back ends consume nothing else.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MatchLeaf {
    pub field: FieldRef,
    pub mask: Num,
    pub value: Num,
}

impl MatchLeaf {
    #[must_use]
    pub fn new(field: FieldRef, mask: Num, value: Num) -> MatchLeaf {
        MatchLeaf { field, mask, value }
    }

    /// Whether the mask tests exactly one bit.
    #[must_use]
    pub fn single_bit(&self) -> bool {
        self.mask.value.count_ones() == 1
    }
}

/// A node of the expression graph. The graph is a tree with diamond sharing
/// introduced only by explicit cloning; each pass takes ownership of its
/// input and hands a new tree to the next pass.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// A concrete value.
    Const(Value),
    /// A byte-range read at a fixed offset.
    Field(FieldRef),
    /// A byte-range read at a computed offset (the ternary access form).
    Access {
        group: GroupId,
        offset: Box<Expr>,
        length: u8,
    },
    Arith(ArithOp, Box<Expr>, Box<Expr>),
    Rel(RelOp, Box<Expr>, Box<Expr>),
    /// Canonical stateless match produced by the arithmetic optimizer.
    Match(MatchLeaf),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
    /// Pure token-bucket test: true iff the bucket's fill level
    /// (dis)satisfies the packet, depending on `expect`. Negation flips
    /// `expect` instead of introducing a NOT node.
    Conform { bucket: BucketId, expect: bool },
    /// Side-effecting policing step: always true, consumes tokens.
    Count(BucketId),
    /// A terminal classification outcome, treated as a true leaf.
    Decision(Decision),
    /// Reference to a deduplicated action node (post-separation form).
    Action(ActionId),
}

impl Expr {
    /// Boolean constant in expression form.
    #[must_use]
    pub fn truth(v: bool) -> Expr {
        Expr::Const(Value::Num(Num::w32(u32::from(v))))
    }

    /// If this is a numeric constant, its boolean reading (zero is false).
    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Expr::Const(Value::Num(n)) => Some(!n.is_zero()),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_num(&self) -> Option<Num> {
        match self {
            Expr::Const(Value::Num(n)) => Some(*n),
            _ => None,
        }
    }

    /// Whether evaluating this expression can fire a side effect (`count`).
    #[must_use]
    pub fn has_side_effect(&self) -> bool {
        match self {
            Expr::Count(_) => true,
            Expr::And(a, b) | Expr::Or(a, b) => a.has_side_effect() || b.has_side_effect(),
            Expr::Not(x) => x.has_side_effect(),
            _ => false,
        }
    }

    /// An action subtree is built solely from conform/count/decision leaves
    /// (or already-lowered action references) and logical connectives over
    /// other action subtrees.
    #[must_use]
    pub fn is_action_subtree(&self) -> bool {
        match self {
            Expr::Conform { .. } | Expr::Count(_) | Expr::Decision(_) | Expr::Action(_) => true,
            Expr::And(a, b) | Expr::Or(a, b) => a.is_action_subtree() && b.is_action_subtree(),
            Expr::Not(x) => x.is_action_subtree(),
            Expr::Const(Value::Num(_)) => false,
            _ => false,
        }
    }

    /// Bit width this expression computes at.
    #[must_use]
    pub fn width(&self) -> Width {
        match self {
            Expr::Const(Value::Num(n)) => n.width,
            Expr::Field(f) => Width::for_bytes(f.length),
            Expr::Access { length, .. } => Width::for_bytes(*length),
            Expr::Arith(_, a, b) => a.width().max(b.width()),
            _ => Width::W32,
        }
    }

    #[must_use]
    pub fn and(self, other: Expr) -> Expr {
        Expr::And(Box::new(self), Box::new(other))
    }

    #[must_use]
    pub fn or(self, other: Expr) -> Expr {
        Expr::Or(Box::new(self), Box::new(other))
    }

    #[must_use]
    pub fn arith(self, op: ArithOp, other: Expr) -> Expr {
        Expr::Arith(op, Box::new(self), Box::new(other))
    }

    #[must_use]
    pub fn rel(self, op: RelOp, other: impl Into<Value>) -> Expr {
        Expr::Rel(op, Box::new(self), Box::new(Expr::Const(other.into())))
    }

    #[must_use]
    pub fn eq(self, other: impl Into<Value>) -> Expr {
        self.rel(RelOp::Eq, other)
    }

    #[must_use]
    pub fn ne(self, other: impl Into<Value>) -> Expr {
        self.rel(RelOp::Ne, other)
    }

    #[must_use]
    pub fn lt(self, other: impl Into<Value>) -> Expr {
        self.rel(RelOp::Lt, other)
    }

    #[must_use]
    pub fn le(self, other: impl Into<Value>) -> Expr {
        self.rel(RelOp::Le, other)
    }

    #[must_use]
    pub fn gt(self, other: impl Into<Value>) -> Expr {
        self.rel(RelOp::Gt, other)
    }

    #[must_use]
    pub fn ge(self, other: impl Into<Value>) -> Expr {
        self.rel(RelOp::Ge, other)
    }

    #[must_use]
    pub fn mask(self, m: impl Into<Value>) -> Expr {
        self.arith(ArithOp::BitAnd, Expr::Const(m.into()))
    }

    #[must_use]
    pub fn shr(self, bits: u32) -> Expr {
        self.arith(ArithOp::Shr, Expr::Const(Value::from(bits)))
    }

    #[must_use]
    pub fn shl(self, bits: u32) -> Expr {
        self.arith(ArithOp::Shl, Expr::Const(Value::from(bits)))
    }
}

impl Not for Expr {
    type Output = Expr;

    fn not(self) -> Expr {
        Expr::Not(Box::new(self))
    }
}

/// A fixed-offset field read.
#[must_use]
pub fn field(group: GroupId, offset: u16, length: u8) -> Expr {
    Expr::Field(FieldRef::new(group, offset, length))
}

/// A reserved meta-field read.
#[must_use]
pub fn meta(m: MetaField) -> Expr {
    Expr::Field(m.field_ref())
}

/// A pure token-bucket conformance test.
#[must_use]
pub fn conform(bucket: BucketId) -> Expr {
    Expr::Conform {
        bucket,
        expect: true,
    }
}

/// A side-effecting token-bucket count.
#[must_use]
pub fn count(bucket: BucketId) -> Expr {
    Expr::Count(bucket)
}

/// A terminal decision leaf.
#[must_use]
pub fn decide(d: Decision) -> Expr {
    Expr::Decision(d)
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Const(v) => write!(f, "{v}"),
            Expr::Field(fr) => write!(f, "[{fr}]"),
            Expr::Access {
                group,
                offset,
                length,
            } => write!(f, "[{}:({offset}):{length}]", group.index()),
            Expr::Arith(op, a, b) => {
                let sym = match op {
                    ArithOp::Add => "+",
                    ArithOp::Sub => "-",
                    ArithOp::Mul => "*",
                    ArithOp::Div => "/",
                    ArithOp::Mod => "%",
                    ArithOp::BitAnd => "&",
                    ArithOp::BitOr => "|",
                    ArithOp::BitXor => "^",
                    ArithOp::Shl => "<<",
                    ArithOp::Shr => ">>",
                };
                write!(f, "({a} {sym} {b})")
            }
            Expr::Rel(op, a, b) => {
                let sym = match op {
                    RelOp::Eq => "==",
                    RelOp::Ne => "!=",
                    RelOp::Lt => "<",
                    RelOp::Le => "<=",
                    RelOp::Gt => ">",
                    RelOp::Ge => ">=",
                };
                write!(f, "({a} {sym} {b})")
            }
            Expr::Match(m) => write!(f, "([{}] & {} == {})", m.field, m.mask, m.value),
            Expr::And(a, b) => write!(f, "({a} && {b})"),
            Expr::Or(a, b) => write!(f, "({a} || {b})"),
            Expr::Not(x) => write!(f, "(!{x})"),
            Expr::Conform { bucket, expect } => {
                if *expect {
                    write!(f, "conform({bucket})")
                } else {
                    write!(f, "!conform({bucket})")
                }
            }
            Expr::Count(b) => write!(f, "count({b})"),
            Expr::Decision(d) => write!(f, "<{d}>"),
            Expr::Action(a) => write!(f, "action#{}", a.index()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::field::OffsetGroups;

    #[test]
    fn truth_round_trips() {
        assert_eq!(Expr::truth(true).as_bool(), Some(true));
        assert_eq!(Expr::truth(false).as_bool(), Some(false));
        assert_eq!(field(OffsetGroups::PACKET, 0, 1).as_bool(), None);
    }

    #[test]
    fn builders_compose() {
        let e = field(OffsetGroups::PACKET, 9, 1)
            .eq(6_u32)
            .and(field(OffsetGroups::PACKET, 16, 4).eq(0x0a00_0000_u32));
        assert!(matches!(e, Expr::And(_, _)));
    }

    #[test]
    fn not_operator_wraps() {
        let e = !field(OffsetGroups::PACKET, 0, 1).eq(1_u32);
        assert!(matches!(e, Expr::Not(_)));
    }

    #[test]
    fn side_effect_detection() {
        let b = BucketId(0);
        assert!(count(b).has_side_effect());
        assert!(!conform(b).has_side_effect());
        assert!(count(b).and(conform(b)).has_side_effect());
        assert!(!field(OffsetGroups::PACKET, 0, 1).eq(1_u32).has_side_effect());
    }

    #[test]
    fn action_subtree_recognition() {
        let b = BucketId(0);
        let action = count(b).and(conform(b)).and(decide(Decision::Drop));
        assert!(action.is_action_subtree());
        let mixed = field(OffsetGroups::PACKET, 0, 1).eq(1_u32).and(count(b));
        assert!(!mixed.is_action_subtree());
    }

    #[test]
    fn width_propagates_through_arith() {
        let wide = field(OffsetGroups::PACKET, 8, 16).mask(u128::MAX);
        assert_eq!(wide.width(), Width::W128);
        let narrow = field(OffsetGroups::PACKET, 0, 2).shr(4);
        assert_eq!(narrow.width(), Width::W32);
    }

    #[test]
    fn single_bit_mask_detection() {
        let f = FieldRef::new(OffsetGroups::PACKET, 0, 1);
        assert!(MatchLeaf::new(f, Num::w32(0x10), Num::w32(0x10)).single_bit());
        assert!(!MatchLeaf::new(f, Num::w32(0x11), Num::w32(0x01)).single_bit());
    }
}
