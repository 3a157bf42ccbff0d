//! Arithmetic and relational canonicalization.
//!
//! Folds constant arithmetic, strength-reduces power-of-two multiplication,
//! division and modulus into shifts and masks, and rewrites every relational
//! test into the canonical stateless form `(field & mask) == value` (the
//! `Match` leaf). Inequalities and `!=` decompose into ORs of such matches;
//! the lowering style (wide prefix tests or single-bit tests) comes from the
//! context's configuration.
//!
//! Statically decided comparisons fold to a boolean constant and leave a
//! diagnostic behind. Output is idempotent under this pass and contains no
//! `Rel`, `Arith`, bare `Field` or `Access` nodes.

use crate::types::{
    low_mask, ArithOp, CompilationContext, CompileError, Expr, FieldRef, GroupBase, GroupId,
    IneqLowering, MatchLeaf, Num, RelOp, Value, Width, MAX_COND_BYTES,
};

/// Canonicalize all arithmetic and relational subtrees of `e`.
pub fn optimize(e: Expr, ctx: &mut CompilationContext) -> Result<Expr, CompileError> {
    match e {
        Expr::And(a, b) => Ok(optimize(*a, ctx)?.and(optimize(*b, ctx)?)),
        Expr::Or(a, b) => Ok(optimize(*a, ctx)?.or(optimize(*b, ctx)?)),
        Expr::Not(x) => Ok(!optimize(*x, ctx)?),
        Expr::Rel(op, a, b) => lower_rel(op, *a, *b, ctx),
        // A bare data expression in boolean position reads as "not zero".
        Expr::Field(_) | Expr::Access { .. } | Expr::Arith(..) => {
            lower_rel(RelOp::Ne, e, Expr::Const(Value::from(0_u32)), ctx)
        }
        Expr::Const(ref v) if v.num().is_none() => Err(CompileError::NotBoolean(e.to_string())),
        other => Ok(other),
    }
}

/// Fold constants bottom-up inside an arithmetic subtree.
fn fold(e: Expr, ctx: &mut CompilationContext) -> Result<Expr, CompileError> {
    match e {
        Expr::Arith(op, a, b) => {
            let a = fold(*a, ctx)?;
            let b = fold(*b, ctx)?;
            for side in [&a, &b] {
                if let Expr::Const(v) = side {
                    if v.num().is_none() {
                        return Err(CompileError::TypeMismatch {
                            expected: "number",
                            got: v.kind(),
                        });
                    }
                }
            }
            match (a.as_num(), b.as_num()) {
                (Some(x), Some(y)) => Ok(Expr::Const(Value::Num(Num::apply(op, x, y)?))),
                _ => reduce(op, a, b, ctx),
            }
        }
        Expr::Access {
            group,
            offset,
            length,
        } => Ok(Expr::Access {
            group,
            offset: Box::new(fold(*offset, ctx)?),
            length,
        }),
        other => Ok(other),
    }
}

/// Strength reduction for an arithmetic node with one constant operand.
fn reduce(op: ArithOp, a: Expr, b: Expr, ctx: &mut CompilationContext) -> Result<Expr, CompileError> {
    let w = a.width().max(b.width());
    // Normalize the constant of a commutative operator to the right.
    let (a, b) = match op {
        ArithOp::Add | ArithOp::Mul | ArithOp::BitAnd | ArithOp::BitOr | ArithOp::BitXor
            if a.as_num().is_some() =>
        {
            (b, a)
        }
        _ => (a, b),
    };
    let Some(k) = b.as_num() else {
        return Ok(a.arith(op, b));
    };
    match op {
        ArithOp::Mul => {
            if k.value == 0 {
                Ok(zero(w))
            } else if k.value == 1 {
                Ok(a)
            } else if k.value.is_power_of_two() {
                Ok(a.shl(k.value.trailing_zeros()))
            } else {
                Ok(a.arith(op, b))
            }
        }
        ArithOp::Div => {
            if k.value == 0 {
                Err(CompileError::DivisionByZero)
            } else if k.value == 1 {
                Ok(a)
            } else if k.value.is_power_of_two() {
                Ok(a.shr(k.value.trailing_zeros()))
            } else {
                Ok(a.arith(op, b))
            }
        }
        ArithOp::Mod => {
            if k.value == 0 {
                Err(CompileError::DivisionByZero)
            } else if k.value == 1 {
                Ok(zero(w))
            } else if k.value.is_power_of_two() {
                Ok(a.mask(Num::new(k.value - 1, w)))
            } else {
                Ok(a.arith(op, b))
            }
        }
        ArithOp::Add | ArithOp::Sub | ArithOp::BitOr | ArithOp::BitXor => {
            if k.value == 0 {
                Ok(a)
            } else {
                Ok(a.arith(op, b))
            }
        }
        ArithOp::BitAnd => {
            if k.value == 0 {
                Ok(zero(w))
            } else if k.value & w.mask() == w.mask() {
                Ok(a)
            } else {
                Ok(a.arith(op, b))
            }
        }
        ArithOp::Shl | ArithOp::Shr => {
            if k.value == 0 {
                Ok(a)
            } else if k.value >= u128::from(w.bits()) {
                ctx.warn("shift amount exceeds operand width");
                Ok(zero(w))
            } else {
                Ok(a.arith(op, b))
            }
        }
    }
}

fn zero(w: Width) -> Expr {
    Expr::Const(Value::Num(Num::new(0, w)))
}

/// Rewrite one relational test into matches or a decided constant.
fn lower_rel(
    op: RelOp,
    lhs: Expr,
    rhs: Expr,
    ctx: &mut CompilationContext,
) -> Result<Expr, CompileError> {
    let lhs = fold(lhs, ctx)?;
    let rhs = fold(rhs, ctx)?;
    let (op, lhs, rhs) = if matches!(lhs, Expr::Const(_)) && !matches!(rhs, Expr::Const(_)) {
        (op.mirror(), rhs, lhs)
    } else {
        (op, lhs, rhs)
    };
    if let (Expr::Const(a), Expr::Const(b)) = (&lhs, &rhs) {
        return Ok(Expr::truth(Value::compare(op, a, b)?));
    }
    let k = match &rhs {
        Expr::Const(v) => v.num().ok_or(CompileError::TypeMismatch {
            expected: "number",
            got: v.kind(),
        })?,
        _ => {
            let e = Expr::Rel(op, Box::new(lhs), Box::new(rhs));
            return Err(CompileError::NonConstantComparison(e.to_string()));
        }
    };
    match op {
        RelOp::Eq => match peel_eq(lhs, k, ctx)? {
            Peeled::Test(leaf) => Ok(Expr::Match(leaf)),
            Peeled::Always(v) => Ok(decided(v, ctx)),
        },
        RelOp::Ne => match peel_eq(lhs, k, ctx)? {
            Peeled::Test(leaf) => Ok(negate_leaf(&leaf, ctx.config.ineq)),
            Peeled::Always(v) => Ok(decided(!v, ctx)),
        },
        _ => lower_ineq(op, lhs, k, ctx),
    }
}

fn decided(v: bool, ctx: &mut CompilationContext) -> Expr {
    if v {
        ctx.warn("comparison always holds");
    } else {
        ctx.warn("comparison can never hold");
    }
    Expr::truth(v)
}

/// Result of reducing an equality to canonical form.
enum Peeled {
    Test(MatchLeaf),
    Always(bool),
}

/// Reduce `lhs == k` to a field test by peeling invertible operators.
fn peel_eq(lhs: Expr, k: Num, ctx: &mut CompilationContext) -> Result<Peeled, CompileError> {
    let w = lhs.width().max(k.width);
    peel(lhs, w.mask(), k.value & w.mask(), w, ctx)
}

/// Maintain the constraint `(e & m) == v` (with `v` a subset of `m`) while
/// descending through the left-hand side.
fn peel(
    e: Expr,
    m: u128,
    v: u128,
    w: Width,
    ctx: &mut CompilationContext,
) -> Result<Peeled, CompileError> {
    match e {
        Expr::Const(Value::Num(n)) => Ok(Peeled::Always(n.value & m == v)),
        Expr::Field(f) => field_test(f, m, v),
        Expr::Access {
            group,
            offset,
            length,
        } => {
            let f = resolve_access(group, *offset, length, ctx)?;
            field_test(f, m, v)
        }
        Expr::Arith(op, a, b) => {
            let (a, b) = (*a, *b);
            let (a, b) = match op {
                ArithOp::Add | ArithOp::Mul | ArithOp::BitAnd | ArithOp::BitOr | ArithOp::BitXor
                    if a.as_num().is_some() =>
                {
                    (b, a)
                }
                _ => (a, b),
            };
            let Some(c) = b.as_num() else {
                let e = Expr::Arith(op, Box::new(a), Box::new(b));
                return Err(CompileError::NonConstantComparison(e.to_string()));
            };
            let c = c.value & w.mask();
            match op {
                ArithOp::BitAnd => {
                    if v & m & !c != 0 {
                        return Ok(Peeled::Always(false));
                    }
                    peel(a, m & c, v & c, w, ctx)
                }
                ArithOp::BitOr => {
                    if (c & m) & !v != 0 {
                        return Ok(Peeled::Always(false));
                    }
                    peel(a, m & !c, v & !c, w, ctx)
                }
                ArithOp::BitXor => peel(a, m, (v ^ c) & m, w, ctx),
                ArithOp::Add | ArithOp::Sub => {
                    // Wrapping addition commutes with truncation only when
                    // the whole width is still constrained.
                    if m != w.mask() {
                        let e = Expr::Arith(op, Box::new(a), Box::new(b));
                        return Err(CompileError::NonConstantComparison(e.to_string()));
                    }
                    let v2 = if op == ArithOp::Add {
                        v.wrapping_sub(c)
                    } else {
                        v.wrapping_add(c)
                    } & m;
                    peel(a, m, v2, w, ctx)
                }
                ArithOp::Shl => {
                    let s = shift_amount(c, w);
                    if s >= w.bits() {
                        ctx.warn("shift amount exceeds operand width");
                        return Ok(Peeled::Always(v == 0));
                    }
                    if v & low_mask(s) != 0 {
                        return Ok(Peeled::Always(false));
                    }
                    peel(a, m >> s, v >> s, w, ctx)
                }
                ArithOp::Shr => {
                    let s = shift_amount(c, w);
                    if s >= w.bits() {
                        ctx.warn("shift amount exceeds operand width");
                        return Ok(Peeled::Always(v == 0));
                    }
                    if v & !low_mask(w.bits() - s) != 0 {
                        return Ok(Peeled::Always(false));
                    }
                    peel(a, (m << s) & w.mask(), (v << s) & w.mask(), w, ctx)
                }
                ArithOp::Mul | ArithOp::Div | ArithOp::Mod => {
                    let e = Expr::Arith(op, Box::new(a), Box::new(b));
                    Err(CompileError::NonConstantComparison(e.to_string()))
                }
            }
        }
        other => Err(CompileError::NonConstantComparison(other.to_string())),
    }
}

fn shift_amount(c: u128, w: Width) -> u32 {
    c.min(u128::from(w.bits())) as u32
}

/// Base case of peeling: the constraint lands on a concrete field.
fn field_test(f: FieldRef, m: u128, v: u128) -> Result<Peeled, CompileError> {
    if f.length > MAX_COND_BYTES {
        return Err(CompileError::FieldTooWide {
            length: f.length,
            max: MAX_COND_BYTES,
        });
    }
    let n = f.bits();
    // Bits above the field are zero; a constraint demanding a one there can
    // never hold.
    if v & !low_mask(n) != 0 {
        return Ok(Peeled::Always(false));
    }
    let m = m & low_mask(n);
    if m == 0 {
        return Ok(Peeled::Always(true));
    }
    let wf = Width::for_bytes(f.length);
    Ok(Peeled::Test(MatchLeaf::new(
        f,
        Num::new(m, wf),
        Num::new(v, wf),
    )))
}

/// Resolve the ternary access form to a field reference, interning a derived
/// offset group when the offset depends on packet contents.
fn resolve_access(
    group: GroupId,
    offset: Expr,
    length: u8,
    ctx: &mut CompilationContext,
) -> Result<FieldRef, CompileError> {
    if length > MAX_COND_BYTES {
        return Err(CompileError::FieldTooWide {
            length,
            max: MAX_COND_BYTES,
        });
    }
    // Split off an additive constant displacement.
    let (shape, disp) = match offset {
        Expr::Arith(ArithOp::Add, a, b) => {
            if let Some(n) = b.as_num() {
                (*a, n.value)
            } else if let Some(n) = a.as_num() {
                (*b, n.value)
            } else {
                let e = Expr::Arith(ArithOp::Add, a, b);
                return Err(CompileError::UnsupportedOffset(e.to_string()));
            }
        }
        other => (other, 0),
    };
    let disp = u16::try_from(disp)
        .map_err(|_| CompileError::UnsupportedOffset(format!("displacement {disp}")))?;
    match shape {
        Expr::Const(Value::Num(n)) => {
            let off = n
                .value
                .checked_add(u128::from(disp))
                .and_then(|o| u16::try_from(o).ok())
                .ok_or_else(|| CompileError::UnsupportedOffset(format!("offset {n}")))?;
            Ok(FieldRef::new(group, off, length))
        }
        Expr::Field(f) => Ok(derived(group, f, 0, disp, length, ctx)),
        Expr::Arith(ArithOp::Shl, a, s) => match (*a, s.as_num()) {
            (Expr::Field(f), Some(s)) if s.value < 8 => {
                Ok(derived(group, f, s.value as u8, disp, length, ctx))
            }
            (a, _) => Err(CompileError::UnsupportedOffset(a.to_string())),
        },
        other => Err(CompileError::UnsupportedOffset(other.to_string())),
    }
}

fn derived(
    base: GroupId,
    from: FieldRef,
    shift: u8,
    disp: u16,
    length: u8,
    ctx: &mut CompilationContext,
) -> FieldRef {
    let gid = ctx.groups.intern_derived(GroupBase::Derived {
        base,
        from: from.group,
        at: from.offset,
        length: from.length,
        shift,
    });
    FieldRef::new(gid, disp, length)
}

/// `!(field & mask == value)` as an OR of positive matches. Also the
/// negative-polarity match expansion of the negation eliminator.
pub(crate) fn negate_leaf(leaf: &MatchLeaf, mode: IneqLowering) -> Expr {
    let wf = leaf.mask.width;
    let mut leaves = Vec::new();
    let mut seen = 0_u128;
    for i in (0..wf.bits()).rev() {
        let bit = 1_u128 << i;
        if leaf.mask.value & bit == 0 {
            continue;
        }
        match mode {
            // One disjunct per tested bit, each a single-bit mismatch.
            IneqLowering::BitTests => {
                leaves.push(MatchLeaf::new(
                    leaf.field,
                    Num::new(bit, wf),
                    Num::new(!leaf.value.value & bit, wf),
                ));
            }
            // Disjoint first-difference prefixes: agree on the bits already
            // seen, differ at this one.
            IneqLowering::PrefixTests => {
                leaves.push(MatchLeaf::new(
                    leaf.field,
                    Num::new(seen | bit, wf),
                    Num::new((leaf.value.value & seen) | (!leaf.value.value & bit), wf),
                ));
            }
        }
        seen |= bit;
    }
    or_chain(leaves.into_iter().map(Expr::Match).collect())
}

/// Lower `lhs OP k` for the four order operators.
fn lower_ineq(
    op: RelOp,
    lhs: Expr,
    k: Num,
    ctx: &mut CompilationContext,
) -> Result<Expr, CompileError> {
    // Canonicalize to strict-below or at-least form.
    let (below, k) = match op {
        RelOp::Lt => (true, k.value),
        RelOp::Ge => (false, k.value),
        RelOp::Le => match k.value.checked_add(1) {
            Some(k1) => (true, k1),
            None => return Ok(decided(true, ctx)),
        },
        RelOp::Gt => match k.value.checked_add(1) {
            Some(k1) => (false, k1),
            None => return Ok(decided(false, ctx)),
        },
        RelOp::Eq | RelOp::Ne => {
            return Err(CompileError::UnhandledOperator {
                pass: "arith",
                op: format!("{op:?}"),
            })
        }
    };
    // Absorb the field side's monotonic right shifts (`x >> s < K` is
    // `x < K << s`) and constant masks, which restrict the bits the
    // decomposition below may test.
    let mut e = lhs;
    let mut k = k;
    let mut m = u128::MAX;
    let w = e.width().max(k_width(k));
    loop {
        match e {
            Expr::Arith(ArithOp::Shr, a, b) => match b.as_num() {
                Some(s) => {
                    let s = shift_amount(s.value, w);
                    if s >= w.bits() || k > (w.mask() >> s) {
                        return Ok(decided(below, ctx));
                    }
                    k <<= s;
                    m = (m << s) & w.mask();
                    e = *a;
                }
                None => {
                    let rebuilt = Expr::Arith(ArithOp::Shr, a, b);
                    return Err(CompileError::NonConstantComparison(rebuilt.to_string()));
                }
            },
            Expr::Arith(ArithOp::BitAnd, a, b) => match b.as_num() {
                Some(c) => {
                    m &= c.value;
                    e = *a;
                }
                None => {
                    let rebuilt = Expr::Arith(ArithOp::BitAnd, a, b);
                    return Err(CompileError::NonConstantComparison(rebuilt.to_string()));
                }
            },
            other => {
                e = other;
                break;
            }
        }
    }
    let f = match e {
        Expr::Field(f) => f,
        Expr::Access {
            group,
            offset,
            length,
        } => resolve_access(group, *offset, length, ctx)?,
        other => return Err(CompileError::NonConstantComparison(other.to_string())),
    };
    if f.length > MAX_COND_BYTES {
        return Err(CompileError::FieldTooWide {
            length: f.length,
            max: MAX_COND_BYTES,
        });
    }
    let n = f.bits();
    let m = m & low_mask(n);
    if k == 0 {
        // Nothing is below zero; everything is at least zero.
        return Ok(decided(!below, ctx));
    }
    if k > m {
        // The masked field can never reach the bound.
        return Ok(decided(below, ctx));
    }
    let leaves = if below {
        lt_leaves(k, n)
    } else {
        ge_leaves(k, n)
    };
    let wf = Width::for_bytes(f.length);
    let mode = ctx.config.ineq;
    let mut alts = Vec::new();
    for (mask, value) in leaves {
        // Bits the absorbed mask cleared are zero in the tested value: a
        // prefix demanding a one there never matches, and the rest of the
        // prefix shrinks to the bits that can vary.
        if value & !m != 0 {
            continue;
        }
        let mask = mask & m;
        if mask == 0 {
            return Ok(decided(true, ctx));
        }
        alts.push(leaf_expr(f, mask, value, wf, mode));
    }
    Ok(or_chain(alts))
}

fn k_width(k: u128) -> Width {
    if k > u128::from(u32::MAX) {
        Width::W128
    } else {
        Width::W32
    }
}

/// Prefix tests covering `x < k` over an `n`-bit field: one per set bit of
/// `k`, matching the higher bits exactly and that bit as zero.
fn lt_leaves(k: u128, n: u32) -> Vec<(u128, u128)> {
    let mut out = Vec::new();
    let mut prefix = 0_u128;
    for i in (0..n).rev() {
        let bit = 1_u128 << i;
        if k & bit != 0 {
            out.push((prefix | bit, k & prefix));
        }
        prefix |= bit;
    }
    out
}

/// Prefix tests covering `x >= k`: one per clear bit of `k` (that bit as
/// one, higher bits exact) plus the exact value itself.
fn ge_leaves(k: u128, n: u32) -> Vec<(u128, u128)> {
    let mut out = Vec::new();
    let mut prefix = 0_u128;
    for i in (0..n).rev() {
        let bit = 1_u128 << i;
        if k & bit == 0 {
            out.push((prefix | bit, (k & prefix) | bit));
        }
        prefix |= bit;
    }
    out.push((low_mask(n), k));
    out
}

/// One prefix test as an expression, split per bit when configured so.
fn leaf_expr(f: FieldRef, mask: u128, value: u128, wf: Width, mode: IneqLowering) -> Expr {
    match mode {
        IneqLowering::PrefixTests => {
            Expr::Match(MatchLeaf::new(f, Num::new(mask, wf), Num::new(value, wf)))
        }
        IneqLowering::BitTests => {
            let mut bits = Vec::new();
            for i in (0..wf.bits()).rev() {
                let bit = 1_u128 << i;
                if mask & bit != 0 {
                    bits.push(Expr::Match(MatchLeaf::new(
                        f,
                        Num::new(bit, wf),
                        Num::new(value & bit, wf),
                    )));
                }
            }
            and_chain(bits)
        }
    }
}

/// Right-leaning OR of the given alternatives; empty input is `false`.
fn or_chain(mut v: Vec<Expr>) -> Expr {
    let mut acc = match v.pop() {
        Some(e) => e,
        None => return Expr::truth(false),
    };
    while let Some(e) = v.pop() {
        acc = e.or(acc);
    }
    acc
}

/// Right-leaning AND of the given conjuncts; empty input is `true`.
fn and_chain(mut v: Vec<Expr>) -> Expr {
    let mut acc = match v.pop() {
        Some(e) => e,
        None => return Expr::truth(true),
    };
    while let Some(e) = v.pop() {
        acc = e.and(acc);
    }
    acc
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{field, meta, Config, MetaField, OffsetGroups, PROTO_IPV4};
    use std::net::Ipv4Addr;

    fn opt(e: Expr) -> Expr {
        let mut ctx = CompilationContext::new();
        optimize(e, &mut ctx).unwrap()
    }

    fn leaf_of(e: &Expr) -> &MatchLeaf {
        match e {
            Expr::Match(m) => m,
            other => panic!("not a match leaf: {other}"),
        }
    }

    #[test]
    fn equality_becomes_match() {
        let e = opt(field(OffsetGroups::PACKET, 9, 1).eq(6_u32));
        let m = leaf_of(&e);
        assert_eq!(m.mask.value, 0xff);
        assert_eq!(m.value.value, 6);
    }

    #[test]
    fn masked_equality_keeps_mask() {
        let e = opt(field(OffsetGroups::PACKET, 0, 1).mask(0xf0_u32).eq(0x40_u32));
        let m = leaf_of(&e);
        assert_eq!(m.mask.value, 0xf0);
        assert_eq!(m.value.value, 0x40);
    }

    #[test]
    fn masked_equality_outside_mask_is_unsat() {
        let mut ctx = CompilationContext::new();
        let e = field(OffsetGroups::PACKET, 0, 1).mask(0xf0_u32).eq(0x41_u32);
        let r = optimize(e, &mut ctx).unwrap();
        assert_eq!(r, Expr::truth(false));
        assert_eq!(ctx.diagnostics().len(), 1);
    }

    #[test]
    fn shift_peels_into_mask() {
        // version field: top nibble of byte 0.
        let e = opt(field(OffsetGroups::PACKET, 0, 1).shr(4).eq(4_u32));
        let m = leaf_of(&e);
        assert_eq!(m.mask.value, 0xf0);
        assert_eq!(m.value.value, 0x40);
    }

    #[test]
    fn xor_and_add_are_inverted() {
        let f = || field(OffsetGroups::PACKET, 2, 2);
        let e = opt(f().arith(ArithOp::BitXor, Expr::Const(Value::from(0xff_u32))).eq(0xff_u32));
        assert_eq!(leaf_of(&e).value.value, 0);
        let e = opt(f().arith(ArithOp::Add, Expr::Const(Value::from(1_u32))).eq(5_u32));
        assert_eq!(leaf_of(&e).value.value, 4);
    }

    #[test]
    fn pow2_mul_div_mod_reduce() {
        let f = || field(OffsetGroups::PACKET, 2, 2);
        // (x * 4) == 8  =>  (x << 2) == 8  =>  x masked test on value 2.
        let e = opt(f().arith(ArithOp::Mul, Expr::Const(Value::from(4_u32))).eq(8_u32));
        assert_eq!(leaf_of(&e).value.value, 2);
        // (x % 8) == 3  =>  (x & 7) == 3.
        let e = opt(f().arith(ArithOp::Mod, Expr::Const(Value::from(8_u32))).eq(3_u32));
        let m = leaf_of(&e);
        assert_eq!(m.mask.value, 7);
        assert_eq!(m.value.value, 3);
    }

    #[test]
    fn division_by_zero_reported() {
        let mut ctx = CompilationContext::new();
        let e = field(OffsetGroups::PACKET, 0, 1)
            .arith(ArithOp::Div, Expr::Const(Value::from(0_u32)))
            .eq(1_u32);
        assert!(matches!(
            optimize(e, &mut ctx),
            Err(CompileError::DivisionByZero)
        ));
    }

    #[test]
    fn non_numeric_constant_in_boolean_position_is_rejected() {
        let mut ctx = CompilationContext::new();
        let e = Expr::Const(Value::Rate(1e6)).and(field(OffsetGroups::PACKET, 0, 1).eq(1_u32));
        assert!(matches!(
            optimize(e, &mut ctx),
            Err(CompileError::NotBoolean(_))
        ));
    }

    #[test]
    fn constant_comparison_folds() {
        let e = opt(Expr::Const(Value::from(3_u32)).lt(4_u32));
        assert_eq!(e, Expr::truth(true));
    }

    #[test]
    fn mirrored_comparison_normalizes() {
        // 6 == field  mirrors to  field == 6.
        let e = opt(Expr::Rel(
            RelOp::Eq,
            Box::new(Expr::Const(Value::from(6_u32))),
            Box::new(field(OffsetGroups::PACKET, 9, 1)),
        ));
        assert_eq!(leaf_of(&e).value.value, 6);
    }

    #[test]
    fn value_beyond_field_range_is_unsat() {
        let mut ctx = CompilationContext::new();
        let e = field(OffsetGroups::PACKET, 9, 1).eq(0x1ff_u32);
        assert_eq!(optimize(e, &mut ctx).unwrap(), Expr::truth(false));
    }

    #[test]
    fn ne_prefix_decomposition_is_disjoint() {
        let e = opt(field(OffsetGroups::PACKET, 9, 1).ne(0_u32));
        // Eight disjoint first-difference prefixes over one byte.
        let mut seen = 0;
        let mut cur = &e;
        while let Expr::Or(a, b) = cur {
            assert!(matches!(**a, Expr::Match(_)));
            seen += 1;
            cur = b;
        }
        assert!(matches!(cur, Expr::Match(_)));
        assert_eq!(seen + 1, 8);
    }

    #[test]
    fn ne_bit_mode_flips_single_bits() {
        let mut ctx = CompilationContext::with_config(Config {
            ineq: IneqLowering::BitTests,
            ..Config::default()
        });
        let e = field(OffsetGroups::PACKET, 0, 1).mask(0x03_u32).ne(0x01_u32);
        let e = optimize(e, &mut ctx).unwrap();
        match e {
            Expr::Or(a, b) => {
                let ma = leaf_of(&a);
                let mb = leaf_of(&b);
                assert_eq!((ma.mask.value, ma.value.value), (0x02, 0x02));
                assert_eq!((mb.mask.value, mb.value.value), (0x01, 0x00));
            }
            other => panic!("unexpected shape: {other}"),
        }
    }

    #[test]
    fn lt_covers_exactly_below() {
        // x < 5 over a byte: prefixes 0xx.. (x<4) and 100 (x=4).
        let e = opt(field(OffsetGroups::PACKET, 0, 1).lt(5_u32));
        let mut leaves = Vec::new();
        let mut cur = &e;
        while let Expr::Or(a, b) = cur {
            leaves.push(leaf_of(a));
            cur = b;
        }
        leaves.push(leaf_of(cur));
        for x in 0_u128..=255 {
            let matched = leaves
                .iter()
                .any(|l| x & l.mask.value == l.value.value);
            assert_eq!(matched, x < 5, "x = {x}");
        }
    }

    #[test]
    fn ge_covers_exactly_at_least() {
        let e = opt(field(OffsetGroups::PACKET, 0, 1).ge(200_u32));
        let mut leaves = Vec::new();
        let mut cur = &e;
        while let Expr::Or(a, b) = cur {
            leaves.push(leaf_of(a));
            cur = b;
        }
        leaves.push(leaf_of(cur));
        for x in 0_u128..=255 {
            let matched = leaves
                .iter()
                .any(|l| x & l.mask.value == l.value.value);
            assert_eq!(matched, x >= 200, "x = {x}");
        }
    }

    #[test]
    fn masked_aligned_boundary_becomes_one_test() {
        // (x & 0xf0) < 0x40 tests only the two bits above the boundary.
        let e = opt(field(OffsetGroups::PACKET, 9, 1).mask(0xf0_u32).lt(0x40_u32));
        let m = leaf_of(&e);
        assert_eq!(m.mask.value, 0xc0);
        assert_eq!(m.value.value, 0);
    }

    #[test]
    fn masked_inequality_covers_exactly() {
        let e = opt(field(OffsetGroups::PACKET, 0, 1).mask(0xf0_u32).ge(0x30_u32));
        let mut leaves = Vec::new();
        let mut cur = &e;
        while let Expr::Or(a, b) = cur {
            leaves.push(leaf_of(a));
            cur = b;
        }
        leaves.push(leaf_of(cur));
        for l in &leaves {
            assert_eq!(l.mask.value & !0xf0, 0, "leaf tests outside the mask");
        }
        for x in 0_u128..=255 {
            let matched = leaves
                .iter()
                .any(|l| x & l.mask.value == l.value.value);
            assert_eq!(matched, (x & 0xf0) >= 0x30, "x = {x}");
        }
    }

    #[test]
    fn shifted_mask_inequality_lands_on_the_source_bits() {
        // ((x >> 4) & 0x0c) >= 4 is a test of the top two bits of x.
        let e = opt(
            field(OffsetGroups::PACKET, 0, 1)
                .shr(4)
                .mask(0x0c_u32)
                .ge(4_u32),
        );
        let mut leaves = Vec::new();
        let mut cur = &e;
        while let Expr::Or(a, b) = cur {
            leaves.push(leaf_of(a));
            cur = b;
        }
        leaves.push(leaf_of(cur));
        for x in 0_u128..=255 {
            let matched = leaves
                .iter()
                .any(|l| x & l.mask.value == l.value.value);
            assert_eq!(matched, ((x >> 4) & 0x0c) >= 4, "x = {x}");
        }
    }

    #[test]
    fn mask_bounds_fold() {
        let mut ctx = CompilationContext::new();
        let e = field(OffsetGroups::PACKET, 0, 1).mask(0x0f_u32).lt(0x10_u32);
        assert_eq!(optimize(e, &mut ctx).unwrap(), Expr::truth(true));
        let e = field(OffsetGroups::PACKET, 0, 1).mask(0x0f_u32).ge(0x10_u32);
        assert_eq!(optimize(e, &mut ctx).unwrap(), Expr::truth(false));
    }

    #[test]
    fn unreachable_bounds_fold() {
        let mut ctx = CompilationContext::new();
        let e = field(OffsetGroups::PACKET, 0, 1).lt(0x100_u32);
        assert_eq!(optimize(e, &mut ctx).unwrap(), Expr::truth(true));
        let e = field(OffsetGroups::PACKET, 0, 1).ge(0x100_u32);
        assert_eq!(optimize(e, &mut ctx).unwrap(), Expr::truth(false));
        let e = field(OffsetGroups::PACKET, 0, 1).lt(0_u32);
        assert_eq!(optimize(e, &mut ctx).unwrap(), Expr::truth(false));
    }

    #[test]
    fn ipv6_width_matches_ipv4_behavior() {
        // Same shape at both widths.
        let e4 = opt(field(OffsetGroups::PACKET, 16, 4).eq(Ipv4Addr::new(10, 0, 0, 1)));
        let e6 = opt(field(OffsetGroups::PACKET, 24, 16).eq(std::net::Ipv6Addr::LOCALHOST));
        assert_eq!(leaf_of(&e4).mask.value, u128::from(u32::MAX));
        assert_eq!(leaf_of(&e6).mask.value, u128::MAX);
        assert_eq!(leaf_of(&e6).value.value, 1);
    }

    #[test]
    fn meta_protocol_match() {
        let e = opt(meta(MetaField::Protocol).eq(PROTO_IPV4));
        let m = leaf_of(&e);
        assert_eq!(m.field.group, OffsetGroups::META);
        assert_eq!(m.value.value, 0x0800);
    }

    #[test]
    fn computed_offset_interns_derived_group() {
        let mut ctx = CompilationContext::new();
        // Offset = (byte 0 low nibble) << 2, the IPv4 header-length idiom.
        let ihl = field(OffsetGroups::PACKET, 0, 1).mask(0x0f_u32);
        let e = Expr::Access {
            group: OffsetGroups::PACKET,
            offset: Box::new(ihl.shl(2)),
            length: 2,
        }
        .eq(80_u32);
        // The masked length read is not a plain field; offsets support only
        // field / shifted-field / plus-constant shapes.
        assert!(matches!(
            optimize(e, &mut ctx),
            Err(CompileError::UnsupportedOffset(_))
        ));

        let e = Expr::Access {
            group: OffsetGroups::PACKET,
            offset: Box::new(field(OffsetGroups::PACKET, 2, 1).shl(2)),
            length: 2,
        }
        .eq(80_u32);
        let r = optimize(e, &mut ctx).unwrap();
        let m = leaf_of(&r);
        assert_ne!(m.field.group, OffsetGroups::PACKET);
        assert_eq!(ctx.groups.len(), 3);
    }

    #[test]
    fn truthiness_of_bare_field() {
        let e = opt(field(OffsetGroups::PACKET, 0, 1));
        // Lowered as field != 0.
        assert!(matches!(e, Expr::Or(_, _)));
    }

    #[test]
    fn idempotent_on_match_output() {
        let mut ctx = CompilationContext::new();
        let e = field(OffsetGroups::PACKET, 9, 1).eq(6_u32);
        let once = optimize(e, &mut ctx).unwrap();
        let twice = optimize(once.clone(), &mut ctx).unwrap();
        assert_eq!(once, twice);
    }
}
