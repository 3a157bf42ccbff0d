//! Negation elimination.
//!
//! Threads a pair of continuations, `(next, otherwise)`, through the boolean
//! structure: `next` is what follows when the current subtree holds,
//! `otherwise` when it does not. A NOT node costs nothing, it swaps the two.
//! At the leaves the continuations are spliced back in; a `Match` leaf under
//! negative polarity expands through the configured mismatch decomposition
//! (single-bit tests or disjoint prefixes, shared with the relational
//! lowering; free when the mask tests one bit), a `conform` leaf flips its
//! polarity in place, and `count` and decision leaves are unconditionally
//! true, so their `otherwise` continuation is unreachable and negating them
//! only earns a diagnostic.
//!
//! The output contains no NOT nodes. Splicing a non-constant continuation
//! into more than one place duplicates work; the caller is told through the
//! `duplicated` flag.

use crate::arith::negate_leaf;
use crate::types::{CompilationContext, CompileError, Expr, Value};

/// Result of negation elimination.
#[derive(Debug, Clone, PartialEq)]
pub struct Eliminated {
    pub expr: Expr,
    /// Whether a non-constant continuation was spliced in more than once.
    pub duplicated: bool,
}

/// Rewrite `e` into an equivalent NOT-free expression.
pub fn eliminate(e: Expr, ctx: &mut CompilationContext) -> Result<Eliminated, CompileError> {
    let mut duplicated = false;
    let expr = walk(
        e,
        Expr::truth(true),
        Expr::truth(false),
        true,
        ctx,
        &mut duplicated,
    )?;
    Ok(Eliminated { expr, duplicated })
}

fn walk(
    e: Expr,
    next: Expr,
    otherwise: Expr,
    polar: bool,
    ctx: &mut CompilationContext,
    duplicated: &mut bool,
) -> Result<Expr, CompileError> {
    match e {
        Expr::Not(x) => walk(*x, otherwise, next, !polar, ctx, duplicated),
        Expr::And(a, b) => {
            let rest = walk(*b, next, otherwise.clone(), polar, ctx, duplicated)?;
            walk(*a, rest, otherwise, polar, ctx, duplicated)
        }
        Expr::Or(a, b) => {
            let rest = walk(*b, next.clone(), otherwise, polar, ctx, duplicated)?;
            walk(*a, next, rest, polar, ctx, duplicated)
        }
        Expr::Const(Value::Num(n)) => Ok(if n.is_zero() { otherwise } else { next }),
        Expr::Match(m) => {
            let neg = negate_leaf(&m, ctx.config.ineq);
            Ok(branch(Expr::Match(m), neg, next, otherwise, duplicated))
        }
        Expr::Conform { bucket, expect } => Ok(branch(
            Expr::Conform { bucket, expect },
            Expr::Conform {
                bucket,
                expect: !expect,
            },
            next,
            otherwise,
            duplicated,
        )),
        Expr::Count(b) => {
            if !polar {
                ctx.warn("negated count is never taken but still consumes tokens");
            }
            Ok(seq(Expr::Count(b), next))
        }
        Expr::Decision(d) => {
            if !polar {
                ctx.warn("negation of a decision has no effect");
            }
            Ok(seq(Expr::Decision(d), next))
        }
        Expr::Action(a) => Ok(seq(Expr::Action(a), next)),
        other => Err(CompileError::UnhandledOperator {
            pass: "negate",
            op: other.to_string(),
        }),
    }
}

/// Splice the continuations around a pure two-way leaf.
fn branch(pos: Expr, neg: Expr, next: Expr, otherwise: Expr, duplicated: &mut bool) -> Expr {
    // The leaf is pure, so equal continuations make it irrelevant.
    if next == otherwise {
        return next;
    }
    match (next.as_bool(), otherwise.as_bool()) {
        (Some(true), Some(false)) => pos,
        (Some(false), Some(true)) => neg,
        (Some(v), Some(_)) => Expr::truth(v),
        (Some(true), None) => pos.or(otherwise),
        (Some(false), None) => neg.and(otherwise),
        (None, Some(false)) => pos.and(next),
        (None, Some(true)) => neg.or(next),
        (None, None) => {
            // When the failure continuation already trails the success one
            // as an OR alternative, ordered evaluation falls through to it
            // on its own.
            if let Expr::Or(x, tail) = &next {
                if **tail == otherwise {
                    return pos.and((**x).clone()).or(otherwise);
                }
            }
            if let Expr::Or(x, tail) = &otherwise {
                if **tail == next {
                    return neg.and((**x).clone()).or(next);
                }
            }
            *duplicated = true;
            pos.and(next).or(neg.and(otherwise))
        }
    }
}

/// An always-true leaf followed by its continuation.
fn seq(leaf: Expr, next: Expr) -> Expr {
    if next.as_bool() == Some(true) {
        leaf
    } else {
        leaf.and(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{
        conform, count, decide, BucketId, Config, Decision, FieldRef, IneqLowering, MatchLeaf,
        Num, OffsetGroups, Width,
    };

    fn m(offset: u16, mask: u128, value: u128) -> Expr {
        Expr::Match(MatchLeaf::new(
            FieldRef::new(OffsetGroups::PACKET, offset, 1),
            Num::new(mask, Width::W32),
            Num::new(value, Width::W32),
        ))
    }

    fn run(e: Expr) -> Eliminated {
        let mut ctx = CompilationContext::new();
        eliminate(e, &mut ctx).unwrap()
    }

    fn has_not(e: &Expr) -> bool {
        match e {
            Expr::Not(_) => true,
            Expr::And(a, b) | Expr::Or(a, b) => has_not(a) || has_not(b),
            _ => false,
        }
    }

    #[test]
    fn positive_formula_is_unchanged() {
        let e = m(0, 0xff, 1).and(m(1, 0xff, 2)).or(m(2, 0xff, 3));
        let r = run(e.clone());
        assert_eq!(r.expr, e);
        assert!(!r.duplicated);
    }

    #[test]
    fn single_bit_match_negates_in_place() {
        let r = run(!m(0, 0x80, 0x80));
        assert_eq!(r.expr, m(0, 0x80, 0));
    }

    fn or_leaves(e: &Expr) -> Vec<Expr> {
        let mut leaves = Vec::new();
        let mut cur = e;
        while let Expr::Or(a, b) = cur {
            leaves.push((**a).clone());
            cur = b;
        }
        leaves.push(cur.clone());
        leaves
    }

    #[test]
    fn multi_bit_match_negates_to_prefix_or() {
        // Default mode: disjoint first-difference prefixes.
        let r = run(!m(0, 0x03, 0x01));
        let leaves = or_leaves(&r.expr);
        assert_eq!(leaves.len(), 2);
        assert!(leaves.contains(&m(0, 0x02, 0x02)));
        assert!(leaves.contains(&m(0, 0x03, 0x00)));
        assert!(!has_not(&r.expr));
    }

    #[test]
    fn multi_bit_match_negates_per_bit_when_configured() {
        let mut ctx = CompilationContext::with_config(Config {
            ineq: IneqLowering::BitTests,
            ..Config::default()
        });
        // Some tested bit differs: bit 0 clear or bit 1 set.
        let r = eliminate(!m(0, 0x03, 0x01), &mut ctx).unwrap();
        let leaves = or_leaves(&r.expr);
        assert_eq!(leaves.len(), 2);
        assert!(leaves.contains(&m(0, 0x01, 0x00)));
        assert!(leaves.contains(&m(0, 0x02, 0x02)));
        assert!(!has_not(&r.expr));
    }

    #[test]
    fn de_morgan_over_and() {
        let r = run(!(m(0, 0x80, 0x80).and(m(1, 0x01, 0x01))));
        assert_eq!(r.expr, m(0, 0x80, 0).or(m(1, 0x01, 0)));
    }

    #[test]
    fn de_morgan_over_or() {
        let r = run(!(m(0, 0x80, 0x80).or(m(1, 0x01, 0x01))));
        assert_eq!(r.expr, m(0, 0x80, 0).and(m(1, 0x01, 0)));
    }

    #[test]
    fn double_negation_cancels() {
        let e = m(0, 0xff, 7);
        let r = run(!!e.clone());
        assert_eq!(r.expr, e);
    }

    #[test]
    fn conform_negation_flips_polarity() {
        let b = BucketId(0);
        let r = run(!conform(b));
        assert_eq!(
            r.expr,
            Expr::Conform {
                bucket: b,
                expect: false
            }
        );
    }

    #[test]
    fn negated_count_keeps_the_side_effect() {
        let mut ctx = CompilationContext::new();
        let b = BucketId(0);
        let r = eliminate(!count(b), &mut ctx).unwrap();
        assert_eq!(r.expr, count(b).and(Expr::truth(false)));
        assert_eq!(ctx.diagnostics().len(), 1);
    }

    #[test]
    fn conform_false_branch_threads_the_default() {
        // match && conform && drop, defaulting to continue.
        let b = BucketId(0);
        let gate = m(0, 0xff, 1);
        let e = gate
            .clone()
            .and(conform(b))
            .and(decide(Decision::Drop))
            .or(decide(Decision::Continue));
        let r = run(e);
        assert!(r.duplicated);
        // The default appears behind both the failed gate and the failed
        // conformance test.
        let shown = r.expr.to_string();
        assert!(shown.contains("!conform(0)"), "{shown}");
        assert!(!has_not(&r.expr));
    }

    #[test]
    fn leftover_relational_is_an_internal_error() {
        let mut ctx = CompilationContext::new();
        let e = crate::types::field(OffsetGroups::PACKET, 0, 1).eq(1_u32);
        assert!(matches!(
            eliminate(e, &mut ctx),
            Err(CompileError::UnhandledOperator { pass: "negate", .. })
        ));
    }
}
