//! Boolean normalization.
//!
//! Rewrites the logical skeleton of an expression into a right-leaning
//! OR-of-ANDs: associative chains are flattened, AND distributes over OR
//! (cloning the shared operand), and constant operands shortcut the usual
//! way. Two things survive untouched: side-effecting `count` operands,
//! which may never be pruned even when the result is already decided, and
//! recognized action subtrees, whose internal OR structure encodes policing
//! alternatives rather than match alternatives.
//!
//! The pass is idempotent; running it on its own output is a no-op.

use crate::types::{CompilationContext, Expr};

/// Normalize the boolean structure of `e`.
#[must_use]
pub fn normalize(e: Expr, ctx: &mut CompilationContext) -> Expr {
    match e {
        Expr::And(a, b) => {
            let a = normalize(*a, ctx);
            let b = normalize(*b, ctx);
            conjoin(a, b, ctx)
        }
        Expr::Or(a, b) => {
            let a = normalize(*a, ctx);
            let b = normalize(*b, ctx);
            disjoin(a, b, ctx)
        }
        Expr::Not(x) => {
            let x = normalize(*x, ctx);
            match x.as_bool() {
                Some(v) => Expr::truth(!v),
                None => !x,
            }
        }
        other => other,
    }
}

/// Combine two normalized operands under AND, restoring the normal form.
fn conjoin(a: Expr, b: Expr, ctx: &mut CompilationContext) -> Expr {
    // Constant shortcuts. A false left side means the right side never
    // evaluates; a false right side still lets the left side's effects
    // fire first.
    if let Some(v) = a.as_bool() {
        return if v { b } else { Expr::truth(false) };
    }
    if let Some(v) = b.as_bool() {
        if v {
            return a;
        }
        return if a.has_side_effect() {
            a.and(Expr::truth(false))
        } else {
            Expr::truth(false)
        };
    }
    match a {
        // Right-lean nested ANDs.
        Expr::And(a1, a2) => {
            let rest = conjoin(*a2, b, ctx);
            conjoin(*a1, rest, ctx)
        }
        // Distribute over a left OR, cloning the right operand into each
        // alternative.
        Expr::Or(a1, a2) if !(a1.is_action_subtree() && a2.is_action_subtree()) => {
            if b.has_side_effect() {
                ctx.warn("side effect duplicated across alternatives");
            }
            let left = conjoin(*a1, b.clone(), ctx);
            let right = conjoin(*a2, b, ctx);
            disjoin(left, right, ctx)
        }
        a => match b {
            // Distribute over a right OR, cloning the left operand.
            Expr::Or(b1, b2) if !(b1.is_action_subtree() && b2.is_action_subtree()) => {
                if a.has_side_effect() {
                    ctx.warn("side effect duplicated across alternatives");
                }
                let left = conjoin(a.clone(), *b1, ctx);
                let right = conjoin(a, *b2, ctx);
                disjoin(left, right, ctx)
            }
            b => a.and(b),
        },
    }
}

/// Combine two normalized operands under OR, restoring the normal form.
fn disjoin(a: Expr, b: Expr, ctx: &mut CompilationContext) -> Expr {
    if let Some(v) = a.as_bool() {
        return if v { Expr::truth(true) } else { b };
    }
    if let Some(v) = b.as_bool() {
        if !v {
            return a;
        }
        return if a.has_side_effect() {
            a.or(Expr::truth(true))
        } else {
            Expr::truth(true)
        };
    }
    match a {
        Expr::Or(a1, a2) => {
            let rest = disjoin(*a2, b, ctx);
            disjoin(*a1, rest, ctx)
        }
        a => a.or(b),
    }
}
