//! Action separation and deduplication.
//!
//! Splits each alternative into its static matching part and its action
//! part. Static field tests bubble to the left of action subtrees inside
//! AND chains (with a diagnostic when that moves a test across a side
//! effect), and every action subtree is lowered into hash-consed action
//! nodes, leaving an `Action` reference behind. The result is the
//! static-matching expression the rule-extraction back ends consume:
//! AND/OR over `Match` leaves and `Action` references only.

use crate::types::{
    ActionId, ActionOp, CompilationContext, CompileError, Decision, Expr, Value,
};

/// What a subtree is statically known to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelfContained {
    /// Ends in a decision no matter what the data says.
    Always,
    /// Statically false.
    False,
    /// Statically true, but selects no decision.
    True,
    /// Depends on packet data or bucket state.
    Data,
}

/// Classify a subtree. Used to decide whether an explicit fall-through
/// default is still reachable behind it.
#[must_use]
pub fn classify(e: &Expr) -> SelfContained {
    use SelfContained::{Always, Data, False, True};
    match e {
        Expr::Decision(Decision::Continue) => True,
        Expr::Decision(_) => Always,
        // Post-separation references carry their outcome with them.
        Expr::Action(_) => Always,
        Expr::Count(_) => True,
        Expr::Const(Value::Num(n)) => {
            if n.is_zero() {
                False
            } else {
                True
            }
        }
        Expr::Not(x) => match classify(x) {
            Always => Always,
            True => False,
            False => True,
            Data => Data,
        },
        Expr::And(a, b) => match (classify(a), classify(b)) {
            (False, _) => False,
            (Always, _) => Always,
            (True, cb) => cb,
            (Data, False) => False,
            (Data, _) => Data,
        },
        Expr::Or(a, b) => match (classify(a), classify(b)) {
            (Always, _) => Always,
            (True, _) => True,
            (False, cb) => cb,
            (Data, True) => True,
            (Data, _) => Data,
        },
        _ => Data,
    }
}

/// Separate actions out of a NOT-free expression.
pub fn separate(e: Expr, ctx: &mut CompilationContext) -> Result<Expr, CompileError> {
    if e.is_action_subtree() {
        let id = lower_root(e, ctx)?;
        return Ok(Expr::Action(id));
    }
    match e {
        Expr::Or(a, b) => Ok(separate(*a, ctx)?.or(separate(*b, ctx)?)),
        Expr::And(_, _) => lower_chain(e, ctx),
        Expr::Match(_) | Expr::Const(_) => Ok(e),
        other => Err(CompileError::UnhandledOperator {
            pass: "separate",
            op: other.to_string(),
        }),
    }
}

/// Whether a subtree is a pure data test, safe to evaluate early.
fn is_static(e: &Expr) -> bool {
    match e {
        Expr::Match(_) | Expr::Const(_) => true,
        Expr::And(a, b) | Expr::Or(a, b) => is_static(a) && is_static(b),
        Expr::Not(x) => is_static(x),
        _ => false,
    }
}

/// Whether reordering a data test across this subtree is observable.
fn effectful(e: &Expr) -> bool {
    match e {
        Expr::Count(_) | Expr::Decision(_) | Expr::Action(_) => true,
        Expr::And(a, b) | Expr::Or(a, b) => effectful(a) || effectful(b),
        Expr::Not(x) => effectful(x),
        _ => false,
    }
}

fn flatten_and(e: Expr, out: &mut Vec<Expr>) {
    match e {
        Expr::And(a, b) => {
            flatten_and(*a, out);
            flatten_and(*b, out);
        }
        other => out.push(other),
    }
}

/// Separate one AND chain: statics first, then the lowered action part.
fn lower_chain(e: Expr, ctx: &mut CompilationContext) -> Result<Expr, CompileError> {
    let mut conjuncts = Vec::new();
    flatten_and(e, &mut conjuncts);

    let mut statics = Vec::new();
    let mut rest = Vec::new();
    let mut crossed = false;
    for c in conjuncts {
        if is_static(&c) {
            if crossed {
                ctx.warn("match test moved in front of a side effect");
            }
            statics.push(c);
        } else {
            crossed = crossed || effectful(&c);
            rest.push(c);
        }
    }

    // Runs of adjacent action conjuncts lower as one chain; anything else
    // (a mixed subexpression) separates recursively in place.
    let mut lowered = Vec::new();
    let mut run: Vec<Expr> = Vec::new();
    for c in rest {
        if c.is_action_subtree() {
            run.push(c);
        } else {
            if !run.is_empty() {
                let id = lower_root(rejoin(std::mem::take(&mut run)), ctx)?;
                lowered.push(Expr::Action(id));
            }
            lowered.push(separate(c, ctx)?);
        }
    }
    if !run.is_empty() {
        let id = lower_root(rejoin(run), ctx)?;
        lowered.push(Expr::Action(id));
    }

    statics.extend(lowered);
    Ok(rejoin(statics))
}

/// Right-leaning AND of a non-empty conjunct list.
fn rejoin(mut v: Vec<Expr>) -> Expr {
    let mut acc = match v.pop() {
        Some(e) => e,
        None => return Expr::truth(true),
    };
    while let Some(e) = v.pop() {
        acc = e.and(acc);
    }
    acc
}

/// Lower a whole action subtree. Both the chain running off the end and a
/// failed test without an explicit alternative fall through unspecified.
fn lower_root(e: Expr, ctx: &mut CompilationContext) -> Result<ActionId, CompileError> {
    let unspec = ctx.actions.decision(Decision::Continue);
    lower_action(e, unspec, unspec, ctx)
}

/// Lower an action subtree into DAG nodes, threading the action to take
/// when the subtree holds (`on_true`) and when it does not (`on_false`).
fn lower_action(
    e: Expr,
    on_true: ActionId,
    on_false: ActionId,
    ctx: &mut CompilationContext,
) -> Result<ActionId, CompileError> {
    match e {
        Expr::Decision(d) => Ok(ctx.actions.decision(d)),
        Expr::Count(b) => Ok(ctx.actions.intern(ActionOp::Count {
            bucket: b,
            next: on_true,
        })),
        Expr::Conform { bucket, expect } => {
            let (if_true, if_false) = if expect {
                (on_true, on_false)
            } else {
                (on_false, on_true)
            };
            Ok(ctx.actions.intern(ActionOp::Conform {
                bucket,
                if_true,
                if_false,
            }))
        }
        Expr::And(a, b) => {
            let rest = lower_action(*b, on_true, on_false, ctx)?;
            lower_action(*a, rest, on_false, ctx)
        }
        Expr::Or(a, b) => {
            let rest = lower_action(*b, on_true, on_false, ctx)?;
            lower_action(*a, on_true, rest, ctx)
        }
        Expr::Action(id) => Ok(id),
        Expr::Const(Value::Num(n)) => Ok(if n.is_zero() { on_false } else { on_true }),
        other => Err(CompileError::UnhandledOperator {
            pass: "separate",
            op: other.to_string(),
        }),
    }
}
