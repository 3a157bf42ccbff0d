//! Back ends: the external line-protocol emitter, the hardware match-chain
//! emitter, and the procedural code generator. All three consume an ordered
//! rule list, produced either by a decision-diagram extraction or by the
//! direct walk below.

pub mod codegen;
pub mod external;
pub mod hardware;

use crate::types::{
    coalesce, CompilationContext, CompileError, Expr, MatchCond, MatchRule, RuleList, Value,
};

/// Lower a separated expression into a rule list without building a decision
/// diagram: one rule per OR alternative, in source order.
pub fn direct_rules(e: &Expr, ctx: &mut CompilationContext) -> Result<RuleList, CompileError> {
    let mut rules = Vec::new();
    let mut cur = e;
    loop {
        match cur {
            Expr::Or(a, b) => {
                branch_rule(a, ctx, &mut rules)?;
                cur = b;
            }
            last => {
                branch_rule(last, ctx, &mut rules)?;
                break;
            }
        }
    }
    Ok(RuleList { rules })
}

/// One OR alternative: a right-leaning AND chain of matches ending in an
/// action reference.
fn branch_rule(
    e: &Expr,
    ctx: &mut CompilationContext,
    rules: &mut Vec<MatchRule>,
) -> Result<(), CompileError> {
    let mut conds = Vec::new();
    let mut satisfiable = true;
    let mut cur = e;
    let action = loop {
        match cur {
            Expr::And(a, b) => {
                collect_cond(a, &mut conds, &mut satisfiable)?;
                cur = b;
            }
            Expr::Action(id) => break *id,
            other => {
                return Err(CompileError::UnhandledOperator {
                    pass: "emit",
                    op: other.to_string(),
                })
            }
        }
    };
    if !satisfiable {
        ctx.warn("rule can never match and was dropped");
        return Ok(());
    }
    match coalesce(conds) {
        Ok(conds) => rules.push(MatchRule { conds, action }),
        Err(_) => ctx.warn("rule can never match and was dropped"),
    }
    Ok(())
}

fn collect_cond(
    e: &Expr,
    conds: &mut Vec<MatchCond>,
    satisfiable: &mut bool,
) -> Result<(), CompileError> {
    match e {
        Expr::Match(m) => {
            if let Some(c) = MatchCond::from_leaf(m) {
                conds.push(c);
            }
            Ok(())
        }
        Expr::Const(Value::Num(n)) => {
            if n.is_zero() {
                *satisfiable = false;
            }
            Ok(())
        }
        other => Err(CompileError::UnhandledOperator {
            pass: "emit",
            op: other.to_string(),
        }),
    }
}
