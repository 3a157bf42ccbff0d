//! Pipeline orchestration.
//!
//! One call compiles one classification point: the boolean `if` expression
//! is wrapped with its decision (and an explicit continue default unless the
//! expression already decides on every path), pushed through the rewrite
//! passes, lowered to a rule list either directly or through a decision
//! diagram, and handed to the selected back end.

use std::path::PathBuf;

use crate::arith;
use crate::diagram;
use crate::emit::hardware::HardwareProgram;
use crate::emit::{self, codegen, external, hardware};
use crate::negate;
use crate::normalize::normalize;
use crate::separate::{self, SelfContained};
use crate::types::{
    decide, ClaxError, CompilationContext, CompileError, Decision, DiagramVariant, Expr, RuleList,
};

/// Where the compiled classifier goes. Every target can optionally route
/// the rule extraction through a decision diagram; without one the direct
/// per-alternative emitter runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// The external classifier-builder protocol. With a program the request
    /// is handed to the builder subprocess; without one only the request
    /// text is produced.
    External {
        program: Option<PathBuf>,
        diagram: Option<DiagramVariant>,
    },
    /// The hardware-native match-chain classifier.
    Hardware { diagram: Option<DiagramVariant> },
    /// The procedural code generator.
    Codegen { diagram: Option<DiagramVariant> },
}

impl Target {
    fn diagram(&self) -> Option<DiagramVariant> {
        match self {
            Target::External { diagram, .. }
            | Target::Hardware { diagram }
            | Target::Codegen { diagram } => *diagram,
        }
    }
}

/// One compiled classification point.
#[derive(Debug)]
pub enum Output {
    /// Rendered builder request.
    Request(String),
    /// Rendered request plus the builder's response.
    Response { request: String, response: String },
    /// Hardware match-chain program.
    Hardware(HardwareProgram),
    /// Generated C source.
    Source(String),
}

/// Compile one classification expression for `target`.
pub fn compile(
    expr: Expr,
    decision: Decision,
    target: &Target,
    ctx: &mut CompilationContext,
) -> Result<Output, ClaxError> {
    let rules = compile_rules(expr, decision, target.diagram(), ctx)?;
    match target {
        Target::External { program, .. } => {
            let request = external::render_request(&rules, ctx)?;
            match program {
                Some(program) => {
                    let response = external::run_builder(program, &request, &ctx.locations)?;
                    Ok(Output::Response { request, response })
                }
                None => Ok(Output::Request(request)),
            }
        }
        Target::Hardware { .. } => Ok(Output::Hardware(hardware::emit_hardware(&rules, ctx)?)),
        Target::Codegen { .. } => Ok(Output::Source(codegen::render_source(&rules, ctx)?)),
    }
}

/// Run the rewrite pipeline and extract the ordered rule list. Exposed so
/// rule lists can be checked against the reference interpreter directly.
pub fn compile_rules(
    expr: Expr,
    decision: Decision,
    variant: Option<DiagramVariant>,
    ctx: &mut CompilationContext,
) -> Result<RuleList, CompileError> {
    let e = lower(expr, decision, ctx)?;
    match variant {
        Some(v) => {
            let default = ctx.actions.decision(Decision::Continue);
            diagram::build_rules(&e, v, default, ctx)
        }
        None => emit::direct_rules(&e, ctx),
    }
}

/// Rewrite one classification expression into separated form: an OR chain
/// of static-match conjunctions ending in action references.
pub fn lower(
    expr: Expr,
    decision: Decision,
    ctx: &mut CompilationContext,
) -> Result<Expr, CompileError> {
    let mut e = expr.and(decide(decision));
    if separate::classify(&e) != SelfContained::Always {
        e = e.or(decide(Decision::Continue));
    }
    let e = normalize(e, ctx);
    let e = arith::optimize(e, ctx)?;
    let e = negate::eliminate(e, ctx)?.expr;
    let e = fixpoint(e, ctx)?;
    let e = separate::separate(e, ctx)?;
    Ok(normalize(e, ctx))
}

/// Re-run normalizer and optimizer until the tree stops changing. Both are
/// idempotent, so divergence means an invariant broke.
fn fixpoint(mut e: Expr, ctx: &mut CompilationContext) -> Result<Expr, CompileError> {
    for _ in 0..ctx.config.fixpoint_limit {
        let next = arith::optimize(normalize(e.clone(), ctx), ctx)?;
        if next == e {
            return Ok(e);
        }
        e = next;
    }
    Err(CompileError::FixpointDiverged {
        limit: ctx.config.fixpoint_limit,
    })
}
