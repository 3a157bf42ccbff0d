//! External classifier-builder backend.
//!
//! Renders one complete textual request (offset-group, bucket, and action
//! declarations followed by the match lines) and hands it to the builder
//! subprocess in a single write-all/read-all rendezvous. The builder's exit
//! status governs success; on failure its diagnostics are relayed verbatim
//! after expanding `@<n>` location tokens against the compiler's own
//! source-location table.
//!
//! Line formats:
//!
//! ```text
//! offset <id> = <base>+(<group>:<offset>:<length> << <shift>)
//! bucket <id> = <rate> <mpu> <burst> <burst> <overflow-id>
//! action <i> = unspec | drop | class <q>:<c> | reclassify <q>:<c>
//!            | count <bucket> action <j>
//!            | conform <bucket> action <j> action <k>
//! match <group>:<offset>:<length>=<hex>[/<mask>] ... action <i>
//! barrier
//! ```
//!
//! A trailing catch-all whose action is the bare `unspec` decision is left
//! implicit; `barrier` separates consecutive rules that are not provably
//! disjoint and therefore must keep their order.

use std::collections::HashSet;
use std::fmt::Write as _;
use std::io::Write as _;
use std::path::Path;
use std::process::{Command, Stdio};

use winnow::combinator::{alt, preceded, repeat};
use winnow::error::ModalResult;
use winnow::prelude::*;
use winnow::token::{take_till, take_while};

use crate::types::{
    low_mask, ActionId, ActionOp, BuilderError, CompilationContext, CompileError, Decision,
    GroupBase, MatchCond, RuleList, SourceLocations, disjoint,
};

/// Render the complete builder request for one rule list.
pub fn render_request(
    rules: &RuleList,
    ctx: &CompilationContext,
) -> Result<String, CompileError> {
    let index = ctx.actions.assign_indices(ctx.config.max_actions)?;
    let mut out = String::new();

    for (id, group) in ctx.groups.iter() {
        if let GroupBase::Derived {
            base,
            from,
            at,
            length,
            shift,
        } = group.base
        {
            let _ = writeln!(
                out,
                "offset {} = {}+({}:{}:{} << {})",
                id.index(),
                base.index(),
                from.index(),
                at,
                length,
                shift
            );
        }
    }

    for (id, bucket) in ctx.buckets.iter() {
        let overflow = bucket.overflow.map_or(-1, |o| o.index() as i64);
        let _ = writeln!(
            out,
            "bucket {} = {} {} {} {} {}",
            id.index(),
            bucket.rate,
            bucket.mpu,
            bucket.burst,
            bucket.burst,
            overflow
        );
    }

    // Declarations in emission-index order, restricted to the actions the
    // rule list can actually reach.
    let live = reachable_actions(rules, ctx);
    let mut order: Vec<_> = ctx
        .actions
        .iter()
        .filter(|(id, _)| live.contains(id))
        .collect();
    order.sort_by_key(|(id, _)| index.of(*id));
    for (id, op) in order {
        let i = index.of(id);
        match op {
            ActionOp::Decide(d) => {
                let _ = writeln!(out, "action {i} = {d}");
            }
            ActionOp::Count { bucket, next } => {
                let _ = writeln!(out, "action {i} = count {bucket} action {}", index.of(next));
            }
            ActionOp::Conform {
                bucket,
                if_true,
                if_false,
            } => {
                let _ = writeln!(
                    out,
                    "action {i} = conform {bucket} action {} action {}",
                    index.of(if_true),
                    index.of(if_false)
                );
            }
        }
    }

    let mut prev: Option<&[MatchCond]> = None;
    for rule in &rules.rules {
        if rule.is_catch_all() && ctx.actions.get(rule.action) == ActionOp::Decide(Decision::Continue)
        {
            // Implicit fallthrough.
            continue;
        }
        if let Some(prev) = prev {
            if !disjoint(prev, &rule.conds) {
                let _ = writeln!(out, "barrier");
            }
        }
        let _ = write!(out, "match");
        for c in &rule.conds {
            let _ = write!(out, " {}", cond_spec(c));
        }
        let _ = writeln!(out, " action {}", index.of(rule.action));
        prev = Some(&rule.conds);
    }
    Ok(out)
}

/// Action nodes reachable from the rule list, following chain successors.
fn reachable_actions(rules: &RuleList, ctx: &CompilationContext) -> HashSet<ActionId> {
    let mut live = HashSet::new();
    let mut stack: Vec<ActionId> = rules.rules.iter().map(|r| r.action).collect();
    while let Some(id) = stack.pop() {
        if !live.insert(id) {
            continue;
        }
        match ctx.actions.get(id) {
            ActionOp::Decide(_) => {}
            ActionOp::Count { next, .. } => stack.push(next),
            ActionOp::Conform {
                if_true, if_false, ..
            } => {
                stack.push(if_true);
                stack.push(if_false);
            }
        }
    }
    live
}

fn cond_spec(c: &MatchCond) -> String {
    let full = low_mask(u32::from(c.length) * 8);
    if c.mask == full {
        format!(
            "{}:{}:{}={:#x}",
            c.group.index(),
            c.offset,
            c.length,
            c.value
        )
    } else {
        format!(
            "{}:{}:{}={:#x}/{:#x}",
            c.group.index(),
            c.offset,
            c.length,
            c.value,
            c.mask
        )
    }
}

/// Run the builder: write the whole request, block until exit, read the
/// whole response.
pub fn run_builder(
    program: &Path,
    request: &str,
    locations: &SourceLocations,
) -> Result<String, BuilderError> {
    let mut child = Command::new(program)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;
    if let Some(mut stdin) = child.stdin.take() {
        stdin.write_all(request.as_bytes())?;
    }
    let output = child.wait_with_output()?;
    if output.status.success() {
        return Ok(String::from_utf8_lossy(&output.stdout).into_owned());
    }
    let mut raw = String::from_utf8_lossy(&output.stderr).into_owned();
    if raw.is_empty() {
        raw = String::from_utf8_lossy(&output.stdout).into_owned();
    }
    let diagnostics = expand_diagnostics(&raw, locations)?;
    match output.status.code() {
        Some(status) => Err(BuilderError::Exit {
            status,
            diagnostics,
        }),
        None => Err(BuilderError::Killed),
    }
}

enum Piece<'s> {
    Loc(usize),
    Text(&'s str),
}

fn location_token(input: &mut &str) -> ModalResult<usize> {
    preceded('@', take_while(1.., |c: char| c.is_ascii_digit()))
        .try_map(str::parse)
        .parse_next(input)
}

fn piece<'i>(input: &mut &'i str) -> ModalResult<Piece<'i>> {
    alt((
        location_token.map(Piece::Loc),
        take_till(1.., '@').map(Piece::Text),
        '@'.take().map(Piece::Text),
    ))
    .parse_next(input)
}

/// Expand `@<n>` location tokens in builder diagnostics. Tokens without a
/// table entry are relayed as-is.
pub fn expand_diagnostics(
    text: &str,
    locations: &SourceLocations,
) -> Result<String, BuilderError> {
    let pieces: Vec<Piece<'_>> = repeat(0.., piece)
        .parse(text)
        .map_err(|e| BuilderError::Response(e.to_string()))?;
    let mut out = String::with_capacity(text.len());
    for p in pieces {
        match p {
            Piece::Text(t) => out.push_str(t),
            Piece::Loc(n) => match locations.get(n) {
                Some(loc) => out.push_str(loc),
                None => {
                    let _ = write!(out, "@{n}");
                }
            },
        }
    }
    Ok(out)
}
