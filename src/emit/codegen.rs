//! Procedural code generator.
//!
//! Renders one self-contained C source file: the bucket table, the
//! action-result table indexed by the emission indices, and one evaluation
//! function that replays the rule list as nested conditionals. The function
//! returns the matched rule's action index, or -1 when no rule matches and
//! the list carries no catch-all. Running the action chain (and the bucket
//! state it needs) is the embedding host's job; the tables give it
//! everything the chain references.

use std::fmt::Write as _;

use crate::types::{
    ActionOp, CompilationContext, CompileError, Decision, GroupBase, GroupId, MatchCond,
    OffsetGroups, RuleList,
};

/// Render the complete C source for one rule list.
pub fn render_source(rules: &RuleList, ctx: &CompilationContext) -> Result<String, CompileError> {
    let index = ctx.actions.assign_indices(ctx.config.max_actions)?;
    let mut out = String::new();

    out.push_str("/* generated classifier; do not edit */\n\n");
    out.push_str(
        "#define CLAX_UNSPEC     0\n\
         #define CLAX_CLASS      1\n\
         #define CLAX_DROP       2\n\
         #define CLAX_RECLASSIFY 3\n\
         #define CLAX_COUNT      4\n\
         #define CLAX_CONFORM    5\n\n",
    );

    out.push_str(
        "struct clax_bucket {\n\
         \tunsigned long rate;\n\
         \tunsigned mpu;\n\
         \tunsigned long burst;\n\
         \tint overflow;\n\
         };\n\n",
    );
    out.push_str("static struct clax_bucket clax_buckets[] = {\n");
    for (_, b) in ctx.buckets.iter() {
        let overflow = b.overflow.map_or(-1, |o| o.index() as i64);
        let _ = writeln!(
            out,
            "\t{{ {}UL, {}U, {}UL, {} }},",
            b.rate, b.mpu, b.burst, overflow
        );
    }
    out.push_str("};\n\n");

    out.push_str(
        "struct clax_action {\n\
         \tint kind;\n\
         \tint bucket;\n\
         \tunsigned qdisc;\n\
         \tunsigned cls;\n\
         \tint on_true;\n\
         \tint on_false;\n\
         };\n\n",
    );
    let mut order: Vec<_> = ctx.actions.iter().collect();
    order.sort_by_key(|(id, _)| index.of(*id));
    out.push_str("static const struct clax_action clax_actions[] = {\n");
    for (_, op) in order {
        let line = match op {
            ActionOp::Decide(Decision::Continue) => "{ CLAX_UNSPEC, -1, 0, 0, -1, -1 },".to_owned(),
            ActionOp::Decide(Decision::Drop) => "{ CLAX_DROP, -1, 0, 0, -1, -1 },".to_owned(),
            ActionOp::Decide(Decision::Class(c)) => {
                format!("{{ CLAX_CLASS, -1, {}, {}, -1, -1 }},", c.qdisc, c.class)
            }
            ActionOp::Decide(Decision::Reclassify(c)) => {
                format!("{{ CLAX_RECLASSIFY, -1, {}, {}, -1, -1 }},", c.qdisc, c.class)
            }
            ActionOp::Count { bucket, next } => format!(
                "{{ CLAX_COUNT, {}, 0, 0, {}, -1 }},",
                bucket.index(),
                index.of(next)
            ),
            ActionOp::Conform {
                bucket,
                if_true,
                if_false,
            } => format!(
                "{{ CLAX_CONFORM, {}, 0, 0, {}, {} }},",
                bucket.index(),
                index.of(if_true),
                index.of(if_false)
            ),
        };
        let _ = writeln!(out, "\t{line}");
    }
    out.push_str("};\n\n");

    out.push_str(
        "static unsigned long clax_read(const unsigned char *p, unsigned n)\n\
         {\n\
         \tunsigned long v = 0;\n\
         \tunsigned i;\n\n\
         \tfor (i = 0; i < n; i++)\n\
         \t\tv = (v << 8) | p[i];\n\
         \treturn v;\n\
         }\n\n",
    );

    out.push_str(
        "int clax_classify(const unsigned char *pkt, unsigned long len,\n\
         \tconst unsigned char *meta)\n\
         {\n",
    );
    for line in group_offset_lines(rules, ctx) {
        let _ = writeln!(out, "\t{line}");
    }
    let mut catch_all = None;
    for rule in &rules.rules {
        if rule.is_catch_all() {
            catch_all = Some(index.of(rule.action));
            break;
        }
        let mut parts = Vec::new();
        for c in &rule.conds {
            cond_parts(c, ctx, &mut parts);
        }
        let _ = writeln!(out, "\tif ({})", parts.join(" &&\n\t    "));
        let _ = writeln!(out, "\t\treturn {};", index.of(rule.action));
    }
    match catch_all {
        Some(i) => {
            let _ = writeln!(out, "\treturn {i};");
        }
        None => out.push_str("\treturn -1;\n"),
    }
    out.push_str("}\n");
    Ok(out)
}

/// Which byte array a group ultimately reads from.
fn namespace(group: GroupId, ctx: &CompilationContext) -> GroupId {
    match ctx.groups.get(group).base {
        GroupBase::Packet => OffsetGroups::PACKET,
        GroupBase::Meta => OffsetGroups::META,
        GroupBase::Derived { base, .. } => namespace(base, ctx),
    }
}

fn base_pointer(group: GroupId, ctx: &CompilationContext) -> &'static str {
    if namespace(group, ctx) == OffsetGroups::META {
        "meta"
    } else {
        "pkt"
    }
}

fn offset_var(group: GroupId) -> String {
    format!("clax_off_{}", group.index())
}

/// Offset variables for every derived group a rule list touches, declared
/// in dependency order (a group's id is larger than its dependencies').
fn group_offset_lines(rules: &RuleList, ctx: &CompilationContext) -> Vec<String> {
    let mut used = vec![false; ctx.groups.len()];
    for rule in &rules.rules {
        for c in &rule.conds {
            mark_used(c.group, ctx, &mut used);
        }
    }
    let mut lines = Vec::new();
    for (id, group) in ctx.groups.iter() {
        if !used[id.index()] {
            continue;
        }
        if let GroupBase::Derived {
            base,
            from,
            at,
            length,
            shift,
        } = group.base
        {
            let base_expr = if matches!(ctx.groups.get(base).base, GroupBase::Derived { .. }) {
                offset_var(base)
            } else {
                "0".to_owned()
            };
            let from_base = if matches!(ctx.groups.get(from).base, GroupBase::Derived { .. }) {
                format!("{} + ", offset_var(from))
            } else {
                String::new()
            };
            lines.push(format!(
                "unsigned long {} = {} + (clax_read({} + {}{}, {}) << {});",
                offset_var(id),
                base_expr,
                base_pointer(from, ctx),
                from_base,
                at,
                length,
                shift
            ));
        }
    }
    lines
}

fn mark_used(group: GroupId, ctx: &CompilationContext, used: &mut [bool]) {
    if used[group.index()] {
        return;
    }
    used[group.index()] = true;
    if let GroupBase::Derived { base, from, .. } = ctx.groups.get(group).base {
        mark_used(base, ctx, used);
        mark_used(from, ctx, used);
    }
}

/// C conjuncts for one condition: a bounds guard for packet reads, then one
/// masked comparison per word of up to four bytes.
fn cond_parts(c: &MatchCond, ctx: &CompilationContext, parts: &mut Vec<String>) {
    let ptr = base_pointer(c.group, ctx);
    let derived = matches!(ctx.groups.get(c.group).base, GroupBase::Derived { .. });
    let start = if derived {
        format!("{} + {}", offset_var(c.group), c.offset)
    } else {
        c.offset.to_string()
    };
    if ptr == "pkt" {
        parts.push(format!("{start} + {} <= len", c.length));
    }
    let mut i = 0_u16;
    while i < u16::from(c.length) {
        let n = (u16::from(c.length) - i).min(4);
        let shift = (u16::from(c.length) - i - n) * 8;
        let word_mask = (c.mask >> shift) & 0xffff_ffff;
        let word_value = (c.value >> shift) & 0xffff_ffff;
        i += n;
        if word_mask == 0 {
            continue;
        }
        parts.push(format!(
            "(clax_read({ptr} + {start} + {i_off}, {n}) & {word_mask:#x}UL) == {word_value:#x}UL",
            i_off = i - n
        ));
    }
}
