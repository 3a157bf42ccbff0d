//! Reference interpreter.
//!
//! Executes the three artifact levels directly: raw expressions (any pass
//! stage), extracted rule lists, and action chains. Token buckets are
//! simulated without refill, so `conform` is a pure fill test and `count`
//! consumes; the firing order of counts is recorded, which is what the
//! reordering passes must preserve. The back ends are checked against this
//! module, never against each other.

use thiserror::Error;

use crate::types::{
    ActionId, ActionOp, Bucket, BucketId, BucketTable, CompilationContext, CompileError,
    Decision, Expr, GroupBase, GroupId, MatchCond, OffsetGroups, RuleList, Value,
};

/// Errors raised while interpreting an expression or rule list against one
/// packet.
#[derive(Debug, Error)]
pub enum EvalError {
    #[error("read of {length} bytes at {group}:{offset} runs past the packet")]
    OutOfBounds {
        group: usize,
        offset: usize,
        length: u8,
    },

    #[error("action {0} is not in the action table")]
    UnknownAction(ActionId),

    #[error(transparent)]
    Compile(#[from] CompileError),
}

/// One packet under classification: payload bytes plus the out-of-band meta
/// namespace (protocol at bytes 0..2, link layer at 2..4).
#[derive(Debug, Clone)]
pub struct Packet {
    pub data: Vec<u8>,
    meta: [u8; 4],
}

impl Packet {
    #[must_use]
    pub fn new(data: impl Into<Vec<u8>>) -> Packet {
        Packet {
            data: data.into(),
            meta: [0; 4],
        }
    }

    #[must_use]
    pub fn with_protocol(mut self, proto: u16) -> Packet {
        self.meta[0..2].copy_from_slice(&proto.to_be_bytes());
        self
    }

    #[must_use]
    pub fn with_link_layer(mut self, kind: u16) -> Packet {
        self.meta[2..4].copy_from_slice(&kind.to_be_bytes());
        self
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Refill-free token-bucket state. Buckets start full at their burst depth.
#[derive(Debug)]
pub struct BucketSim {
    tokens: Vec<u64>,
    fired: Vec<BucketId>,
}

impl BucketSim {
    #[must_use]
    pub fn new(buckets: &BucketTable) -> BucketSim {
        BucketSim {
            tokens: buckets.iter().map(|(_, b)| b.burst).collect(),
            fired: Vec::new(),
        }
    }

    fn cost(bucket: &Bucket, packet: &Packet) -> u64 {
        (packet.len() as u64).max(u64::from(bucket.mpu))
    }

    /// Pure conformance test: would the packet fit the bucket right now.
    #[must_use]
    pub fn conforms(&self, id: BucketId, buckets: &BucketTable, packet: &Packet) -> bool {
        self.tokens[id.index()] >= Self::cost(buckets.get(id), packet)
    }

    /// Consume the packet's cost and record the firing.
    pub fn count(&mut self, id: BucketId, buckets: &BucketTable, packet: &Packet) {
        let cost = Self::cost(buckets.get(id), packet);
        let level = &mut self.tokens[id.index()];
        *level = level.saturating_sub(cost);
        self.fired.push(id);
    }

    /// Every count fired so far, in order.
    #[must_use]
    pub fn fired(&self) -> &[BucketId] {
        &self.fired
    }
}

/// Result of classifying one packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    pub decision: Decision,
    /// Counts fired during this classification, in order.
    pub fired: Vec<BucketId>,
}

enum Control {
    Value(Value),
    Decided(Decision),
}

/// Classify one packet with an expression at any pass stage. An expression
/// that finishes without reaching a decision classifies as `Continue`.
pub fn classify(
    e: &Expr,
    packet: &Packet,
    ctx: &CompilationContext,
    sim: &mut BucketSim,
) -> Result<Outcome, EvalError> {
    let start = sim.fired.len();
    let decision = match eval(e, packet, ctx, sim)? {
        Control::Decided(d) => d,
        Control::Value(_) => Decision::Continue,
    };
    Ok(Outcome {
        decision,
        fired: sim.fired[start..].to_vec(),
    })
}

/// Classify one packet with an extracted rule list. The first rule whose
/// conditions all hold wins and its action chain runs; no rule matching
/// classifies as `Continue`.
pub fn run_rules(
    rules: &RuleList,
    packet: &Packet,
    ctx: &CompilationContext,
    sim: &mut BucketSim,
) -> Result<Outcome, EvalError> {
    let start = sim.fired.len();
    let mut decision = Decision::Continue;
    for rule in &rules.rules {
        if rule_matches(&rule.conds, packet, ctx)? {
            decision = run_action(rule.action, packet, ctx, sim)?;
            break;
        }
    }
    Ok(Outcome {
        decision,
        fired: sim.fired[start..].to_vec(),
    })
}

/// Run one action chain to its decision. Chains are finite because children
/// are interned before their parents.
pub fn run_action(
    mut id: ActionId,
    packet: &Packet,
    ctx: &CompilationContext,
    sim: &mut BucketSim,
) -> Result<Decision, EvalError> {
    loop {
        if id.index() >= ctx.actions.len() {
            return Err(EvalError::UnknownAction(id));
        }
        match ctx.actions.get(id) {
            ActionOp::Decide(d) => return Ok(d),
            ActionOp::Count { bucket, next } => {
                sim.count(bucket, &ctx.buckets, packet);
                id = next;
            }
            ActionOp::Conform {
                bucket,
                if_true,
                if_false,
            } => {
                id = if sim.conforms(bucket, &ctx.buckets, packet) {
                    if_true
                } else {
                    if_false
                };
            }
        }
    }
}

fn rule_matches(
    conds: &[MatchCond],
    packet: &Packet,
    ctx: &CompilationContext,
) -> Result<bool, EvalError> {
    for c in conds {
        let v = read_window(c.group, usize::from(c.offset), c.length, packet, ctx)?;
        if v & c.mask != c.value {
            return Ok(false);
        }
    }
    Ok(true)
}

fn truthy(v: &Value) -> Result<bool, EvalError> {
    match v.num() {
        Some(n) => Ok(!n.is_zero()),
        None => Err(CompileError::TypeMismatch {
            expected: "number",
            got: v.kind(),
        }
        .into()),
    }
}

fn eval(
    e: &Expr,
    packet: &Packet,
    ctx: &CompilationContext,
    sim: &mut BucketSim,
) -> Result<Control, EvalError> {
    match e {
        Expr::Const(v) => Ok(Control::Value(v.clone())),
        Expr::Field(f) => {
            let v = read_window(f.group, usize::from(f.offset), f.length, packet, ctx)?;
            Ok(Control::Value(Value::Num(crate::types::Num::new(
                v,
                crate::types::Width::for_bytes(f.length),
            ))))
        }
        Expr::Access {
            group,
            offset,
            length,
        } => {
            let off = match eval(offset, packet, ctx, sim)? {
                Control::Decided(d) => return Ok(Control::Decided(d)),
                Control::Value(v) => v.num().ok_or(CompileError::TypeMismatch {
                    expected: "number",
                    got: v.kind(),
                })?,
            };
            let v = read_window(*group, off.value as usize, *length, packet, ctx)?;
            Ok(Control::Value(Value::Num(crate::types::Num::new(
                v,
                crate::types::Width::for_bytes(*length),
            ))))
        }
        Expr::Arith(op, a, b) => {
            let x = match eval(a, packet, ctx, sim)? {
                Control::Decided(d) => return Ok(Control::Decided(d)),
                Control::Value(v) => v.num().ok_or(CompileError::TypeMismatch {
                    expected: "number",
                    got: v.kind(),
                })?,
            };
            let y = match eval(b, packet, ctx, sim)? {
                Control::Decided(d) => return Ok(Control::Decided(d)),
                Control::Value(v) => v.num().ok_or(CompileError::TypeMismatch {
                    expected: "number",
                    got: v.kind(),
                })?,
            };
            Ok(Control::Value(Value::Num(crate::types::Num::apply(
                *op, x, y,
            )?)))
        }
        Expr::Rel(op, a, b) => {
            let x = match eval(a, packet, ctx, sim)? {
                Control::Decided(d) => return Ok(Control::Decided(d)),
                Control::Value(v) => v,
            };
            let y = match eval(b, packet, ctx, sim)? {
                Control::Decided(d) => return Ok(Control::Decided(d)),
                Control::Value(v) => v,
            };
            Ok(Control::Value(Value::from(u32::from(Value::compare(
                *op, &x, &y,
            )?))))
        }
        Expr::Match(m) => {
            let v = read_window(
                m.field.group,
                usize::from(m.field.offset),
                m.field.length,
                packet,
                ctx,
            )?;
            Ok(Control::Value(Value::from(u32::from(
                v & m.mask.value == m.value.value,
            ))))
        }
        Expr::And(a, b) => match eval(a, packet, ctx, sim)? {
            Control::Decided(d) => Ok(Control::Decided(d)),
            Control::Value(v) => {
                if truthy(&v)? {
                    eval(b, packet, ctx, sim)
                } else {
                    Ok(Control::Value(Value::from(0_u32)))
                }
            }
        },
        Expr::Or(a, b) => match eval(a, packet, ctx, sim)? {
            Control::Decided(d) => Ok(Control::Decided(d)),
            Control::Value(v) => {
                if truthy(&v)? {
                    Ok(Control::Value(Value::from(1_u32)))
                } else {
                    eval(b, packet, ctx, sim)
                }
            }
        },
        Expr::Not(x) => match eval(x, packet, ctx, sim)? {
            Control::Decided(d) => Ok(Control::Decided(d)),
            Control::Value(v) => Ok(Control::Value(Value::from(u32::from(!truthy(&v)?)))),
        },
        Expr::Conform { bucket, expect } => {
            let ok = sim.conforms(*bucket, &ctx.buckets, packet) == *expect;
            Ok(Control::Value(Value::from(u32::from(ok))))
        }
        Expr::Count(b) => {
            sim.count(*b, &ctx.buckets, packet);
            Ok(Control::Value(Value::from(1_u32)))
        }
        Expr::Decision(d) => Ok(Control::Decided(*d)),
        Expr::Action(id) => Ok(Control::Decided(run_action(*id, packet, ctx, sim)?)),
    }
}

/// Byte offset of a group's root within its namespace. Derived groups chain
/// through the length field they were declared over.
fn group_root(
    group: GroupId,
    packet: &Packet,
    ctx: &CompilationContext,
) -> Result<usize, EvalError> {
    match ctx.groups.get(group).base {
        GroupBase::Packet | GroupBase::Meta => Ok(0),
        GroupBase::Derived {
            base,
            from,
            at,
            length,
            shift,
        } => {
            let root = group_root(base, packet, ctx)?;
            let v = read_window(from, usize::from(at), length, packet, ctx)?;
            Ok(root + ((v as usize) << shift))
        }
    }
}

/// Which byte array a group ultimately reads from.
fn namespace(group: GroupId, ctx: &CompilationContext) -> GroupId {
    match ctx.groups.get(group).base {
        GroupBase::Packet => OffsetGroups::PACKET,
        GroupBase::Meta => OffsetGroups::META,
        GroupBase::Derived { base, .. } => namespace(base, ctx),
    }
}

fn read_window(
    group: GroupId,
    offset: usize,
    length: u8,
    packet: &Packet,
    ctx: &CompilationContext,
) -> Result<u128, EvalError> {
    let bytes: &[u8] = if namespace(group, ctx) == OffsetGroups::META {
        &packet.meta
    } else {
        &packet.data
    };
    let start = group_root(group, packet, ctx)? + offset;
    let end = start + usize::from(length);
    if end > bytes.len() {
        return Err(EvalError::OutOfBounds {
            group: group.index(),
            offset: start,
            length,
        });
    }
    let mut v = 0_u128;
    for &b in &bytes[start..end] {
        v = (v << 8) | u128::from(b);
    }
    Ok(v)
}
