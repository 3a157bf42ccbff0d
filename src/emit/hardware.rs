//! Hardware-native match-chain backend.
//!
//! The target classifier walks priority-ordered match records within hash
//! tables, carrying at most `key_bits` bits of accumulated match state
//! between stages. A rule whose tested bits exceed that width is split into
//! a chain of records linked through indirection tables; chains that share
//! an already-matched prefix share the indirection table for it.
//!
//! Protocol meta-matches are not records at all: they compile into an outer
//! dispatch over protocol identifiers, one inner table per protocol. Any
//! other meta-field test cannot be expressed and is rejected.

use std::collections::HashMap;

use crate::types::{
    ActionId, ActionOp, ClassRef, CompilationContext, CompileError, Decision, GroupId, MatchCond,
    MetaField, OffsetGroups, RuleList,
};

/// One matched byte range within a record.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KeyField {
    pub group: GroupId,
    pub offset: u16,
    pub length: u8,
    pub mask: u128,
    pub value: u128,
}

/// What a record does once its fields match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordNext {
    /// Continue matching in an indirection table.
    Table(u32),
    /// Terminal outcome.
    Action(HardwareAction),
}

/// The terminal outcomes the hardware can express: a decision, or one
/// policing stage selecting between two decisions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HardwareAction {
    Unspec,
    Drop,
    Class(ClassRef),
    Police {
        bucket: usize,
        conform: Box<HardwareAction>,
        exceed: Box<HardwareAction>,
    },
}

/// One priority-ordered match record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchRecord {
    pub table: u32,
    pub fields: Vec<KeyField>,
    /// Bits of key state this record consumes.
    pub key_bits: u32,
    pub next: RecordNext,
}

/// Outer dispatch entry: packets with this protocol start in `table`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolDispatch {
    pub protocol: u16,
    pub table: u32,
}

/// The complete hardware program for one classification point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HardwareProgram {
    pub dispatch: Vec<ProtocolDispatch>,
    /// Table for packets whose protocol matches no dispatch entry.
    pub default_table: u32,
    pub records: Vec<MatchRecord>,
    pub tables: u32,
}

/// Lower a rule list into the match-chain program.
pub fn emit_hardware(
    rules: &RuleList,
    ctx: &CompilationContext,
) -> Result<HardwareProgram, CompileError> {
    let key_bits = ctx.config.key_bits;
    let mut emitter = Emitter {
        records: Vec::new(),
        tables: 0,
        forks: HashMap::new(),
        key_bits,
    };

    // Protocols are discovered up front so order-preserving replication of
    // protocol-less rules can target every inner table.
    let mut dispatch: Vec<ProtocolDispatch> = Vec::new();
    for rule in &rules.rules {
        let (protocol, _) = split_protocol(&rule.conds)?;
        if let Some(p) = protocol {
            if !dispatch.iter().any(|d| d.protocol == p) {
                dispatch.push(ProtocolDispatch {
                    protocol: p,
                    table: 0,
                });
            }
        }
    }
    for d in &mut dispatch {
        d.table = emitter.fresh_table();
    }
    let default_table = emitter.fresh_table();

    for rule in &rules.rules {
        let (protocol, conds) = split_protocol(&rule.conds)?;
        let action = lower_action(rule.action, ctx)?;
        match protocol {
            Some(p) => {
                let table = dispatch
                    .iter()
                    .find(|d| d.protocol == p)
                    .map(|d| d.table)
                    .unwrap_or(default_table);
                emitter.chain(table, &conds, action)?;
            }
            None => {
                // A protocol-agnostic rule holds in every dispatch arm.
                for d in &dispatch {
                    emitter.chain(d.table, &conds, action.clone())?;
                }
                emitter.chain(default_table, &conds, action)?;
            }
        }
    }

    Ok(HardwareProgram {
        dispatch,
        default_table,
        records: emitter.records,
        tables: emitter.tables,
    })
}

/// Pull the protocol dispatch condition out of a rule. Any other meta-field
/// condition cannot be carried in a match record.
fn split_protocol(conds: &[MatchCond]) -> Result<(Option<u16>, Vec<MatchCond>), CompileError> {
    let proto = MetaField::Protocol.field_ref();
    let mut protocol = None;
    let mut rest = Vec::new();
    for c in conds {
        if c.group != OffsetGroups::META {
            rest.push(*c);
            continue;
        }
        let is_protocol = c.offset == proto.offset
            && c.length == proto.length
            && c.mask == 0xffff
            && protocol.is_none();
        if is_protocol {
            protocol = Some(c.value as u16);
        } else {
            return Err(CompileError::MixedMetaMatch);
        }
    }
    Ok((protocol, rest))
}

/// Lower an action chain to a hardware terminal. At most one policing stage
/// is expressible.
fn lower_action(id: ActionId, ctx: &CompilationContext) -> Result<HardwareAction, CompileError> {
    lower_action_inner(id, ctx, false)
}

fn lower_action_inner(
    id: ActionId,
    ctx: &CompilationContext,
    in_police: bool,
) -> Result<HardwareAction, CompileError> {
    match ctx.actions.get(id) {
        ActionOp::Decide(Decision::Continue) => Ok(HardwareAction::Unspec),
        ActionOp::Decide(Decision::Drop) => Ok(HardwareAction::Drop),
        ActionOp::Decide(Decision::Class(c)) => Ok(HardwareAction::Class(c)),
        ActionOp::Decide(Decision::Reclassify(_)) => Err(CompileError::UnsupportedHardwareAction {
            index: id.index(),
        }),
        ActionOp::Conform {
            bucket,
            if_true,
            if_false,
        } => {
            if in_police {
                return Err(CompileError::UnsupportedHardwareAction { index: id.index() });
            }
            Ok(HardwareAction::Police {
                bucket: bucket.index(),
                conform: Box::new(lower_action_inner(if_true, ctx, true)?),
                exceed: Box::new(lower_action_inner(if_false, ctx, true)?),
            })
        }
        ActionOp::Count { bucket, next } => {
            if in_police {
                return Err(CompileError::UnsupportedHardwareAction { index: id.index() });
            }
            let outcome = lower_action_inner(next, ctx, true)?;
            Ok(HardwareAction::Police {
                bucket: bucket.index(),
                conform: Box::new(outcome.clone()),
                exceed: Box::new(outcome),
            })
        }
    }
}

struct Emitter {
    records: Vec<MatchRecord>,
    tables: u32,
    /// Shared indirection tables keyed by the matched prefix record.
    forks: HashMap<(u32, Vec<KeyField>), u32>,
    key_bits: u32,
}

impl Emitter {
    fn fresh_table(&mut self) -> u32 {
        let t = self.tables;
        self.tables += 1;
        t
    }

    /// Emit the record chain for one rule starting in `table`.
    fn chain(
        &mut self,
        table: u32,
        conds: &[MatchCond],
        action: HardwareAction,
    ) -> Result<(), CompileError> {
        let chunks = self.chunk(conds)?;
        let mut table = table;
        let last = chunks.len().saturating_sub(1);
        if chunks.is_empty() {
            self.records.push(MatchRecord {
                table,
                fields: Vec::new(),
                key_bits: 0,
                next: RecordNext::Action(action),
            });
            return Ok(());
        }
        for (i, (fields, bits)) in chunks.into_iter().enumerate() {
            if i == last {
                self.records.push(MatchRecord {
                    table,
                    fields,
                    key_bits: bits,
                    next: RecordNext::Action(action),
                });
                break;
            }
            let key = (table, fields.clone());
            if let Some(&next) = self.forks.get(&key) {
                table = next;
                continue;
            }
            let next = self.fresh_table();
            self.forks.insert(key, next);
            self.records.push(MatchRecord {
                table,
                fields,
                key_bits: bits,
                next: RecordNext::Table(next),
            });
            table = next;
        }
        Ok(())
    }

    /// Split a rule's conditions into record-sized chunks. Conditions are
    /// first exploded into single-byte fields, then packed greedily while
    /// the accumulated mask bits fit the carried key.
    fn chunk(&self, conds: &[MatchCond]) -> Result<Vec<(Vec<KeyField>, u32)>, CompileError> {
        let mut chunks = Vec::new();
        let mut fields = Vec::new();
        let mut used = 0_u32;
        for c in conds {
            for byte in explode(c) {
                let bits = byte.mask.count_ones();
                if bits > self.key_bits {
                    return Err(CompileError::KeyWidthExceeded {
                        needed: bits,
                        limit: self.key_bits,
                    });
                }
                if used + bits > self.key_bits {
                    chunks.push((std::mem::take(&mut fields), used));
                    used = 0;
                }
                used += bits;
                fields.push(byte);
            }
        }
        if !fields.is_empty() {
            chunks.push((fields, used));
        }
        Ok(chunks)
    }
}

/// Per-byte fields of one condition, untested bytes skipped.
fn explode(c: &MatchCond) -> Vec<KeyField> {
    let mut out = Vec::new();
    for i in 0..u16::from(c.length) {
        let shift = (u16::from(c.length) - 1 - i) * 8;
        let mask = (c.mask >> shift) & 0xff;
        if mask == 0 {
            continue;
        }
        out.push(KeyField {
            group: c.group,
            offset: c.offset + i,
            length: 1,
            mask,
            value: (c.value >> shift) & 0xff,
        });
    }
    out
}
