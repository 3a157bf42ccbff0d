use std::collections::BTreeMap;
use std::fmt;

use super::action::ActionId;
use super::expr::MatchLeaf;
use super::field::GroupId;

/// All-ones mask of the low `bits` bits.
#[must_use]
pub(crate) fn low_mask(bits: u32) -> u128 {
    if bits >= 128 {
        u128::MAX
    } else {
        (1 << bits) - 1
    }
}

/// One concrete match condition: a big-endian window of `length` bytes at
/// `offset` within an offset group, tested as `(window & mask) == value`.
/// Windows never exceed 16 bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatchCond {
    pub group: GroupId,
    pub offset: u16,
    pub length: u8,
    pub mask: u128,
    pub value: u128,
}

pub const MAX_COND_BYTES: u8 = 16;

impl MatchCond {
    /// Lower a canonical match leaf. Returns `None` when the leaf is
    /// trivially true (mask empty within the field).
    #[must_use]
    pub fn from_leaf(m: &MatchLeaf) -> Option<MatchCond> {
        let bits = m.field.bits();
        let mask = m.mask.value & low_mask(bits);
        if mask == 0 {
            return None;
        }
        Some(MatchCond {
            group: m.field.group,
            offset: m.field.offset,
            length: m.field.length,
            mask,
            value: m.value.value & mask,
        })
    }

    fn end(&self) -> u16 {
        self.offset + u16::from(self.length)
    }

    /// Merge with another condition over the same group when the byte
    /// ranges overlap or touch and the union fits one window. `Ok(None)`
    /// means not mergeable; `Err(())` means the conditions contradict.
    fn merge(&self, other: &MatchCond) -> Result<Option<MatchCond>, Contradiction> {
        if self.group != other.group {
            return Ok(None);
        }
        let start = self.offset.min(other.offset);
        let end = self.end().max(other.end());
        if end - start > u16::from(MAX_COND_BYTES) {
            return Ok(None);
        }
        if self.end() < other.offset || other.end() < self.offset {
            // A gap of untested bytes; keep the conditions separate.
            return Ok(None);
        }
        let length = (end - start) as u8;
        let place = |c: &MatchCond| {
            let shift = (end - c.end()) * 8;
            (c.mask << shift, c.value << shift)
        };
        let (ma, va) = place(self);
        let (mb, vb) = place(other);
        let common = ma & mb;
        if va & common != vb & common {
            return Err(Contradiction);
        }
        Ok(Some(MatchCond {
            group: self.group,
            offset: start,
            length,
            mask: ma | mb,
            value: va | vb,
        }))
    }

    /// Whether two conditions can never both hold (they demand different
    /// values for some shared bit).
    #[must_use]
    pub fn conflicts(&self, other: &MatchCond) -> bool {
        matches!(self.merge(other), Err(Contradiction))
    }
}

/// Marker for a statically unsatisfiable conjunction of conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Contradiction;

/// Sort and coalesce a conjunction of conditions, merging contiguous byte
/// ranges per offset group. `Err(Contradiction)` means the rule can never
/// match and should be dropped.
pub fn coalesce(mut conds: Vec<MatchCond>) -> Result<Vec<MatchCond>, Contradiction> {
    conds.sort_by_key(|c| (c.group, c.offset, c.length));
    let mut out: Vec<MatchCond> = Vec::with_capacity(conds.len());
    for cond in conds {
        match out.last() {
            Some(last) => match last.merge(&cond)? {
                Some(merged) => {
                    *out.last_mut().expect("non-empty") = merged;
                }
                None => out.push(cond),
            },
            None => out.push(cond),
        }
    }
    Ok(out)
}

/// Build conditions from per-bit constraints. `bits` maps an absolute bit
/// position within the group (byte * 8 + bit-from-MSB) to its required
/// value. Contiguous tested bytes coalesce into one window.
#[must_use]
pub fn conds_from_bits(group: GroupId, bits: &BTreeMap<u32, bool>) -> Vec<MatchCond> {
    let mut out = Vec::new();
    let mut run: Vec<(u32, bool)> = Vec::new();
    let mut run_start_byte = 0_u32;
    let mut last_byte: Option<u32> = None;

    let flush = |run: &mut Vec<(u32, bool)>, start_byte: u32, end_byte: u32, out: &mut Vec<MatchCond>| {
        if run.is_empty() {
            return;
        }
        let length = (end_byte - start_byte + 1) as u8;
        let mut mask = 0_u128;
        let mut value = 0_u128;
        for &(pos, v) in run.iter() {
            let byte = pos / 8 - start_byte;
            let bit = pos % 8;
            let shift = (u32::from(length) - 1 - byte) * 8 + (7 - bit);
            mask |= 1 << shift;
            if v {
                value |= 1 << shift;
            }
        }
        out.push(MatchCond {
            group,
            offset: start_byte as u16,
            length,
            mask,
            value,
        });
        run.clear();
    };

    for (&pos, &v) in bits {
        let byte = pos / 8;
        match last_byte {
            Some(prev) if byte <= prev + 1 && byte - run_start_byte < u32::from(MAX_COND_BYTES) => {}
            Some(prev) => {
                flush(&mut run, run_start_byte, prev, &mut out);
                run_start_byte = byte;
            }
            None => run_start_byte = byte,
        }
        run.push((pos, v));
        last_byte = Some(byte);
    }
    if let Some(prev) = last_byte {
        flush(&mut run, run_start_byte, prev, &mut out);
    }
    out
}

/// Whether two condition sets are provably disjoint (no packet can match
/// both).
#[must_use]
pub fn disjoint(a: &[MatchCond], b: &[MatchCond]) -> bool {
    a.iter().any(|ca| b.iter().any(|cb| ca.conflicts(cb)))
}

/// One ordered classifier rule: a conjunction of match conditions and the
/// action taken when they all hold.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchRule {
    pub conds: Vec<MatchCond>,
    pub action: ActionId,
}

impl MatchRule {
    #[must_use]
    pub fn is_catch_all(&self) -> bool {
        self.conds.is_empty()
    }
}

/// An ordered rule list; the first matching rule wins. The final rule is
/// the unconditional catch-all.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RuleList {
    pub rules: Vec<MatchRule>,
}

impl RuleList {
    #[must_use]
    pub fn catch_all(&self) -> Option<ActionId> {
        self.rules
            .last()
            .filter(|r| r.is_catch_all())
            .map(|r| r.action)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

impl fmt::Display for MatchCond {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}={:#x}/{:#x}",
            self.group.index(),
            self.offset,
            self.length,
            self.value,
            self.mask
        )
    }
}
