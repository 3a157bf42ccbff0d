//! Decision-diagram rule extraction.
//!
//! The static-matching expression is grafted into a binary diagram with one
//! node per tested field bit, held in an append-only arena (children always
//! precede parents, so node ids double as a topological order). Structural
//! sharing is by hash-consing; nodes whose two children coincide collapse
//! to the child; duplicate tests of one bit along a path resolve to the
//! already-known outcome.
//!
//! Three constructions share the extraction machinery:
//!
//! * `Baseline` grafts in formula order, then merges and collapses in one
//!   canonicalization sweep.
//! * `Sorted` keeps every path tested in global bit order, repairing
//!   violations locally as nodes are made.
//! * `TailMerge` is the baseline plus a terminal-up recanonicalization
//!   before every extraction round, unifying suffixes that deletions have
//!   made identical.
//!
//! Extraction greedily picks the bit-test edge into an action leaf that the
//! most remaining root paths cross (ties to the lowest node id, observable
//! only in rule counts), emits one rule per such path, deletes the edge by
//! substituting the node with its other child, and repeats until the root
//! itself is an action: the unconditional catch-all. Earlier rounds shadow
//! later ones, which is what makes the emitted list order-sensitive.

use std::collections::{BTreeMap, HashMap, HashSet};

use crate::types::{
    conds_from_bits, ActionId, CompilationContext, CompileError, DiagramVariant, Expr, GroupId,
    MatchLeaf, MatchRule, RuleList, Value,
};

/// A single tested bit: absolute position within an offset group, counted
/// from the most significant bit of byte zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BitPos {
    pub group: GroupId,
    pub pos: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
struct NodeId(usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Node {
    Leaf(ActionId),
    Test {
        bit: BitPos,
        if0: NodeId,
        if1: NodeId,
    },
}

struct Diagram {
    nodes: Vec<Node>,
    dedup: HashMap<Node, NodeId>,
    variant: DiagramVariant,
}

/// Compile a static-matching expression into an ordered rule list.
/// `default` is the action taken when the formula holds or fails without
/// reaching an action of its own.
pub fn build_rules(
    e: &Expr,
    variant: DiagramVariant,
    default: ActionId,
    ctx: &CompilationContext,
) -> Result<RuleList, CompileError> {
    let mut d = Diagram::new(variant);
    let dflt = d.leaf(default);
    let root = d.graft(e, dflt, dflt)?;
    let root = match variant {
        DiagramVariant::Sorted => root,
        DiagramVariant::Baseline | DiagramVariant::TailMerge => {
            d.canonicalize(root, &mut HashMap::new())
        }
    };
    d.extract(root, ctx.config.max_rules)
}

impl Diagram {
    fn new(variant: DiagramVariant) -> Diagram {
        Diagram {
            nodes: Vec::new(),
            dedup: HashMap::new(),
            variant,
        }
    }

    fn node(&self, id: NodeId) -> Node {
        self.nodes[id.0]
    }

    fn intern(&mut self, n: Node) -> NodeId {
        if let Some(&id) = self.dedup.get(&n) {
            return id;
        }
        let id = NodeId(self.nodes.len());
        self.nodes.push(n);
        self.dedup.insert(n, id);
        id
    }

    fn leaf(&mut self, a: ActionId) -> NodeId {
        self.intern(Node::Leaf(a))
    }

    /// Shared, collapsed test node.
    fn mk(&mut self, bit: BitPos, if0: NodeId, if1: NodeId) -> NodeId {
        if if0 == if1 {
            return if0;
        }
        self.intern(Node::Test { bit, if0, if1 })
    }

    /// Construction-time node. The baseline grafts unshared and merges
    /// later; the sorted variant repairs bit order on the spot.
    fn make(&mut self, bit: BitPos, if0: NodeId, if1: NodeId) -> NodeId {
        match self.variant {
            DiagramVariant::Sorted => self.mk_ordered(bit, if0, if1),
            DiagramVariant::Baseline | DiagramVariant::TailMerge => {
                let id = NodeId(self.nodes.len());
                self.nodes.push(Node::Test { bit, if0, if1 });
                id
            }
        }
    }

    fn top(&self, n: NodeId) -> Option<BitPos> {
        match self.node(n) {
            Node::Leaf(_) => None,
            Node::Test { bit, .. } => Some(bit),
        }
    }

    /// Both cofactors of an ordered subgraph with respect to `var`. With
    /// paths in bit order, one level of lookahead is all it takes.
    fn cofactors(&self, n: NodeId, var: BitPos) -> (NodeId, NodeId) {
        match self.node(n) {
            Node::Test { bit, if0, if1 } if bit == var => (if0, if1),
            _ => (n, n),
        }
    }

    /// Make a test node while keeping every path bit-order sorted,
    /// hoisting whichever variable belongs on top.
    fn mk_ordered(&mut self, bit: BitPos, if0: NodeId, if1: NodeId) -> NodeId {
        let mut topv = bit;
        for child in [if0, if1] {
            if let Some(t) = self.top(child) {
                if t < topv {
                    topv = t;
                }
            }
        }
        let (l0, h0) = self.cofactors(if0, topv);
        let (l1, h1) = self.cofactors(if1, topv);
        if topv == bit {
            self.mk(bit, l0, h1)
        } else {
            let l = self.mk_ordered(bit, l0, l1);
            let h = self.mk_ordered(bit, h0, h1);
            self.mk(topv, l, h)
        }
    }

    /// Graft a formula between a success and a failure continuation.
    fn graft(
        &mut self,
        e: &Expr,
        then_: NodeId,
        else_: NodeId,
    ) -> Result<NodeId, CompileError> {
        match e {
            Expr::And(a, b) => {
                let t = self.graft(b, then_, else_)?;
                self.graft(a, t, else_)
            }
            Expr::Or(a, b) => {
                let f = self.graft(b, then_, else_)?;
                self.graft(a, then_, f)
            }
            Expr::Match(m) => Ok(self.graft_match(m, then_, else_)),
            Expr::Action(id) => Ok(self.leaf(*id)),
            Expr::Const(Value::Num(n)) => Ok(if n.is_zero() { else_ } else { then_ }),
            other => Err(CompileError::UnhandledOperator {
                pass: "diagram",
                op: other.to_string(),
            }),
        }
    }

    /// One bit-test chain per tested mask bit, most significant first.
    fn graft_match(&mut self, m: &MatchLeaf, then_: NodeId, else_: NodeId) -> NodeId {
        let width = u32::from(m.field.length) * 8;
        let mut cur = then_;
        for k in 0..width {
            // Walk bits LSB-first so the MSB test ends up on top.
            let i = width - 1 - k;
            if !m.mask.bit_msb(i, width) {
                continue;
            }
            let bit = BitPos {
                group: m.field.group,
                pos: u32::from(m.field.offset) * 8 + i,
            };
            cur = if m.value.bit_msb(i, width) {
                self.make(bit, else_, cur)
            } else {
                self.make(bit, cur, else_)
            };
        }
        cur
    }

    /// Merge, collapse, and resolve duplicate bit tests along every path.
    fn canonicalize(&mut self, n: NodeId, memo: &mut HashMap<NodeId, NodeId>) -> NodeId {
        if let Some(&r) = memo.get(&n) {
            return r;
        }
        let r = match self.node(n) {
            Node::Leaf(_) => n,
            Node::Test { bit, if0, if1 } => {
                let l = self.restrict(if0, bit, false, &mut HashMap::new());
                let h = self.restrict(if1, bit, true, &mut HashMap::new());
                let l = self.canonicalize(l, memo);
                let h = self.canonicalize(h, memo);
                self.mk(bit, l, h)
            }
        };
        memo.insert(n, r);
        r
    }

    /// The subgraph under the assumption that `var` tests as `val`.
    fn restrict(
        &mut self,
        n: NodeId,
        var: BitPos,
        val: bool,
        memo: &mut HashMap<NodeId, NodeId>,
    ) -> NodeId {
        if let Some(&r) = memo.get(&n) {
            return r;
        }
        let r = match self.node(n) {
            Node::Leaf(_) => n,
            Node::Test { bit, if0, if1 } if bit == var => {
                let child = if val { if1 } else { if0 };
                self.restrict(child, var, val, memo)
            }
            Node::Test { bit, if0, if1 } => {
                let l = self.restrict(if0, var, val, memo);
                let h = self.restrict(if1, var, val, memo);
                self.mk(bit, l, h)
            }
        };
        memo.insert(n, r);
        r
    }

    /// Nodes reachable from `root`.
    fn reachable(&self, root: NodeId) -> HashSet<NodeId> {
        let mut seen = HashSet::new();
        let mut stack = vec![root];
        while let Some(n) = stack.pop() {
            if !seen.insert(n) {
                continue;
            }
            if let Node::Test { if0, if1, .. } = self.node(n) {
                stack.push(if0);
                stack.push(if1);
            }
        }
        seen
    }

    /// Root-path counts per reachable node. Ids are topological, so one
    /// descending sweep suffices.
    fn path_counts(&self, root: NodeId, seen: &HashSet<NodeId>) -> HashMap<NodeId, u64> {
        let mut ids: Vec<NodeId> = seen.iter().copied().collect();
        ids.sort_unstable_by(|a, b| b.cmp(a));
        let mut counts: HashMap<NodeId, u64> = HashMap::new();
        counts.insert(root, 1);
        for id in ids {
            let c = counts.get(&id).copied().unwrap_or(0);
            if c == 0 {
                continue;
            }
            if let Node::Test { if0, if1, .. } = self.node(id) {
                *counts.entry(if0).or_insert(0) += c;
                *counts.entry(if1).or_insert(0) += c;
            }
        }
        counts
    }

    /// The edge into an action leaf that dumps the most remaining paths.
    fn best_leaf_edge(&self, root: NodeId) -> Option<(NodeId, bool)> {
        let seen = self.reachable(root);
        let counts = self.path_counts(root, &seen);
        let mut ids: Vec<NodeId> = seen.iter().copied().collect();
        ids.sort_unstable();
        let mut best: Option<(u64, NodeId, bool)> = None;
        for id in ids {
            let Node::Test { if0, if1, .. } = self.node(id) else {
                continue;
            };
            let score = counts.get(&id).copied().unwrap_or(0);
            if score == 0 {
                continue;
            }
            for (side, child) in [(false, if0), (true, if1)] {
                if !matches!(self.node(child), Node::Leaf(_)) {
                    continue;
                }
                let better = match best {
                    None => true,
                    Some((s, _, _)) => score > s,
                };
                if better {
                    best = Some((score, id, side));
                }
            }
        }
        best.map(|(_, id, side)| (id, side))
    }

    /// Every root path that reaches `target`, as bit assignments. Bails
    /// out once `limit` paths have been found.
    fn paths_to(
        &self,
        root: NodeId,
        target: NodeId,
        limit: usize,
    ) -> Result<Vec<Vec<(BitPos, bool)>>, CompileError> {
        let seen = self.reachable(root);
        let mut can: HashSet<NodeId> = HashSet::new();
        let mut ids: Vec<NodeId> = seen.iter().copied().collect();
        ids.sort_unstable();
        for id in ids {
            let hit = id == target
                || match self.node(id) {
                    Node::Test { if0, if1, .. } => can.contains(&if0) || can.contains(&if1),
                    Node::Leaf(_) => false,
                };
            if hit {
                can.insert(id);
            }
        }
        let mut out = Vec::new();
        let mut path = Vec::new();
        self.walk_paths(root, target, &can, &mut path, &mut out, limit)?;
        Ok(out)
    }

    fn walk_paths(
        &self,
        n: NodeId,
        target: NodeId,
        can: &HashSet<NodeId>,
        path: &mut Vec<(BitPos, bool)>,
        out: &mut Vec<Vec<(BitPos, bool)>>,
        limit: usize,
    ) -> Result<(), CompileError> {
        if n == target {
            if out.len() >= limit {
                return Err(CompileError::TooManyRules { limit });
            }
            out.push(path.clone());
            return Ok(());
        }
        let Node::Test { bit, if0, if1 } = self.node(n) else {
            return Ok(());
        };
        for (side, child) in [(false, if0), (true, if1)] {
            if can.contains(&child) {
                path.push((bit, side));
                self.walk_paths(child, target, can, path, out, limit)?;
                path.pop();
            }
        }
        Ok(())
    }

    /// Replace `target` by `replacement` throughout the graph under `root`.
    fn substitute(
        &mut self,
        n: NodeId,
        target: NodeId,
        replacement: NodeId,
        memo: &mut HashMap<NodeId, NodeId>,
    ) -> NodeId {
        if n == target {
            return replacement;
        }
        if let Some(&r) = memo.get(&n) {
            return r;
        }
        let r = match self.node(n) {
            Node::Leaf(_) => n,
            Node::Test { bit, if0, if1 } => {
                let l = self.substitute(if0, target, replacement, memo);
                let h = self.substitute(if1, target, replacement, memo);
                self.mk(bit, l, h)
            }
        };
        memo.insert(n, r);
        r
    }

    /// Greedy path extraction. Terminates because every round deletes at
    /// least one remaining root path.
    fn extract(&mut self, mut root: NodeId, max_rules: usize) -> Result<RuleList, CompileError> {
        let mut rules: Vec<MatchRule> = Vec::new();
        loop {
            if self.variant == DiagramVariant::TailMerge {
                root = self.canonicalize(root, &mut HashMap::new());
            }
            if let Node::Leaf(action) = self.node(root) {
                rules.push(MatchRule {
                    conds: Vec::new(),
                    action,
                });
                break;
            }
            let (node, side) = self
                .best_leaf_edge(root)
                .ok_or_else(|| CompileError::DiagramState("no action edge reachable".into()))?;
            let Node::Test { bit, if0, if1 } = self.node(node) else {
                return Err(CompileError::DiagramState("chosen edge is not a test".into()));
            };
            let (chosen, other) = if side { (if1, if0) } else { (if0, if1) };
            let Node::Leaf(action) = self.node(chosen) else {
                return Err(CompileError::DiagramState("chosen child is not a leaf".into()));
            };
            // Reserve a slot for the final catch-all.
            let budget = max_rules
                .saturating_sub(rules.len())
                .saturating_sub(1);
            if budget == 0 {
                return Err(CompileError::TooManyRules { limit: max_rules });
            }
            let paths = self.paths_to(root, node, budget)?;
            for mut path in paths {
                path.push((bit, side));
                rules.push(rule_from_path(&path, action));
            }
            let mut memo = HashMap::new();
            root = self.substitute(root, node, other, &mut memo);
        }
        Ok(RuleList { rules })
    }
}

/// One extracted path as a match rule, with contiguous tested bits
/// coalesced per offset group.
fn rule_from_path(path: &[(BitPos, bool)], action: ActionId) -> MatchRule {
    let mut by_group: BTreeMap<GroupId, BTreeMap<u32, bool>> = BTreeMap::new();
    for &(bit, val) in path {
        by_group.entry(bit.group).or_default().insert(bit.pos, val);
    }
    let mut conds = Vec::new();
    for (group, bits) in &by_group {
        conds.extend(conds_from_bits(*group, bits));
    }
    MatchRule { conds, action }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{FieldRef, MatchCond, Num, OffsetGroups, Width};

    fn m(offset: u16, mask: u128, value: u128) -> Expr {
        Expr::Match(MatchLeaf::new(
            FieldRef::new(OffsetGroups::PACKET, offset, 1),
            Num::new(mask, Width::W32),
            Num::new(value, Width::W32),
        ))
    }

    const A: ActionId = ActionId(10);
    const B: ActionId = ActionId(11);
    const DEFAULT: ActionId = ActionId(0);

    fn bits_value(bytes: &[u8], c: &MatchCond) -> u128 {
        let mut v = 0_u128;
        for i in 0..usize::from(c.length) {
            v = (v << 8) | u128::from(bytes[usize::from(c.offset) + i]);
        }
        v
    }

    fn eval_rules(rules: &RuleList, bytes: &[u8]) -> ActionId {
        for rule in &rules.rules {
            if rule
                .conds
                .iter()
                .all(|c| bits_value(bytes, c) & c.mask == c.value)
            {
                return rule.action;
            }
        }
        panic!("no catch-all rule matched");
    }

    /// Reference evaluation of a static-matching formula.
    fn eval_expr(e: &Expr, bytes: &[u8]) -> Result<bool, ActionId> {
        match e {
            Expr::Match(m) => {
                let mut v = 0_u128;
                for i in 0..usize::from(m.field.length) {
                    v = (v << 8) | u128::from(bytes[usize::from(m.field.offset) + i]);
                }
                Ok(v & m.mask.value == m.value.value)
            }
            Expr::Action(id) => Err(*id),
            Expr::And(a, b) => match eval_expr(a, bytes)? {
                true => eval_expr(b, bytes),
                false => Ok(false),
            },
            Expr::Or(a, b) => match eval_expr(a, bytes)? {
                true => Ok(true),
                false => eval_expr(b, bytes),
            },
            other => panic!("unexpected node: {other}"),
        }
    }

    fn expected(e: &Expr, bytes: &[u8]) -> ActionId {
        match eval_expr(e, bytes) {
            Err(a) => a,
            Ok(_) => DEFAULT,
        }
    }

    fn check_equivalent(e: &Expr, len: usize) {
        let ctx = CompilationContext::new();
        for variant in [
            DiagramVariant::Baseline,
            DiagramVariant::Sorted,
            DiagramVariant::TailMerge,
        ] {
            let rules = build_rules(e, variant, DEFAULT, &ctx).unwrap();
            assert!(rules.rules.last().unwrap().is_catch_all());
            assert_eq!(
                rules
                    .rules
                    .iter()
                    .filter(|r| r.is_catch_all())
                    .count(),
                1,
                "{variant:?}"
            );
            let mut bytes = vec![0_u8; len];
            exhaust(&mut bytes, 0, &mut |b| {
                assert_eq!(
                    eval_rules(&rules, b),
                    expected(e, b),
                    "{variant:?} on {b:?}"
                );
            });
        }
    }

    fn exhaust(bytes: &mut Vec<u8>, i: usize, f: &mut dyn FnMut(&[u8])) {
        if i == bytes.len() {
            f(bytes);
            return;
        }
        // Cover structured and noisy values without 256^n blowup.
        for v in [0x00, 0x01, 0x45, 0x80, 0xa5, 0xff] {
            bytes[i] = v;
            exhaust(bytes, i + 1, f);
        }
    }

    #[test]
    fn single_match_round_trips() {
        let e = m(0, 0xff, 0x45).and(Expr::Action(A));
        check_equivalent(&e, 1);
    }

    #[test]
    fn masked_match_round_trips() {
        let e = m(0, 0xf0, 0x40).and(Expr::Action(A));
        check_equivalent(&e, 1);
    }

    #[test]
    fn ordered_alternatives_shadow_correctly() {
        // First alternative wins where both apply.
        let e = m(0, 0xff, 0x45)
            .and(Expr::Action(A))
            .or(m(1, 0x80, 0x80).and(Expr::Action(B)));
        check_equivalent(&e, 2);
    }

    #[test]
    fn conjunction_across_bytes_round_trips() {
        let e = m(0, 0xf0, 0x40)
            .and(m(1, 0x01, 0x01))
            .and(Expr::Action(A));
        check_equivalent(&e, 2);
    }

    #[test]
    fn overlapping_masks_on_one_byte() {
        let e = m(0, 0xc0, 0x80)
            .and(m(0, 0x03, 0x01))
            .and(Expr::Action(A))
            .or(m(0, 0x30, 0x10).and(Expr::Action(B)));
        check_equivalent(&e, 1);
    }

    #[test]
    fn repeated_bit_along_a_path_resolves() {
        // The same single-bit match twice must not test the bit twice.
        let e = m(0, 0x80, 0x80)
            .and(m(0, 0x80, 0x80))
            .and(Expr::Action(A));
        let ctx = CompilationContext::new();
        let rules = build_rules(&e, DiagramVariant::Baseline, DEFAULT, &ctx).unwrap();
        for rule in &rules.rules {
            for c in &rule.conds {
                assert_eq!(c.mask.count_ones(), 1);
            }
        }
        check_equivalent(&e, 1);
    }

    #[test]
    fn contradictory_path_collapses_to_default() {
        let e = m(0, 0x80, 0x80)
            .and(m(0, 0x80, 0x00))
            .and(Expr::Action(A));
        let ctx = CompilationContext::new();
        let rules = build_rules(&e, DiagramVariant::Baseline, DEFAULT, &ctx).unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules.catch_all(), Some(DEFAULT));
    }

    #[test]
    fn shared_tails_intern_to_one_node() {
        let mut d = Diagram::new(DiagramVariant::Sorted);
        let a = d.leaf(A);
        let b = d.leaf(DEFAULT);
        let bit = BitPos {
            group: OffsetGroups::PACKET,
            pos: 3,
        };
        let n1 = d.mk(bit, a, b);
        let n2 = d.mk(bit, a, b);
        assert_eq!(n1, n2);
        assert_eq!(d.mk(bit, a, a), a);
    }

    #[test]
    fn rule_budget_is_enforced() {
        let mut ctx = CompilationContext::new();
        ctx.config.max_rules = 2;
        // Needs more than two rules: 8 tested bits, alternating outcomes.
        let e = m(0, 0xff, 0x55).and(Expr::Action(A)).or(m(1, 0xff, 0xaa)
            .and(Expr::Action(B)));
        let r = build_rules(&e, DiagramVariant::Baseline, DEFAULT, &ctx);
        assert!(matches!(r, Err(CompileError::TooManyRules { limit: 2 })));
    }

    #[test]
    fn bit_positions_coalesce_into_byte_windows() {
        let e = m(0, 0xff, 0x45).and(m(1, 0xff, 0x00)).and(Expr::Action(A));
        let ctx = CompilationContext::new();
        let rules = build_rules(&e, DiagramVariant::Sorted, DEFAULT, &ctx).unwrap();
        // The all-bits-match path must be a single two-byte window.
        let full = rules
            .rules
            .iter()
            .find(|r| r.action == A && r.conds.len() == 1 && r.conds[0].mask == 0xffff)
            .expect("coalesced rule");
        assert_eq!(full.conds[0].offset, 0);
        assert_eq!(full.conds[0].length, 2);
        assert_eq!(full.conds[0].value, 0x4500);
    }
}
