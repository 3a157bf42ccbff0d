use std::collections::HashMap;
use std::fmt;

use super::bucket::BucketId;
use super::decision::Decision;
use super::error::CompileError;

/// Interned handle to an action node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ActionId(pub(crate) usize);

impl ActionId {
    #[must_use]
    pub fn index(self) -> usize {
        self.0
    }
}

/// One step of the side-effecting half of a classification: the action DAG
/// node. Conform carries both outcomes of the test; count has a single
/// successor; decisions terminate the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionOp {
    Conform {
        bucket: BucketId,
        if_true: ActionId,
        if_false: ActionId,
    },
    Count {
        bucket: BucketId,
        next: ActionId,
    },
    Decide(Decision),
}

/// The action DAG for one compilation. Structurally identical nodes are
/// hash-consed to one id; a conform whose outcomes coincide collapses to
/// that outcome. Emission indices are assigned once at the end, after the
/// expression side has been fully lowered.
#[derive(Debug, Default)]
pub struct ActionTable {
    nodes: Vec<ActionOp>,
    dedup: HashMap<ActionOp, ActionId>,
}

impl ActionTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Intern a node. Children must already be interned in this table.
    pub fn intern(&mut self, op: ActionOp) -> ActionId {
        if let ActionOp::Conform {
            if_true, if_false, ..
        } = op
        {
            if if_true == if_false {
                return if_true;
            }
        }
        if let Some(&id) = self.dedup.get(&op) {
            return id;
        }
        let id = ActionId(self.nodes.len());
        self.nodes.push(op);
        self.dedup.insert(op, id);
        id
    }

    pub fn decision(&mut self, d: Decision) -> ActionId {
        self.intern(ActionOp::Decide(d))
    }

    #[must_use]
    pub fn get(&self, id: ActionId) -> ActionOp {
        self.nodes[id.0]
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ActionId, ActionOp)> + '_ {
        self.nodes
            .iter()
            .enumerate()
            .map(|(i, op)| (ActionId(i), *op))
    }

    /// Assign small emission indices to every node. Class decisions get
    /// their natural class number when it is still free, which keeps the
    /// index space aligned with class numbering in constrained encodings;
    /// everything else fills the gaps from zero upward.
    ///
    /// # Errors
    ///
    /// Returns [`CompileError::TooManyActions`] if the table exceeds `limit`.
    pub fn assign_indices(&self, limit: usize) -> Result<ActionIndex, CompileError> {
        if self.nodes.len() > limit {
            return Err(CompileError::TooManyActions { limit });
        }
        let mut index = vec![usize::MAX; self.nodes.len()];
        let mut taken = vec![false; limit];

        for (i, op) in self.nodes.iter().enumerate() {
            if let ActionOp::Decide(Decision::Class(c)) = op {
                let want = c.class as usize;
                if want < limit && !taken[want] {
                    index[i] = want;
                    taken[want] = true;
                }
            }
        }
        let mut next = 0;
        for slot in index.iter_mut() {
            if *slot != usize::MAX {
                continue;
            }
            while taken[next] {
                next += 1;
            }
            *slot = next;
            taken[next] = true;
        }
        Ok(ActionIndex { index })
    }
}

/// Emission indices for the action table, one per node.
#[derive(Debug, Clone)]
pub struct ActionIndex {
    index: Vec<usize>,
}

impl ActionIndex {
    #[must_use]
    pub fn of(&self, id: ActionId) -> usize {
        self.index[id.0]
    }
}

impl fmt::Display for ActionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::decision::ClassRef;

    #[test]
    fn identical_chains_share_one_node() {
        let mut table = ActionTable::new();
        let b = BucketId(0);
        let class = table.decision(Decision::Class(ClassRef::new(1, 2)));
        let a1 = table.intern(ActionOp::Count { bucket: b, next: class });
        let a2 = table.intern(ActionOp::Count { bucket: b, next: class });
        assert_eq!(a1, a2);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn distinct_chains_get_distinct_nodes() {
        let mut table = ActionTable::new();
        let drop = table.decision(Decision::Drop);
        let cont = table.decision(Decision::Continue);
        assert_ne!(drop, cont);
    }

    #[test]
    fn conform_with_equal_outcomes_collapses() {
        let mut table = ActionTable::new();
        let drop = table.decision(Decision::Drop);
        let id = table.intern(ActionOp::Conform {
            bucket: BucketId(0),
            if_true: drop,
            if_false: drop,
        });
        assert_eq!(id, drop);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn class_decisions_prefer_their_class_number() {
        let mut table = ActionTable::new();
        let cont = table.decision(Decision::Continue);
        let c3 = table.decision(Decision::Class(ClassRef::new(1, 3)));
        let c1 = table.decision(Decision::Class(ClassRef::new(1, 1)));
        let idx = table.assign_indices(16).unwrap();
        assert_eq!(idx.of(c3), 3);
        assert_eq!(idx.of(c1), 1);
        // The continue node fills the lowest free slot.
        assert_eq!(idx.of(cont), 0);
    }

    #[test]
    fn natural_number_conflict_falls_back() {
        let mut table = ActionTable::new();
        let a = table.decision(Decision::Class(ClassRef::new(1, 2)));
        let b = table.decision(Decision::Class(ClassRef::new(2, 2)));
        let idx = table.assign_indices(16).unwrap();
        let (ia, ib) = (idx.of(a), idx.of(b));
        assert!(ia == 2 || ib == 2);
        assert_ne!(ia, ib);
    }

    #[test]
    fn capacity_limit_enforced() {
        let mut table = ActionTable::new();
        for q in 0..5 {
            table.decision(Decision::Class(ClassRef::new(q, 0)));
        }
        assert!(matches!(
            table.assign_indices(4),
            Err(CompileError::TooManyActions { limit: 4 })
        ));
    }
}
