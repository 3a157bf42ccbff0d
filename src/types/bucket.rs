use std::fmt;

/// Interned handle to a token bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BucketId(pub(crate) usize);

impl BucketId {
    #[must_use]
    pub fn index(self) -> usize {
        self.0
    }
}

/// A token-bucket policer. Referenced by the pure `conform` test and the
/// side-effecting `count` operator; the distinction between the two is what
/// every reordering optimization hinges on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bucket {
    /// Token refill rate, bytes per second.
    pub rate: u64,
    /// Minimum policed unit, bytes.
    pub mpu: u32,
    /// Bucket depth, bytes.
    pub burst: u64,
    /// Bucket to overflow surplus tokens into.
    pub overflow: Option<BucketId>,
}

/// The bucket registry for one compilation. Identical buckets are interned
/// to one id so the emitted declarations stay compact.
#[derive(Debug, Default)]
pub struct BucketTable {
    buckets: Vec<Bucket>,
}

impl BucketTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn intern(&mut self, bucket: Bucket) -> BucketId {
        if let Some(pos) = self.buckets.iter().position(|b| *b == bucket) {
            return BucketId(pos);
        }
        self.buckets.push(bucket);
        BucketId(self.buckets.len() - 1)
    }

    #[must_use]
    pub fn get(&self, id: BucketId) -> &Bucket {
        &self.buckets[id.0]
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (BucketId, &Bucket)> {
        self.buckets
            .iter()
            .enumerate()
            .map(|(i, b)| (BucketId(i), b))
    }
}

impl fmt::Display for BucketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
