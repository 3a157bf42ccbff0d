mod action;
mod bucket;
mod context;
mod decision;
mod error;
mod expr;
mod field;
mod rule;
mod value;

pub use action::{ActionId, ActionIndex, ActionOp, ActionTable};
pub use bucket::{Bucket, BucketId, BucketTable};
pub use context::{
    CompilationContext, Config, Diagnostic, DiagramVariant, IneqLowering, SourceLocations,
};
pub use decision::{ClassRef, Decision};
pub use error::{BuilderError, ClaxError, CompileError};
pub use expr::{
    conform, count, decide, field, meta, ArithOp, Expr, MatchLeaf, RelOp,
};
pub use field::{
    FieldRef, GroupBase, GroupId, MetaField, OffsetGroup, OffsetGroups, PROTO_IPV4, PROTO_IPV6,
};
pub use rule::{
    coalesce, conds_from_bits, disjoint, Contradiction, MatchCond, MatchRule, RuleList,
    MAX_COND_BYTES,
};
pub use value::{Num, Value, Width};

pub(crate) use rule::low_mask;
