//! Compiler from packet-classification expressions to classifier back ends.

mod arith;
mod compile;
mod diagram;
mod emit;
mod evaluate;
mod negate;
mod normalize;
mod separate;
mod types;

pub use compile::{compile, compile_rules, lower, Output, Target};
pub use emit::codegen::render_source;
pub use emit::external::{expand_diagnostics, render_request, run_builder};
pub use emit::hardware::{
    emit_hardware, HardwareAction, HardwareProgram, KeyField, MatchRecord, ProtocolDispatch,
    RecordNext,
};
pub use evaluate::{classify, run_action, run_rules, BucketSim, EvalError, Outcome, Packet};
pub use types::{
    coalesce, conds_from_bits, conform, count, decide, disjoint, field, meta, ActionId,
    ActionIndex, ActionOp, ActionTable, ArithOp, Bucket, BucketId, BucketTable, BuilderError,
    ClassRef, ClaxError, CompilationContext, CompileError, Config, Contradiction, Decision,
    Diagnostic, DiagramVariant, Expr, FieldRef, GroupBase, GroupId, IneqLowering, MatchCond,
    MatchLeaf, MatchRule, MetaField, Num, OffsetGroup, OffsetGroups, RelOp, RuleList,
    SourceLocations, Value, Width, MAX_COND_BYTES, PROTO_IPV4, PROTO_IPV6,
};
