use thiserror::Error;

/// Errors raised while compiling one classification expression. No category
/// is retried; all abort the classification point being compiled.
#[derive(Debug, Error)]
pub enum CompileError {
    // -- model errors: the input expression is malformed ---------------------
    #[error("type mismatch: expected {expected}, got {got}")]
    TypeMismatch {
        expected: &'static str,
        got: &'static str,
    },

    #[error("division by zero in constant expression")]
    DivisionByZero,

    #[error("expression is not boolean-shaped: {0}")]
    NotBoolean(String),

    #[error("comparison cannot be reduced to field tests: {0}")]
    NonConstantComparison(String),

    #[error("field access offset is not a recognized shape: {0}")]
    UnsupportedOffset(String),

    #[error("field access of {length} bytes exceeds the {max}-byte window limit")]
    FieldTooWide { length: u8, max: u8 },

    // -- capacity errors: a fixed resource bound was exceeded ----------------
    #[error("action table overflow: more than {limit} distinct actions")]
    TooManyActions { limit: usize },

    #[error("rule extraction produced more than {limit} rules")]
    TooManyRules { limit: usize },

    #[error("match state of {needed} bits cannot fit the {limit}-bit carried key")]
    KeyWidthExceeded { needed: u32, limit: u32 },

    #[error("action {index} cannot be expressed by the hardware classifier")]
    UnsupportedHardwareAction { index: usize },

    #[error("meta-field match mixed with ordinary field matches in one rule")]
    MixedMetaMatch,

    // -- internal invariant violations: always fatal, never recovered --------
    #[error("internal: pass {pass} cannot handle operator {op}")]
    UnhandledOperator { pass: &'static str, op: String },

    #[error("internal: rewrite fixpoint not reached after {limit} rounds")]
    FixpointDiverged { limit: usize },

    #[error("internal: decision diagram in inconsistent state: {0}")]
    DiagramState(String),
}

/// Errors from the external classifier-builder rendezvous. The subprocess's
/// exit status governs success; diagnostics are relayed verbatim with
/// location tokens expanded.
#[derive(Debug, Error)]
pub enum BuilderError {
    #[error("builder exited with status {status}: {diagnostics}")]
    Exit { status: i32, diagnostics: String },

    #[error("builder terminated by a signal")]
    Killed,

    #[error("builder response did not parse: {0}")]
    Response(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Unified error type covering compilation and the external builder.
#[derive(Debug, Error)]
pub enum ClaxError {
    #[error(transparent)]
    Compile(#[from] CompileError),

    #[error(transparent)]
    Builder(#[from] BuilderError),
}
