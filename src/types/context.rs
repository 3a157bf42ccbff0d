use std::fmt;

use super::action::ActionTable;
use super::bucket::BucketTable;
use super::field::OffsetGroups;

/// How range comparisons and `!=` are lowered into equality tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IneqLowering {
    /// One equality test per contiguous bit range (fewer, wider matches).
    #[default]
    PrefixTests,
    /// One equality test per bit (more, single-bit matches).
    BitTests,
}

/// Which decision-diagram construction the rule extractor runs on. `None`
/// on the target means the direct, diagram-free emitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagramVariant {
    /// Construct, merge, collapse.
    Baseline,
    /// Keep the graph bit-order sorted, repairing violations lazily.
    Sorted,
    /// Unify shared suffixes from the terminals upward before extraction.
    TailMerge,
}

/// Per-compilation tunables.
#[derive(Debug, Clone)]
pub struct Config {
    pub ineq: IneqLowering,
    /// Carried match-key width of the hardware classifier, bits.
    pub key_bits: u32,
    /// Action table capacity.
    pub max_actions: usize,
    /// Upper bound on extracted rules per classification point.
    pub max_rules: usize,
    /// Rounds the normalizer/optimizer loop may run before the compiler
    /// declares an internal error.
    pub fixpoint_limit: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            ineq: IneqLowering::default(),
            key_bits: 16,
            max_actions: 256,
            max_rules: 4096,
            fixpoint_limit: 16,
        }
    }
}

/// A non-fatal message produced during compilation. Collected on the
/// context; the invoking layer decides how to present them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub message: String,
    /// Index into the source-location table, when known.
    pub location: Option<usize>,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "warning: {}", self.message)
    }
}

/// Source locations of the constructs being compiled, used to expand the
/// `@<n>` tokens the external builder echoes back in its diagnostics.
#[derive(Debug, Default)]
pub struct SourceLocations {
    entries: Vec<String>,
}

impl SourceLocations {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, description: impl Into<String>) -> usize {
        self.entries.push(description.into());
        self.entries.len() - 1
    }

    #[must_use]
    pub fn get(&self, id: usize) -> Option<&str> {
        self.entries.get(id).map(String::as_str)
    }
}

/// Everything one compilation owns: the interned registries, tunables, and
/// accumulated diagnostics. Built fresh per classification expression and
/// dropped wholesale afterwards; nothing here is global or shared between
/// compilations.
#[derive(Debug)]
pub struct CompilationContext {
    pub config: Config,
    pub groups: OffsetGroups,
    pub buckets: BucketTable,
    pub actions: ActionTable,
    pub locations: SourceLocations,
    diagnostics: Vec<Diagnostic>,
}

impl CompilationContext {
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(Config::default())
    }

    #[must_use]
    pub fn with_config(config: Config) -> Self {
        CompilationContext {
            config,
            groups: OffsetGroups::new(),
            buckets: BucketTable::new(),
            actions: ActionTable::new(),
            locations: SourceLocations::new(),
            diagnostics: Vec::new(),
        }
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        self.diagnostics.push(Diagnostic {
            message: message.into(),
            location: None,
        });
    }

    #[must_use]
    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diagnostics
    }
}

impl Default for CompilationContext {
    fn default() -> Self {
        Self::new()
    }
}
