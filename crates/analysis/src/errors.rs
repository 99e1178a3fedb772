//! Error types for the semantic analysis phases.

/// Failures of the storage-variable analyzer.
///
/// `OutOfRules` is the expected steady-state miss: a load/store shape the
/// rule set does not recognize. Callers fall back to treating the slot as a
/// full 32-byte word.
#[derive(Debug, Clone, thiserror::Error)]
pub enum AnalysisError {
    #[error("No analysis rule matches: {0}")]
    OutOfRules(String),

    #[error("Path refuted by the feasibility checker")]
    InfeasiblePath,
}
