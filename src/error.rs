// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use thiserror::Error;

/// Failure taxonomy for extraction and solving.
///
/// Every worker reports its outcome exactly once, either as a success or as
/// one of these kinds. When a whole parallel race comes up empty the engine
/// collapses the per-child failures into the most informative one; see
/// [`SolveError::rank`].
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SolveError {
    /// Bad image dimensions, empty subframe, or malformed parameters.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The extractor returned no stars, or failed internally.
    #[error("extraction failed: {0}")]
    ExtractionFailed(String),

    /// Fewer stars than the solver's minimum remained after filtering.
    #[error("insufficient stars: {0}")]
    InsufficientStars(String),

    /// The solver exhausted its scale/depth window without a match.
    #[error("no solution: {0}")]
    NoSolution(String),

    /// The solve time limit was reached.
    #[error("solve timed out: {0}")]
    Timeout(String),

    /// Cancelled by the caller or by a winning sibling.
    #[error("aborted: {0}")]
    Aborted(String),

    /// A child process exited non-zero or a binary was missing.
    #[error("external tool failure: {0}")]
    ExternalToolFailure(String),

    /// HTTP error or network timeout while talking to the online service.
    #[error("transport failure: {0}")]
    TransportFailure(String),

    /// Refused to start a parallel solve due to RAM.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),
}

impl SolveError {
    /// Informativeness ranking used when every child of a parallel race
    /// fails: Timeout > NoSolution > Aborted. Anything outside those three
    /// (tool/transport failures and the like) outranks them all, since it
    /// points at a concrete malfunction rather than an unlucky search.
    pub(crate) fn rank(&self) -> u8 {
        match self {
            SolveError::Aborted(_) => 0,
            SolveError::NoSolution(_) => 1,
            SolveError::Timeout(_) => 2,
            _ => 3,
        }
    }
}

/// Picks the most informative error out of a set of child failures.
/// Ties go to the latest arrival, matching the "last error wins" behavior
/// of a sequential scan.
pub(crate) fn most_informative(errors: Vec<SolveError>) -> SolveError {
    let mut best: Option<SolveError> = None;
    for e in errors {
        match &best {
            Some(b) if e.rank() < b.rank() => {}
            _ => best = Some(e),
        }
    }
    best.unwrap_or_else(|| SolveError::NoSolution("no child solvers ran".into()))
}
