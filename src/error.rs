//! Defines the error types used throughout occmap.

use std::fmt;

/// Why a transaction was aborted.
///
/// Validation failures are never recovered locally; any of these aborts the
/// whole transaction. The abort path is idempotent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    /// The application called [`Transaction::abort`](crate::Transaction::abort).
    UserRequested,
    /// A write target is no longer the latest version, is being deleted, or
    /// carries a tid the protocol cannot read; also raised when an insert's
    /// observed leaf counter cannot be cleanly bumped, or when absent-range
    /// revalidation finds a live key.
    WriteNodeInterference,
    /// A read-set tuple is no longer the version the transaction observed.
    ReadNodeInterference,
    /// A key previously observed absent (or logically deleted) now has a
    /// non-nil latest value.
    ReadAbsenceInterference,
    /// Low-level-scan mode detected that a scanned leaf's version counter
    /// changed between the scan and validation.
    NodeScanReadVersionChanged,
}

impl AbortReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            AbortReason::UserRequested => "user requested",
            AbortReason::WriteNodeInterference => "write node interference",
            AbortReason::ReadNodeInterference => "read node interference",
            AbortReason::ReadAbsenceInterference => "read absence interference",
            AbortReason::NodeScanReadVersionChanged => "node scan read version changed",
        }
    }
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The primary error enum for all fallible operations in occmap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The transaction was aborted, carrying the reason. Retrying with a
    /// fresh transaction is typically safe.
    Abort(AbortReason),
    /// Misuse: the transaction has already committed (or been consumed) and
    /// cannot be touched again.
    Unusable,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Abort(reason) => write!(f, "transaction aborted: {}", reason),
            Error::Unusable => write!(f, "transaction is no longer usable"),
        }
    }
}

impl std::error::Error for Error {}
