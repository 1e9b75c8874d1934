use thiserror::Error;

use natmem_core::budget::Ceiling;
use natmem_core::config::format_bytes;
use natmem_core::id::ScopeId;

/// Result type local to natmem-mem.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("{0} requires a live native handle")]
    NullResource(&'static str),

    #[error("native allocation failed for {bytes} bytes (kind '{kind}')")]
    OutOfResource { kind: &'static str, bytes: usize },

    #[error("{}", budget_message(.ceiling, .requested, .tracked_bytes, .max_bytes, .physical_bytes, .max_physical_bytes, .retries))]
    ResourceBudgetExceeded {
        ceiling: Ceiling,
        requested: usize,
        tracked_bytes: usize,
        max_bytes: usize,
        physical_bytes: usize,
        max_physical_bytes: usize,
        retries: usize,
    },

    #[error("{scope} does not accept handles of kind '{kind}' (allowed: {allowed:?})")]
    CapabilityMismatch {
        kind: &'static str,
        scope: ScopeId,
        allowed: Vec<&'static str>,
    },

    #[error("no layout metadata for kind '{kind}' (member '{member}')")]
    TypeMetadataUnavailable { kind: String, member: String },

    #[error("limit < position: ({limit} < {position})")]
    InvalidRange { position: usize, limit: usize },

    #[error("range of {requested} bytes exceeds the {extent} bytes backing the handle")]
    OutOfBounds { requested: usize, extent: usize },

    #[error("element size mismatch for kind '{kind}': kind has {expected} bytes, buffer has {actual}")]
    ElementSizeMismatch {
        kind: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("release routine failed: {0}")]
    Release(String),

    #[error("global runtime is already initialized")]
    AlreadyInitialized,

    #[error("runtime has been shut down")]
    ShutDown,

    #[error(transparent)]
    Core(natmem_core::Error),
}

fn budget_message(
    ceiling: &Ceiling,
    requested: &usize,
    tracked_bytes: &usize,
    max_bytes: &usize,
    physical_bytes: &usize,
    max_physical_bytes: &usize,
    retries: &usize,
) -> String {
    match ceiling {
        Ceiling::TrackedBytes => format!(
            "allocation exceeds limits after {retries} retries: tracked bytes ({} + {}) > max bytes ({})",
            format_bytes(*tracked_bytes),
            format_bytes(*requested),
            format_bytes(*max_bytes),
        ),
        Ceiling::PhysicalBytes => format!(
            "physical memory usage too high after {retries} retries: physical bytes ({}) > max physical bytes ({})",
            format_bytes(*physical_bytes),
            format_bytes(*max_physical_bytes),
        ),
    }
}

impl From<natmem_core::Error> for Error {
    fn from(e: natmem_core::Error) -> Self {
        match e {
            natmem_core::Error::TypeMetadataUnavailable { kind, member } => {
                Error::TypeMetadataUnavailable { kind, member }
            }
            other => Error::Core(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exceeded(ceiling: Ceiling) -> Error {
        Error::ResourceBudgetExceeded {
            ceiling,
            requested: 600,
            tracked_bytes: 600,
            max_bytes: 1000,
            physical_bytes: 3 << 30,
            max_physical_bytes: 1 << 30,
            retries: 10,
        }
    }

    #[test]
    fn test_budget_message_formats_bytes() {
        assert_eq!(
            exceeded(Ceiling::TrackedBytes).to_string(),
            "allocation exceeds limits after 10 retries: tracked bytes (600 + 600) > max bytes (1000)"
        );
        assert_eq!(
            exceeded(Ceiling::PhysicalBytes).to_string(),
            "physical memory usage too high after 10 retries: physical bytes (3072M) > max physical bytes (1024M)"
        );
    }
}
