use thiserror::Error;

/// Failure categories that abort a single (class, transformer) attempt.
///
/// A missing defect signature is not an error; it is reported through
/// [`crate::rewriter::MethodOutcome::PatternNotFound`].
#[derive(Debug, Error)]
pub enum PatchError {
    /// The input bytes are not a structurally valid class container.
    #[error("malformed class file: {0}")]
    MalformedInput(String),
    /// A rewrite would produce an unverifiable or unbalanced method body.
    #[error("structural violation: {0}")]
    StructuralViolation(String),
    /// The rewritten structure could not be encoded back to bytes.
    #[error("serialization failure: {0}")]
    SerializationFailure(String),
}

impl PatchError {
    pub(crate) fn malformed(message: impl Into<String>) -> anyhow::Error {
        PatchError::MalformedInput(message.into()).into()
    }

    pub(crate) fn structural(message: impl Into<String>) -> anyhow::Error {
        PatchError::StructuralViolation(message.into()).into()
    }

    pub(crate) fn serialization(message: impl Into<String>) -> anyhow::Error {
        PatchError::SerializationFailure(message.into()).into()
    }
}

/// Stable classification used by diagnostics and reports.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub enum FailureKind {
    MalformedInput,
    StructuralViolation,
    SerializationFailure,
    /// An error without a [`PatchError`] cause, or a panic inside a transformer.
    Internal,
}

impl FailureKind {
    /// Walk the error chain and report the first engine category found.
    pub fn classify(error: &anyhow::Error) -> Self {
        error
            .chain()
            .find_map(|cause| cause.downcast_ref::<PatchError>())
            .map(|patch_error| match patch_error {
                PatchError::MalformedInput(_) => FailureKind::MalformedInput,
                PatchError::StructuralViolation(_) => FailureKind::StructuralViolation,
                PatchError::SerializationFailure(_) => FailureKind::SerializationFailure,
            })
            .unwrap_or(FailureKind::Internal)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::MalformedInput => "malformed-input",
            FailureKind::StructuralViolation => "structural-violation",
            FailureKind::SerializationFailure => "serialization-failure",
            FailureKind::Internal => "internal",
        }
    }
}
