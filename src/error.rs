use std::{
    error::Error,
    fmt::{self, Display},
    io,
};

use ndarray::ShapeError;

/// The result type used in the entire tokens encoder crate.
pub type Result<T> = std::result::Result<T, EncoderErr>;

/// The tokens encoder crate's error type.
///
/// Configuration errors are raised while building models, encoders and optimizers, protocol
/// violations while driving a forward/backward cycle. None of them are recoverable locally.
#[derive(Debug)]
pub enum EncoderErr {
    EmptyEnsemble,
    ZeroWidth {
        kind: &'static str,
        what: &'static str,
    },
    WidthMismatch {
        kind: &'static str,
        what: &'static str,
        got: usize,
        expected: usize,
    },
    InvalidDropout {
        got: f32,
    },
    InvalidInitializer(String),
    EmptyVocabulary {
        kind: &'static str,
    },
    BackwardBeforeForward {
        kind: &'static str,
        id: usize,
    },
    StaleState {
        kind: &'static str,
        id: usize,
    },
    LengthMismatch {
        kind: &'static str,
        what: &'static str,
        got: usize,
        expected: usize,
    },
    InputErrorsDisabled {
        kind: &'static str,
        id: usize,
    },
    ErrorsUnavailable {
        kind: &'static str,
        what: &'static str,
    },
    ModelMismatch {
        expected: &'static str,
        got: &'static str,
    },
    StructureMismatch {
        kind: &'static str,
        what: &'static str,
        expected: bool,
    },
    PoolShrinkBelowIssued {
        issued: usize,
        requested: usize,
    },
    AccumulatorEmpty,
    Shape(ShapeError),
    Serde(serde_json::Error),
    Io(io::Error),
}

impl Display for EncoderErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EncoderErr::EmptyEnsemble => {
                write!(f, "an ensemble requires at least one component")
            }
            EncoderErr::ZeroWidth { kind, what } => {
                write!(f, "{kind}: {what} must have a non zero width")
            }
            EncoderErr::WidthMismatch {
                kind,
                what,
                got,
                expected,
            } => write!(
                f,
                "{kind}: width mismatch for {what}, got {got} and expected {expected}"
            ),
            EncoderErr::InvalidDropout { got } => {
                write!(f, "the dropout must be in [0, 1], got {got}")
            }
            EncoderErr::InvalidInitializer(msg) => write!(f, "invalid initializer: {msg}"),
            EncoderErr::EmptyVocabulary { kind } => {
                write!(f, "{kind}: cannot build a model from an empty vocabulary")
            }
            EncoderErr::BackwardBeforeForward { kind, id } => write!(
                f,
                "{kind} encoder {id}: backward called without a preceding forward"
            ),
            EncoderErr::StaleState { kind, id } => write!(
                f,
                "{kind} encoder {id}: state belongs to a released pool generation, forward it first"
            ),
            EncoderErr::LengthMismatch {
                kind,
                what,
                got,
                expected,
            } => write!(
                f,
                "{kind}: length mismatch for {what}, got {got} and expected {expected}"
            ),
            EncoderErr::InputErrorsDisabled { kind, id } => write!(
                f,
                "{kind} encoder {id}: input errors requested but propagate_to_input is false"
            ),
            EncoderErr::ErrorsUnavailable { kind, what } => write!(
                f,
                "{kind}: {what} requested before a backward (or already taken by reference)"
            ),
            EncoderErr::ModelMismatch { expected, got } => {
                write!(f, "expected a {expected} model, got {got}")
            }
            EncoderErr::StructureMismatch {
                kind,
                what,
                expected: true,
            } => write!(f, "{kind}: {what} errors expected but missing"),
            EncoderErr::StructureMismatch { kind, what, .. } => {
                write!(f, "{kind}: unexpected {what} errors")
            }
            EncoderErr::PoolShrinkBelowIssued { issued, requested } => write!(
                f,
                "cannot shrink the pool to {requested} items, {issued} are still issued"
            ),
            EncoderErr::AccumulatorEmpty => {
                write!(f, "the accumulator was queried before any accumulation")
            }
            EncoderErr::Shape(e) => write!(f, "shape error: {e}"),
            EncoderErr::Serde(e) => write!(f, "serialization error: {e}"),
            EncoderErr::Io(e) => write!(f, "io error: {e}"),
        }
    }
}

impl Error for EncoderErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            EncoderErr::Shape(e) => Some(e),
            EncoderErr::Serde(e) => Some(e),
            EncoderErr::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ShapeError> for EncoderErr {
    fn from(value: ShapeError) -> Self {
        Self::Shape(value)
    }
}

impl From<io::Error> for EncoderErr {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<serde_json::Error> for EncoderErr {
    fn from(value: serde_json::Error) -> Self {
        Self::Serde(value)
    }
}

/// Returns a `LengthMismatch` error unless `got == expected`.
pub(crate) fn check_len(
    kind: &'static str,
    what: &'static str,
    got: usize,
    expected: usize,
) -> Result<()> {
    if got != expected {
        return Err(EncoderErr::LengthMismatch {
            kind,
            what,
            got,
            expected,
        });
    }

    Ok(())
}

/// Returns a `StructureMismatch` error unless errors are given exactly for the optimized parts.
pub(crate) fn check_structure(
    kind: &'static str,
    what: &'static str,
    optimized: bool,
    given: bool,
) -> Result<()> {
    if optimized != given {
        return Err(EncoderErr::StructureMismatch {
            kind,
            what,
            expected: optimized,
        });
    }

    Ok(())
}
