/// Errors raised while configuring or running a beam search.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid beam search config, {field}: {reason}")]
    InvalidConfig { field: &'static str, reason: String },

    #[error("shape mismatch in {op}, expected: {expected:?}, got: {got:?}")]
    ShapeMismatch {
        op: &'static str,
        expected: Vec<usize>,
        got: Vec<usize>,
    },

    #[error("vocabulary error: {0}")]
    Vocabulary(String),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Candle(#[from] candle::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn config(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            field,
            reason: reason.into(),
        }
    }

    pub(crate) fn shape(op: &'static str, expected: &[usize], got: &[usize]) -> Self {
        Self::ShapeMismatch {
            op,
            expected: expected.to_vec(),
            got: got.to_vec(),
        }
    }
}
