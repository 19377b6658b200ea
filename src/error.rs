// SPDX-License-Identifier: MIT OR Apache-2.0

//! Error types for candle-lens.

/// Errors that can occur while building, loading, or instrumenting a model.
#[derive(Debug, thiserror::Error)]
pub enum LensError {
    /// Tensor operation or weight access error (wraps candle).
    #[error("model error: {0}")]
    Model(#[from] candle_core::Error),

    /// Hook registration, dispatch, or capture lookup error.
    #[error("hook error: {0}")]
    Hook(String),

    /// Model configuration parsing or validation error.
    #[error("config error: {0}")]
    Config(String),

    /// Tokenizer error.
    #[error("tokenizer error: {0}")]
    Tokenizer(String),

    /// Checkpoint download error.
    #[error("download error: {0}")]
    Download(String),

    /// The requested checkpoint name is not known.
    #[error("unknown checkpoint '{name}'{}", suggest(.suggestions))]
    UnknownCheckpoint {
        /// Name as given by the caller.
        name: String,
        /// Official names that look similar.
        suggestions: Vec<String>,
    },

    /// A converted parameter does not have the shape the architecture expects.
    #[error("shape mismatch for '{name}': expected {expected:?}, found {found:?}")]
    ShapeMismatch {
        /// Instrumented parameter name.
        name: String,
        /// Shape implied by the configuration.
        expected: Vec<usize>,
        /// Shape found in the checkpoint.
        found: Vec<usize>,
    },

    /// A tensor required by the conversion is absent from the checkpoint.
    #[error("missing weight '{0}' in checkpoint")]
    MissingWeight(String),

    /// Quantized loading was requested.
    #[error("quantization is not supported: {0}")]
    UnsupportedQuantization(String),

    /// The requested compute device is not available in this build or machine.
    #[error("device unavailable: {0}")]
    DeviceUnavailable(String),

    /// Invalid factored-matrix construction or operation.
    #[error("factored matrix error: {0}")]
    FactoredMatrix(String),

    /// I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Render the "did you mean" tail of an unknown-checkpoint message.
fn suggest(suggestions: &[String]) -> String {
    if suggestions.is_empty() {
        String::new()
    } else {
        format!("; did you mean one of: {}", suggestions.join(", "))
    }
}

/// Result type alias for candle-lens operations.
pub type Result<T> = std::result::Result<T, LensError>;
