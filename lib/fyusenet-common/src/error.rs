use thiserror::Error;

/// The error taxonomy surfaced anywhere in the engine, buffer manager or layer contracts.
///
/// Every variant here corresponds to a failure mode that a caller is expected to branch on;
/// anything that is purely an internal invariant violation is a `debug_assert!` instead, not
/// a variant of this enum.
#[derive(Debug, Error)]
pub enum FyuseNetError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("no matching input/output buffer specification found for this connection")]
    NoIoMatch,

    #[error("input port is already connected")]
    AlreadyConnected,

    #[error("gpu backend error: {0}")]
    GpuError(#[from] anyhow::Error),

    #[error("gpu fence wait exceeded its timeout")]
    PipelineTimeout,

    #[error("background tasks did not drain within the bound given to finish()")]
    FinishTimeout,

    #[error("unsupported feature: {0}")]
    UnsupportedFeature(String),

    #[error("required parameter '{name}' (layer {layer}, sub-index {sub_index}) was missing")]
    ParameterMissing {
        name: String,
        layer: i32,
        sub_index: i32,
    },
}

pub type Result<T> = std::result::Result<T, FyuseNetError>;
