//! Spider host error types.

use thiserror::Error;

use freebox_relay::RelayError;

#[derive(Error, Debug)]
pub enum SpiderError {
    #[error("invalid descriptor: {0}")]
    DescriptorResolution(String),

    #[error("artifact download failed: {0}")]
    ArtifactDownload(String),

    #[error("artifact rejected: {0}")]
    ArtifactValidation(String),

    #[error("module load failed: {0}")]
    ModuleLoad(String),

    #[error("invocation timed out: {0}")]
    InvocationTimeout(String),

    #[error("invocation failed: {0}")]
    InvocationFailure(String),

    #[error("script error: {0}")]
    Script(String),

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("relay error: {0}")]
    Relay(#[from] RelayError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SpiderError {
    /// Whether this failure is a load-time problem the user should be told
    /// about, as opposed to a run-time failure that only shows up in logs.
    pub fn is_user_visible(&self) -> bool {
        matches!(
            self,
            Self::DescriptorResolution(_)
                | Self::ArtifactDownload(_)
                | Self::ArtifactValidation(_)
                | Self::ModuleLoad(_)
                | Self::Script(_)
                | Self::Io(_)
        )
    }
}

impl From<boa_engine::JsError> for SpiderError {
    fn from(err: boa_engine::JsError) -> Self {
        Self::Script(err.to_string())
    }
}
