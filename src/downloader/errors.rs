// Error types for orchestration, transfer and local processing

use std::path::PathBuf;

/// Hint attached to zero-byte downloads. Some providers only serve a usable
/// stream when the request asks for HLS, so the caller may retry with it.
pub const EMPTY_FILE_HINT: &str =
    "the server returned an empty file; retrying with the `youtubeHLS` request option may help";

/// Failures of the settings layer
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid API URL `{0}`")]
    InvalidApiUrl(String),

    #[error("invalid request template: {0}")]
    InvalidTemplate(String),

    #[error("settings I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("settings are not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Failures of the managed-auth provider
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// Device attestation is not available in this build or on this device
    #[error("device attestation is not supported: {0}")]
    Unsupported(String),

    #[error("auth request failed: {0}")]
    Network(#[from] reqwest::Error),

    /// The auth server answered with something other than success/invalid
    #[error("auth server returned HTTP {status}: {detail}")]
    Server { status: u16, detail: String },

    #[error("malformed auth response: {0}")]
    Parse(String),

    #[error("could not persist credential: {0}")]
    Store(String),
}

/// Failures of the orchestration client
#[derive(Debug, thiserror::Error)]
pub enum OrchestrationError {
    #[error("cancelled")]
    Cancelled,

    #[error("invalid API URL `{0}`")]
    InvalidApiUrl(String),

    /// HTTP 404 from the API endpoint
    #[error("the download server is unavailable")]
    ServerUnavailable,

    #[error("request failed with HTTP {status}: {detail}")]
    RequestFailed { status: u16, detail: String },

    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("could not parse API response: {0}")]
    Parsing(String),

    #[error("unsupported processing type `{0}`")]
    UnsupportedType(String),

    /// The API answered `status: error`
    #[error("API error: {0}")]
    Api(String),

    #[error("unexpected response status `{0}`")]
    UnexpectedStatus(String),

    #[error(transparent)]
    Auth(#[from] AuthError),
}

/// Failures of the transfer engine
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("download cancelled")]
    Cancelled,

    /// Another transfer already occupies this engine
    #[error("a download is already in progress")]
    Busy,

    /// Completion arrived with no tracked job (logic defect)
    #[error("transfer completed without a tracked job")]
    MissingState,

    #[error("could not move downloaded file into place: {0}")]
    MoveFailed(#[source] std::io::Error),

    #[error("downloaded file is missing after move: {}", .0.display())]
    FileMissingAfterMove(PathBuf),

    #[error("{hint} ({})", .path.display())]
    EmptyFile { path: PathBuf, hint: &'static str },

    #[error("transfer failed with HTTP {status} for {url}")]
    HttpStatus { status: u16, url: String },

    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransferError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Failure of the structural/probe duration lookup
#[derive(Debug, thiserror::Error)]
pub enum DurationError {
    #[error("could not determine media duration: {0}")]
    ExtractionFailed(String),
}

/// Failures of the local processing pipeline
#[derive(Debug, thiserror::Error)]
pub enum ProcessingError {
    #[error("unsupported processing type `{0}`")]
    UnsupportedType(String),

    #[error("invalid URL `{0}`")]
    InvalidUrl(String),

    #[error("processing failed: {0}")]
    ProcessingFailed(String),

    #[error("processing cancelled")]
    Cancelled,

    #[error("processing is already in progress")]
    Busy,

    #[error(transparent)]
    Transfer(TransferError),
}

impl From<TransferError> for ProcessingError {
    fn from(err: TransferError) -> Self {
        match err {
            TransferError::Cancelled => Self::Cancelled,
            other => Self::Transfer(other),
        }
    }
}

impl From<DurationError> for ProcessingError {
    fn from(err: DurationError) -> Self {
        Self::ProcessingFailed(err.to_string())
    }
}

impl From<std::io::Error> for ProcessingError {
    fn from(err: std::io::Error) -> Self {
        Self::ProcessingFailed(err.to_string())
    }
}

/// Umbrella error surfaced by the session facade
#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    #[error("cancelled")]
    Cancelled,

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Orchestration(OrchestrationError),

    #[error(transparent)]
    Transfer(TransferError),

    #[error(transparent)]
    Processing(ProcessingError),
}

impl DownloadError {
    pub fn is_cancelled(&self) -> bool {
        matches!(
            self,
            Self::Cancelled
                | Self::Orchestration(OrchestrationError::Cancelled)
                | Self::Transfer(TransferError::Cancelled)
                | Self::Processing(ProcessingError::Cancelled)
        )
    }

    /// Text to show the user. Cancellation is always the neutral "Cancelled",
    /// whatever failure it raced with.
    pub fn user_message(&self) -> String {
        if self.is_cancelled() {
            "Cancelled".to_string()
        } else {
            self.to_string()
        }
    }
}

impl From<OrchestrationError> for DownloadError {
    fn from(err: OrchestrationError) -> Self {
        match err {
            OrchestrationError::Cancelled => Self::Cancelled,
            other => Self::Orchestration(other),
        }
    }
}

impl From<TransferError> for DownloadError {
    fn from(err: TransferError) -> Self {
        match err {
            TransferError::Cancelled => Self::Cancelled,
            other => Self::Transfer(other),
        }
    }
}

impl From<ProcessingError> for DownloadError {
    fn from(err: ProcessingError) -> Self {
        match err {
            ProcessingError::Cancelled => Self::Cancelled,
            other => Self::Processing(other),
        }
    }
}
