// Common data models for orchestration, transfer and processing

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::errors::ProcessingError;

/// `downloadMode` override sent to the API
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadMode {
    #[default]
    Auto,
    Audio,
    Mute,
}

impl DownloadMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Audio => "audio",
            Self::Mute => "mute",
        }
    }
}

impl fmt::Display for DownloadMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What kind of asset a transfer fetches. Only used for the fallback
/// extension and for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssetKind {
    Video,
    Image,
    Audio,
}

impl AssetKind {
    /// Extension used when neither a filename nor the URL path provides one
    pub fn default_extension(&self) -> &'static str {
        match self {
            Self::Video => "mp4",
            Self::Image => "jpg",
            Self::Audio => "mp3",
        }
    }

    /// Map a picker label ("video", "photo", "gif", "audio") to an asset kind
    pub fn from_picker_label(label: &str) -> Self {
        match label {
            "photo" | "image" => Self::Image,
            "audio" => Self::Audio,
            _ => Self::Video,
        }
    }
}

impl fmt::Display for AssetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Video => write!(f, "video"),
            Self::Image => write!(f, "image"),
            Self::Audio => write!(f, "audio"),
        }
    }
}

/// One candidate of a picker response. Identity is the source URL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PickerOption {
    /// Free-text type tag, e.g. "video", "audio", "photo"
    pub label: String,
    pub url: String,
}

impl PartialEq for PickerOption {
    fn eq(&self, other: &Self) -> bool {
        self.url == other.url
    }
}

impl Eq for PickerOption {}

impl PickerOption {
    pub fn asset_kind(&self) -> AssetKind {
        AssetKind::from_picker_label(&self.label)
    }
}

/// On-device transform requested by a `local-processing` response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessingType {
    Merge,
    Mute,
    Audio,
    Gif,
    Remux,
    Proxy,
}

impl ProcessingType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Merge => "merge",
            Self::Mute => "mute",
            Self::Audio => "audio",
            Self::Gif => "gif",
            Self::Remux => "remux",
            Self::Proxy => "proxy",
        }
    }
}

impl FromStr for ProcessingType {
    type Err = ProcessingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "merge" => Ok(Self::Merge),
            "mute" => Ok(Self::Mute),
            "audio" => Ok(Self::Audio),
            "gif" => Ok(Self::Gif),
            "remux" => Ok(Self::Remux),
            "proxy" => Ok(Self::Proxy),
            other => Err(ProcessingError::UnsupportedType(other.to_string())),
        }
    }
}

impl fmt::Display for ProcessingType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A fetchable asset of a local-processing response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetDescriptor {
    pub url: String,
    pub filename: String,
    pub size: Option<u64>,
    pub format: Option<String>,
}

/// Everything the pipeline needs to assemble the final file on device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalProcessingDescriptor {
    pub processing_type: ProcessingType,
    /// Upstream provider name, informational only
    pub service: String,
    /// Never empty; `tunnel[0]` is the primary asset
    pub tunnel: Vec<String>,
    pub output: AssetDescriptor,
    pub audio: Option<AssetDescriptor>,
    pub is_hls: bool,
}

/// Result of one orchestration call
#[derive(Debug, Clone, PartialEq)]
pub enum OrchestrationResult {
    /// Direct single-file retrieval
    Success {
        url: String,
        filename: Option<String>,
    },
    /// The user must choose among candidates
    PickerOptions(Vec<PickerOption>),
    /// Final assembly happens on device
    LocalProcessing(LocalProcessingDescriptor),
}

/// Byte progress of a transfer, in megabytes. A non-positive total means
/// the size is unknown and only the downloaded amount should be shown.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TransferProgress {
    pub downloaded_mb: f64,
    pub total_mb: f64,
}

impl TransferProgress {
    pub fn is_indeterminate(&self) -> bool {
        self.total_mb <= 0.0
    }

    /// Render as "3.2 / 10.0 MB" or "3.2 MB" when the total is unknown
    pub fn describe(&self) -> String {
        if self.is_indeterminate() {
            format!("{:.1} MB", self.downloaded_mb)
        } else {
            format!("{:.1} / {:.1} MB", self.downloaded_mb, self.total_mb)
        }
    }

    pub fn fraction(&self) -> Option<f64> {
        if self.is_indeterminate() {
            None
        } else {
            Some((self.downloaded_mb / self.total_mb).clamp(0.0, 1.0))
        }
    }
}

/// Download progress information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadProgress {
    pub percent: f32,
    pub status: String,
}

/// One user-initiated download
#[derive(Debug, Clone)]
pub struct DownloadRequest {
    pub url: String,
    pub mode: Option<DownloadMode>,
    /// Polled at every step boundary
    pub cancel: CancellationToken,
}

impl DownloadRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            mode: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_mode(mut self, mode: DownloadMode) -> Self {
        self.mode = Some(mode);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}
