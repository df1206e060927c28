// Media toolkit abstraction: probing and track composition exports

pub mod ffmpeg;

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::downloader::errors::ProcessingError;

pub use ffmpeg::FfmpegToolkit;

/// Number of tracks per kind in a media file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TrackInventory {
    pub video: usize,
    pub audio: usize,
}

impl TrackInventory {
    pub fn count(&self, kind: TrackKind) -> usize {
        match kind {
            TrackKind::Video => self.video,
            TrackKind::Audio => self.audio,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Video,
    Audio,
}

impl std::fmt::Display for TrackKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Video => write!(f, "video"),
            Self::Audio => write!(f, "audio"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackSelection {
    /// Every track of the kind
    All,
    First,
}

/// Tracks of one kind taken from one source file
#[derive(Debug, Clone, PartialEq)]
pub struct TrackSource {
    pub path: PathBuf,
    pub kind: TrackKind,
    pub selection: TrackSelection,
    /// Trim to `[0, trim]` seconds; `None` keeps the native range
    pub trim: Option<f64>,
}

impl TrackSource {
    pub fn all(path: impl Into<PathBuf>, kind: TrackKind) -> Self {
        Self {
            path: path.into(),
            kind,
            selection: TrackSelection::All,
            trim: None,
        }
    }

    pub fn first(path: impl Into<PathBuf>, kind: TrackKind) -> Self {
        Self {
            selection: TrackSelection::First,
            ..Self::all(path, kind)
        }
    }

    pub fn trimmed(mut self, seconds: f64) -> Self {
        self.trim = Some(seconds);
        self
    }
}

/// Output container, inferred from the output extension
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerKind {
    Mp4,
    /// Audio-only MPEG-4 (`.m4a`, `.aac`)
    M4a,
    Mp3,
    Wav,
}

impl ContainerKind {
    pub fn from_path(path: &Path) -> Self {
        match crate::downloader::utils::extension_of(path).as_deref() {
            Some("m4a") | Some("aac") => Self::M4a,
            Some("mp3") => Self::Mp3,
            Some("wav") => Self::Wav,
            _ => Self::Mp4,
        }
    }

    pub fn is_audio_only(&self) -> bool {
        !matches!(self, Self::Mp4)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecPolicy {
    /// Copy streams verbatim where the container allows it
    Copy,
    Transcode,
}

/// A new container assembled from tracks of one or more files
#[derive(Debug, Clone, PartialEq)]
pub struct Composition {
    pub tracks: Vec<TrackSource>,
    pub container: ContainerKind,
    pub codec: CodecPolicy,
}

impl Composition {
    pub fn new(container: ContainerKind, codec: CodecPolicy) -> Self {
        Self {
            tracks: Vec::new(),
            container,
            codec,
        }
    }

    pub fn with_track(mut self, track: TrackSource) -> Self {
        self.tracks.push(track);
        self
    }

    /// Longest trimmed length, when every track is trimmed
    pub fn expected_duration(&self) -> Option<f64> {
        self.tracks
            .iter()
            .map(|t| t.trim)
            .try_fold(0.0_f64, |acc, trim| trim.map(|t| acc.max(t)))
            .filter(|d| *d > 0.0)
    }
}

/// Looping animated GIF sampled from a video
#[derive(Debug, Clone, PartialEq)]
pub struct GifSpec {
    pub source: PathBuf,
    pub fps: u32,
    pub max_frames: u32,
}

impl GifSpec {
    /// Seconds of source covered by the frames
    pub fn covered_duration(&self) -> f64 {
        self.max_frames as f64 / self.fps.max(1) as f64
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExportJob {
    Compose(Composition),
    Gif(GifSpec),
}

/// Media framework used by the duration extractor and the processing pipeline
#[async_trait]
pub trait MediaToolkit: Send + Sync {
    /// Name of the toolkit (for logging)
    fn name(&self) -> &'static str;

    /// Duration in seconds as reported by the framework
    async fn probe_duration(&self, path: &Path) -> Result<f64, ProcessingError>;

    async fn probe_tracks(&self, path: &Path) -> Result<TrackInventory, ProcessingError>;

    /// Run `job` writing `output`, reporting raw progress in `0.0..=1.0`.
    /// Polls `cancel` while running and returns
    /// `ProcessingError::Cancelled` after aborting the export.
    async fn export(
        &self,
        job: &ExportJob,
        output: &Path,
        progress: &(dyn Fn(f64) + Send + Sync),
        cancel: &CancellationToken,
    ) -> Result<(), ProcessingError>;
}
