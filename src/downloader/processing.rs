// Local processing pipeline: download assets, then assemble the final file

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use super::config::ProcessingSettings;
use super::duration::DurationExtractor;
use super::errors::ProcessingError;
use super::media::{
    CodecPolicy, Composition, ContainerKind, ExportJob, GifSpec, MediaToolkit, TrackKind,
    TrackSource,
};
use super::models::{
    AssetDescriptor, AssetKind, DownloadProgress, LocalProcessingDescriptor, ProcessingType,
};
use super::traits::ProgressEmitter;
use super::transfer::{TransferEngine, TransferOptions};
use super::utils::{extension_of, is_audio_extension, with_extension};

/// Durations closer than this are treated as equal
const DURATION_TOLERANCE: f64 = 0.1;
/// Beyond this difference the shorter stream wins
const DURATION_MISMATCH: f64 = 2.0;

const GIF_FPS: u32 = 10;
const GIF_MAX_FRAMES: u32 = 50;

/// Target length of a merge. Nearly equal lengths keep the video's. A large
/// mismatch trims to the shorter stream; a small one keeps the longer.
pub fn reconcile_durations(video: f64, audio: f64) -> f64 {
    let diff = (video - audio).abs();
    if diff <= DURATION_TOLERANCE {
        video
    } else if video > audio {
        if diff > DURATION_MISMATCH {
            audio
        } else {
            video
        }
    } else if diff > DURATION_MISMATCH {
        video
    } else {
        audio
    }
}

/// Export progress shown to the user: raw progress doubled, capped at 100
pub fn scaled_percent(raw: f64) -> f32 {
    (raw * 2.0 * 100.0).clamp(0.0, 100.0) as f32
}

/// Frames sampled for a GIF of a `duration`-second video, `None` when the
/// video is shorter than one frame interval
pub fn gif_frame_count(duration: f64) -> Option<u32> {
    let available = (duration * GIF_FPS as f64).floor();
    if !available.is_finite() || available < 1.0 {
        return None;
    }
    Some((available as u32).min(GIF_MAX_FRAMES))
}

struct ActiveRelease<'a>(&'a Mutex<Option<CancellationToken>>);

impl Drop for ActiveRelease<'_> {
    fn drop(&mut self) {
        *self.0.lock() = None;
    }
}

pub struct LocalProcessingPipeline {
    transfer: Arc<TransferEngine>,
    toolkit: Arc<dyn MediaToolkit>,
    durations: DurationExtractor,
    settings: ProcessingSettings,
    active: Mutex<Option<CancellationToken>>,
}

impl LocalProcessingPipeline {
    pub fn new(
        transfer: Arc<TransferEngine>,
        toolkit: Arc<dyn MediaToolkit>,
        settings: ProcessingSettings,
    ) -> Self {
        Self {
            transfer,
            durations: DurationExtractor::new(toolkit.clone()),
            toolkit,
            settings,
            active: Mutex::new(None),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.lock().is_some()
    }

    /// Cancel the running `process` call, if any. Safe to call repeatedly.
    pub fn cancel_processing(&self) {
        if let Some(token) = self.active.lock().as_ref() {
            debug!("[Pipeline] Cancelling");
            token.cancel();
        }
    }

    /// Fetch the assets of `descriptor` and produce the final file
    pub async fn process(
        &self,
        descriptor: &LocalProcessingDescriptor,
        progress: &ProgressEmitter,
        cancel: &CancellationToken,
    ) -> Result<PathBuf, ProcessingError> {
        check_cancelled(cancel)?;

        let token = cancel.child_token();
        {
            let mut active = self.active.lock();
            if active.is_some() {
                return Err(ProcessingError::Busy);
            }
            *active = Some(token.clone());
        }
        let _release = ActiveRelease(&self.active);

        info!(
            "[Pipeline] {} from {} -> {}",
            descriptor.processing_type, descriptor.service, descriptor.output.filename
        );
        let result = self.run(descriptor, progress, &token).await;
        match &result {
            Ok(path) => info!("[Pipeline] Finished {}", path.display()),
            Err(e) => warn!("[Pipeline] {} failed: {}", descriptor.processing_type, e),
        }
        if token.is_cancelled() && result.is_err() {
            return Err(ProcessingError::Cancelled);
        }
        result
    }

    async fn run(
        &self,
        descriptor: &LocalProcessingDescriptor,
        progress: &ProgressEmitter,
        cancel: &CancellationToken,
    ) -> Result<PathBuf, ProcessingError> {
        validate_url(&descriptor.output.url)?;

        progress.status("Downloading");
        let main = self
            .download(&descriptor.output, AssetKind::Video, false, progress, cancel)
            .await?;
        check_cancelled(cancel)?;

        match descriptor.processing_type {
            ProcessingType::Merge => self.merge(descriptor, &main, progress, cancel).await,
            ProcessingType::Mute => self.mute(descriptor, &main, progress, cancel).await,
            ProcessingType::Audio => self.extract_audio(&main, progress, cancel).await,
            ProcessingType::Gif => self.convert_gif(&main, progress, cancel).await,
            ProcessingType::Remux => self.remux(descriptor, &main, progress, cancel).await,
            ProcessingType::Proxy => Ok(main),
        }
    }

    async fn download(
        &self,
        asset: &AssetDescriptor,
        kind: AssetKind,
        keep_scratch: bool,
        progress: &ProgressEmitter,
        cancel: &CancellationToken,
    ) -> Result<PathBuf, ProcessingError> {
        let mut options = TransferOptions::named(asset.filename.clone())
            .with_progress(progress.transfer_sink("Downloading"));
        options.skip_scratch_clear = keep_scratch;
        Ok(self
            .transfer
            .download_file(&asset.url, kind, options, cancel)
            .await?)
    }

    async fn merge(
        &self,
        descriptor: &LocalProcessingDescriptor,
        main: &Path,
        progress: &ProgressEmitter,
        cancel: &CancellationToken,
    ) -> Result<PathBuf, ProcessingError> {
        let audio = descriptor.audio.as_ref().ok_or_else(|| {
            ProcessingError::ProcessingFailed("merge requires an audio asset".to_string())
        })?;
        validate_url(&audio.url)?;

        // Private copy, out of reach of later scratch clears
        let work_dir = self.settings.output_dir.join(".work");
        tokio::fs::create_dir_all(&work_dir).await?;
        let file_name = main
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "video".to_string());
        let video_copy = work_dir.join(format!("{}-{}", Uuid::new_v4(), file_name));
        tokio::fs::copy(main, &video_copy).await?;

        let result = self
            .merge_tracks(descriptor, audio, &video_copy, progress, cancel)
            .await;

        if let Err(e) = tokio::fs::remove_file(&video_copy).await {
            warn!("[Pipeline] Could not remove {}: {}", video_copy.display(), e);
        }
        result
    }

    async fn merge_tracks(
        &self,
        descriptor: &LocalProcessingDescriptor,
        audio: &AssetDescriptor,
        video_path: &Path,
        progress: &ProgressEmitter,
        cancel: &CancellationToken,
    ) -> Result<PathBuf, ProcessingError> {
        progress.status("Downloading audio");
        let audio_path = self
            .download(audio, AssetKind::Audio, true, progress, cancel)
            .await?;
        check_cancelled(cancel)?;

        self.require_track(video_path, TrackKind::Video).await?;
        self.require_track(&audio_path, TrackKind::Audio).await?;

        let (video_duration, audio_duration) = tokio::join!(
            self.durations.extract_duration(video_path),
            self.durations.extract_duration(&audio_path)
        );
        let (video_duration, audio_duration) = (video_duration?, audio_duration?);
        let target = reconcile_durations(video_duration, audio_duration);
        debug!(
            "[Pipeline] video {:.3}s, audio {:.3}s -> {:.3}s",
            video_duration, audio_duration, target
        );

        let output = self.output_path(&descriptor.output.filename).await?;
        let composition = Composition::new(ContainerKind::from_path(&output), CodecPolicy::Copy)
            .with_track(TrackSource::first(video_path, TrackKind::Video).trimmed(target))
            .with_track(TrackSource::first(&audio_path, TrackKind::Audio).trimmed(target));
        self.export(ExportJob::Compose(composition), &output, progress, cancel)
            .await
    }

    async fn mute(
        &self,
        descriptor: &LocalProcessingDescriptor,
        main: &Path,
        progress: &ProgressEmitter,
        cancel: &CancellationToken,
    ) -> Result<PathBuf, ProcessingError> {
        self.require_track(main, TrackKind::Video).await?;
        let output = self.output_path(&descriptor.output.filename).await?;
        let composition = Composition::new(ContainerKind::from_path(&output), CodecPolicy::Copy)
            .with_track(TrackSource::first(main, TrackKind::Video));
        self.export(ExportJob::Compose(composition), &output, progress, cancel)
            .await
    }

    async fn extract_audio(
        &self,
        main: &Path,
        progress: &ProgressEmitter,
        cancel: &CancellationToken,
    ) -> Result<PathBuf, ProcessingError> {
        if extension_of(main).is_some_and(|ext| is_audio_extension(&ext)) {
            debug!("[Pipeline] {} is already audio", main.display());
            return Ok(main.to_path_buf());
        }

        self.require_track(main, TrackKind::Audio).await?;
        let output = self.output_path(&with_extension(&file_name_of(main), "m4a")).await?;
        let composition = Composition::new(ContainerKind::M4a, CodecPolicy::Transcode)
            .with_track(TrackSource::first(main, TrackKind::Audio));
        self.export(ExportJob::Compose(composition), &output, progress, cancel)
            .await
    }

    async fn convert_gif(
        &self,
        main: &Path,
        progress: &ProgressEmitter,
        cancel: &CancellationToken,
    ) -> Result<PathBuf, ProcessingError> {
        if extension_of(main).as_deref() == Some("gif") {
            if has_gif_signature(main).await? {
                return Ok(main.to_path_buf());
            }
            // Video served under a .gif name
            let renamed = main.with_extension("mp4");
            tokio::fs::rename(main, &renamed).await?;
            info!("[Pipeline] {} is not a GIF, renamed to {}", main.display(), renamed.display());
            return Ok(renamed);
        }

        self.require_track(main, TrackKind::Video).await?;
        let duration = self.durations.extract_duration(main).await?;
        check_cancelled(cancel)?;

        let max_frames = gif_frame_count(duration).ok_or_else(|| {
            ProcessingError::ProcessingFailed(format!(
                "{} is too short for a GIF ({:.3}s)",
                main.display(),
                duration
            ))
        })?;

        let output = self.output_path(&with_extension(&file_name_of(main), "gif")).await?;
        let spec = GifSpec {
            source: main.to_path_buf(),
            fps: GIF_FPS,
            max_frames,
        };
        self.export(ExportJob::Gif(spec), &output, progress, cancel).await
    }

    async fn remux(
        &self,
        descriptor: &LocalProcessingDescriptor,
        main: &Path,
        progress: &ProgressEmitter,
        cancel: &CancellationToken,
    ) -> Result<PathBuf, ProcessingError> {
        let inventory = self.toolkit.probe_tracks(main).await?;
        let output = self.output_path(&descriptor.output.filename).await?;
        let container = ContainerKind::from_path(&output);

        let mut composition = Composition::new(container, CodecPolicy::Copy);
        if inventory.video > 0 && !container.is_audio_only() {
            composition = composition.with_track(TrackSource::all(main, TrackKind::Video));
        }
        if inventory.audio > 0 {
            composition = composition.with_track(TrackSource::all(main, TrackKind::Audio));
        }
        if composition.tracks.is_empty() {
            return Err(ProcessingError::ProcessingFailed(format!(
                "{} has no usable tracks",
                main.display()
            )));
        }
        self.export(ExportJob::Compose(composition), &output, progress, cancel)
            .await
    }

    async fn require_track(&self, path: &Path, kind: TrackKind) -> Result<(), ProcessingError> {
        let inventory = self.toolkit.probe_tracks(path).await?;
        if inventory.count(kind) == 0 {
            return Err(ProcessingError::ProcessingFailed(format!(
                "{} has no {} track",
                path.display(),
                kind
            )));
        }
        Ok(())
    }

    async fn output_path(&self, filename: &str) -> Result<PathBuf, ProcessingError> {
        tokio::fs::create_dir_all(&self.settings.output_dir).await?;
        let name = Path::new(filename)
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .filter(|n| !n.is_empty())
            .ok_or_else(|| {
                ProcessingError::ProcessingFailed(format!("invalid output name `{}`", filename))
            })?;
        Ok(self.settings.output_dir.join(name))
    }

    async fn export(
        &self,
        job: ExportJob,
        output: &Path,
        progress: &ProgressEmitter,
        cancel: &CancellationToken,
    ) -> Result<PathBuf, ProcessingError> {
        check_cancelled(cancel)?;
        progress.emit(DownloadProgress {
            percent: 0.0,
            status: "Processing".to_string(),
        });

        let report = |raw: f64| {
            progress.emit(DownloadProgress {
                percent: scaled_percent(raw),
                status: "Processing".to_string(),
            })
        };
        self.toolkit.export(&job, output, &report, cancel).await?;

        match tokio::fs::metadata(output).await {
            Ok(meta) if meta.len() > 0 => Ok(output.to_path_buf()),
            Ok(_) => Err(ProcessingError::ProcessingFailed(format!(
                "{} produced an empty file",
                self.toolkit.name()
            ))),
            Err(_) => Err(ProcessingError::ProcessingFailed(format!(
                "{} produced no output at {}",
                self.toolkit.name(),
                output.display()
            ))),
        }
    }
}

fn check_cancelled(cancel: &CancellationToken) -> Result<(), ProcessingError> {
    if cancel.is_cancelled() {
        Err(ProcessingError::Cancelled)
    } else {
        Ok(())
    }
}

fn validate_url(url: &str) -> Result<(), ProcessingError> {
    match Url::parse(url) {
        Ok(parsed) if matches!(parsed.scheme(), "http" | "https") => Ok(()),
        _ => Err(ProcessingError::InvalidUrl(url.to_string())),
    }
}

fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default()
}

/// Whether the file starts with a GIF87a/GIF89a header
async fn has_gif_signature(path: &Path) -> Result<bool, ProcessingError> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut header = [0u8; 6];
    let mut filled = 0;
    while filled < header.len() {
        let n = file.read(&mut header[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled == 6 && (&header == b"GIF87a" || &header == b"GIF89a"))
}
