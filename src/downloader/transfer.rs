// Single-slot transfer engine with background -> foreground fallback

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::backends::HttpTransport;
use super::config::TransferSettings;
use super::errors::{TransferError, EMPTY_FILE_HINT};
use super::models::AssetKind;
use super::traits::{
    ByteCounters, LogNotifier, Transport, TransferProgressFn, TransportMode, UserNotifier,
};
use super::utils::{clear_directory, unique_file_name, url_path_extension};

const FALLBACK_TITLE: &str = "Background downloads unavailable";
const FALLBACK_BODY: &str = "Background transfers are not available in this environment. \
     The download continues in the foreground.";

/// Per-call options of [`TransferEngine::download_file`]
#[derive(Clone, Default)]
pub struct TransferOptions {
    /// Destination file name inside the scratch directory
    pub filename: Option<String>,
    /// Keep files already in the scratch directory
    pub skip_scratch_clear: bool,
    pub progress: Option<TransferProgressFn>,
}

impl TransferOptions {
    pub fn named(filename: impl Into<String>) -> Self {
        Self {
            filename: Some(filename.into()),
            ..Self::default()
        }
    }

    pub fn keep_scratch(mut self) -> Self {
        self.skip_scratch_clear = true;
        self
    }

    pub fn with_progress(mut self, progress: TransferProgressFn) -> Self {
        self.progress = Some(progress);
        self
    }
}

struct ActiveJob {
    id: Uuid,
    cancel: CancellationToken,
    temp_path: PathBuf,
    destination: PathBuf,
}

/// Clears the slot if the job is still registered when the call unwinds
struct SlotRelease<'a> {
    slot: &'a Mutex<Option<ActiveJob>>,
    id: Uuid,
}

impl Drop for SlotRelease<'_> {
    fn drop(&mut self) {
        let mut slot = self.slot.lock();
        if slot.as_ref().map(|job| job.id) == Some(self.id) {
            *slot = None;
        }
    }
}

pub struct TransferEngine {
    settings: TransferSettings,
    background: Arc<dyn Transport>,
    foreground: Arc<dyn Transport>,
    notifier: Arc<dyn UserNotifier>,
    active: Mutex<Option<ActiveJob>>,
    fallback_notified: Arc<AtomicBool>,
}

impl TransferEngine {
    /// Engine with the HTTP transports
    pub fn new(settings: TransferSettings) -> Result<Self, TransferError> {
        let background = Arc::new(HttpTransport::new(TransportMode::Background, &settings)?);
        let foreground = Arc::new(HttpTransport::new(TransportMode::Foreground, &settings)?);
        Ok(Self::with_transports(settings, background, foreground))
    }

    pub fn with_transports(
        settings: TransferSettings,
        background: Arc<dyn Transport>,
        foreground: Arc<dyn Transport>,
    ) -> Self {
        Self {
            settings,
            background,
            foreground,
            notifier: Arc::new(LogNotifier),
            active: Mutex::new(None),
            fallback_notified: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn UserNotifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn scratch_dir(&self) -> &Path {
        &self.settings.scratch_dir
    }

    pub fn is_active(&self) -> bool {
        self.active.lock().is_some()
    }

    /// Download `url` into the scratch directory and return the local path
    pub async fn download_file(
        &self,
        url: &str,
        kind: AssetKind,
        options: TransferOptions,
        cancel: &CancellationToken,
    ) -> Result<PathBuf, TransferError> {
        if cancel.is_cancelled() {
            return Err(TransferError::Cancelled);
        }

        let scratch = self.settings.scratch_dir.clone();
        let destination = scratch.join(destination_name(url, kind, options.filename.as_deref()));
        let temp_path = scratch.join(format!(".{}.part", Uuid::new_v4()));

        let id = Uuid::new_v4();
        let job_cancel = cancel.child_token();
        {
            let mut slot = self.active.lock();
            if slot.is_some() {
                return Err(TransferError::Busy);
            }
            *slot = Some(ActiveJob {
                id,
                cancel: job_cancel.clone(),
                temp_path: temp_path.clone(),
                destination: destination.clone(),
            });
        }
        let _release = SlotRelease {
            slot: &self.active,
            id,
        };
        let _abort_on_drop = job_cancel.clone().drop_guard();

        if !options.skip_scratch_clear {
            clear_directory(&scratch).await;
        }
        tokio::fs::create_dir_all(&scratch).await?;

        info!("[Transfer] Downloading {} {} -> {}", kind, url, destination.display());

        let counters = Arc::new(ByteCounters::new(options.progress));
        let first = if self.settings.background_enabled {
            self.background.clone()
        } else {
            self.foreground.clone()
        };
        let attempt = TransferAttempt {
            first,
            foreground: self.foreground.clone(),
            notifier: self.notifier.clone(),
            fallback_notified: self.fallback_notified.clone(),
            url: url.to_string(),
            temp_path: temp_path.clone(),
            counters: counters.clone(),
            cancel: job_cancel.clone(),
        };

        // The sender is consumed by its single send, so the result resolves once
        let (done_tx, done_rx) = oneshot::channel();
        tokio::spawn(async move {
            let _ = done_tx.send(attempt.run().await);
        });
        let outcome = done_rx
            .await
            .unwrap_or(Err(TransferError::MissingState));

        let job = {
            let mut slot = self.active.lock();
            match slot.as_ref() {
                Some(job) if job.id == id => slot.take(),
                _ => None,
            }
        };
        let Some(job) = job else {
            remove_quietly(&temp_path).await;
            return Err(TransferError::MissingState);
        };

        if let Err(e) = outcome {
            remove_quietly(&job.temp_path).await;
            if job.cancel.is_cancelled() || e.is_cancelled() {
                info!("[Transfer] Cancelled {}", url);
                return Err(TransferError::Cancelled);
            }
            warn!("[Transfer] {} failed: {}", url, e);
            return Err(e);
        }
        if job.cancel.is_cancelled() {
            remove_quietly(&job.temp_path).await;
            return Err(TransferError::Cancelled);
        }

        let path = finalize(&job.temp_path, &job.destination).await?;
        info!(
            "[Transfer] Saved {} ({:.1} MB)",
            path.display(),
            counters.snapshot().downloaded_mb
        );
        Ok(path)
    }

    /// Cancel the active transfer, if any. Safe to call repeatedly.
    pub fn cancel_download(&self) {
        match self.active.lock().as_ref() {
            Some(job) => {
                debug!("[Transfer] Cancelling job {}", job.id);
                job.cancel.cancel();
            }
            None => debug!("[Transfer] Cancel requested with no active transfer"),
        }
    }
}

struct TransferAttempt {
    first: Arc<dyn Transport>,
    foreground: Arc<dyn Transport>,
    notifier: Arc<dyn UserNotifier>,
    fallback_notified: Arc<AtomicBool>,
    url: String,
    temp_path: PathBuf,
    counters: Arc<ByteCounters>,
    cancel: CancellationToken,
}

impl TransferAttempt {
    async fn run(self) -> Result<(), TransferError> {
        debug!("[Transfer] Trying transport: {}", self.first.name());
        let err = match self
            .first
            .fetch(&self.url, &self.temp_path, &self.counters, &self.cancel)
            .await
        {
            Ok(()) => return Ok(()),
            Err(e) => e,
        };

        if err.is_cancelled() || self.cancel.is_cancelled() {
            return Err(TransferError::Cancelled);
        }
        if self.first.mode() != TransportMode::Background {
            return Err(err);
        }

        warn!(
            "[Transfer] ✗ {} failed ({}), retrying with {}",
            self.first.name(),
            err,
            self.foreground.name()
        );
        if !self.fallback_notified.swap(true, Ordering::SeqCst) {
            self.notifier.notify(FALLBACK_TITLE, FALLBACK_BODY);
        }

        self.foreground
            .fetch(&self.url, &self.temp_path, &self.counters, &self.cancel)
            .await
    }
}

/// File name for a download: the explicit name wins, otherwise a random
/// name with the URL's extension or the kind's default one
pub fn destination_name(url: &str, kind: AssetKind, filename: Option<&str>) -> String {
    let explicit = filename
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .and_then(|name| Path::new(name).file_name())
        .and_then(|name| name.to_str());
    if let Some(name) = explicit {
        return name.to_string();
    }

    let ext = url_path_extension(url).unwrap_or_else(|| kind.default_extension().to_string());
    unique_file_name(&ext)
}

async fn finalize(temp_path: &Path, destination: &Path) -> Result<PathBuf, TransferError> {
    match tokio::fs::remove_file(destination).await {
        Ok(()) => debug!("[Transfer] Replaced existing {}", destination.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(TransferError::MoveFailed(e)),
    }
    tokio::fs::rename(temp_path, destination)
        .await
        .map_err(TransferError::MoveFailed)?;

    let meta = tokio::fs::metadata(destination)
        .await
        .map_err(|_| TransferError::FileMissingAfterMove(destination.to_path_buf()))?;
    if meta.len() == 0 {
        warn!("[Transfer] {} is empty", destination.display());
        return Err(TransferError::EmptyFile {
            path: destination.to_path_buf(),
            hint: EMPTY_FILE_HINT,
        });
    }
    Ok(destination.to_path_buf())
}

async fn remove_quietly(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("Could not remove {}: {}", path.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    enum Behavior {
        Write(Vec<u8>),
        Fail,
        WaitForCancel,
    }

    struct FakeTransport {
        mode: TransportMode,
        behavior: Behavior,
        calls: AtomicUsize,
    }

    impl FakeTransport {
        fn new(mode: TransportMode, behavior: Behavior) -> Arc<Self> {
            Arc::new(Self {
                mode,
                behavior,
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Transport for FakeTransport {
        fn name(&self) -> &'static str {
            "fake"
        }

        fn mode(&self) -> TransportMode {
            self.mode
        }

        async fn fetch(
            &self,
            url: &str,
            target: &Path,
            counters: &ByteCounters,
            cancel: &CancellationToken,
        ) -> Result<(), TransferError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.behavior {
                Behavior::Write(data) => {
                    tokio::fs::write(target, data).await?;
                    counters.reset(0, Some(data.len() as u64));
                    counters.advance(data.len() as u64);
                    Ok(())
                }
                Behavior::Fail => Err(TransferError::HttpStatus {
                    status: 500,
                    url: url.to_string(),
                }),
                Behavior::WaitForCancel => {
                    cancel.cancelled().await;
                    Err(TransferError::Cancelled)
                }
            }
        }
    }

    #[derive(Default)]
    struct RecordingNotifier {
        count: AtomicUsize,
    }

    impl UserNotifier for RecordingNotifier {
        fn notify(&self, _title: &str, _body: &str) {
            self.count.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn settings(dir: &Path) -> TransferSettings {
        TransferSettings::default().with_scratch_dir(dir)
    }

    fn writer(data: &[u8]) -> Arc<FakeTransport> {
        FakeTransport::new(TransportMode::Foreground, Behavior::Write(data.to_vec()))
    }

    #[test]
    fn test_destination_name() {
        assert_eq!(
            destination_name("https://x/y.mp4", AssetKind::Video, Some("clip.webm")),
            "clip.webm"
        );
        assert_eq!(
            destination_name("https://x", AssetKind::Video, Some("../../etc/passwd")),
            "passwd"
        );
        let name = destination_name("https://x/file.xyz", AssetKind::Video, None);
        assert!(name.ends_with(".xyz"));
        assert!(Uuid::parse_str(name.trim_end_matches(".xyz")).is_ok());
        assert!(
            destination_name("https://x/tunnel?id=1", AssetKind::Image, None).ends_with(".jpg")
        );
        assert!(destination_name("https://x/", AssetKind::Audio, Some(" ")).ends_with(".mp3"));
    }

    #[tokio::test]
    async fn test_download_with_filename() {
        let dir = tempfile::tempdir().unwrap();
        let background =
            FakeTransport::new(TransportMode::Background, Behavior::Write(b"data".to_vec()));
        let engine =
            TransferEngine::with_transports(settings(dir.path()), background.clone(), writer(b"x"));

        let path = engine
            .download_file(
                "https://x/y.mp4",
                AssetKind::Video,
                TransferOptions::named("out.mp4"),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(path, dir.path().join("out.mp4"));
        assert_eq!(std::fs::read(&path).unwrap(), b"data");
        assert_eq!(background.calls(), 1);
        assert!(!engine.is_active());
    }

    #[tokio::test]
    async fn test_download_derives_extension() {
        let dir = tempfile::tempdir().unwrap();
        let engine =
            TransferEngine::with_transports(settings(dir.path()), writer(b"a"), writer(b"a"));

        let path = engine
            .download_file(
                "https://x/file.xyz",
                AssetKind::Video,
                TransferOptions::default(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(path.parent().unwrap(), dir.path());
        assert_eq!(path.extension().unwrap(), "xyz");
    }

    #[tokio::test]
    async fn test_background_failure_falls_back_once() {
        let dir = tempfile::tempdir().unwrap();
        let background = FakeTransport::new(TransportMode::Background, Behavior::Fail);
        let foreground = writer(b"payload");
        let notifier = Arc::new(RecordingNotifier::default());
        let engine = TransferEngine::with_transports(
            settings(dir.path()),
            background.clone(),
            foreground.clone(),
        )
        .with_notifier(notifier.clone());

        for _ in 0..2 {
            let path = engine
                .download_file(
                    "https://x/y.mp4",
                    AssetKind::Video,
                    TransferOptions::default(),
                    &CancellationToken::new(),
                )
                .await
                .unwrap();
            assert_eq!(std::fs::read(&path).unwrap(), b"payload");
        }

        assert_eq!(background.calls(), 2);
        assert_eq!(foreground.calls(), 2);
        assert_eq!(notifier.count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_foreground_failure_does_not_retry() {
        let dir = tempfile::tempdir().unwrap();
        let background = writer(b"unused");
        let foreground = FakeTransport::new(TransportMode::Foreground, Behavior::Fail);
        let mut settings = settings(dir.path());
        settings.background_enabled = false;
        let engine =
            TransferEngine::with_transports(settings, background.clone(), foreground.clone());

        let err = engine
            .download_file(
                "https://x/y.mp4",
                AssetKind::Video,
                TransferOptions::default(),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, TransferError::HttpStatus { status: 500, .. }));
        assert_eq!(background.calls(), 0);
        assert_eq!(foreground.calls(), 1);
    }

    #[tokio::test]
    async fn test_empty_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let engine =
            TransferEngine::with_transports(settings(dir.path()), writer(b""), writer(b""));

        let err = engine
            .download_file(
                "https://x/y.mp4",
                AssetKind::Video,
                TransferOptions::default(),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, TransferError::EmptyFile { hint, .. } if hint == EMPTY_FILE_HINT));
    }

    #[tokio::test]
    async fn test_scratch_clear_and_skip() {
        let dir = tempfile::tempdir().unwrap();
        let engine =
            TransferEngine::with_transports(settings(dir.path()), writer(b"a"), writer(b"a"));
        let cancel = CancellationToken::new();

        let first = engine
            .download_file(
                "https://x/v.mp4",
                AssetKind::Video,
                TransferOptions::named("v.mp4"),
                &cancel,
            )
            .await
            .unwrap();
        let second = engine
            .download_file(
                "https://x/a.m4a",
                AssetKind::Audio,
                TransferOptions::named("a.m4a").keep_scratch(),
                &cancel,
            )
            .await
            .unwrap();
        assert!(first.exists());
        assert!(second.exists());

        engine
            .download_file(
                "https://x/w.mp4",
                AssetKind::Video,
                TransferOptions::named("w.mp4"),
                &cancel,
            )
            .await
            .unwrap();
        assert!(!first.exists());
        assert!(!second.exists());
    }

    #[tokio::test]
    async fn test_existing_destination_is_overwritten() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("out.mp4"), b"old").unwrap();
        let engine =
            TransferEngine::with_transports(settings(dir.path()), writer(b"new"), writer(b"new"));

        let path = engine
            .download_file(
                "https://x/y.mp4",
                AssetKind::Video,
                TransferOptions::named("out.mp4").keep_scratch(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(std::fs::read(path).unwrap(), b"new");
    }

    #[tokio::test]
    async fn test_cancel_is_idempotent_without_transfer() {
        let dir = tempfile::tempdir().unwrap();
        let engine =
            TransferEngine::with_transports(settings(dir.path()), writer(b"a"), writer(b"a"));
        engine.cancel_download();
        engine.cancel_download();
        assert!(!engine.is_active());
    }

    #[tokio::test]
    async fn test_cancel_active_transfer_and_reject_overlap() {
        let dir = tempfile::tempdir().unwrap();
        let waiting = FakeTransport::new(TransportMode::Background, Behavior::WaitForCancel);
        let engine = Arc::new(TransferEngine::with_transports(
            settings(dir.path()),
            waiting.clone(),
            writer(b"unused"),
        ));

        let task_engine = engine.clone();
        let handle = tokio::spawn(async move {
            task_engine
                .download_file(
                    "https://x/y.mp4",
                    AssetKind::Video,
                    TransferOptions::default(),
                    &CancellationToken::new(),
                )
                .await
        });

        while !engine.is_active() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let overlap = engine
            .download_file(
                "https://x/z.mp4",
                AssetKind::Video,
                TransferOptions::default(),
                &CancellationToken::new(),
            )
            .await;
        assert!(matches!(overlap, Err(TransferError::Busy)));

        engine.cancel_download();
        engine.cancel_download();

        let result = handle.await.unwrap();
        assert!(matches!(result, Err(TransferError::Cancelled)));
        assert!(!engine.is_active());
    }

    #[tokio::test]
    async fn test_cancelled_token_short_circuits() {
        let dir = tempfile::tempdir().unwrap();
        let transport = writer(b"a");
        let engine = TransferEngine::with_transports(
            settings(dir.path()),
            transport.clone(),
            transport.clone(),
        );
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = engine
            .download_file("https://x/y.mp4", AssetKind::Video, TransferOptions::default(), &cancel)
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(transport.calls(), 0);
    }
}
