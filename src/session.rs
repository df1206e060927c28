// Session facade: orchestration result dispatched to transfer or local processing

use std::path::PathBuf;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::downloader::auth::{Attestor, ManagedAuthProvider};
use crate::downloader::config::{
    ApiSettings, KeyValueStore, ProcessingSettings, RequestTemplate, TransferSettings,
};
use crate::downloader::errors::{DownloadError, TransferError};
use crate::downloader::media::FfmpegToolkit;
use crate::downloader::models::{AssetKind, DownloadRequest, OrchestrationResult, PickerOption};
use crate::downloader::orchestrator::OrchestrationClient;
use crate::downloader::processing::LocalProcessingPipeline;
use crate::downloader::traits::ProgressEmitter;
use crate::downloader::transfer::{TransferEngine, TransferOptions};
use crate::downloader::utils::build_http_client;

const API_USER_AGENT: &str = concat!("nickel-downloader/", env!("CARGO_PKG_VERSION"));

/// What a finished session produced
#[derive(Debug, Clone, PartialEq)]
pub enum SessionOutcome {
    /// A file ready for the user
    Saved(PathBuf),
    /// The user has to pick one; continue with [`Session::download_option`]
    Picker(Vec<PickerOption>),
}

pub struct Session {
    orchestrator: OrchestrationClient,
    transfer: Arc<TransferEngine>,
    pipeline: LocalProcessingPipeline,
    progress: ProgressEmitter,
}

impl Session {
    pub fn new(
        orchestrator: OrchestrationClient,
        transfer: Arc<TransferEngine>,
        pipeline: LocalProcessingPipeline,
        progress: ProgressEmitter,
    ) -> Self {
        Self {
            orchestrator,
            transfer,
            pipeline,
            progress,
        }
    }

    /// Wire every component from persisted settings, with ffmpeg as the
    /// media toolkit
    pub fn from_store(
        store: Arc<dyn KeyValueStore>,
        attestor: Arc<dyn Attestor>,
        progress: ProgressEmitter,
    ) -> Result<Self, DownloadError> {
        let api = ApiSettings::load(store.as_ref())?;
        let template = RequestTemplate::load(store.as_ref())?;
        let transfer_settings = TransferSettings::load(store.as_ref());
        let processing_settings = ProcessingSettings::default();

        let http = build_http_client(
            transfer_settings.proxy.as_deref(),
            transfer_settings.connect_timeout,
            API_USER_AGENT,
            None,
        )
        .map_err(TransferError::from)?;

        let auth = Arc::new(ManagedAuthProvider::new(
            http.clone(),
            api.auth_server.clone(),
            store,
            attestor,
        ));
        let orchestrator =
            OrchestrationClient::new(http, api, template, auth).with_progress(progress.clone());

        let transfer = Arc::new(TransferEngine::new(transfer_settings)?);
        let toolkit = Arc::new(FfmpegToolkit::detect(processing_settings.poll_interval));
        let pipeline = LocalProcessingPipeline::new(transfer.clone(), toolkit, processing_settings);

        Ok(Self::new(orchestrator, transfer, pipeline, progress))
    }

    /// Resolve `request` through the API and carry it to a local file, or
    /// to the list of options the user must choose from
    pub async fn run(&self, request: &DownloadRequest) -> Result<SessionOutcome, DownloadError> {
        info!("[Session] Starting {}", request.url);
        let outcome = self.dispatch(request).await;
        settle(outcome, &request.cancel)
    }

    async fn dispatch(&self, request: &DownloadRequest) -> Result<SessionOutcome, DownloadError> {
        let cancel = &request.cancel;
        let result = self
            .orchestrator
            .fetch_result(&request.url, request.mode, cancel)
            .await?;

        match result {
            OrchestrationResult::Success { url, filename } => {
                let options = TransferOptions {
                    filename,
                    ..TransferOptions::default()
                }
                .with_progress(self.progress.transfer_sink("Downloading"));
                let path = self
                    .transfer
                    .download_file(&url, AssetKind::Video, options, cancel)
                    .await?;
                Ok(SessionOutcome::Saved(path))
            }
            OrchestrationResult::PickerOptions(options) => {
                info!("[Session] {} options to pick from", options.len());
                Ok(SessionOutcome::Picker(options))
            }
            OrchestrationResult::LocalProcessing(descriptor) => {
                let path = self
                    .pipeline
                    .process(&descriptor, &self.progress, cancel)
                    .await?;
                Ok(SessionOutcome::Saved(path))
            }
        }
    }

    /// Download the option the user picked
    pub async fn download_option(
        &self,
        option: &PickerOption,
        cancel: &CancellationToken,
    ) -> Result<PathBuf, DownloadError> {
        let options =
            TransferOptions::default().with_progress(self.progress.transfer_sink("Downloading"));
        let outcome = self
            .transfer
            .download_file(&option.url, option.asset_kind(), options, cancel)
            .await
            .map_err(DownloadError::from);
        settle(outcome, cancel)
    }

    /// Stop whatever transfer or processing step is running
    pub fn cancel(&self) {
        self.transfer.cancel_download();
        self.pipeline.cancel_processing();
    }

    pub fn is_busy(&self) -> bool {
        self.transfer.is_active() || self.pipeline.is_active()
    }
}

/// Cancellation wins over whatever failure it raced with
fn settle<T>(
    outcome: Result<T, DownloadError>,
    cancel: &CancellationToken,
) -> Result<T, DownloadError> {
    match outcome {
        Err(e) if cancel.is_cancelled() && !e.is_cancelled() => {
            warn!("[Session] {} after cancellation, reporting as cancelled", e);
            Err(DownloadError::Cancelled)
        }
        Err(e) => {
            warn!("[Session] Failed: {}", e);
            Err(e)
        }
        ok => ok,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::downloader::auth::UnsupportedAttestor;
    use crate::downloader::config::{MemoryStore, KEY_API_URL};
    use crate::downloader::errors::OrchestrationError;

    #[test]
    fn test_settle_prefers_cancellation() {
        let cancel = CancellationToken::new();
        let failure = || {
            Err::<PathBuf, _>(DownloadError::Orchestration(
                OrchestrationError::ServerUnavailable,
            ))
        };

        assert!(matches!(
            settle(failure(), &cancel),
            Err(DownloadError::Orchestration(_))
        ));

        cancel.cancel();
        let err = settle(failure(), &cancel).unwrap_err();
        assert!(matches!(err, DownloadError::Cancelled));
        assert_eq!(err.user_message(), "Cancelled");

        let saved = settle(Ok(PathBuf::from("a.mp4")), &cancel).unwrap();
        assert_eq!(saved, PathBuf::from("a.mp4"));
    }

    #[tokio::test]
    async fn test_download_option_cancelled_before_start() {
        let store = Arc::new(MemoryStore::new());
        let session =
            Session::from_store(store, Arc::new(UnsupportedAttestor), ProgressEmitter::noop())
                .unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let option = PickerOption {
            label: "photo".to_string(),
            url: "http://127.0.0.1:9/1.jpg".to_string(),
        };
        let err = session.download_option(&option, &cancel).await.unwrap_err();
        assert!(matches!(err, DownloadError::Cancelled));
    }

    #[tokio::test]
    async fn test_cancelled_request_never_reaches_network() {
        let store = Arc::new(MemoryStore::new());
        // Nothing listens on the discard port
        store.set(KEY_API_URL, "http://127.0.0.1:9/").unwrap();
        let session =
            Session::from_store(store, Arc::new(UnsupportedAttestor), ProgressEmitter::noop())
                .unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let request = DownloadRequest::new("https://video.example/watch?v=1").with_cancel(cancel);

        let err = session.run(&request).await.unwrap_err();
        assert!(matches!(err, DownloadError::Cancelled));
        assert!(!session.is_busy());
    }
}
