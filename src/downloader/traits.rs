// Transport trait and progress/notification helpers

use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::errors::TransferError;
use super::models::{DownloadProgress, TransferProgress};

const BYTES_PER_MB: f64 = 1_048_576.0;

/// Whether a transport may keep running while the app is suspended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportMode {
    Background,
    Foreground,
}

impl fmt::Display for TransportMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Background => write!(f, "background"),
            Self::Foreground => write!(f, "foreground"),
        }
    }
}

/// Trait for transfer transport implementations
#[async_trait]
pub trait Transport: Send + Sync {
    /// Name of the transport (for logging)
    fn name(&self) -> &'static str;

    fn mode(&self) -> TransportMode;

    /// Fetch `url` into `target`. A partially written `target` may be
    /// resumed. Must return `TransferError::Cancelled` once `cancel` fires.
    async fn fetch(
        &self,
        url: &str,
        target: &Path,
        counters: &ByteCounters,
        cancel: &CancellationToken,
    ) -> Result<(), TransferError>;
}

pub type TransferProgressFn = Arc<dyn Fn(TransferProgress) + Send + Sync>;

/// Live byte counters of the active transfer. The total is negative while
/// unknown.
pub struct ByteCounters {
    downloaded: AtomicU64,
    total: AtomicI64,
    callback: Option<TransferProgressFn>,
}

impl ByteCounters {
    pub fn new(callback: Option<TransferProgressFn>) -> Self {
        Self {
            downloaded: AtomicU64::new(0),
            total: AtomicI64::new(-1),
            callback,
        }
    }

    /// Restart counting, e.g. when a server ignores a range request
    pub fn reset(&self, downloaded: u64, total: Option<u64>) {
        self.downloaded.store(downloaded, Ordering::SeqCst);
        self.total
            .store(total.map_or(-1, |t| t as i64), Ordering::SeqCst);
        self.report();
    }

    pub fn advance(&self, bytes: u64) {
        self.downloaded.fetch_add(bytes, Ordering::SeqCst);
        self.report();
    }

    pub fn downloaded(&self) -> u64 {
        self.downloaded.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> TransferProgress {
        let total = self.total.load(Ordering::SeqCst);
        TransferProgress {
            downloaded_mb: self.downloaded() as f64 / BYTES_PER_MB,
            total_mb: if total > 0 {
                total as f64 / BYTES_PER_MB
            } else {
                -1.0
            },
        }
    }

    fn report(&self) {
        if let Some(callback) = &self.callback {
            callback(self.snapshot());
        }
    }
}

/// Progress emitter helper
#[derive(Clone)]
pub struct ProgressEmitter {
    sink: Option<Arc<dyn Fn(DownloadProgress) + Send + Sync>>,
}

impl ProgressEmitter {
    pub fn new(sink: impl Fn(DownloadProgress) + Send + Sync + 'static) -> Self {
        Self {
            sink: Some(Arc::new(sink)),
        }
    }

    /// Emitter that drops everything
    pub fn noop() -> Self {
        Self { sink: None }
    }

    pub fn emit(&self, progress: DownloadProgress) {
        if let Some(sink) = &self.sink {
            sink(progress);
        }
    }

    /// Status-only notification, no percentage
    pub fn status(&self, status: impl Into<String>) {
        self.emit(DownloadProgress {
            percent: 0.0,
            status: status.into(),
        });
    }

    /// Byte-progress callback for a transfer, rendered as `"<label> 3.2 / 10.0 MB"`.
    /// An unknown total reports 0% with the downloaded amount only.
    pub fn transfer_sink(&self, label: &'static str) -> TransferProgressFn {
        let emitter = self.clone();
        Arc::new(move |progress: TransferProgress| {
            emitter.emit(DownloadProgress {
                percent: progress.fraction().map_or(0.0, |f| (f * 100.0) as f32),
                status: format!("{} {}", label, progress.describe()),
            });
        })
    }
}

impl Default for ProgressEmitter {
    fn default() -> Self {
        Self::noop()
    }
}

/// One-off informational messages for the user (not progress)
pub trait UserNotifier: Send + Sync {
    fn notify(&self, title: &str, body: &str);
}

/// Notifier that only writes to the log
pub struct LogNotifier;

impl UserNotifier for LogNotifier {
    fn notify(&self, title: &str, body: &str) {
        info!(title, "{}", body);
    }
}
