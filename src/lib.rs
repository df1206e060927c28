pub mod downloader;
pub mod session;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

pub use downloader::{
    DownloadError, DownloadMode, DownloadProgress, DownloadRequest, OrchestrationResult,
    PickerOption, ProgressEmitter,
};
pub use session::{Session, SessionOutcome};

/// Install the global tracing subscriber. `RUST_LOG` wins over `verbose`.
/// Calling it again is a no-op.
pub fn init_logging(verbose: bool) {
    let default_level = if verbose {
        "nickel_downloader=debug"
    } else {
        "nickel_downloader=info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .try_init();
}
