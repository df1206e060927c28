// Downloader module - orchestration, transfer and local processing layers

pub mod auth;
pub mod backends;
pub mod config;
pub mod duration;
pub mod errors;
pub mod media;
pub mod models;
pub mod orchestrator;
pub mod processing;
pub mod tools;
pub mod traits;
pub mod transfer;
pub mod utils;

pub use errors::DownloadError;
pub use models::{
    DownloadMode, DownloadProgress, DownloadRequest, LocalProcessingDescriptor,
    OrchestrationResult, PickerOption,
};
pub use orchestrator::OrchestrationClient;
pub use processing::LocalProcessingPipeline;
pub use traits::ProgressEmitter;
pub use transfer::TransferEngine;
