// reqwest streaming transport with range-request resume

use std::io;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::RANGE;
use reqwest::StatusCode;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::downloader::config::TransferSettings;
use crate::downloader::errors::TransferError;
use crate::downloader::traits::{ByteCounters, Transport, TransportMode};
use crate::downloader::utils::build_http_client;

const USER_AGENT: &str = concat!("nickel-downloader/", env!("CARGO_PKG_VERSION"));

pub struct HttpTransport {
    client: reqwest::Client,
    mode: TransportMode,
    read_timeout: Duration,
}

impl HttpTransport {
    /// Build a transport profile. The background profile keeps connections
    /// alive across idle periods; the foreground one does not.
    pub fn new(mode: TransportMode, settings: &TransferSettings) -> Result<Self, TransferError> {
        let keepalive = match mode {
            TransportMode::Background => Some(Duration::from_secs(60)),
            TransportMode::Foreground => None,
        };
        let client = build_http_client(
            settings.proxy.as_deref(),
            settings.connect_timeout,
            USER_AGENT,
            keepalive,
        )?;
        Ok(Self {
            client,
            mode,
            read_timeout: settings.read_timeout,
        })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    fn name(&self) -> &'static str {
        match self.mode {
            TransportMode::Background => "http-background",
            TransportMode::Foreground => "http-foreground",
        }
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
        let resume_from = match tokio::fs::metadata(target).await {
            Ok(meta) => meta.len(),
            Err(_) => 0,
        };

        let mut request = self.client.get(url);
        if resume_from > 0 {
            debug!("[{}] Resuming {} from byte {}", self.name(), url, resume_from);
            request = request.header(RANGE, format!("bytes={}-", resume_from));
        }

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(TransferError::Cancelled),
            response = request.send() => response?,
        };

        let status = response.status();
        let mut file = if status == StatusCode::PARTIAL_CONTENT && resume_from > 0 {
            counters.reset(
                resume_from,
                response.content_length().map(|len| len + resume_from),
            );
            OpenOptions::new().append(true).open(target).await?
        } else if status.is_success() {
            if resume_from > 0 {
                info!("[{}] Server ignored range request, restarting", self.name());
            }
            counters.reset(0, response.content_length());
            OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(target)
                .await?
        } else {
            return Err(TransferError::HttpStatus {
                status: status.as_u16(),
                url: url.to_string(),
            });
        };

        let mut stream = response.bytes_stream();
        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => {
                    file.flush().await?;
                    return Err(TransferError::Cancelled);
                }
                next = tokio::time::timeout(self.read_timeout, stream.next()) => next,
            };

            match next {
                Err(_) => {
                    file.flush().await?;
                    return Err(TransferError::Io(io::Error::new(
                        io::ErrorKind::TimedOut,
                        format!("no data for {}s", self.read_timeout.as_secs()),
                    )));
                }
                Ok(None) => break,
                Ok(Some(chunk)) => {
                    let chunk = match chunk {
                        Ok(chunk) => chunk,
                        Err(e) => {
                            file.flush().await?;
                            return Err(e.into());
                        }
                    };
                    file.write_all(&chunk).await?;
                    counters.advance(chunk.len() as u64);
                }
            }
        }

        file.flush().await?;
        debug!(
            "[{}] Finished {} ({} bytes)",
            self.name(),
            url,
            counters.downloaded()
        );
        Ok(())
    }
}
