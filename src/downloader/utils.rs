// Helper functions shared by the transfer engine and the pipeline

use std::io;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::process::Command as TokioCommand;
use tokio::time::{timeout, Duration as TokioDuration};
use tracing::{debug, warn};
use url::Url;

const AUDIO_EXTENSIONS: &[&str] = &["mp3", "m4a", "aac", "wav", "opus", "ogg", "flac"];

/// Run command with timeout (shared utility)
pub async fn run_output_with_timeout(
    program: &str,
    args: Vec<String>,
    timeout_secs: u64,
) -> io::Result<std::process::Output> {
    let mut child = TokioCommand::new(program)
        .args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;

    let mut stdout_pipe = child
        .stdout
        .take()
        .ok_or_else(|| io::Error::other(format!("failed to capture stdout from {}", program)))?;
    let mut stderr_pipe = child
        .stderr
        .take()
        .ok_or_else(|| io::Error::other(format!("failed to capture stderr from {}", program)))?;

    let stdout_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        stdout_pipe.read_to_end(&mut buf).await?;
        Ok::<Vec<u8>, io::Error>(buf)
    });
    let stderr_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        stderr_pipe.read_to_end(&mut buf).await?;
        Ok::<Vec<u8>, io::Error>(buf)
    });

    match timeout(TokioDuration::from_secs(timeout_secs), child.wait()).await {
        Ok(status) => {
            let status = status?;
            let stdout = stdout_task.await.map_err(io::Error::other)??;
            let stderr = stderr_task.await.map_err(io::Error::other)??;
            Ok(std::process::Output { status, stdout, stderr })
        }
        Err(_) => {
            let _ = child.kill().await;
            stdout_task.abort();
            stderr_task.abort();
            Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("{} timed out after {}s", program, timeout_secs),
            ))
        }
    }
}

/// Build an HTTP client, routed through `proxy` when one is given. An
/// unusable proxy URL falls back to a direct connection.
pub fn build_http_client(
    proxy: Option<&str>,
    connect_timeout: Duration,
    user_agent: &str,
    tcp_keepalive: Option<Duration>,
) -> reqwest::Result<reqwest::Client> {
    let builder = reqwest::Client::builder()
        .connect_timeout(connect_timeout)
        .user_agent(user_agent)
        .tcp_keepalive(tcp_keepalive);

    match proxy {
        Some(proxy_url) => match reqwest::Proxy::all(proxy_url) {
            Ok(proxy) => {
                debug!("Using proxy {}", proxy_url);
                builder.proxy(proxy).build()
            }
            Err(e) => {
                warn!("Invalid proxy URL {} ({}), connecting directly", proxy_url, e);
                builder.build()
            }
        },
        None => builder.build(),
    }
}

/// Delete every entry of `dir`. Failures are logged and skipped; returns
/// how many entries were removed.
pub async fn clear_directory(dir: &Path) -> usize {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return 0,
        Err(e) => {
            warn!("Could not list {}: {}", dir.display(), e);
            return 0;
        }
    };

    let mut removed = 0;
    loop {
        let entry = match entries.next_entry().await {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(e) => {
                warn!("Could not read entry of {}: {}", dir.display(), e);
                break;
            }
        };
        let path = entry.path();
        let result = match entry.file_type().await {
            Ok(ft) if ft.is_dir() => tokio::fs::remove_dir_all(&path).await,
            _ => tokio::fs::remove_file(&path).await,
        };
        match result {
            Ok(()) => removed += 1,
            Err(e) => warn!("Could not remove {}: {}", path.display(), e),
        }
    }

    debug!("Cleared {} entries from {}", removed, dir.display());
    removed
}

/// Lowercased extension of a path, if any
pub fn extension_of(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|e| e.to_str())
        .filter(|e| !e.is_empty())
        .map(|e| e.to_ascii_lowercase())
}

/// Extension of the last path segment of a URL ("https://x/a/b.webm?x=1" -> "webm")
pub fn url_path_extension(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    let segment = parsed.path_segments()?.next_back()?;
    let (stem, ext) = segment.rsplit_once('.')?;
    if stem.is_empty() || ext.is_empty() || !ext.chars().all(|c| c.is_ascii_alphanumeric()) {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}

pub fn is_audio_extension(ext: &str) -> bool {
    AUDIO_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str())
}

/// Filename of the audio half of a merge: "out.mp4" -> "out_audio.m4a",
/// "out" -> "out_audio.m4a"
pub fn audio_companion_filename(primary: &str) -> String {
    match primary.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() && !ext.is_empty() => {
            format!("{}_audio.m4a", stem)
        }
        _ => format!("{}_audio.m4a", primary),
    }
}

/// Replace (or add) the extension of a bare filename
pub fn with_extension(filename: &str, ext: &str) -> String {
    Path::new(filename)
        .with_extension(ext)
        .to_string_lossy()
        .to_string()
}

/// Human-readable detail of an error response body. Understands
/// `{"error":{"code":..}}`, `{"error":".."}` and `{"text":".."}`, otherwise
/// returns the trimmed raw body.
pub fn response_error_detail(body: &str) -> String {
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(body) {
        let detail = value
            .pointer("/error/code")
            .and_then(|v| v.as_str())
            .or_else(|| value.get("error").and_then(|v| v.as_str()))
            .or_else(|| value.get("text").and_then(|v| v.as_str()));
        if let Some(detail) = detail {
            return detail.to_string();
        }
    }
    body.trim().to_string()
}

/// Random unique file name with the given extension
pub fn unique_file_name(ext: &str) -> String {
    format!("{}.{}", uuid::Uuid::new_v4(), ext)
}
