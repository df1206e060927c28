// ffmpeg/ffprobe implementation of the media toolkit

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{
    CodecPolicy, Composition, ContainerKind, ExportJob, GifSpec, MediaToolkit,
    TrackInventory, TrackKind, TrackSelection,
};
use crate::downloader::errors::ProcessingError;
use crate::downloader::tools::{ToolManager, ToolType};
use crate::downloader::utils::run_output_with_timeout;

const PROBE_TIMEOUT_SECS: u64 = 30;

lazy_static! {
    // `out_time_ms` is microseconds too, despite its name
    static ref OUT_TIME_RE: Regex = Regex::new(r"^out_time_(?:us|ms)=(\d+)$").unwrap();
}

pub struct FfmpegToolkit {
    ffmpeg: String,
    ffprobe: String,
    poll_interval: Duration,
}

impl FfmpegToolkit {
    pub fn new(
        ffmpeg: impl Into<String>,
        ffprobe: impl Into<String>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
            ffprobe: ffprobe.into(),
            poll_interval,
        }
    }

    /// Locate the binaries with [`ToolManager`]
    pub fn detect(poll_interval: Duration) -> Self {
        let manager = ToolManager::new();
        let toolkit = Self::new(
            manager.resolve(ToolType::Ffmpeg),
            manager.resolve(ToolType::Ffprobe),
            poll_interval,
        );
        debug!("Media toolkit: {} / {}", toolkit.ffmpeg, toolkit.ffprobe);
        toolkit
    }

    async fn ffprobe(&self, args: Vec<String>) -> Result<String, ProcessingError> {
        let output = run_output_with_timeout(&self.ffprobe, args, PROBE_TIMEOUT_SECS)
            .await
            .map_err(|e| {
                ProcessingError::ProcessingFailed(format!("ffprobe failed to run: {}", e))
            })?;
        if !output.status.success() {
            return Err(ProcessingError::ProcessingFailed(format!(
                "ffprobe failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

#[async_trait]
impl MediaToolkit for FfmpegToolkit {
    fn name(&self) -> &'static str {
        "ffmpeg"
    }

    async fn probe_duration(&self, path: &Path) -> Result<f64, ProcessingError> {
        let stdout = self
            .ffprobe(vec![
                "-v".into(),
                "error".into(),
                "-show_entries".into(),
                "format=duration".into(),
                "-of".into(),
                "default=noprint_wrappers=1:nokey=1".into(),
                path.to_string_lossy().to_string(),
            ])
            .await?;
        stdout.trim().parse::<f64>().map_err(|_| {
            ProcessingError::ProcessingFailed(format!(
                "ffprobe reported no duration for {}",
                path.display()
            ))
        })
    }

    async fn probe_tracks(&self, path: &Path) -> Result<TrackInventory, ProcessingError> {
        let stdout = self
            .ffprobe(vec![
                "-v".into(),
                "error".into(),
                "-show_entries".into(),
                "stream=codec_type".into(),
                "-of".into(),
                "csv=p=0".into(),
                path.to_string_lossy().to_string(),
            ])
            .await?;
        Ok(parse_track_inventory(&stdout))
    }

    async fn export(
        &self,
        job: &ExportJob,
        output: &Path,
        progress: &(dyn Fn(f64) + Send + Sync),
        cancel: &CancellationToken,
    ) -> Result<(), ProcessingError> {
        if cancel.is_cancelled() {
            return Err(ProcessingError::Cancelled);
        }

        let total_secs = match job {
            ExportJob::Compose(composition) => match composition.expected_duration() {
                Some(d) => Some(d),
                None => match composition.tracks.first() {
                    Some(track) => self.probe_duration(&track.path).await.ok(),
                    None => None,
                },
            },
            ExportJob::Gif(spec) => Some(spec.covered_duration()),
        };

        let args = export_args(job, output);
        info!("Exporting {} with {}", output.display(), self.ffmpeg);
        debug!("ffmpeg {}", args.join(" "));

        let mut child = Command::new(&self.ffmpeg)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                ProcessingError::ProcessingFailed(format!("failed to start ffmpeg: {}", e))
            })?;

        let out_time_us = Arc::new(AtomicU64::new(0));
        if let Some(stdout) = child.stdout.take() {
            let out_time_us = out_time_us.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if let Some(us) = parse_out_time_us(&line) {
                        out_time_us.store(us, Ordering::Relaxed);
                    }
                }
            });
        }
        let stderr_task = child.stderr.take().map(|mut stderr| {
            tokio::spawn(async move {
                let mut buf = Vec::new();
                let _ = stderr.read_to_end(&mut buf).await;
                String::from_utf8_lossy(&buf).to_string()
            })
        });

        let mut ticker = tokio::time::interval(self.poll_interval);
        let status = loop {
            tokio::select! {
                status = child.wait() => break Some(status),
                _ = ticker.tick() => {
                    if cancel.is_cancelled() {
                        break None;
                    }
                    if let Some(total) = total_secs.filter(|t| *t > 0.0) {
                        let done = out_time_us.load(Ordering::Relaxed) as f64 / 1_000_000.0;
                        progress((done / total).clamp(0.0, 1.0));
                    }
                }
            }
        };

        let Some(status) = status else {
            let _ = child.kill().await;
            let _ = tokio::fs::remove_file(output).await;
            info!("Export of {} cancelled", output.display());
            return Err(ProcessingError::Cancelled);
        };
        let status = status
            .map_err(|e| {
                ProcessingError::ProcessingFailed(format!("ffmpeg did not finish: {}", e))
            })?;

        if !status.success() {
            let stderr = match stderr_task {
                Some(task) => task.await.unwrap_or_default(),
                None => String::new(),
            };
            let _ = tokio::fs::remove_file(output).await;
            let reason = last_lines(&stderr, 3);
            warn!("ffmpeg exited with {}: {}", status, reason);
            return Err(ProcessingError::ProcessingFailed(format!(
                "export failed ({}): {}",
                status, reason
            )));
        }

        progress(1.0);
        info!("Exported {}", output.display());
        Ok(())
    }
}

/// Count `codec_type` lines of ffprobe's csv output
fn parse_track_inventory(stdout: &str) -> TrackInventory {
    stdout
        .lines()
        .map(|line| line.trim().trim_end_matches(','))
        .fold(TrackInventory::default(), |mut inv, line| {
            match line {
                "video" => inv.video += 1,
                "audio" => inv.audio += 1,
                _ => {}
            }
            inv
        })
}

fn parse_out_time_us(line: &str) -> Option<u64> {
    OUT_TIME_RE
        .captures(line.trim())
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

fn last_lines(text: &str, count: usize) -> String {
    let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
    lines[lines.len().saturating_sub(count)..].join(" | ")
}

/// Full ffmpeg argument list for `job`
pub fn export_args(job: &ExportJob, output: &Path) -> Vec<String> {
    let mut args: Vec<String> = vec!["-hide_banner".into(), "-nostdin".into(), "-y".into()];

    match job {
        ExportJob::Compose(composition) => compose_args(&mut args, composition),
        ExportJob::Gif(spec) => gif_args(&mut args, spec),
    }

    args.extend([
        "-progress".to_string(),
        "pipe:1".to_string(),
        "-nostats".to_string(),
        output.to_string_lossy().to_string(),
    ]);
    args
}

fn compose_args(args: &mut Vec<String>, composition: &Composition) {
    // One input per distinct source, trimmed to the shortest trim of its tracks
    let mut inputs: Vec<(PathBuf, Option<f64>)> = Vec::new();
    let mut maps = Vec::new();

    for track in &composition.tracks {
        let index = match inputs.iter().position(|(path, _)| *path == track.path) {
            Some(index) => {
                if let Some(trim) = track.trim {
                    let current = &mut inputs[index].1;
                    *current = Some(current.map_or(trim, |c| c.min(trim)));
                }
                index
            }
            None => {
                inputs.push((track.path.clone(), track.trim));
                inputs.len() - 1
            }
        };

        let kind = match track.kind {
            TrackKind::Video => "v",
            TrackKind::Audio => "a",
        };
        maps.push(match track.selection {
            TrackSelection::All => format!("{}:{}", index, kind),
            TrackSelection::First => format!("{}:{}:0", index, kind),
        });
    }

    for (path, trim) in &inputs {
        if let Some(trim) = trim {
            args.push("-t".into());
            args.push(format!("{:.3}", trim));
        }
        args.push("-i".into());
        args.push(path.to_string_lossy().to_string());
    }
    for map in maps {
        args.push("-map".into());
        args.push(map);
    }

    match (composition.container, composition.codec) {
        (ContainerKind::Mp3, _) => {
            args.extend(["-c:a", "libmp3lame", "-q:a", "2"].map(String::from))
        }
        (ContainerKind::Wav, _) => args.extend(["-c:a", "pcm_s16le"].map(String::from)),
        (ContainerKind::M4a, CodecPolicy::Transcode) => {
            args.extend(["-c:a", "aac", "-b:a", "192k"].map(String::from))
        }
        (ContainerKind::Mp4, CodecPolicy::Transcode) => {
            args.extend(["-c:v", "libx264", "-c:a", "aac"].map(String::from))
        }
        (_, CodecPolicy::Copy) => args.extend(["-c", "copy"].map(String::from)),
    }

    if matches!(composition.container, ContainerKind::Mp4 | ContainerKind::M4a) {
        args.extend(["-movflags", "+faststart"].map(String::from));
    }
}

fn gif_args(args: &mut Vec<String>, spec: &GifSpec) {
    args.push("-i".into());
    args.push(spec.source.to_string_lossy().to_string());
    args.push("-vf".into());
    args.push(format!(
        "fps={},split[a][b];[a]palettegen[p];[b][p]paletteuse",
        spec.fps
    ));
    args.push("-frames:v".into());
    args.push(spec.max_frames.to_string());
    args.push("-loop".into());
    args.push("0".into());
}
