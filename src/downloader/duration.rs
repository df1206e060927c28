// Exact media duration from the MP4 movie header, with a toolkit fallback

use std::fs::File;
use std::io::{self, BufReader, Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::Arc;

use tracing::{debug, warn};

use super::errors::DurationError;
use super::media::MediaToolkit;

const MOOV: [u8; 4] = *b"moov";
const MVHD: [u8; 4] = *b"mvhd";

pub struct DurationExtractor {
    toolkit: Arc<dyn MediaToolkit>,
}

impl DurationExtractor {
    pub fn new(toolkit: Arc<dyn MediaToolkit>) -> Self {
        Self { toolkit }
    }

    /// Duration of `path` in seconds. Reads the `mvhd` box when the file is an
    /// MP4-family container, otherwise asks the media toolkit.
    pub async fn extract_duration(&self, path: &Path) -> Result<f64, DurationError> {
        let owned = path.to_path_buf();
        match tokio::task::spawn_blocking(move || read_movie_duration(&owned)).await {
            Ok(Ok(seconds)) => {
                debug!("Duration of {} from mvhd: {:.3}s", path.display(), seconds);
                return Ok(seconds);
            }
            Ok(Err(e)) => debug!("No mvhd duration for {} ({}), probing", path.display(), e),
            Err(e) => warn!("Duration scan task failed: {}", e),
        }

        let reported = self
            .toolkit
            .probe_duration(path)
            .await
            .map_err(|e| DurationError::ExtractionFailed(e.to_string()))?;
        if reported.is_finite() && reported > 0.0 {
            debug!(
                "Duration of {} from {}: {:.3}s",
                path.display(),
                self.toolkit.name(),
                reported
            );
            Ok(reported)
        } else {
            Err(DurationError::ExtractionFailed(format!(
                "{} reported {} for {}",
                self.toolkit.name(),
                reported,
                path.display()
            )))
        }
    }
}

/// Structural duration lookup on a file
pub fn read_movie_duration(path: &Path) -> io::Result<f64> {
    let file = File::open(path)?;
    let len = file.metadata()?.len();
    scan_movie_duration(&mut BufReader::new(file), len)
}

/// Walk the top-level boxes in `[0, end)`, descend into `moov` and read
/// `mvhd`'s timescale and duration
pub fn scan_movie_duration<R: Read + Seek>(reader: &mut R, end: u64) -> io::Result<f64> {
    let moov = find_box(reader, 0, end, MOOV)?
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no moov box"))?;
    let mvhd = find_box(reader, moov.body_start, moov.end, MVHD)?
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no mvhd box"))?;

    reader.seek(SeekFrom::Start(mvhd.body_start))?;
    let (timescale, duration) = read_mvhd(reader)?;
    if timescale == 0 {
        return Err(invalid("mvhd timescale is zero"));
    }

    let seconds = duration as f64 / timescale as f64;
    if seconds.is_finite() && seconds > 0.0 {
        Ok(seconds)
    } else {
        Err(invalid("mvhd duration is zero"))
    }
}

#[derive(Debug, Clone, Copy)]
struct BoxSpan {
    body_start: u64,
    end: u64,
}

fn find_box<R: Read + Seek>(
    reader: &mut R,
    start: u64,
    end: u64,
    target: [u8; 4],
) -> io::Result<Option<BoxSpan>> {
    let mut offset = start;
    while offset + 8 <= end {
        reader.seek(SeekFrom::Start(offset))?;
        let size = read_u32(reader)? as u64;
        let mut fourcc = [0u8; 4];
        reader.read_exact(&mut fourcc)?;

        // size 1: 64-bit size follows; size 0: box runs to the end of its parent
        let (size, header) = match size {
            1 => (read_u64(reader)?, 16),
            0 => (end - offset, 8),
            n => (n, 8),
        };
        if size < header || offset.checked_add(size).map_or(true, |e| e > end) {
            return Err(invalid("box size out of range"));
        }

        if fourcc == target {
            return Ok(Some(BoxSpan {
                body_start: offset + header,
                end: offset + size,
            }));
        }
        offset += size;
    }
    Ok(None)
}

/// `(timescale, duration)` of an mvhd body
fn read_mvhd<R: Read + Seek>(reader: &mut R) -> io::Result<(u32, u64)> {
    let mut version_flags = [0u8; 4];
    reader.read_exact(&mut version_flags)?;

    match version_flags[0] {
        0 => {
            reader.seek(SeekFrom::Current(8))?;
            let timescale = read_u32(reader)?;
            let duration = read_u32(reader)? as u64;
            Ok((timescale, duration))
        }
        1 => {
            reader.seek(SeekFrom::Current(16))?;
            let timescale = read_u32(reader)?;
            let duration = read_u64(reader)?;
            Ok((timescale, duration))
        }
        v => Err(invalid(&format!("unknown mvhd version {}", v))),
    }
}

fn read_u32<R: Read>(reader: &mut R) -> io::Result<u32> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(u32::from_be_bytes(buf))
}

fn read_u64<R: Read>(reader: &mut R) -> io::Result<u64> {
    let mut buf = [0u8; 8];
    reader.read_exact(&mut buf)?;
    Ok(u64::from_be_bytes(buf))
}

fn invalid(msg: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::downloader::errors::ProcessingError;
    use crate::downloader::media::{ExportJob, TrackInventory};
    use async_trait::async_trait;
    use std::io::Cursor;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio_util::sync::CancellationToken;

    fn boxed(fourcc: &[u8; 4], body: &[u8]) -> Vec<u8> {
        let mut out = ((body.len() + 8) as u32).to_be_bytes().to_vec();
        out.extend_from_slice(fourcc);
        out.extend_from_slice(body);
        out
    }

    fn mvhd_v0(timescale: u32, duration: u32) -> Vec<u8> {
        let mut body = vec![0, 0, 0, 0];
        body.extend_from_slice(&[0u8; 8]);
        body.extend_from_slice(&timescale.to_be_bytes());
        body.extend_from_slice(&duration.to_be_bytes());
        body.extend_from_slice(&[0u8; 80]);
        boxed(b"mvhd", &body)
    }

    fn mvhd_v1(timescale: u32, duration: u64) -> Vec<u8> {
        let mut body = vec![1, 0, 0, 0];
        body.extend_from_slice(&[0u8; 16]);
        body.extend_from_slice(&timescale.to_be_bytes());
        body.extend_from_slice(&duration.to_be_bytes());
        body.extend_from_slice(&[0u8; 80]);
        boxed(b"mvhd", &body)
    }

    fn movie(mvhd: Vec<u8>) -> Vec<u8> {
        let mut moov_body = boxed(b"udta", b"junk");
        moov_body.extend(mvhd);
        let mut file = boxed(b"ftyp", b"isomiso2");
        file.extend(boxed(b"free", &[0u8; 10]));
        file.extend(boxed(b"moov", &moov_body));
        file.extend(boxed(b"mdat", &[1u8; 32]));
        file
    }

    fn scan(bytes: &[u8]) -> io::Result<f64> {
        scan_movie_duration(&mut Cursor::new(bytes), bytes.len() as u64)
    }

    #[test]
    fn test_mvhd_version_0() {
        assert_eq!(scan(&movie(mvhd_v0(1000, 12_500))).unwrap(), 12.5);
        assert_eq!(scan(&movie(mvhd_v0(90_000, 900_000))).unwrap(), 10.0);
    }

    #[test]
    fn test_mvhd_version_1() {
        assert_eq!(scan(&movie(mvhd_v1(600, 6_000_000_000))).unwrap(), 10_000_000.0);
    }

    #[test]
    fn test_largesize_and_to_eof_boxes() {
        // ftyp with a 64-bit size, then a moov running to the end of the file
        let mut file = 1u32.to_be_bytes().to_vec();
        file.extend_from_slice(b"ftyp");
        file.extend_from_slice(&24u64.to_be_bytes());
        file.extend_from_slice(b"isomiso2");
        file.extend_from_slice(&0u32.to_be_bytes());
        file.extend_from_slice(b"moov");
        file.extend(mvhd_v0(48_000, 96_000));
        assert_eq!(scan(&file).unwrap(), 2.0);
    }

    #[test]
    fn test_corrupt_inputs() {
        assert!(scan(b"").is_err());
        assert!(scan(b"GIF89a not a movie at all").is_err());
        assert!(scan(&movie(mvhd_v0(0, 100))).is_err());
        assert!(scan(&movie(mvhd_v0(1000, 0))).is_err());

        let mut truncated = movie(mvhd_v0(1000, 5000));
        truncated.truncate(40);
        assert!(scan(&truncated).is_err());
    }

    struct FixedDuration {
        seconds: f64,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl MediaToolkit for FixedDuration {
        fn name(&self) -> &'static str {
            "fixed"
        }

        async fn probe_duration(&self, _path: &Path) -> Result<f64, ProcessingError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.seconds)
        }

        async fn probe_tracks(&self, _path: &Path) -> Result<TrackInventory, ProcessingError> {
            Ok(TrackInventory::default())
        }

        async fn export(
            &self,
            _job: &ExportJob,
            _output: &Path,
            _progress: &(dyn Fn(f64) + Send + Sync),
            _cancel: &CancellationToken,
        ) -> Result<(), ProcessingError> {
            Ok(())
        }
    }

    fn fixed_extractor(seconds: f64) -> (DurationExtractor, Arc<FixedDuration>) {
        let toolkit = Arc::new(FixedDuration {
            seconds,
            calls: AtomicUsize::new(0),
        });
        (DurationExtractor::new(toolkit.clone()), toolkit)
    }

    #[tokio::test]
    async fn test_structural_path_skips_toolkit() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.mp4");
        std::fs::write(&path, movie(mvhd_v0(1000, 3_000))).unwrap();

        let (extractor, toolkit) = fixed_extractor(99.0);
        assert_eq!(extractor.extract_duration(&path).await.unwrap(), 3.0);
        assert_eq!(toolkit.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_fallback_to_toolkit() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.webm");
        std::fs::write(&path, b"\x1a\x45\xdf\xa3 matroska").unwrap();

        let (extractor, toolkit) = fixed_extractor(7.25);
        assert_eq!(extractor.extract_duration(&path).await.unwrap(), 7.25);
        assert_eq!(toolkit.calls.load(Ordering::SeqCst), 1);

        let (extractor, _) = fixed_extractor(f64::NAN);
        assert!(extractor.extract_duration(&path).await.is_err());
        let (extractor, _) = fixed_extractor(0.0);
        assert!(matches!(
            extractor.extract_duration(&path).await,
            Err(DurationError::ExtractionFailed(_))
        ));
    }
}
