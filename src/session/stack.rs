//! Reduction of a stack of frames to per-pixel statistics, written beside a
//! small header describing the stack.

use super::{SessionError, SessionResult};
use crate::astro_math::modified_julian_date;
use crate::camera::RawFrame;
use crate::config::ObserverSite;
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt::{self, Display, Formatter};
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tokio::task::{self, JoinHandle};
use tracing::{error, info};

/// Fewest frames the statistics are defined for
pub const MIN_STACK_FRAMES: usize = 3;

/// Full stacks waiting to be written before capture blocks
const STACK_QUEUE_DEPTH: usize = 2;

#[derive(Debug)]
pub enum StackError {
    TooFewFrames(usize),
    MixedFrameSizes,
    Io(io::Error),
    Header(confy::ConfyError),
}

impl Display for StackError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::TooFewFrames(n) => write!(
                f,
                "A stack needs at least {} frames, got {}",
                MIN_STACK_FRAMES, n
            ),
            Self::MixedFrameSizes => f.write_str("Frames in a stack differ in size"),
            Self::Io(e) => write!(f, "Failed to write stack: {}", e),
            Self::Header(e) => write!(f, "Failed to write stack header: {}", e),
        }
    }
}

impl Error for StackError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Header(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for StackError {
    fn from(e: io::Error) -> Self {
        StackError::Io(e)
    }
}

impl From<confy::ConfyError> for StackError {
    fn from(e: confy::ConfyError) -> Self {
        StackError::Header(e)
    }
}

/// Per-pixel planes, flipped so the first row is the bottom of the image
#[derive(Debug, Clone, PartialEq)]
pub struct StackStatistics {
    pub width: usize,
    pub height: usize,
    /// Mean with the brightest frame left out
    pub mean: Vec<f32>,
    /// Standard deviation with the brightest frame left out
    pub std: Vec<f32>,
    pub max: Vec<f32>,
    /// Index of the frame holding the maximum
    pub argmax: Vec<f32>,
}

impl StackStatistics {
    pub fn reduce(frames: &[RawFrame]) -> Result<Self, StackError> {
        if frames.len() < MIN_STACK_FRAMES {
            return Err(StackError::TooFewFrames(frames.len()));
        }

        let width = frames[0].width as usize;
        let height = frames[0].height as usize;
        let npix = width * height;
        if frames.iter().any(|f| {
            f.width as usize != width || f.height as usize != height || f.pixels.len() != npix
        }) {
            return Err(StackError::MixedFrameSizes);
        }

        let mut sum = vec![0f64; npix];
        let mut sum_sq = vec![0f64; npix];
        let mut max = vec![0u8; npix];
        let mut argmax = vec![0usize; npix];

        for (i, frame) in frames.iter().enumerate() {
            for (p, &z) in frame.pixels.iter().enumerate() {
                let z64 = z as f64;
                sum[p] += z64;
                sum_sq[p] += z64 * z64;
                if z > max[p] {
                    max[p] = z;
                    argmax[p] = i;
                }
            }
        }

        let n = frames.len() as f64;
        let mut stats = StackStatistics {
            width,
            height,
            mean: Vec::with_capacity(npix),
            std: Vec::with_capacity(npix),
            max: Vec::with_capacity(npix),
            argmax: Vec::with_capacity(npix),
        };

        for row in (0..height).rev() {
            for p in row * width..(row + 1) * width {
                let zmax = max[p] as f64;
                let s1 = sum[p] - zmax;
                let s2 = sum_sq[p] - zmax * zmax;
                let mean = s1 / (n - 1.);
                let var = (s2 - s1 * mean) / (n - 2.);

                stats.mean.push(mean as f32);
                stats.std.push(var.max(0.).sqrt() as f32);
                stats.max.push(zmax as f32);
                stats.argmax.push(argmax[p] as f32);
            }
        }

        Ok(stats)
    }

    /// Mean, std, max and argmax planes as little endian f32, in that order
    pub fn write_planes(&self, mut out: impl Write) -> io::Result<()> {
        for plane in [&self.mean, &self.std, &self.max, &self.argmax] {
            for value in plane.iter() {
                out.write_all(&value.to_le_bytes())?;
            }
        }
        out.flush()
    }
}

/// Header stored next to the statistics planes
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StackHeader {
    pub date_obs: String,
    pub mjd_obs: f64,
    /// Seconds between the first and last frame
    pub exptime: f64,
    pub nframes: usize,
    pub width: usize,
    pub height: usize,
    pub cospar: String,
    pub observer: String,
    /// Seconds from the first frame, one per frame
    pub frame_offsets: Vec<f64>,
}

/// Who took the stack
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StationInfo {
    pub cospar: String,
    pub observer: String,
}

impl From<&ObserverSite> for StationInfo {
    fn from(site: &ObserverSite) -> Self {
        StationInfo {
            cospar: site.cospar.clone(),
            observer: site.name.clone(),
        }
    }
}

/// Writes `<timestamp>.bin` and `<timestamp>.toml` into `dir` and returns the data path
pub fn write_stack(
    dir: &Path,
    station: &StationInfo,
    frames: &[RawFrame],
) -> Result<PathBuf, StackError> {
    let stats = StackStatistics::reduce(frames)?;

    let t0 = frames[0].timestamp;
    let frame_offsets: Vec<f64> = frames
        .iter()
        .map(|f| (f.timestamp - t0).num_microseconds().unwrap_or_default() as f64 * 1E-6)
        .collect();
    let date_obs = t0.format("%Y-%m-%dT%H:%M:%S%.3f").to_string();

    let header = StackHeader {
        date_obs: date_obs.clone(),
        mjd_obs: modified_julian_date(t0),
        exptime: frame_offsets.last().copied().unwrap_or_default(),
        nframes: frames.len(),
        width: stats.width,
        height: stats.height,
        cospar: station.cospar.clone(),
        observer: station.observer.clone(),
        frame_offsets,
    };

    let data_path = dir.join(format!("{}.bin", date_obs));
    stats.write_planes(BufWriter::new(File::create(&data_path)?))?;
    confy::store_path(dir.join(format!("{}.toml", date_obs)), &header)?;

    Ok(data_path)
}

/// Background task that writes full stacks while capture continues
pub struct StackWriter {
    tx: mpsc::Sender<Vec<RawFrame>>,
    worker: JoinHandle<Result<usize, String>>,
}

impl StackWriter {
    pub fn spawn(dir: PathBuf, station: StationInfo) -> Self {
        let (tx, mut rx) = mpsc::channel::<Vec<RawFrame>>(STACK_QUEUE_DEPTH);

        let worker = tokio::spawn(async move {
            let mut written = 0;
            let mut first_failure = None;
            while let Some(frames) = rx.recv().await {
                let dir = dir.clone();
                let station = station.clone();
                let failure = match task::spawn_blocking(move || {
                    write_stack(&dir, &station, &frames)
                })
                .await
                {
                    Ok(Ok(path)) => {
                        info!("Compressed {}", path.display());
                        written += 1;
                        continue;
                    }
                    Ok(Err(e)) => e.to_string(),
                    Err(e) => format!("Stack writer failed: {}", e),
                };
                error!("{}", failure);
                first_failure.get_or_insert(failure);
            }
            info!("Exiting compress");
            match first_failure {
                Some(failure) => Err(failure),
                None => Ok(written),
            }
        });

        StackWriter { tx, worker }
    }

    pub async fn submit(&self, frames: Vec<RawFrame>) -> SessionResult<()> {
        self.tx
            .send(frames)
            .await
            .map_err(|_| SessionError::Writer("stack writer has stopped".to_string()))
    }

    /// Waits for queued stacks and returns how many were written.
    /// Fails with the first write error if any stack was lost.
    pub async fn finish(self) -> SessionResult<usize> {
        drop(self.tx);
        self.worker
            .await
            .map_err(|e| SessionError::Writer(e.to_string()))?
            .map_err(SessionError::Writer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};

    fn frames(values: &[[u8; 4]]) -> Vec<RawFrame> {
        let t0 = Utc.with_ymd_and_hms(2024, 3, 20, 21, 0, 0).unwrap();
        values
            .iter()
            .enumerate()
            .map(|(i, pixels)| RawFrame {
                width: 2,
                height: 2,
                pixels: pixels.to_vec(),
                timestamp: t0 + Duration::milliseconds(40 * i as i64),
            })
            .collect()
    }

    fn station() -> StationInfo {
        StationInfo {
            cospar: "4171".to_string(),
            observer: "Cees Bassa".to_string(),
        }
    }

    #[test]
    fn test_reduce_by_hand() {
        // pixel 0 sees 1, 5, 3
        let stack = frames(&[[1, 0, 0, 0], [5, 0, 0, 0], [3, 0, 0, 0]]);
        let stats = StackStatistics::reduce(&stack).unwrap();

        // row 0 ends up at the bottom
        let p = 2;
        assert_eq!(stats.max[p], 5.);
        assert_eq!(stats.argmax[p], 1.);
        assert_float_absolute_eq!(stats.mean[p], 2.);
        assert_float_absolute_eq!(stats.std[p], 2f32.sqrt(), 1E-6);
    }

    #[test]
    fn test_reduce_flips_rows() {
        let stack = frames(&[[1, 2, 3, 4], [1, 2, 3, 4], [1, 2, 3, 4]]);
        let stats = StackStatistics::reduce(&stack).unwrap();

        assert_eq!(stats.max, vec![3., 4., 1., 2.]);
        assert_eq!(stats.mean, vec![3., 4., 1., 2.]);
        assert_eq!(stats.std, vec![0.; 4]);
        assert_eq!(stats.argmax, vec![0.; 4]);
    }

    #[test]
    fn test_reduce_rejects_bad_stacks() {
        assert!(matches!(
            StackStatistics::reduce(&frames(&[[0; 4], [0; 4]])),
            Err(StackError::TooFewFrames(2))
        ));

        let mut stack = frames(&[[0; 4], [0; 4], [0; 4]]);
        stack[1].pixels.pop();
        assert!(matches!(
            StackStatistics::reduce(&stack),
            Err(StackError::MixedFrameSizes)
        ));
    }

    #[test]
    fn test_write_stack() {
        let dir = tempfile::tempdir().unwrap();
        let stack = frames(&[[1, 2, 3, 4], [5, 6, 7, 8], [9, 10, 11, 12]]);

        let path = write_stack(dir.path(), &station(), &stack).unwrap();
        assert_eq!(
            path.file_name().unwrap().to_str().unwrap(),
            "2024-03-20T21:00:00.000.bin"
        );
        // four planes of four pixels
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 4 * 4 * 4);

        let header: StackHeader =
            confy::load_path(dir.path().join("2024-03-20T21:00:00.000.toml")).unwrap();
        assert_eq!(header.date_obs, "2024-03-20T21:00:00.000");
        assert_eq!(header.nframes, 3);
        assert_eq!((header.width, header.height), (2, 2));
        assert_eq!(header.cospar, "4171");
        assert_eq!(header.observer, "Cees Bassa");
        assert_float_absolute_eq!(header.exptime, 0.08, 1E-9);
        assert_eq!(header.frame_offsets.len(), 3);
        assert_float_absolute_eq!(header.mjd_obs, 60389.875, 1E-6);
    }

    #[tokio::test]
    async fn test_writer_counts_written_stacks() {
        let dir = tempfile::tempdir().unwrap();
        let writer = StackWriter::spawn(dir.path().to_path_buf(), station());

        writer
            .submit(frames(&[[1; 4], [2; 4], [3; 4]]))
            .await
            .unwrap();

        assert_eq!(writer.finish().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_writer_reports_first_failure() {
        let dir = tempfile::tempdir().unwrap();
        let writer = StackWriter::spawn(dir.path().to_path_buf(), station());

        writer
            .submit(frames(&[[1; 4], [2; 4], [3; 4]]))
            .await
            .unwrap();
        writer.submit(frames(&[[1; 4]])).await.unwrap();

        match writer.finish().await {
            Err(SessionError::Writer(msg)) => assert!(msg.contains("at least 3 frames"), "{}", msg),
            other => panic!("Expected a writer error, got {:?}", other),
        }
        // the good stack still reached the disk
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 2);
    }

    #[tokio::test]
    async fn test_writer_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let writer = StackWriter::spawn(dir.path().join("missing"), station());

        writer
            .submit(frames(&[[1; 4], [2; 4], [3; 4]]))
            .await
            .unwrap();

        assert!(matches!(
            writer.finish().await,
            Err(SessionError::Writer(_))
        ));
    }
}
