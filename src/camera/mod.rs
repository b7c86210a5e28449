//! Camera drivers.
//!
//! Hardware is reached through the [`VideoCaptureDevice`] and [`AsiDevice`]
//! traits. [`DriverAdapter`] picks one of the two backends from the configured
//! [`CameraProfile`] and gives the capture session a single set of operations.

pub use asi::*;
pub use cv2::*;
pub use sim::*;

use crate::config::{CameraProfile, CameraType};
use chrono::{DateTime, Utc};
use std::error::Error;
use std::fmt::{self, Display, Formatter};

mod asi;
mod cv2;
mod sim;

/// One 8-bit grayscale frame, stamped at mid-exposure
#[derive(Debug, Clone, PartialEq)]
pub struct RawFrame {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
    pub timestamp: DateTime<Utc>,
}

/// Midpoint between the start and end of a read
pub(crate) fn mid_time(start: DateTime<Utc>, end: DateTime<Utc>) -> DateTime<Utc> {
    start + (end - start) / 2
}

#[derive(Debug, Clone, PartialEq)]
pub enum DriverError {
    /// The device can't be used for this session
    DeviceUnavailable { device_id: u32, status: String },
    /// A single frame was lost
    FrameCapture(String),
    NotOpen,
    ProfileMismatch {
        adapter: CameraType,
        profile: CameraType,
    },
}

impl Display for DriverError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::DeviceUnavailable { device_id, status } => {
                write!(f, "Camera {} unavailable: {}", device_id, status)
            }
            Self::FrameCapture(msg) => write!(f, "Frame capture failed: {}", msg),
            Self::NotOpen => f.write_str("Camera is not open"),
            Self::ProfileMismatch { adapter, profile } => write!(
                f,
                "{} driver can't be configured with a {} profile",
                adapter, profile
            ),
        }
    }
}

impl Error for DriverError {}

pub type DriverResult<T> = Result<T, DriverError>;

pub enum DriverAdapter {
    Cv2(Cv2Adapter),
    Asi(AsiAdapter),
}

impl DriverAdapter {
    /// Adapter backed by a simulated device matching the profile
    pub fn simulated(profile: &CameraProfile) -> Self {
        match profile {
            CameraProfile::Cv2(p) => {
                DriverAdapter::Cv2(Cv2Adapter::new(Box::new(SimulatedVideoCapture::new(
                    p.device_id,
                ))))
            }
            CameraProfile::Asi(p) => DriverAdapter::Asi(AsiAdapter::new(Box::new(
                SimulatedAsiCamera::new(p.device_id, p.width, p.height),
            ))),
        }
    }

    pub fn camera_type(&self) -> CameraType {
        match self {
            DriverAdapter::Cv2(_) => CameraType::Cv2,
            DriverAdapter::Asi(_) => CameraType::Asi,
        }
    }

    pub fn device_id(&self) -> u32 {
        match self {
            DriverAdapter::Cv2(a) => a.device_id(),
            DriverAdapter::Asi(a) => a.device_id(),
        }
    }

    pub fn is_open(&self) -> bool {
        match self {
            DriverAdapter::Cv2(a) => a.is_open(),
            DriverAdapter::Asi(a) => a.is_open(),
        }
    }

    pub async fn open(&mut self) -> DriverResult<()> {
        match self {
            DriverAdapter::Cv2(a) => a.open().await,
            DriverAdapter::Asi(a) => a.open().await,
        }
    }

    pub async fn configure(&mut self, profile: &CameraProfile) -> DriverResult<()> {
        match (self, profile) {
            (DriverAdapter::Cv2(a), CameraProfile::Cv2(p)) => a.configure(p).await,
            (DriverAdapter::Asi(a), CameraProfile::Asi(p)) => a.configure(p).await,
            (adapter, profile) => Err(DriverError::ProfileMismatch {
                adapter: adapter.camera_type(),
                profile: profile.camera_type(),
            }),
        }
    }

    pub async fn capture_frame(&mut self) -> DriverResult<RawFrame> {
        match self {
            DriverAdapter::Cv2(a) => a.capture_frame().await,
            DriverAdapter::Asi(a) => a.capture_frame().await,
        }
    }

    pub async fn close(&mut self) -> DriverResult<()> {
        match self {
            DriverAdapter::Cv2(a) => a.close().await,
            DriverAdapter::Asi(a) => a.close().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AsiProfile, Cv2Profile};

    fn cv2_profile() -> CameraProfile {
        CameraProfile::Cv2(Cv2Profile {
            device_id: 1,
            width: 16,
            height: 8,
            nframes: 3,
        })
    }

    fn asi_profile() -> CameraProfile {
        CameraProfile::Asi(AsiProfile {
            device_id: 2,
            width: 16,
            height: 8,
            nframes: 3,
            gain: 100,
            max_gain: 100,
            autogain: false,
            exposure_us: 1000,
            binning: 1,
            brightness: 10,
            bandwidth: 90,
            high_speed: false,
        })
    }

    #[test]
    fn test_simulated_matches_profile() {
        let adapter = DriverAdapter::simulated(&cv2_profile());
        assert_eq!(adapter.camera_type(), CameraType::Cv2);
        assert_eq!(adapter.device_id(), 1);

        let adapter = DriverAdapter::simulated(&asi_profile());
        assert_eq!(adapter.camera_type(), CameraType::Asi);
        assert_eq!(adapter.device_id(), 2);
    }

    #[tokio::test]
    async fn test_profile_mismatch() {
        let mut adapter = DriverAdapter::simulated(&cv2_profile());
        adapter.open().await.unwrap();
        assert_eq!(
            adapter.configure(&asi_profile()).await,
            Err(DriverError::ProfileMismatch {
                adapter: CameraType::Cv2,
                profile: CameraType::Asi,
            })
        );
        adapter.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_lifecycle() {
        for profile in [cv2_profile(), asi_profile()] {
            let mut adapter = DriverAdapter::simulated(&profile);
            assert!(!adapter.is_open());
            assert_eq!(adapter.capture_frame().await, Err(DriverError::NotOpen));

            adapter.open().await.unwrap();
            adapter.configure(&profile).await.unwrap();
            let frame = adapter.capture_frame().await.unwrap();
            assert_eq!((frame.width, frame.height), (16, 8));
            assert_eq!(frame.pixels.len(), 16 * 8);

            adapter.close().await.unwrap();
            assert!(!adapter.is_open());
        }
    }
}
