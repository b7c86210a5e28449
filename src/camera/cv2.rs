use super::{mid_time, DriverError, DriverResult, RawFrame};
use crate::config::Cv2Profile;
use async_trait::async_trait;
use chrono::Utc;
use tracing::{info, warn};

/// OpenCV `VideoCapture` property ids
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(i32)]
pub enum CaptureProperty {
    FrameWidth = 3,
    FrameHeight = 4,
}

/// Interleaved blue, green, red image as delivered by a video capture device
#[derive(Debug, Clone, PartialEq)]
pub struct BgrImage {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
}

#[async_trait]
pub trait VideoCaptureDevice: Send {
    fn device_id(&self) -> u32;

    /// Returns false if the device couldn't be opened
    async fn open(&mut self) -> bool;

    fn is_opened(&self) -> bool;

    /// Returns false if the device ignored the property
    fn set(&mut self, property: CaptureProperty, value: f64) -> bool;

    /// `None` when the frame was lost
    async fn read(&mut self) -> Option<BgrImage>;

    fn release(&mut self);
}

/// Converts BGR pixels to luma with OpenCV's fixed point weights
pub fn bgr_to_gray(bgr: &[u8]) -> Vec<u8> {
    const B: u32 = 1868;
    const G: u32 = 9617;
    const R: u32 = 4899;
    const SHIFT: u32 = 14;

    bgr.chunks_exact(3)
        .map(|p| {
            let luma = p[0] as u32 * B + p[1] as u32 * G + p[2] as u32 * R;
            ((luma + (1 << (SHIFT - 1))) >> SHIFT) as u8
        })
        .collect()
}

/// Webcam-class camera. Gain, exposure and binning don't apply here.
pub struct Cv2Adapter {
    device: Box<dyn VideoCaptureDevice>,
    width: u32,
    height: u32,
}

impl Cv2Adapter {
    pub fn new(device: Box<dyn VideoCaptureDevice>) -> Self {
        Cv2Adapter {
            device,
            width: 0,
            height: 0,
        }
    }

    pub fn device_id(&self) -> u32 {
        self.device.device_id()
    }

    pub fn is_open(&self) -> bool {
        self.device.is_opened()
    }

    pub async fn open(&mut self) -> DriverResult<()> {
        if self.device.is_opened() {
            return Ok(());
        }

        if !self.device.open().await {
            return Err(DriverError::DeviceUnavailable {
                device_id: self.device_id(),
                status: "video capture device could not be opened".to_string(),
            });
        }

        info!("Opened CV2 camera {}", self.device_id());
        Ok(())
    }

    pub async fn configure(&mut self, profile: &Cv2Profile) -> DriverResult<()> {
        if !self.is_open() {
            return Err(DriverError::NotOpen);
        }

        if !self
            .device
            .set(CaptureProperty::FrameWidth, profile.width as f64)
        {
            warn!("CV2 camera {} ignored frame width {}", self.device_id(), profile.width);
        }
        if !self
            .device
            .set(CaptureProperty::FrameHeight, profile.height as f64)
        {
            warn!("CV2 camera {} ignored frame height {}", self.device_id(), profile.height);
        }

        self.width = profile.width;
        self.height = profile.height;
        Ok(())
    }

    pub async fn capture_frame(&mut self) -> DriverResult<RawFrame> {
        if !self.is_open() {
            return Err(DriverError::NotOpen);
        }

        let start = Utc::now();
        let image = self.device.read().await;
        let timestamp = mid_time(start, Utc::now());

        let image = image.ok_or_else(|| {
            DriverError::FrameCapture(format!("CV2 camera {} lost a frame", self.device_id()))
        })?;

        if image.width != self.width
            || image.height != self.height
            || image.data.len() != image.width as usize * image.height as usize * 3
        {
            return Err(DriverError::FrameCapture(format!(
                "CV2 camera {} delivered a {}x{} frame of {} bytes, expected {}x{}",
                self.device_id(),
                image.width,
                image.height,
                image.data.len(),
                self.width,
                self.height
            )));
        }

        Ok(RawFrame {
            width: image.width,
            height: image.height,
            pixels: bgr_to_gray(&image.data),
            timestamp,
        })
    }

    pub async fn close(&mut self) -> DriverResult<()> {
        if self.device.is_opened() {
            self.device.release();
            info!("Released CV2 camera {}", self.device_id());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::SimulatedVideoCapture;

    fn profile() -> Cv2Profile {
        Cv2Profile {
            device_id: 0,
            width: 12,
            height: 10,
            nframes: 3,
        }
    }

    #[test]
    fn test_bgr_to_gray() {
        assert_eq!(bgr_to_gray(&[0, 0, 0, 255, 255, 255]), vec![0, 255]);
        // pure blue, green and red
        assert_eq!(
            bgr_to_gray(&[255, 0, 0, 0, 255, 0, 0, 0, 255]),
            vec![29, 150, 76]
        );
        // incomplete trailing pixel is dropped
        assert_eq!(bgr_to_gray(&[10, 10, 10, 1]), vec![10]);
    }

    #[tokio::test]
    async fn test_capture_grayscale_frame() {
        let sim = SimulatedVideoCapture::new(0);
        let probe = sim.probe();
        let mut adapter = Cv2Adapter::new(Box::new(sim));

        adapter.open().await.unwrap();
        adapter.configure(&profile()).await.unwrap();
        let frame = adapter.capture_frame().await.unwrap();

        assert_eq!((frame.width, frame.height), (12, 10));
        assert_eq!(frame.pixels.len(), 120);
        assert_eq!(probe.frames_delivered(), 1);

        adapter.close().await.unwrap();
        assert!(!probe.is_open());
        assert_eq!(probe.close_count(), 1);
    }

    #[tokio::test]
    async fn test_lost_frame() {
        let sim = SimulatedVideoCapture::new(0).failing_reads(1);
        let mut adapter = Cv2Adapter::new(Box::new(sim));
        adapter.open().await.unwrap();
        adapter.configure(&profile()).await.unwrap();

        assert!(matches!(
            adapter.capture_frame().await,
            Err(DriverError::FrameCapture(_))
        ));
        assert!(adapter.capture_frame().await.is_ok());
    }

    #[tokio::test]
    async fn test_unavailable_device() {
        let sim = SimulatedVideoCapture::new(3).unavailable();
        let mut adapter = Cv2Adapter::new(Box::new(sim));
        match adapter.open().await {
            Err(DriverError::DeviceUnavailable { device_id, .. }) => assert_eq!(device_id, 3),
            other => panic!("Expected DeviceUnavailable, got {:?}", other),
        }
        assert!(!adapter.is_open());
    }

    #[tokio::test]
    async fn test_configure_requires_open() {
        let mut adapter = Cv2Adapter::new(Box::new(SimulatedVideoCapture::new(0)));
        assert_eq!(
            adapter.configure(&profile()).await,
            Err(DriverError::NotOpen)
        );
    }
}
