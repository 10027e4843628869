//! Live V4L2 capture.

use crate::frame::{self, Frame, FrameError};
use crate::source::FrameSource;
use image::GrayImage;
use std::io;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use v4l::buffer::Type as BufType;
use v4l::capability::Flags;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::{Format, FourCC};

const EBUSY: i32 = 16;
pub(crate) const CAPTURE_WIDTH: u32 = 640;
pub(crate) const CAPTURE_HEIGHT: u32 = 480;
const STREAM_BUFFERS: u32 = 4;

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("device busy: {0}")]
    DeviceBusy(String),
    #[error("capture failed: {0}")]
    CaptureFailed(String),
    #[error("no frame within {0:?}")]
    Timeout(Duration),
    #[error("format negotiation failed: {0}")]
    FormatNegotiationFailed(String),
    #[error("device cannot stream video")]
    StreamingNotSupported,
    #[error("stream decoder unavailable: {0}")]
    DecoderUnavailable(String),
    #[error("failed to decode {path}: {reason}")]
    Decode { path: String, reason: String },
}

impl From<FrameError> for CameraError {
    fn from(e: FrameError) -> Self {
        CameraError::CaptureFailed(e.to_string())
    }
}

#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub path: String,
    pub name: String,
    pub driver: String,
    pub bus: String,
}

/// Pixel layouts the capture path can reduce to 8-bit luma.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// Packed 4:2:2, luma in every other byte.
    Yuyv,
    Grey,
    /// 16-bit little-endian luma.
    Y16,
}

impl PixelFormat {
    pub fn from_fourcc(fourcc: FourCC) -> Option<Self> {
        match &fourcc.repr {
            b"YUYV" => Some(Self::Yuyv),
            b"GREY" => Some(Self::Grey),
            b"Y16 " | b"Y16\0" => Some(Self::Y16),
            _ => None,
        }
    }

    /// Reduce one raw buffer to `width * height` luma bytes.
    pub fn to_luma(self, raw: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
        match self {
            Self::Yuyv => frame::yuyv_to_grayscale(raw, width, height),
            Self::Y16 => frame::y16_to_grayscale(raw, width, height),
            Self::Grey => {
                let expected = (width * height) as usize;
                raw.get(..expected)
                    .map(<[u8]>::to_vec)
                    .ok_or(FrameError::InvalidLength {
                        expected,
                        actual: raw.len(),
                    })
            }
        }
    }
}

/// An open, streaming V4L2 device.
///
/// Buffers are mapped once at open. Each read dequeues one buffer and waits
/// at most the configured timeout.
pub struct Camera {
    stream: MmapStream<'static>,
    _device: Device,
    pub device_path: String,
    pub width: u32,
    pub height: u32,
    pub fourcc: FourCC,
    pixel_format: PixelFormat,
    timeout: Duration,
}

fn open_error(path: &str, e: io::Error) -> CameraError {
    if e.raw_os_error() == Some(EBUSY) {
        CameraError::DeviceBusy(path.to_string())
    } else {
        CameraError::DeviceNotFound(format!("{path}: {e}"))
    }
}

/// Request the capture size in YUYV and accept whatever luma-bearing format comes back.
fn negotiate(device: &Device) -> Result<(Format, PixelFormat), CameraError> {
    let mut wanted = device
        .format()
        .map_err(|e| CameraError::FormatNegotiationFailed(format!("cannot read format: {e}")))?;
    wanted.width = CAPTURE_WIDTH;
    wanted.height = CAPTURE_HEIGHT;
    wanted.fourcc = FourCC::new(b"YUYV");

    let granted = device
        .set_format(&wanted)
        .map_err(|e| CameraError::FormatNegotiationFailed(format!("cannot set format: {e}")))?;
    let pixel_format = PixelFormat::from_fourcc(granted.fourcc).ok_or_else(|| {
        CameraError::FormatNegotiationFailed(format!(
            "driver offered {:?}; expected YUYV, GREY or Y16",
            granted.fourcc
        ))
    })?;
    Ok((granted, pixel_format))
}

impl Camera {
    /// Open `device_path` (e.g. `/dev/video0`) and start streaming.
    pub fn open(device_path: &str, timeout: Duration) -> Result<Self, CameraError> {
        if !Path::new(device_path).exists() {
            return Err(CameraError::DeviceNotFound(device_path.to_string()));
        }
        let device = Device::with_path(device_path).map_err(|e| open_error(device_path, e))?;

        let caps = device
            .query_caps()
            .map_err(|e| CameraError::CaptureFailed(format!("cannot query capabilities: {e}")))?;
        if !caps.capabilities.contains(Flags::VIDEO_CAPTURE | Flags::STREAMING) {
            return Err(CameraError::StreamingNotSupported);
        }

        let (format, pixel_format) = negotiate(&device)?;

        let mut stream = MmapStream::with_buffers(&device, BufType::VideoCapture, STREAM_BUFFERS)
            .map_err(|e| CameraError::CaptureFailed(format!("cannot map buffers: {e}")))?;
        stream.set_timeout(timeout);

        tracing::info!(
            device = device_path,
            card = %caps.card,
            width = format.width,
            height = format.height,
            format = ?pixel_format,
            "camera streaming"
        );

        Ok(Self {
            stream,
            _device: device,
            device_path: device_path.to_string(),
            width: format.width,
            height: format.height,
            fourcc: format.fourcc,
            pixel_format,
            timeout,
        })
    }

    pub fn pixel_format(&self) -> PixelFormat {
        self.pixel_format
    }

    /// Dequeue the next buffer as a grayscale frame.
    pub fn capture_frame(&mut self) -> Result<Frame, CameraError> {
        let (raw, meta) = match self.stream.next() {
            Ok(next) => next,
            Err(e) if e.kind() == io::ErrorKind::TimedOut => {
                return Err(CameraError::Timeout(self.timeout))
            }
            Err(e) => return Err(CameraError::CaptureFailed(format!("dequeue failed: {e}"))),
        };
        let sequence = meta.sequence;

        let luma = self.pixel_format.to_luma(raw, self.width, self.height)?;
        let image = GrayImage::from_raw(self.width, self.height, luma).ok_or_else(|| {
            CameraError::CaptureFailed("frame size does not match negotiated format".into())
        })?;
        Ok(Frame::new(image, sequence))
    }

    /// Capture-capable devices among `/dev/video0` to `/dev/video15`.
    pub fn list_devices() -> Vec<DeviceInfo> {
        (0..16)
            .map(|i| format!("/dev/video{i}"))
            .filter(|path| Path::new(path).exists())
            .filter_map(|path| {
                let caps = Device::with_path(&path).ok()?.query_caps().ok()?;
                caps.capabilities
                    .contains(Flags::VIDEO_CAPTURE)
                    .then(|| DeviceInfo {
                        path,
                        name: caps.card,
                        driver: caps.driver,
                        bus: caps.bus,
                    })
            })
            .collect()
    }
}

impl FrameSource for Camera {
    fn describe(&self) -> String {
        self.device_path.clone()
    }

    /// A live camera has no natural end; silence surfaces as a timeout.
    fn read_frame(&mut self) -> Result<Option<Frame>, CameraError> {
        self.capture_frame().map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pixel_format_from_fourcc() {
        assert_eq!(PixelFormat::from_fourcc(FourCC::new(b"YUYV")), Some(PixelFormat::Yuyv));
        assert_eq!(PixelFormat::from_fourcc(FourCC::new(b"GREY")), Some(PixelFormat::Grey));
        assert_eq!(PixelFormat::from_fourcc(FourCC::new(b"Y16 ")), Some(PixelFormat::Y16));
        assert_eq!(PixelFormat::from_fourcc(FourCC::new(b"MJPG")), None);
    }

    #[test]
    fn test_grey_to_luma_truncates_padding() {
        let raw = [1u8, 2, 3, 4, 99, 99];
        assert_eq!(PixelFormat::Grey.to_luma(&raw, 2, 2).unwrap(), vec![1, 2, 3, 4]);
        assert!(PixelFormat::Grey.to_luma(&raw[..3], 2, 2).is_err());
    }

    #[test]
    fn test_yuyv_to_luma_takes_every_other_byte() {
        let raw = [10u8, 128, 20, 128];
        assert_eq!(PixelFormat::Yuyv.to_luma(&raw, 2, 1).unwrap(), vec![10, 20]);
    }

    #[test]
    fn test_open_missing_device() {
        let err = Camera::open("/dev/video-presence-none", Duration::from_millis(5)).err();
        assert!(matches!(err, Some(CameraError::DeviceNotFound(_))));
    }
}
