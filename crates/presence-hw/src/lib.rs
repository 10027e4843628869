//! Frame sources for the capture loop.
//!
//! V4L2 cameras (YUYV, GREY and Y16), network streams decoded by ffmpeg and
//! directory replay behind one [`FrameSource`] trait, selected by a
//! [`SourceLocator`].

pub mod camera;
pub mod frame;
pub mod network;
pub mod source;

pub use camera::{Camera, CameraError, DeviceInfo, PixelFormat};
pub use frame::{Frame, FrameError};
pub use network::NetworkSource;
pub use source::{open_source, parse_locators, FrameSource, ReplaySource, SourceLocator};
