//! Frame sources and stream locators.

use crate::camera::{Camera, CameraError};
use crate::frame::Frame;
use crate::network::NetworkSource;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// A readable stream of grayscale frames.
pub trait FrameSource: Send {
    /// Human-readable name for logs.
    fn describe(&self) -> String;

    /// Next frame, or `Ok(None)` at the natural end of the stream.
    fn read_frame(&mut self) -> Result<Option<Frame>, CameraError>;
}

impl<T: FrameSource + ?Sized> FrameSource for Box<T> {
    fn describe(&self) -> String {
        (**self).describe()
    }

    fn read_frame(&mut self) -> Result<Option<Frame>, CameraError> {
        (**self).read_frame()
    }
}

/// Parsed form of one configured stream locator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceLocator {
    /// Local V4L2 device node.
    Device(PathBuf),
    /// Directory of still images replayed in file-name order.
    Replay(PathBuf),
    /// Network stream address (rtsp, http, https, rtmp).
    Network(String),
}

const NETWORK_SCHEMES: [&str; 4] = ["rtsp://", "rtmp://", "http://", "https://"];

impl FromStr for SourceLocator {
    type Err = CameraError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(CameraError::DeviceNotFound("empty source locator".into()));
        }
        if let Ok(index) = s.parse::<u32>() {
            return Ok(Self::Device(PathBuf::from(format!("/dev/video{index}"))));
        }
        if let Some(dir) = s.strip_prefix("dir:") {
            return Ok(Self::Replay(PathBuf::from(dir)));
        }
        let lower = s.to_ascii_lowercase();
        if NETWORK_SCHEMES.iter().any(|scheme| lower.starts_with(scheme)) {
            return Ok(Self::Network(s.to_string()));
        }
        if s.starts_with("/dev/") {
            return Ok(Self::Device(PathBuf::from(s)));
        }
        let path = Path::new(s);
        if path.is_dir() {
            return Ok(Self::Replay(path.to_path_buf()));
        }
        Err(CameraError::DeviceNotFound(format!(
            "unrecognized source locator: {s}"
        )))
    }
}

impl fmt::Display for SourceLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Device(path) => write!(f, "{}", path.display()),
            Self::Replay(path) => write!(f, "dir:{}", path.display()),
            Self::Network(url) => f.write_str(url),
        }
    }
}

/// Parse a comma-separated locator list, e.g. `"0,/dev/video2,dir:/tmp/frames"`.
pub fn parse_locators(list: &str) -> Result<Vec<SourceLocator>, CameraError> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(SourceLocator::from_str)
        .collect()
}

/// Open the source a locator names.
///
/// `frame_timeout` bounds each read, local or network, so a silent source
/// surfaces as [`CameraError::Timeout`] instead of blocking forever.
pub fn open_source(
    locator: &SourceLocator,
    frame_timeout: Duration,
) -> Result<Box<dyn FrameSource>, CameraError> {
    match locator {
        SourceLocator::Device(path) => {
            let camera = Camera::open(&path.to_string_lossy(), frame_timeout)?;
            Ok(Box::new(camera))
        }
        SourceLocator::Replay(dir) => Ok(Box::new(ReplaySource::open(dir)?)),
        SourceLocator::Network(url) => Ok(Box::new(NetworkSource::open(url, frame_timeout)?)),
    }
}

const REPLAY_EXTENSIONS: [&str; 6] = ["png", "jpg", "jpeg", "bmp", "pgm", "tif"];

/// Replays still images from a directory as a finite stream.
pub struct ReplaySource {
    dir: PathBuf,
    files: std::vec::IntoIter<PathBuf>,
    sequence: u32,
}

impl ReplaySource {
    pub fn open(dir: &Path) -> Result<Self, CameraError> {
        let entries = std::fs::read_dir(dir)
            .map_err(|e| CameraError::DeviceNotFound(format!("{}: {e}", dir.display())))?;

        let mut files: Vec<PathBuf> = entries
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| path.is_file() && has_image_extension(path))
            .collect();
        files.sort();

        tracing::info!(dir = %dir.display(), frames = files.len(), "opened replay source");

        Ok(Self {
            dir: dir.to_path_buf(),
            files: files.into_iter(),
            sequence: 0,
        })
    }
}

fn has_image_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| REPLAY_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

impl FrameSource for ReplaySource {
    fn describe(&self) -> String {
        format!("dir:{}", self.dir.display())
    }

    fn read_frame(&mut self) -> Result<Option<Frame>, CameraError> {
        let Some(path) = self.files.next() else {
            return Ok(None);
        };
        let image = image::open(&path)
            .map_err(|e| CameraError::Decode {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?
            .to_luma8();
        let frame = Frame::new(image, self.sequence);
        self.sequence = self.sequence.wrapping_add(1);
        Ok(Some(frame))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayImage, Luma};

    #[test]
    fn test_locator_index_maps_to_video_node() {
        assert_eq!(
            "0".parse::<SourceLocator>().unwrap(),
            SourceLocator::Device(PathBuf::from("/dev/video0"))
        );
        assert_eq!(
            " 3 ".parse::<SourceLocator>().unwrap(),
            SourceLocator::Device(PathBuf::from("/dev/video3"))
        );
    }

    #[test]
    fn test_locator_kinds() {
        assert_eq!(
            "/dev/video2".parse::<SourceLocator>().unwrap(),
            SourceLocator::Device(PathBuf::from("/dev/video2"))
        );
        assert_eq!(
            "dir:/tmp/frames".parse::<SourceLocator>().unwrap(),
            SourceLocator::Replay(PathBuf::from("/tmp/frames"))
        );
        assert_eq!(
            "rtsp://cam.local/stream".parse::<SourceLocator>().unwrap(),
            SourceLocator::Network("rtsp://cam.local/stream".into())
        );
        assert!(matches!(
            "HTTPS://cam/feed".parse::<SourceLocator>().unwrap(),
            SourceLocator::Network(_)
        ));
    }

    #[test]
    fn test_locator_existing_directory_is_replay() {
        let dir = tempfile::tempdir().unwrap();
        let raw = dir.path().to_string_lossy().to_string();
        assert_eq!(
            raw.parse::<SourceLocator>().unwrap(),
            SourceLocator::Replay(dir.path().to_path_buf())
        );
    }

    #[test]
    fn test_locator_rejects_garbage() {
        assert!("".parse::<SourceLocator>().is_err());
        assert!("no-such-thing-here".parse::<SourceLocator>().is_err());
    }

    #[test]
    fn test_parse_locator_list_skips_blanks() {
        let list = parse_locators("0, ,dir:/x,").unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[1].to_string(), "dir:/x");
    }

    #[test]
    fn test_unreachable_network_source_never_yields_a_frame() {
        // Without ffmpeg the open fails; with it the refused connection makes
        // the decoder exit or the read time out. Either way no frame arrives.
        let locator = SourceLocator::Network("rtsp://127.0.0.1:9/live".into());
        match open_source(&locator, Duration::from_millis(200)) {
            Err(e) => assert!(matches!(e, CameraError::DecoderUnavailable(_)), "{e}"),
            Ok(mut source) => {
                assert_eq!(source.describe(), "rtsp://127.0.0.1:9/live");
                assert!(!matches!(source.read_frame(), Ok(Some(_))));
            }
        }
    }

    #[test]
    fn test_missing_device_is_not_found() {
        let locator = SourceLocator::Device(PathBuf::from("/dev/video-presence-missing"));
        let err = open_source(&locator, Duration::from_millis(10)).err();
        assert!(matches!(err, Some(CameraError::DeviceNotFound(_))));
    }

    #[test]
    fn test_replay_yields_images_in_name_order_then_ends() {
        let dir = tempfile::tempdir().unwrap();
        for (name, value) in [("b.png", 20u8), ("a.png", 10), ("c.png", 30)] {
            GrayImage::from_pixel(4, 4, Luma([value]))
                .save(dir.path().join(name))
                .unwrap();
        }
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let mut source = ReplaySource::open(dir.path()).unwrap();
        let mut seen = Vec::new();
        while let Some(frame) = source.read_frame().unwrap() {
            seen.push((frame.sequence, frame.image.get_pixel(0, 0).0[0]));
        }
        assert_eq!(seen, vec![(0, 10), (1, 20), (2, 30)]);
        assert!(source.read_frame().unwrap().is_none());
    }

    #[test]
    fn test_replay_undecodable_file_is_decode_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("broken.png"), b"not a png").unwrap();
        let mut source = ReplaySource::open(dir.path()).unwrap();
        assert!(matches!(source.read_frame(), Err(CameraError::Decode { .. })));
    }
}
