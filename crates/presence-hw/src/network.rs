//! Network streams (RTSP, RTMP, HTTP) decoded by an `ffmpeg` child process.
//!
//! ffmpeg scales every frame to a fixed size and writes raw 8-bit luma to
//! its stdout. A reader thread cuts that byte stream into frames and hands
//! them over a bounded channel, so a stream that goes quiet surfaces as
//! [`CameraError::Timeout`] instead of a blocked read.

use crate::camera::{CameraError, CAPTURE_HEIGHT, CAPTURE_WIDTH};
use crate::frame::Frame;
use crate::source::FrameSource;
use image::GrayImage;
use std::io::{self, Read};
use std::process::{Child, ChildStdout, Command, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender};
use std::time::{Duration, Instant};

/// Frames buffered between the reader thread and the capture loop.
const FRAME_QUEUE: usize = 2;

const EXIT_POLL: Duration = Duration::from_millis(10);

/// `ffmpeg` invocation that decodes `url` to raw `width`x`height` luma on stdout.
pub fn ffmpeg_command(url: &str, width: u32, height: u32) -> Command {
    let mut cmd = Command::new("ffmpeg");
    cmd.args(["-nostdin", "-hide_banner", "-loglevel", "error"]);
    if url.to_ascii_lowercase().starts_with("rtsp://") {
        cmd.args(["-rtsp_transport", "tcp"]);
    }
    cmd.args(["-i", url, "-an", "-vf"])
        .arg(format!("scale={width}:{height}"))
        .args(["-pix_fmt", "gray", "-f", "rawvideo", "pipe:1"]);
    cmd
}

/// A stream of raw grayscale frames read from a child process.
pub struct NetworkSource {
    name: String,
    child: Child,
    frames: Receiver<io::Result<Vec<u8>>>,
    width: u32,
    height: u32,
    timeout: Duration,
    sequence: u32,
    ended: bool,
}

impl NetworkSource {
    /// Start decoding `url` with the system `ffmpeg`.
    pub fn open(url: &str, timeout: Duration) -> Result<Self, CameraError> {
        let source = Self::spawn(
            url,
            ffmpeg_command(url, CAPTURE_WIDTH, CAPTURE_HEIGHT),
            CAPTURE_WIDTH,
            CAPTURE_HEIGHT,
            timeout,
        )?;
        tracing::info!(url, width = CAPTURE_WIDTH, height = CAPTURE_HEIGHT, "network stream opened");
        Ok(source)
    }

    /// Run `command` and read `width * height` byte frames from its stdout.
    pub fn spawn(
        name: &str,
        mut command: Command,
        width: u32,
        height: u32,
        timeout: Duration,
    ) -> Result<Self, CameraError> {
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null());
        let program = command.get_program().to_string_lossy().into_owned();
        let mut child = command.spawn().map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => {
                CameraError::DecoderUnavailable(format!("{program} not found on PATH"))
            }
            _ => CameraError::CaptureFailed(format!("cannot start {program} for {name}: {e}")),
        })?;

        let Some(stdout) = child.stdout.take() else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(CameraError::CaptureFailed("decoder stdout not captured".into()));
        };

        let frame_len = width as usize * height as usize;
        let (tx, rx) = mpsc::sync_channel(FRAME_QUEUE);
        let spawned = std::thread::Builder::new()
            .name("presence-net-reader".into())
            .spawn(move || read_frames(stdout, frame_len, tx));
        if let Err(e) = spawned {
            let _ = child.kill();
            let _ = child.wait();
            return Err(CameraError::CaptureFailed(format!("cannot start reader thread: {e}")));
        }

        Ok(Self {
            name: name.to_string(),
            child,
            frames: rx,
            width,
            height,
            timeout,
            sequence: 0,
            ended: false,
        })
    }

    /// The byte stream closed. Wait briefly for the decoder's exit status:
    /// a clean exit is the end of the stream, anything else is a failure.
    fn finish(&mut self) -> Result<Option<Frame>, CameraError> {
        self.ended = true;
        let deadline = Instant::now() + self.timeout;
        loop {
            match self.child.try_wait() {
                Ok(Some(status)) if status.success() => {
                    tracing::info!(source = %self.name, "network stream ended");
                    return Ok(None);
                }
                Ok(Some(status)) => {
                    return Err(CameraError::CaptureFailed(format!(
                        "decoder for {} exited with {status}",
                        self.name
                    )))
                }
                Ok(None) if Instant::now() < deadline => std::thread::sleep(EXIT_POLL),
                Ok(None) => {
                    return Err(CameraError::CaptureFailed(format!(
                        "decoder for {} closed its output but kept running",
                        self.name
                    )))
                }
                Err(e) => return Err(CameraError::CaptureFailed(format!("decoder status: {e}"))),
            }
        }
    }
}

fn read_frames(mut stdout: ChildStdout, frame_len: usize, tx: SyncSender<io::Result<Vec<u8>>>) {
    loop {
        let mut buf = vec![0u8; frame_len];
        match stdout.read_exact(&mut buf) {
            Ok(()) => {
                if tx.send(Ok(buf)).is_err() {
                    return;
                }
            }
            // A trailing partial frame is dropped along with the stream.
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return,
            Err(e) => {
                let _ = tx.send(Err(e));
                return;
            }
        }
    }
}

impl FrameSource for NetworkSource {
    fn describe(&self) -> String {
        self.name.clone()
    }

    fn read_frame(&mut self) -> Result<Option<Frame>, CameraError> {
        if self.ended {
            return Ok(None);
        }
        match self.frames.recv_timeout(self.timeout) {
            Ok(Ok(raw)) => {
                let image = GrayImage::from_raw(self.width, self.height, raw).ok_or_else(|| {
                    CameraError::CaptureFailed("decoded frame has the wrong size".into())
                })?;
                let frame = Frame::new(image, self.sequence);
                self.sequence = self.sequence.wrapping_add(1);
                Ok(Some(frame))
            }
            Ok(Err(e)) => Err(CameraError::CaptureFailed(format!("stream read failed: {e}"))),
            Err(RecvTimeoutError::Timeout) => Err(CameraError::Timeout(self.timeout)),
            Err(RecvTimeoutError::Disconnected) => self.finish(),
        }
    }
}

impl Drop for NetworkSource {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shell(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", script]);
        cmd
    }

    #[test]
    fn test_reads_fixed_size_frames_until_clean_exit() {
        // "A\n" repeated: 16 bytes make two 4x2 frames.
        let mut source = NetworkSource::spawn(
            "scripted",
            shell("yes A | head -c 16"),
            4,
            2,
            Duration::from_secs(5),
        )
        .unwrap();

        let first = source.read_frame().unwrap().unwrap();
        assert_eq!(first.sequence, 0);
        assert_eq!(first.image.as_raw(), &vec![b'A', b'\n', b'A', b'\n', b'A', b'\n', b'A', b'\n']);
        assert_eq!(source.read_frame().unwrap().unwrap().sequence, 1);
        assert!(source.read_frame().unwrap().is_none());
        assert!(source.read_frame().unwrap().is_none());
    }

    #[test]
    fn test_trailing_partial_frame_is_dropped() {
        let mut source =
            NetworkSource::spawn("scripted", shell("yes A | head -c 12"), 4, 2, Duration::from_secs(5))
                .unwrap();
        assert!(source.read_frame().unwrap().is_some());
        assert!(source.read_frame().unwrap().is_none());
    }

    #[test]
    fn test_decoder_failure_is_capture_error() {
        let mut source =
            NetworkSource::spawn("scripted", shell("exit 3"), 4, 2, Duration::from_secs(5)).unwrap();
        assert!(matches!(source.read_frame(), Err(CameraError::CaptureFailed(_))));
        assert!(source.read_frame().unwrap().is_none());
    }

    #[test]
    fn test_silent_stream_times_out() {
        let mut source = NetworkSource::spawn(
            "scripted",
            shell("exec sleep 5"),
            4,
            2,
            Duration::from_millis(50),
        )
        .unwrap();
        let started = Instant::now();
        assert!(matches!(source.read_frame(), Err(CameraError::Timeout(_))));
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[test]
    fn test_missing_decoder_binary() {
        let err = NetworkSource::spawn(
            "scripted",
            Command::new("presence-no-such-decoder"),
            4,
            2,
            Duration::from_millis(50),
        )
        .err();
        assert!(matches!(err, Some(CameraError::DecoderUnavailable(_))));
    }

    #[test]
    fn test_ffmpeg_command_shape() {
        let args = |url: &str| -> Vec<String> {
            ffmpeg_command(url, 640, 480)
                .get_args()
                .map(|a| a.to_string_lossy().into_owned())
                .collect()
        };
        let rtsp = args("rtsp://10.0.0.5/live");
        assert!(rtsp.windows(2).any(|w| w == ["-rtsp_transport", "tcp"]));
        assert!(rtsp.windows(2).any(|w| w == ["-i", "rtsp://10.0.0.5/live"]));
        assert!(rtsp.windows(2).any(|w| w == ["-vf", "scale=640:480"]));
        assert!(rtsp.windows(2).any(|w| w == ["-pix_fmt", "gray"]));
        assert_eq!(rtsp.last().map(String::as_str), Some("pipe:1"));

        let http = args("http://cam.local/mjpeg");
        assert!(!http.iter().any(|a| a == "-rtsp_transport"));
    }
}
