//! Live capture loop, one thread per camera source.
//!
//! Each source runs `read → detect → recognize → mark` sequentially. Sources
//! share the model slot and the ledger and nothing else, so a stalled or
//! panicking source never affects its siblings.

use chrono::{DateTime, Local};
use image::GrayImage;
use presence_core::{
    normalize_face, DetectParams, DetectorError, FaceDetect, ModelSlot, Recognition,
};
use presence_hw::{open_source, CameraError, FrameSource, SourceLocator};
use presence_store::{AttendanceLedger, MarkOutcome};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("detector error: {0}")]
    Detector(#[from] DetectorError),
    #[error("failed to spawn capture thread: {0}")]
    Spawn(#[source] std::io::Error),
}

/// Lifecycle of one camera source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceState {
    Opening,
    Streaming,
    /// Open or read failed; the source was retired.
    Stalled,
    /// Stop requested or the stream ended.
    Closed,
}

/// Per-frame tallies from [`FramePipeline::process_frame`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FrameStats {
    pub faces: u32,
    pub known: u32,
    pub marked: u32,
    pub already_marked: u32,
    pub errors: u32,
}

/// What a source did before it stopped.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceReport {
    pub source: String,
    pub state: SourceState,
    pub frames: u64,
    pub dark_skipped: u64,
    pub faces: u64,
    pub marked: u64,
    pub errors: u64,
    /// Why the source stalled, if it did.
    pub error: Option<String>,
}

impl SourceReport {
    fn new(source: &str) -> Self {
        Self {
            source: source.to_string(),
            state: SourceState::Opening,
            frames: 0,
            dark_skipped: 0,
            faces: 0,
            marked: 0,
            errors: 0,
            error: None,
        }
    }

    fn absorb(&mut self, stats: FrameStats) {
        self.faces += u64::from(stats.faces);
        self.marked += u64::from(stats.marked);
        self.errors += u64::from(stats.errors);
    }
}

type Clock = Box<dyn FnMut() -> DateTime<Local> + Send>;

/// Detector, model slot and ledger wired together for one source.
pub struct FramePipeline<D> {
    detector: D,
    slot: Arc<ModelSlot>,
    ledger: AttendanceLedger,
    clock: Clock,
}

impl<D: FaceDetect> FramePipeline<D> {
    pub fn new(detector: D, slot: Arc<ModelSlot>, ledger: AttendanceLedger) -> Self {
        Self {
            detector,
            slot,
            ledger,
            clock: Box::new(Local::now),
        }
    }

    /// Replace the wall clock used to timestamp marks.
    pub fn with_clock(mut self, clock: impl FnMut() -> DateTime<Local> + Send + 'static) -> Self {
        self.clock = Box::new(clock);
        self
    }

    /// Detect, recognize and mark every face in one frame, stamped with the
    /// pipeline clock.
    pub fn process(&mut self, image: &GrayImage) -> FrameStats {
        let when = (self.clock)();
        self.process_frame(image, when)
    }

    /// Detect, recognize and mark every face in one frame.
    ///
    /// All faces use the same model snapshot. Failures are counted and
    /// logged; they never abort the frame's remaining faces.
    pub fn process_frame(&mut self, image: &GrayImage, when: DateTime<Local>) -> FrameStats {
        let mut stats = FrameStats::default();
        let recognizer = self.slot.snapshot();

        let regions = match self.detector.detect(image, &DetectParams::STRICT) {
            Ok(regions) => regions,
            Err(e) => {
                tracing::warn!(error = %e, "detection failed; skipping frame");
                stats.errors += 1;
                return stats;
            }
        };

        for region in &regions {
            stats.faces += 1;
            let face = match normalize_face(image, region) {
                Ok(face) => face,
                Err(e) => {
                    tracing::warn!(error = %e, "face region unusable");
                    stats.errors += 1;
                    continue;
                }
            };

            let (user_id, confidence) = match recognizer.recognize(&face) {
                Recognition::Known { user_id, confidence } => (user_id, confidence),
                Recognition::Unknown => {
                    tracing::debug!(detection = region.confidence, "unknown face");
                    continue;
                }
            };
            stats.known += 1;

            match self.ledger.mark(&user_id, when) {
                Ok(MarkOutcome::Marked) => {
                    tracing::info!(user_id, confidence, "attendance recorded");
                    stats.marked += 1;
                }
                Ok(MarkOutcome::AlreadyMarkedToday) => stats.already_marked += 1,
                Ok(MarkOutcome::UserNotFound) => {
                    tracing::warn!(user_id, "recognized user is no longer enrolled");
                }
                Err(e) => {
                    tracing::error!(user_id, error = %e, "failed to record attendance");
                    stats.errors += 1;
                }
            }
        }

        stats
    }
}

/// Drive one source from `Opening` to `Stalled` or `Closed`.
///
/// The source is dropped before returning on every path.
pub fn run_source<D, O>(
    name: &str,
    open: O,
    pipeline: &mut FramePipeline<D>,
    stop: &AtomicBool,
) -> SourceReport
where
    D: FaceDetect,
    O: FnOnce() -> Result<Box<dyn FrameSource>, CameraError>,
{
    let mut report = SourceReport::new(name);

    tracing::info!(source = name, "opening source");
    let mut source = match open() {
        Ok(source) => source,
        Err(e) => {
            tracing::warn!(source = name, error = %e, "source unavailable; skipping");
            report.state = SourceState::Stalled;
            report.error = Some(e.to_string());
            return report;
        }
    };

    report.state = SourceState::Streaming;
    tracing::info!(source = name, "streaming");

    loop {
        if stop.load(Ordering::Relaxed) {
            report.state = SourceState::Closed;
            break;
        }
        match source.read_frame() {
            Ok(Some(frame)) => {
                report.frames += 1;
                if frame.is_dark {
                    report.dark_skipped += 1;
                    tracing::trace!(source = name, sequence = frame.sequence, "dark frame skipped");
                    continue;
                }
                let stats = pipeline.process(&frame.image);
                report.absorb(stats);
            }
            Ok(None) => {
                tracing::info!(source = name, "end of stream");
                report.state = SourceState::Closed;
                break;
            }
            Err(e) => {
                tracing::warn!(source = name, error = %e, "frame read failed; retiring source");
                report.state = SourceState::Stalled;
                report.error = Some(e.to_string());
                break;
            }
        }
    }
    drop(source);

    tracing::info!(
        source = name,
        state = ?report.state,
        frames = report.frames,
        faces = report.faces,
        marked = report.marked,
        "source finished"
    );
    report
}

pub type SourceOpener = Box<dyn FnOnce() -> Result<Box<dyn FrameSource>, CameraError> + Send>;

/// A named source ready to be opened on its capture thread.
pub struct SourceTask {
    pub name: String,
    pub open: SourceOpener,
}

impl SourceTask {
    /// Source opened from a configured locator string.
    pub fn from_locator(locator: &str, frame_timeout: Duration) -> Self {
        let raw = locator.to_string();
        Self {
            name: raw.clone(),
            open: Box::new(move || {
                let parsed: SourceLocator = raw.parse()?;
                open_source(&parsed, frame_timeout)
            }),
        }
    }
}

/// Running capture threads and their shared stop flag.
pub struct CaptureHandle {
    stop: Arc<AtomicBool>,
    threads: Vec<(String, JoinHandle<SourceReport>)>,
}

impl CaptureHandle {
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }

    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    /// Wait for every source. A panicked source is reported as stalled.
    pub fn join(self) -> Vec<SourceReport> {
        self.threads
            .into_iter()
            .map(|(name, handle)| match handle.join() {
                Ok(report) => report,
                Err(payload) => {
                    let reason = payload
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| payload.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "unknown panic".to_string());
                    tracing::error!(source = name, reason, "capture thread panicked");
                    let mut report = SourceReport::new(&name);
                    report.state = SourceState::Stalled;
                    report.error = Some(format!("panicked: {reason}"));
                    report
                }
            })
            .collect()
    }
}

/// Start one named thread per source, each with its own detector.
///
/// Detectors are built up front so a missing detection model fails before
/// any camera is touched.
pub fn spawn_sources<D, F>(
    sources: Vec<SourceTask>,
    mut make_detector: F,
    slot: Arc<ModelSlot>,
    ledger: AttendanceLedger,
) -> Result<CaptureHandle, CaptureError>
where
    D: FaceDetect + 'static,
    F: FnMut() -> Result<D, DetectorError>,
{
    let detectors = sources
        .iter()
        .map(|_| make_detector())
        .collect::<Result<Vec<D>, DetectorError>>()?;

    let mut handle = CaptureHandle {
        stop: Arc::new(AtomicBool::new(false)),
        threads: Vec::with_capacity(sources.len()),
    };

    for (index, (task, detector)) in sources.into_iter().zip(detectors).enumerate() {
        let mut pipeline = FramePipeline::new(detector, Arc::clone(&slot), ledger.clone());
        let stop = handle.stop_flag();
        let name = task.name.clone();
        let spawned = std::thread::Builder::new()
            .name(format!("presence-src-{index}"))
            .spawn(move || run_source(&task.name, task.open, &mut pipeline, &stop));

        match spawned {
            Ok(thread) => handle.threads.push((name, thread)),
            Err(e) => {
                handle.stop();
                let _ = handle.join();
                return Err(CaptureError::Spawn(e));
            }
        }
    }

    tracing::info!(sources = handle.threads.len(), "capture started");
    Ok(handle)
}
