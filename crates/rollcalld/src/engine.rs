use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use rollcall_core::{
    AttendanceLedger, AttendanceStore, DetectedFace, EmbeddingStore, EuclideanMatcher, FaceEncoder,
    ImageFetcher, LastSeen, LoadError, MarkOutcome, Matcher, ReferenceSource,
};
use rollcall_hw::{CameraError, Frame, FrameSource};
use serde::Serialize;
use thiserror::Error;

use crate::status::{RecognitionStatus, StatusBuffer, CAMERA_UNAVAILABLE_MESSAGE};

#[derive(Error, Debug)]
pub enum StartError {
    #[error("failed to load reference identities: {0}")]
    Load(#[from] LoadError),
    #[error("no capture device available: {0}")]
    DeviceUnavailable(#[from] CameraError),
    #[error("previous recognition loop has not released its resources yet")]
    StillStopping,
    #[error("recognition loop resources were lost")]
    WorkerLost,
    #[error("failed to spawn engine thread: {0}")]
    Spawn(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LoopState {
    Idle,
    Running,
    /// Stop was requested but the loop has not exited yet.
    Stopping,
}

impl LoopState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Stopping => "stopping",
        }
    }
}

/// Tunables for the recognition loop.
#[derive(Debug, Clone)]
pub struct LoopSettings {
    pub every_n_frames: u64,
    pub tolerance: f32,
    pub dedup_window: Duration,
    pub loop_delay: Duration,
    pub stop_timeout: Duration,
    pub detect_width: u32,
    pub detect_height: u32,
    pub reference_scale: f32,
}

impl Default for LoopSettings {
    fn default() -> Self {
        Self {
            every_n_frames: 10,
            tolerance: 0.6,
            dedup_window: rollcall_core::dedup::DEFAULT_DEDUP_WINDOW,
            loop_delay: Duration::from_millis(100),
            stop_timeout: Duration::from_secs(5),
            detect_width: 160,
            detect_height: 120,
            reference_scale: 0.5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Health {
    pub state: LoopState,
    pub store_connected: bool,
    pub identities_loaded: usize,
}

/// Capabilities owned by whichever side currently drives the camera.
struct Parts {
    encoder: Box<dyn FaceEncoder>,
    frames: Box<dyn FrameSource>,
}

enum Lifecycle {
    Idle(Parts),
    Running {
        cancel: Sender<()>,
        done: Receiver<Parts>,
    },
    /// Stop timed out; the worker hands the parts back when it exits.
    Stopping { done: Receiver<Parts> },
    Lost,
}

/// State visible to both the worker and request handlers.
struct Shared {
    buffer: StatusBuffer,
    gallery: EmbeddingStore,
    running: AtomicBool,
    stopping: AtomicBool,
}

/// Owns the recognition loop and everything it touches.
///
/// `start`/`stop` are serialized by the lifecycle lock; status and frame
/// reads never take it.
pub struct Controller {
    settings: LoopSettings,
    shared: Arc<Shared>,
    references: Arc<dyn ReferenceSource>,
    fetcher: Arc<dyn ImageFetcher>,
    attendance: Arc<dyn AttendanceStore>,
    ledger: Arc<AttendanceLedger>,
    lifecycle: Mutex<Lifecycle>,
}

impl Controller {
    pub fn new(
        settings: LoopSettings,
        references: Arc<dyn ReferenceSource>,
        fetcher: Arc<dyn ImageFetcher>,
        attendance: Arc<dyn AttendanceStore>,
        encoder: Box<dyn FaceEncoder>,
        frames: Box<dyn FrameSource>,
    ) -> Self {
        let shared = Arc::new(Shared {
            buffer: StatusBuffer::new(),
            gallery: EmbeddingStore::new(settings.reference_scale),
            running: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
        });
        Self {
            settings,
            shared,
            references,
            fetcher,
            ledger: Arc::new(AttendanceLedger::new(Arc::clone(&attendance))),
            attendance,
            lifecycle: Mutex::new(Lifecycle::Idle(Parts { encoder, frames })),
        }
    }

    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn state(&self) -> LoopState {
        let running = self.shared.running.load(Ordering::SeqCst);
        let stopping = self.shared.stopping.load(Ordering::SeqCst);
        match (running, stopping) {
            (false, _) => LoopState::Idle,
            (true, true) => LoopState::Stopping,
            (true, false) => LoopState::Running,
        }
    }

    /// Take back the parts of a loop that exited after its stop timed out.
    fn reclaim(lifecycle: &mut Lifecycle) {
        if let Lifecycle::Stopping { done } = lifecycle {
            match done.try_recv() {
                Ok(parts) => {
                    tracing::info!("late-stopping recognition loop released its resources");
                    *lifecycle = Lifecycle::Idle(parts);
                }
                Err(TryRecvError::Empty) => {}
                Err(TryRecvError::Disconnected) => *lifecycle = Lifecycle::Lost,
            }
        }
    }

    /// Reload the gallery, open the camera and spawn the loop.
    ///
    /// A no-op returning `Running` if the loop is already active. Fails with
    /// `StillStopping` while a timed-out stop is still winding down, which
    /// `state()` reports as `Stopping`.
    pub fn start(&self) -> Result<LoopState, StartError> {
        let mut lifecycle = self.lifecycle();
        Self::reclaim(&mut lifecycle);

        let mut parts = match std::mem::replace(&mut *lifecycle, Lifecycle::Lost) {
            Lifecycle::Idle(parts) => parts,
            running @ Lifecycle::Running { .. } => {
                *lifecycle = running;
                tracing::debug!("start requested while running");
                return Ok(LoopState::Running);
            }
            stopping @ Lifecycle::Stopping { .. } => {
                *lifecycle = stopping;
                tracing::debug!("start requested while previous loop is stopping");
                return Err(StartError::StillStopping);
            }
            Lifecycle::Lost => return Err(StartError::WorkerLost),
        };

        if let Err(e) = self.shared.gallery.reload(
            self.references.as_ref(),
            self.fetcher.as_ref(),
            parts.encoder.as_mut(),
        ) {
            tracing::error!(error = %e, "start aborted: reference load failed");
            *lifecycle = Lifecycle::Idle(parts);
            return Err(e.into());
        }

        if let Err(e) = parts.frames.open() {
            tracing::error!(error = %e, "start aborted: camera unavailable");
            self.shared
                .buffer
                .set_status(RecognitionStatus::message(CAMERA_UNAVAILABLE_MESSAGE));
            *lifecycle = Lifecycle::Idle(parts);
            return Err(e.into());
        }

        let (cancel_tx, cancel_rx) = mpsc::channel();
        let (done_tx, done_rx) = mpsc::channel();
        let worker = Worker::new(
            self.settings.clone(),
            Arc::clone(&self.shared),
            Arc::clone(&self.ledger),
            parts,
        );

        // The thread takes the worker out of the slot; if spawning fails it
        // is still there and the parts go back to Idle.
        let slot = Arc::new(Mutex::new(Some(worker)));
        let thread_slot = Arc::clone(&slot);

        // Flip before spawning so a fast stop still observes Running.
        self.shared.stopping.store(false, Ordering::SeqCst);
        self.shared.running.store(true, Ordering::SeqCst);
        let spawned = std::thread::Builder::new()
            .name("rollcall-engine".into())
            .spawn(move || {
                let worker = thread_slot.lock().unwrap_or_else(|p| p.into_inner()).take();
                if let Some(worker) = worker {
                    worker.run(cancel_rx, done_tx);
                }
            });

        if let Err(e) = spawned {
            self.shared.running.store(false, Ordering::SeqCst);
            tracing::error!(error = %e, "failed to spawn engine thread");
            if let Some(worker) = slot.lock().unwrap_or_else(|p| p.into_inner()).take() {
                let mut parts = worker.parts;
                parts.frames.close();
                *lifecycle = Lifecycle::Idle(parts);
            }
            return Err(e.into());
        }

        *lifecycle = Lifecycle::Running {
            cancel: cancel_tx,
            done: done_rx,
        };
        tracing::info!(identities = self.shared.gallery.len(), "recognition started");
        Ok(LoopState::Running)
    }

    /// Ask the loop to stop and wait up to the stop timeout for it.
    ///
    /// A no-op returning the current state if the loop is not running.
    pub fn stop(&self) -> LoopState {
        let mut lifecycle = self.lifecycle();
        Self::reclaim(&mut lifecycle);

        let (cancel, done) = match std::mem::replace(&mut *lifecycle, Lifecycle::Lost) {
            Lifecycle::Running { cancel, done } => (cancel, done),
            other => {
                *lifecycle = other;
                tracing::debug!("stop requested while not running");
                return self.state();
            }
        };

        let _ = cancel.send(());
        match done.recv_timeout(self.settings.stop_timeout) {
            Ok(parts) => {
                *lifecycle = Lifecycle::Idle(parts);
                tracing::info!("recognition stopped");
            }
            Err(RecvTimeoutError::Timeout) => {
                tracing::warn!(
                    timeout_ms = self.settings.stop_timeout.as_millis() as u64,
                    "recognition loop did not stop in time; continuing"
                );
                self.shared.stopping.store(true, Ordering::SeqCst);
                *lifecycle = Lifecycle::Stopping { done };
            }
            Err(RecvTimeoutError::Disconnected) => {
                tracing::error!("engine thread exited without returning its resources");
            }
        }
        self.state()
    }

    pub fn current_status(&self) -> RecognitionStatus {
        self.shared.buffer.status()
    }

    pub fn latest_frame(&self) -> Option<Frame> {
        self.shared.buffer.latest_frame()
    }

    pub fn reset_status(&self) {
        self.shared.buffer.reset_status();
    }

    pub fn health(&self) -> Health {
        Health {
            state: self.state(),
            store_connected: self.references.is_connected() && self.attendance.is_connected(),
            identities_loaded: self.shared.gallery.len(),
        }
    }
}

impl Drop for Controller {
    fn drop(&mut self) {
        if let Lifecycle::Running { cancel, .. } = &*self.lifecycle() {
            let _ = cancel.send(());
        }
    }
}

/// Marks the loop as exited however the engine thread leaves `run`,
/// including by unwinding.
struct ExitGuard(Arc<Shared>);

impl Drop for ExitGuard {
    fn drop(&mut self) {
        self.0.running.store(false, Ordering::SeqCst);
        self.0.stopping.store(false, Ordering::SeqCst);
    }
}

#[derive(Debug, PartialEq)]
enum StepOutcome {
    /// Transient empty read or capture error.
    NoFrame,
    /// Published but not sampled for detection.
    Published,
    Sampled {
        faces: usize,
        outcome: Option<MarkOutcome>,
    },
}

/// The recognition loop body. Lives on the engine thread.
struct Worker {
    settings: LoopSettings,
    shared: Arc<Shared>,
    ledger: Arc<AttendanceLedger>,
    matcher: EuclideanMatcher,
    last_seen: LastSeen,
    frame_count: u64,
    parts: Parts,
}

impl Worker {
    fn new(mut settings: LoopSettings, shared: Arc<Shared>, ledger: Arc<AttendanceLedger>, parts: Parts) -> Self {
        settings.every_n_frames = settings.every_n_frames.max(1);
        Self {
            last_seen: LastSeen::new(settings.dedup_window),
            settings,
            shared,
            ledger,
            matcher: EuclideanMatcher,
            frame_count: 0,
            parts,
        }
    }

    fn run(mut self, cancel: Receiver<()>, done: Sender<Parts>) {
        let exit = ExitGuard(Arc::clone(&self.shared));
        tracing::info!(
            every_n_frames = self.settings.every_n_frames,
            tolerance = self.settings.tolerance,
            "engine thread started"
        );

        loop {
            match cancel.try_recv() {
                Err(TryRecvError::Empty) => {}
                Ok(()) | Err(TryRecvError::Disconnected) => break,
            }
            let now = Instant::now();
            if panic::catch_unwind(AssertUnwindSafe(|| self.step(now))).is_err() {
                tracing::error!(frame = self.frame_count, "recognition step panicked; continuing");
            }
            std::thread::sleep(self.settings.loop_delay);
        }

        let frames = &mut self.parts.frames;
        if panic::catch_unwind(AssertUnwindSafe(|| frames.close())).is_err() {
            tracing::error!("frame source panicked while closing");
        }
        tracing::info!(frames = self.frame_count, "engine thread exiting");
        // Clear the flags before handing the parts back so `stop` reports Idle.
        drop(exit);
        let _ = done.send(self.parts);
    }

    fn step(&mut self, now: Instant) -> StepOutcome {
        let frame = match self.parts.frames.read() {
            Ok(Some(frame)) => frame,
            Ok(None) => return StepOutcome::NoFrame,
            Err(e) => {
                tracing::warn!(error = %e, "frame read failed");
                return StepOutcome::NoFrame;
            }
        };

        self.shared.buffer.publish_frame(&frame);
        self.frame_count += 1;
        if self.frame_count % self.settings.every_n_frames != 0 {
            return StepOutcome::Published;
        }

        let faces = self.detect(&frame);
        let outcome = self.handle_detections(&faces, now);
        StepOutcome::Sampled {
            faces: faces.len(),
            outcome,
        }
    }

    /// Run the encoder on a shrunken copy. Any fault yields no faces.
    fn detect(&mut self, frame: &Frame) -> Vec<DetectedFace> {
        let small = match frame.resized(self.settings.detect_width, self.settings.detect_height) {
            Ok(image) => image,
            Err(e) => {
                tracing::warn!(error = %e, sequence = frame.sequence, "failed to prepare frame for detection");
                return Vec::new();
            }
        };

        let encoder = &mut self.parts.encoder;
        match panic::catch_unwind(AssertUnwindSafe(|| encoder.encode(&small))) {
            Ok(Ok(faces)) => faces,
            Ok(Err(e)) => {
                tracing::warn!(error = %e, sequence = frame.sequence, "face encoding failed");
                Vec::new()
            }
            Err(_) => {
                tracing::error!(sequence = frame.sequence, "face encoder panicked");
                Vec::new()
            }
        }
    }

    /// Resolve at most one identity per frame: the first face that matches.
    fn handle_detections(&mut self, faces: &[DetectedFace], now: Instant) -> Option<MarkOutcome> {
        let gallery = self.shared.gallery.identities();

        for face in faces {
            let result = self
                .matcher
                .compare(&face.embedding, &gallery, self.settings.tolerance);
            let Some(identity) = result.index.filter(|_| result.matched).and_then(|i| gallery.get(i)) else {
                continue;
            };

            if !self.last_seen.should_attempt(&identity.id, now) {
                tracing::debug!(identity = %identity.id, "match suppressed within dedup window");
                return None;
            }

            let outcome = self.ledger.mark(&identity.id);
            self.last_seen.record(&identity.id, now);
            tracing::info!(
                identity = %identity.id,
                name = %identity.display_name,
                distance = result.distance.unwrap_or(f32::NAN),
                outcome = outcome.status_message(),
                "face recognized"
            );
            self.shared.buffer.set_status(RecognitionStatus {
                name: identity.display_name.clone(),
                reference_image_uri: identity.reference_image_uri.clone(),
                status_message: outcome.status_message().to_string(),
            });
            return Some(outcome);
        }

        None
    }
}
