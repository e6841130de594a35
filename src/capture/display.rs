//! Display mirroring into an encoder's input surface.

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::codec::screen::BYTES_PER_PIXEL;
use crate::codec::InputSurface;
use crate::error::BoxError;

/// Notifications from the host about a mirroring session.
///
/// Both callbacks run on the host's thread, never on the controller's.
pub trait DisplayCallback: Send + Sync {
    /// The host ended the session (e.g. the projection was revoked)
    fn on_stopped(&self);

    /// The host paused mirroring; frames stop until it resumes
    fn on_paused(&self) {}
}

/// Parameters for a new mirroring session
pub struct DisplayRequest {
    pub name: String,
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
    pub surface: InputSurface,
    pub callback: Arc<dyn DisplayCallback>,
}

impl std::fmt::Debug for DisplayRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DisplayRequest")
            .field("name", &self.name)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("frame_rate", &self.frame_rate)
            .finish()
    }
}

/// A live screen-mirroring session writing into an input surface
pub trait VirtualDisplay: Send {
    fn name(&self) -> &str;

    /// Stop mirroring and free the session. Does not fire `on_stopped`.
    fn release(&mut self);
}

/// Lets a test (or the host) end a [`SyntheticDisplay`] from outside
#[derive(Clone)]
pub struct DisplayStopTrigger {
    control: Arc<CompositorControl>,
}

impl DisplayStopTrigger {
    pub fn fire(&self) {
        let mut state = self.control.state.lock();
        if state.host_stopped || state.released {
            return;
        }
        state.host_stopped = true;
        self.control.wake.notify_all();
    }
}

#[derive(Default)]
struct ControlState {
    host_stopped: bool,
    released: bool,
}

#[derive(Default)]
struct CompositorControl {
    state: Mutex<ControlState>,
    wake: Condvar,
}

/// Software compositor painting a moving test pattern at a fixed rate
pub struct SyntheticDisplay {
    name: String,
    control: Arc<CompositorControl>,
    frames_posted: Arc<AtomicU64>,
    compositor: Option<JoinHandle<()>>,
    surface: InputSurface,
}

impl SyntheticDisplay {
    pub fn start(request: DisplayRequest) -> Result<Self, BoxError> {
        let expected = request.width as usize * request.height as usize * BYTES_PER_PIXEL;
        if request.surface.frame_size() != expected {
            return Err(format!(
                "surface expects {} byte frames, display {}x{} produces {}",
                request.surface.frame_size(),
                request.width,
                request.height,
                expected
            )
            .into());
        }
        if request.frame_rate == 0 {
            return Err("display frame rate must be non-zero".into());
        }

        let control = Arc::new(CompositorControl::default());
        let frames_posted = Arc::new(AtomicU64::new(0));
        let painter = TestPattern::new(request.width, request.height);
        let interval = Duration::from_secs(1) / request.frame_rate;

        let compositor = {
            let control = Arc::clone(&control);
            let frames_posted = Arc::clone(&frames_posted);
            let surface = request.surface.clone();
            let callback = Arc::clone(&request.callback);
            std::thread::Builder::new()
                .name(format!("{}-compositor", request.name))
                .spawn(move || {
                    run_compositor(painter, surface, callback, control, frames_posted, interval)
                })?
        };

        info!(
            "Virtual display '{}' started: {}x{} @ {} fps",
            request.name, request.width, request.height, request.frame_rate
        );

        Ok(Self {
            name: request.name,
            control,
            frames_posted,
            compositor: Some(compositor),
            surface: request.surface,
        })
    }

    pub fn stop_trigger(&self) -> DisplayStopTrigger {
        DisplayStopTrigger {
            control: Arc::clone(&self.control),
        }
    }

    pub fn frames_posted(&self) -> u64 {
        self.frames_posted.load(Ordering::Relaxed)
    }
}

impl VirtualDisplay for SyntheticDisplay {
    fn name(&self) -> &str {
        &self.name
    }

    fn release(&mut self) {
        {
            let mut state = self.control.state.lock();
            state.released = true;
            self.control.wake.notify_all();
        }
        if let Some(handle) = self.compositor.take() {
            if handle.join().is_err() {
                warn!("Compositor thread for '{}' panicked", self.name);
            }
            debug!(
                "Virtual display '{}' released after {} frames (surface released: {})",
                self.name,
                self.frames_posted(),
                self.surface.is_released()
            );
        }
    }
}

impl Drop for SyntheticDisplay {
    fn drop(&mut self) {
        self.release();
    }
}

fn run_compositor(
    mut painter: TestPattern,
    surface: InputSurface,
    callback: Arc<dyn DisplayCallback>,
    control: Arc<CompositorControl>,
    frames_posted: Arc<AtomicU64>,
    interval: Duration,
) {
    let started = Instant::now();
    let mut next_frame = started;
    let mut was_paused = false;

    loop {
        {
            let mut state = control.state.lock();
            while !state.released && !state.host_stopped && Instant::now() < next_frame {
                control.wake.wait_until(&mut state, next_frame);
            }
            if state.released {
                break;
            }
            if state.host_stopped {
                drop(state);
                info!("Virtual display stopped by host");
                callback.on_stopped();
                break;
            }
        }

        if surface.is_released() {
            // Host-side pause: nothing to draw into until release
            if !was_paused {
                was_paused = true;
                callback.on_paused();
            }
        } else {
            let timestamp_us = started.elapsed().as_micros() as u64;
            if surface.post_frame(painter.next_frame(), timestamp_us) {
                frames_posted.fetch_add(1, Ordering::Relaxed);
            }
        }

        next_frame += interval;
        let now = Instant::now();
        if next_frame < now {
            // Running behind; skip ahead instead of bursting
            next_frame = now;
        }
    }
}

/// Gradient background with a bar sweeping left to right.
///
/// Only the columns touched by the bar are repainted per frame.
struct TestPattern {
    width: usize,
    height: usize,
    frame: Vec<u8>,
    background: Vec<u8>,
    bar_x: usize,
    bar_width: usize,
}

impl TestPattern {
    fn new(width: u32, height: u32) -> Self {
        let (width, height) = (width as usize, height as usize);
        let mut background = vec![0u8; width * height * BYTES_PER_PIXEL];
        for y in 0..height {
            let shade = (y * 255 / height.max(1)) as u8;
            for x in 0..width {
                let at = (y * width + x) * BYTES_PER_PIXEL;
                background[at] = shade;
                background[at + 1] = (x * 255 / width.max(1)) as u8;
                background[at + 2] = 0x40;
                background[at + 3] = 0xFF;
            }
        }

        Self {
            width,
            height,
            frame: background.clone(),
            background,
            bar_x: 0,
            bar_width: (width / 32).max(1),
        }
    }

    fn paint_bar(&mut self, x0: usize, on: bool) {
        let x1 = (x0 + self.bar_width).min(self.width);
        for y in 0..self.height {
            let start = (y * self.width + x0) * BYTES_PER_PIXEL;
            let end = (y * self.width + x1) * BYTES_PER_PIXEL;
            if on {
                self.frame[start..end].fill(0xFF);
            } else {
                self.frame[start..end].copy_from_slice(&self.background[start..end]);
            }
        }
    }

    fn next_frame(&mut self) -> &[u8] {
        self.paint_bar(self.bar_x, false);
        self.bar_x = (self.bar_x + self.bar_width / 2 + 1) % self.width;
        self.paint_bar(self.bar_x, true);
        &self.frame
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::SurfaceSink;
    use std::sync::atomic::{AtomicBool, AtomicUsize};

    #[derive(Default)]
    struct CountingSink {
        frames: AtomicUsize,
        released: AtomicBool,
    }

    impl SurfaceSink for CountingSink {
        fn post_frame(&self, frame: &[u8], _timestamp_us: u64) -> bool {
            assert_eq!(frame.len(), self.frame_size());
            self.frames.fetch_add(1, Ordering::SeqCst);
            true
        }

        fn frame_size(&self) -> usize {
            16 * 8 * BYTES_PER_PIXEL
        }

        fn release(&self) {
            self.released.store(true, Ordering::SeqCst);
        }

        fn is_released(&self) -> bool {
            self.released.load(Ordering::SeqCst)
        }
    }

    #[derive(Default)]
    struct StopFlag(AtomicBool);

    impl DisplayCallback for StopFlag {
        fn on_stopped(&self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    fn request(sink: Arc<CountingSink>, callback: Arc<StopFlag>) -> DisplayRequest {
        DisplayRequest {
            name: "test-display".to_string(),
            width: 16,
            height: 8,
            frame_rate: 100,
            surface: InputSurface::new(sink),
            callback,
        }
    }

    #[test]
    fn test_compositor_posts_frames_until_release() {
        let sink = Arc::new(CountingSink::default());
        let callback = Arc::new(StopFlag::default());
        let mut display = SyntheticDisplay::start(request(sink.clone(), callback.clone())).unwrap();

        std::thread::sleep(Duration::from_millis(100));
        display.release();

        let posted = sink.frames.load(Ordering::SeqCst);
        assert!(posted >= 3, "only {} frames posted", posted);
        assert!(!callback.0.load(Ordering::SeqCst));
    }

    #[test]
    fn test_host_stop_fires_callback() {
        let sink = Arc::new(CountingSink::default());
        let callback = Arc::new(StopFlag::default());
        let mut display = SyntheticDisplay::start(request(sink, callback.clone())).unwrap();

        display.stop_trigger().fire();
        for _ in 0..100 {
            if callback.0.load(Ordering::SeqCst) {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(callback.0.load(Ordering::SeqCst));
        display.release();
    }

    #[test]
    fn test_mismatched_surface_rejected() {
        let sink = Arc::new(CountingSink::default());
        let mut req = request(sink, Arc::new(StopFlag::default()));
        req.width = 32;
        assert!(SyntheticDisplay::start(req).is_err());
    }

    #[test]
    fn test_pattern_moves_between_frames() {
        let mut pattern = TestPattern::new(64, 4);
        let first = pattern.next_frame().to_vec();
        let second = pattern.next_frame().to_vec();
        assert_ne!(first, second);
        assert_eq!(first.len(), 64 * 4 * BYTES_PER_PIXEL);
    }
}
