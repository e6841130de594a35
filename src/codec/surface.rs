use std::sync::Arc;

/// Receiving end of a writable surface.
pub trait SurfaceSink: Send + Sync {
    /// Submit one raw frame; returns `false` if the frame was not accepted
    fn post_frame(&self, frame: &[u8], timestamp_us: u64) -> bool;

    /// Exact byte length of one frame
    fn frame_size(&self) -> usize;

    fn release(&self);

    fn is_released(&self) -> bool;
}

/// Writable surface feeding an encoder, handed to the compositor.
///
/// Cloning shares the same surface; releasing any clone releases it for all.
#[derive(Clone)]
pub struct InputSurface {
    sink: Arc<dyn SurfaceSink>,
}

impl InputSurface {
    pub fn new(sink: Arc<dyn SurfaceSink>) -> Self {
        Self { sink }
    }

    pub fn post_frame(&self, frame: &[u8], timestamp_us: u64) -> bool {
        self.sink.post_frame(frame, timestamp_us)
    }

    pub fn frame_size(&self) -> usize {
        self.sink.frame_size()
    }

    pub fn release(&self) {
        self.sink.release();
    }

    pub fn is_released(&self) -> bool {
        self.sink.is_released()
    }
}

impl std::fmt::Debug for InputSurface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InputSurface")
            .field("frame_size", &self.frame_size())
            .field("released", &self.is_released())
            .finish()
    }
}
