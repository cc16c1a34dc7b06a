//! Display surfaces a camera stream is bound to while a session is live.

use crate::frame::Frame;
use std::sync::{Arc, Mutex, MutexGuard};

/// Sink that shows the live stream (a preview window, a video element, ...).
///
/// The camera session binds exactly one surface for its lifetime and presents
/// every frame it decodes to it.
pub trait DisplaySurface: Send {
    /// Bind the surface to a stream.
    fn attach(&mut self, stream_label: &str);
    /// Show a decoded frame.
    fn present(&mut self, frame: &Frame);
    /// Unbind from the stream and clear any displayed content.
    fn detach(&mut self);
}

#[derive(Default)]
struct PreviewState {
    bound_to: Option<String>,
    latest: Option<Frame>,
    presented: u64,
}

/// Headless surface that keeps the most recently presented frame.
///
/// Clones share state, so a caller can keep a handle for inspection
/// (diagnostics, snapshots) while the camera manager owns the other.
#[derive(Clone, Default)]
pub struct PreviewSurface {
    state: Arc<Mutex<PreviewState>>,
}

impl PreviewSurface {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, PreviewState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Label of the stream currently bound, if any.
    pub fn bound_to(&self) -> Option<String> {
        self.lock().bound_to.clone()
    }

    /// Most recent frame presented while bound.
    pub fn latest(&self) -> Option<Frame> {
        self.lock().latest.clone()
    }

    /// Total frames presented since creation.
    pub fn presented(&self) -> u64 {
        self.lock().presented
    }
}

impl DisplaySurface for PreviewSurface {
    fn attach(&mut self, stream_label: &str) {
        tracing::debug!(stream = stream_label, "preview surface bound");
        self.lock().bound_to = Some(stream_label.to_string());
    }

    fn present(&mut self, frame: &Frame) {
        let mut state = self.lock();
        state.latest = Some(frame.clone());
        state.presented += 1;
    }

    fn detach(&mut self) {
        let mut state = self.lock();
        state.bound_to = None;
        state.latest = None;
    }
}
