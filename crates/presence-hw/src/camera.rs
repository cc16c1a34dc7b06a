//! Camera session manager: acquire a video stream, bind it to a display
//! surface, wait for the first decoded frame, release deterministically.

use crate::frame::Frame;
use crate::surface::DisplaySurface;
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Default bound on the wait for the first decoded frame.
pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("camera unavailable: {0}")]
    DeviceUnavailable(String),
    #[error("no display surface available to bind the camera stream")]
    DisplaySurfaceMissing,
    #[error("capture failed: {0}")]
    CaptureFailed(String),
    #[error("format negotiation failed: {0}")]
    FormatNegotiationFailed(String),
    #[error("camera stream has been stopped")]
    StreamStopped,
}

/// Which way the requested camera should face.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FacingMode {
    User,
    Environment,
}

/// Hints for a video-only stream request. Backends treat every field as
/// "ideal": the nearest mode the hardware supports is accepted.
#[derive(Debug, Clone, Serialize)]
pub struct VideoConstraints {
    pub facing_mode: FacingMode,
    pub ideal_width: u32,
    pub ideal_height: u32,
}

impl Default for VideoConstraints {
    fn default() -> Self {
        Self {
            facing_mode: FacingMode::User,
            ideal_width: 640,
            ideal_height: 480,
        }
    }
}

/// Platform media access (permission prompt + device open).
#[async_trait]
pub trait MediaDevices: Send + Sync {
    /// Request a video-only stream. Permission or hardware rejection must be
    /// reported as [`CameraError::DeviceUnavailable`].
    async fn open_video(
        &self,
        constraints: &VideoConstraints,
    ) -> Result<Box<dyn VideoStream>, CameraError>;
}

/// A live video stream made of one or more tracks.
#[async_trait]
pub trait VideoStream: Send {
    fn label(&self) -> &str;
    /// False once [`stop`](Self::stop) has run.
    fn is_live(&self) -> bool;
    async fn read_frame(&mut self) -> Result<Frame, CameraError>;
    /// Stop every track. Calling it twice is a no-op.
    fn stop(&mut self);
}

/// Read-only view of a bound stream used by frame consumers.
#[async_trait]
pub trait FrameSource: Send {
    /// True once at least one frame has been decoded and presented.
    fn is_ready(&self) -> bool;
    /// Wait for the first decoded frame, up to `timeout`. Returns readiness.
    async fn wait_ready(&mut self, timeout: Duration) -> bool;
    /// Decode the next frame.
    async fn grab(&mut self) -> Result<Frame, CameraError>;
}

/// Whether the first frame arrived before the acquisition deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    TimedOut,
}

/// A live stream bound to a display surface.
pub struct CameraSession {
    stream: Box<dyn VideoStream>,
    surface: Box<dyn DisplaySurface>,
    readiness: Readiness,
    frames_presented: u64,
}

impl CameraSession {
    pub fn readiness(&self) -> Readiness {
        self.readiness
    }

    pub fn label(&self) -> &str {
        self.stream.label()
    }

    pub fn is_live(&self) -> bool {
        self.stream.is_live()
    }

    pub fn frames_presented(&self) -> u64 {
        self.frames_presented
    }

    fn present(&mut self, frame: &Frame) {
        self.surface.present(frame);
        self.readiness = Readiness::Ready;
        self.frames_presented += 1;
    }
}

#[async_trait]
impl FrameSource for CameraSession {
    fn is_ready(&self) -> bool {
        self.readiness == Readiness::Ready
    }

    async fn wait_ready(&mut self, timeout: Duration) -> bool {
        if self.is_ready() {
            return true;
        }
        let first = tokio::time::timeout(timeout, self.stream.read_frame()).await;
        match first {
            Ok(Ok(frame)) => {
                self.present(&frame);
                true
            }
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "frame read failed while waiting for readiness");
                false
            }
            Err(_) => false,
        }
    }

    async fn grab(&mut self) -> Result<Frame, CameraError> {
        if !self.stream.is_live() {
            return Err(CameraError::StreamStopped);
        }
        let frame = self.stream.read_frame().await?;
        self.present(&frame);
        Ok(frame)
    }
}

/// Sole owner of the active camera stream.
///
/// At most one session is live at a time; acquiring again releases the
/// previous one first. The display surface moves into the session on
/// acquisition and back into the manager on release.
pub struct CameraManager {
    devices: Arc<dyn MediaDevices>,
    surface: Option<Box<dyn DisplaySurface>>,
    active: Option<CameraSession>,
    ready_timeout: Duration,
}

impl CameraManager {
    pub fn new(devices: Arc<dyn MediaDevices>, surface: Option<Box<dyn DisplaySurface>>) -> Self {
        Self {
            devices,
            surface,
            active: None,
            ready_timeout: DEFAULT_READY_TIMEOUT,
        }
    }

    pub fn with_ready_timeout(mut self, timeout: Duration) -> Self {
        self.ready_timeout = timeout;
        self
    }

    pub fn ready_timeout(&self) -> Duration {
        self.ready_timeout
    }

    /// Install (or replace) the surface used by the next acquisition.
    pub fn set_surface(&mut self, surface: Box<dyn DisplaySurface>) {
        self.surface = Some(surface);
    }

    pub fn is_active(&self) -> bool {
        self.active.as_ref().is_some_and(|s| s.is_live())
    }

    pub fn session_mut(&mut self) -> Option<&mut CameraSession> {
        self.active.as_mut()
    }

    /// Open a stream, bind it to the surface and wait for the first frame.
    ///
    /// If no frame arrives within the ready timeout the session is returned
    /// anyway with [`Readiness::TimedOut`] and a warning is logged.
    pub async fn acquire(
        &mut self,
        constraints: &VideoConstraints,
    ) -> Result<&mut CameraSession, CameraError> {
        if self.active.is_some() {
            tracing::debug!("releasing previous camera session before re-acquiring");
            self.release();
        }

        let mut surface = self.surface.take().ok_or(CameraError::DisplaySurfaceMissing)?;

        let mut stream = match self.devices.open_video(constraints).await {
            Ok(stream) => stream,
            Err(e) => {
                self.surface = Some(surface);
                return Err(e);
            }
        };
        surface.attach(stream.label());

        let first = tokio::time::timeout(self.ready_timeout, stream.read_frame()).await;
        let (readiness, frames_presented) = match first {
            Ok(Ok(frame)) => {
                surface.present(&frame);
                (Readiness::Ready, 1)
            }
            Ok(Err(e)) => {
                stream.stop();
                surface.detach();
                self.surface = Some(surface);
                return Err(e);
            }
            Err(_) => {
                tracing::warn!(
                    stream = stream.label(),
                    timeout_ms = self.ready_timeout.as_millis() as u64,
                    "no frame decoded before the ready timeout; continuing without readiness"
                );
                (Readiness::TimedOut, 0)
            }
        };

        tracing::info!(
            stream = stream.label(),
            width = constraints.ideal_width,
            height = constraints.ideal_height,
            ?readiness,
            "camera session acquired"
        );

        Ok(self.active.insert(CameraSession {
            stream,
            surface,
            readiness,
            frames_presented,
        }))
    }

    /// Stop all tracks and unbind the surface. Returns whether a session was
    /// active; safe to call repeatedly.
    pub fn release(&mut self) -> bool {
        let Some(mut session) = self.active.take() else {
            return false;
        };
        session.stream.stop();
        session.surface.detach();
        tracing::info!(
            stream = session.stream.label(),
            frames = session.frames_presented,
            "camera session released"
        );
        self.surface = Some(session.surface);
        true
    }
}

impl Drop for CameraManager {
    fn drop(&mut self) {
        self.release();
    }
}
