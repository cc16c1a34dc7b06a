//! V4L2 media backend via the `v4l` crate.

use crate::camera::{CameraError, FacingMode, MediaDevices, VideoConstraints, VideoStream};
use crate::frame::{self, Frame};
use crate::worker::{serve, CaptureWorker};
use async_trait::async_trait;
use std::io;
use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::mpsc;
use std::time::Duration;
use v4l::buffer::Type as BufType;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

const CAPTURE_BUFFERS: u32 = 4;
/// Upper bound on one blocking dequeue, and so on how long a stop waits.
const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Info about a discovered V4L2 capture device.
#[derive(Debug, Clone, serde::Serialize)]
pub struct DeviceInfo {
    pub path: String,
    pub name: String,
    pub driver: String,
    pub bus: String,
}

/// Negotiated pixel format, always converted to 8-bit grayscale.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// YUYV 4:2:2 packed, luma extracted.
    Yuyv,
    /// 8-bit grayscale.
    Grey,
    /// 16-bit little-endian grayscale, high byte kept.
    Y16,
}

impl PixelFormat {
    fn from_fourcc(fourcc: FourCC) -> Option<Self> {
        if fourcc == FourCC::new(b"YUYV") {
            Some(Self::Yuyv)
        } else if fourcc == FourCC::new(b"GREY") {
            Some(Self::Grey)
        } else if fourcc == FourCC::new(b"Y16 ") || fourcc == FourCC::new(b"Y16\0") {
            Some(Self::Y16)
        } else {
            None
        }
    }

    fn to_grayscale(self, buf: &[u8], width: u32, height: u32) -> Result<Vec<u8>, CameraError> {
        let converted = match self {
            Self::Yuyv => frame::yuyv_to_grayscale(buf, width, height),
            Self::Y16 => frame::y16_to_grayscale(buf, width, height),
            Self::Grey => {
                let pixels = width as usize * height as usize;
                if buf.len() < pixels {
                    return Err(CameraError::CaptureFailed(format!(
                        "GREY buffer too short: expected {pixels}, got {}",
                        buf.len()
                    )));
                }
                Ok(buf[..pixels].to_vec())
            }
        };
        converted.map_err(|e| CameraError::CaptureFailed(e.to_string()))
    }
}

/// [`MediaDevices`] backed by a single V4L2 node (e.g. `/dev/video0`).
pub struct V4lDevices {
    device_path: String,
    warmup_frames: usize,
}

impl V4lDevices {
    pub fn new(device_path: impl Into<String>, warmup_frames: usize) -> Self {
        Self {
            device_path: device_path.into(),
            warmup_frames,
        }
    }

    pub fn device_path(&self) -> &str {
        &self.device_path
    }

    /// List V4L2 nodes that support video capture.
    pub fn list() -> Vec<DeviceInfo> {
        (0..16)
            .map(|i| format!("/dev/video{i}"))
            .filter(|path| Path::new(path).exists())
            .filter_map(|path| {
                let dev = Device::with_path(&path).ok()?;
                let caps = dev.query_caps().ok()?;
                caps.capabilities
                    .contains(v4l::capability::Flags::VIDEO_CAPTURE)
                    .then(|| DeviceInfo {
                        path,
                        name: caps.card.clone(),
                        driver: caps.driver.clone(),
                        bus: caps.bus.clone(),
                    })
            })
            .collect()
    }
}

#[async_trait]
impl MediaDevices for V4lDevices {
    async fn open_video(
        &self,
        constraints: &VideoConstraints,
    ) -> Result<Box<dyn VideoStream>, CameraError> {
        let path = self.device_path.clone();
        let constraints = constraints.clone();
        let warmup = self.warmup_frames;

        let stream = tokio::task::spawn_blocking(move || V4lStream::open(&path, &constraints, warmup))
            .await
            .map_err(|e| CameraError::CaptureFailed(format!("camera open task failed: {e}")))??;

        Ok(Box::new(stream))
    }
}

/// Size and layout of the frames a stream delivers.
#[derive(Debug, Clone, Copy)]
struct FrameLayout {
    width: u32,
    height: u32,
    pixel_format: PixelFormat,
}

/// An open V4L2 capture stream.
///
/// The device and its single mmap stream live on a dedicated capture
/// thread; stopping the stream joins that thread, which closes the node.
pub struct V4lStream {
    worker: Option<CaptureWorker>,
    label: String,
}

impl V4lStream {
    fn open(
        device_path: &str,
        constraints: &VideoConstraints,
        warmup_frames: usize,
    ) -> Result<Self, CameraError> {
        if !Path::new(device_path).exists() {
            return Err(CameraError::DeviceUnavailable(format!("{device_path}: no such device")));
        }

        // EACCES and EBUSY both mean the platform refused us the camera.
        let device = Device::with_path(device_path)
            .map_err(|e| CameraError::DeviceUnavailable(format!("{device_path}: {e}")))?;

        let caps = device.query_caps().map_err(|e| {
            CameraError::DeviceUnavailable(format!("{device_path}: failed to query capabilities: {e}"))
        })?;
        if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
            return Err(CameraError::DeviceUnavailable(format!(
                "{device_path} is not a video capture device"
            )));
        }

        if constraints.facing_mode != FacingMode::User {
            tracing::debug!(
                facing_mode = ?constraints.facing_mode,
                "facing mode hint has no V4L2 equivalent; ignored"
            );
        }

        let mut fmt = device.format().map_err(|e| {
            CameraError::FormatNegotiationFailed(format!("failed to get format: {e}"))
        })?;
        fmt.fourcc = FourCC::new(b"YUYV");
        fmt.width = constraints.ideal_width;
        fmt.height = constraints.ideal_height;

        let negotiated = device.set_format(&fmt).map_err(|e| {
            CameraError::FormatNegotiationFailed(format!("failed to set format: {e}"))
        })?;
        let pixel_format = PixelFormat::from_fourcc(negotiated.fourcc).ok_or_else(|| {
            CameraError::FormatNegotiationFailed(format!(
                "unsupported pixel format: {:?} (need YUYV, GREY, or Y16)",
                negotiated.fourcc
            ))
        })?;

        tracing::info!(
            device = device_path,
            card = %caps.card,
            width = negotiated.width,
            height = negotiated.height,
            ?pixel_format,
            "opened V4L2 camera"
        );

        let layout = FrameLayout {
            width: negotiated.width,
            height: negotiated.height,
            pixel_format,
        };
        let (ready_tx, ready_rx) = mpsc::sync_channel(1);

        let worker = CaptureWorker::spawn("v4l-capture", move |stop, requests| {
            let mut stream =
                match MmapStream::with_buffers(&device, BufType::VideoCapture, CAPTURE_BUFFERS) {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(CameraError::CaptureFailed(format!(
                            "failed to create mmap stream: {e}"
                        ))));
                        return;
                    }
                };
            stream.set_timeout(POLL_INTERVAL);

            // Let auto-exposure settle before anyone looks at a frame.
            for _ in 0..warmup_frames {
                if stop.load(Ordering::Acquire) {
                    break;
                }
                match poll_frame(&mut stream, layout) {
                    Ok(Some(_)) => {}
                    Ok(None) => tracing::debug!("warm-up frame timed out"),
                    Err(e) => tracing::debug!(error = %e, "warm-up frame dropped"),
                }
            }

            if ready_tx.send(Ok(())).is_err() {
                return;
            }
            serve(|| poll_frame(&mut stream, layout), &stop, requests);
            tracing::debug!("capture thread exiting");
        })?;

        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                return Err(CameraError::CaptureFailed(
                    "capture thread exited during start-up".into(),
                ))
            }
        }

        Ok(Self {
            worker: Some(worker),
            label: format!("{} ({device_path})", caps.card),
        })
    }
}

/// Dequeue one buffer, waiting at most [`POLL_INTERVAL`].
fn poll_frame(stream: &mut MmapStream<'_>, layout: FrameLayout) -> Result<Option<Frame>, CameraError> {
    match stream.next() {
        Ok((buf, meta)) => {
            let gray = layout
                .pixel_format
                .to_grayscale(buf, layout.width, layout.height)?;
            Ok(Some(Frame::from_gray(gray, layout.width, layout.height, meta.sequence)))
        }
        Err(e) if e.kind() == io::ErrorKind::TimedOut => Ok(None),
        Err(e) => Err(CameraError::CaptureFailed(format!("failed to dequeue buffer: {e}"))),
    }
}

#[async_trait]
impl VideoStream for V4lStream {
    fn label(&self) -> &str {
        &self.label
    }

    fn is_live(&self) -> bool {
        self.worker.as_ref().is_some_and(|w| w.is_running())
    }

    async fn read_frame(&mut self) -> Result<Frame, CameraError> {
        let worker = self.worker.as_ref().ok_or(CameraError::StreamStopped)?;
        let reply = worker.request()?;
        reply.await.map_err(|_| CameraError::StreamStopped)?
    }

    fn stop(&mut self) {
        if let Some(mut worker) = self.worker.take() {
            worker.shutdown();
            tracing::debug!(stream = %self.label, "V4L2 stream stopped");
        }
    }
}
