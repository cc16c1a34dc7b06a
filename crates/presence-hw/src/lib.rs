//! presence-hw: Camera access for the attendance pipeline.
//!
//! Owns the camera session lifecycle (acquire, bind to a display surface,
//! release) and provides a V4L2 backend plus grayscale frame utilities.

pub mod camera;
pub mod frame;
pub mod surface;
pub mod v4l_device;
mod worker;

pub use camera::{
    CameraError, CameraManager, CameraSession, FacingMode, FrameSource, MediaDevices, Readiness,
    VideoConstraints, VideoStream,
};
pub use frame::Frame;
pub use surface::{DisplaySurface, PreviewSurface};
pub use v4l_device::{DeviceInfo, V4lDevices};
