//! facegate-hw — camera capture for the access-control loop.
//!
//! Provides V4L2-based camera access and the [`FrameSource`] trait the
//! loop pulls frames through.

pub mod camera;
pub mod frame;

pub use camera::{Camera, CameraError, CameraStream, FrameSource, PixelFormat};
pub use frame::{Frame, FrameError};
