//! facetrace-hw: Hardware abstraction for camera capture and audio input discovery.
//!
//! Provides V4L2-based camera access producing RGB frames, plus the
//! microphone selection the encoder records from.

pub mod audio;
pub mod camera;
pub mod frame;
pub mod media;

pub use audio::{AudioBackend, AudioError, AudioInput, AudioSelection};
pub use camera::{Camera, CameraError, DeviceInfo, PixelFormat};
pub use frame::{Frame, FrameError};
pub use media::{MediaDevices, MediaError, MediaRequest, MediaStream};
