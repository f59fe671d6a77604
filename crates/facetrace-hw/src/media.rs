//! Combined camera + microphone acquisition.

use crate::audio::{self, AudioError, AudioInput, AudioSelection};
use crate::camera::{Camera, CameraError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MediaError {
    #[error("camera: {0}")]
    Camera(#[from] CameraError),
    #[error("microphone: {0}")]
    Audio(#[from] AudioError),
}

/// What to acquire.
#[derive(Debug, Clone)]
pub struct MediaRequest {
    pub camera_device: String,
    pub width: u32,
    pub height: u32,
    pub audio: AudioSelection,
}

/// An opened camera plus the audio input recordings should use, if any.
pub struct MediaStream {
    pub camera: Camera,
    pub audio: Option<AudioInput>,
}

pub struct MediaDevices;

impl MediaDevices {
    /// Open the camera and resolve the microphone in one request.
    ///
    /// The camera is mandatory. With `AudioSelection::Auto` a machine without
    /// capture hardware degrades to video-only; an explicitly requested
    /// microphone that cannot be found fails the request.
    pub fn acquire(request: &MediaRequest) -> Result<MediaStream, MediaError> {
        let camera = Camera::open(&request.camera_device, request.width, request.height)?;

        let audio = audio::resolve(&request.audio)?;
        match (&audio, &request.audio) {
            (Some(input), _) => tracing::info!(audio = %input, "audio input selected"),
            (None, AudioSelection::Auto) => {
                tracing::warn!("no audio capture device found, recording video only")
            }
            (None, _) => tracing::info!("audio disabled, recording video only"),
        }

        Ok(MediaStream { camera, audio })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_without_camera_is_fatal() {
        let request = MediaRequest {
            camera_device: "/dev/facetrace-missing".into(),
            width: 640,
            height: 480,
            audio: AudioSelection::Disabled,
        };
        match MediaDevices::acquire(&request) {
            Err(MediaError::Camera(CameraError::DeviceNotFound(_))) => {}
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("acquired a missing camera"),
        }
    }
}
