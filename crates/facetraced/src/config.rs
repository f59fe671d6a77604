use facetrace_hw::{AudioSelection, MediaRequest};
use std::path::PathBuf;
use std::time::Duration;

/// Daemon configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// V4L2 device path (default: /dev/video0).
    pub camera_device: String,
    /// Requested capture width; the driver may pick the nearest supported size.
    pub capture_width: u32,
    pub capture_height: u32,
    /// Microphone selection: `auto`, `none`, `alsa:<dev>` or `pulse:<dev>`.
    pub audio: AudioSelection,
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// Path to the SQLite artifact database.
    pub db_path: PathBuf,
    /// Compositor and encoder frame rate.
    pub fps: u32,
    /// Detection loop pacing (display refresh interval).
    pub detect_interval: Duration,
    /// Explicit ffmpeg binary; otherwise looked up on `PATH`.
    pub ffmpeg: Option<PathBuf>,
}

impl Config {
    /// Load configuration from `FACETRACE_*` environment variables with defaults.
    pub fn from_env() -> Self {
        let model_dir = std::env::var("FACETRACE_MODEL_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| facetrace_core::default_model_dir());

        let db_path = std::env::var("FACETRACE_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| facetrace_store::default_db_path());

        let audio = match std::env::var("FACETRACE_AUDIO") {
            Ok(value) => value.parse().unwrap_or_else(|e| {
                tracing::warn!(value = %value, error = %e, "invalid FACETRACE_AUDIO, using auto");
                AudioSelection::Auto
            }),
            Err(_) => AudioSelection::Auto,
        };

        Self {
            camera_device: std::env::var("FACETRACE_CAMERA_DEVICE")
                .unwrap_or_else(|_| "/dev/video0".to_string()),
            capture_width: env_u32("FACETRACE_CAPTURE_WIDTH", 640),
            capture_height: env_u32("FACETRACE_CAPTURE_HEIGHT", 480),
            audio,
            model_dir,
            db_path,
            fps: env_u32("FACETRACE_FPS", 30).max(1),
            detect_interval: Duration::from_millis(
                env_u64("FACETRACE_DETECT_INTERVAL_MS", 16).max(1),
            ),
            ffmpeg: std::env::var("FACETRACE_FFMPEG").ok().map(PathBuf::from),
        }
    }

    /// The combined camera + microphone request for pipeline start.
    pub fn media_request(&self) -> MediaRequest {
        MediaRequest {
            camera_device: self.camera_device.clone(),
            width: self.capture_width,
            height: self.capture_height,
            audio: self.audio.clone(),
        }
    }

    pub fn frame_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.fps as f64)
    }
}

fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
