//! Audio input selection and discovery.
//!
//! Audio is never read by this crate; an [`AudioInput`] names a capture
//! device that the encoder opens itself.

use serde::Serialize;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

const PROC_PCM: &str = "/proc/asound/pcm";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioBackend {
    Alsa,
    Pulse,
}

impl AudioBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Alsa => "alsa",
            Self::Pulse => "pulse",
        }
    }
}

/// A concrete capture device, e.g. `alsa:hw:1,0`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AudioInput {
    pub backend: AudioBackend,
    pub device: String,
}

impl fmt::Display for AudioInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.backend.as_str(), self.device)
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AudioError {
    #[error("unknown audio backend in {0:?} (expected alsa:<dev> or pulse:<dev>)")]
    UnknownBackend(String),
    #[error("empty audio device name in {0:?}")]
    EmptyDevice(String),
    #[error("audio device not available: {0}")]
    NotAvailable(String),
}

/// How the pipeline should pick its audio input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AudioSelection {
    /// First capture PCM the kernel reports.
    Auto,
    /// Video-only recordings.
    Disabled,
    Explicit(AudioInput),
}

impl FromStr for AudioSelection {
    type Err = AudioError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        match s {
            "" | "auto" => return Ok(Self::Auto),
            "none" | "off" => return Ok(Self::Disabled),
            _ => {}
        }

        let (backend, device) = s
            .split_once(':')
            .ok_or_else(|| AudioError::UnknownBackend(s.to_string()))?;
        let backend = match backend {
            "alsa" => AudioBackend::Alsa,
            "pulse" => AudioBackend::Pulse,
            _ => return Err(AudioError::UnknownBackend(s.to_string())),
        };
        if device.is_empty() {
            return Err(AudioError::EmptyDevice(s.to_string()));
        }
        Ok(Self::Explicit(AudioInput {
            backend,
            device: device.to_string(),
        }))
    }
}

/// All ALSA capture PCMs listed in `/proc/asound/pcm`.
pub fn list_inputs() -> Vec<AudioInput> {
    match std::fs::read_to_string(PROC_PCM) {
        Ok(contents) => parse_proc_pcm(&contents),
        Err(e) => {
            tracing::debug!(path = PROC_PCM, error = %e, "no ALSA pcm listing");
            Vec::new()
        }
    }
}

/// The first capture PCM, if any.
pub fn first_available() -> Option<AudioInput> {
    list_inputs().into_iter().next()
}

/// Resolve a selection to a device, checking explicit ALSA devices exist.
///
/// `Auto` with no capture hardware resolves to `Ok(None)`; an explicit
/// device that is missing is an error.
pub fn resolve(selection: &AudioSelection) -> Result<Option<AudioInput>, AudioError> {
    match selection {
        AudioSelection::Disabled => Ok(None),
        AudioSelection::Auto => Ok(first_available()),
        AudioSelection::Explicit(input) => {
            if input.backend == AudioBackend::Alsa && Path::new(PROC_PCM).exists() {
                let known = list_inputs();
                if !known.iter().any(|k| alsa_aliases_match(&k.device, &input.device)) {
                    return Err(AudioError::NotAvailable(input.to_string()));
                }
            }
            Ok(Some(input.clone()))
        }
    }
}

// `plughw:1,0` and `hw:1,0` address the same PCM; named ALSA devices
// (`default`, `dsnoop`) are not in /proc and are accepted as-is.
fn alsa_aliases_match(known: &str, requested: &str) -> bool {
    match requested.split_once(':') {
        Some(("hw" | "plughw", rest)) => known.split_once(':').map(|(_, k)| k) == Some(rest),
        _ => true,
    }
}

/// Parse lines like `01-00: USB Audio : USB Audio : capture 1`.
fn parse_proc_pcm(contents: &str) -> Vec<AudioInput> {
    contents
        .lines()
        .filter(|line| line.contains("capture"))
        .filter_map(|line| {
            let (id, _) = line.split_once(':')?;
            let (card, dev) = id.trim().split_once('-')?;
            let card: u32 = card.parse().ok()?;
            let dev: u32 = dev.parse().ok()?;
            Some(AudioInput {
                backend: AudioBackend::Alsa,
                device: format!("hw:{card},{dev}"),
            })
        })
        .collect()
}
