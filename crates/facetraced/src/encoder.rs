//! ffmpeg encoding session
//!
//! Composited frames go to ffmpeg's stdin as raw RGB24; ffmpeg opens the
//! microphone itself and writes a streamable container to stdout, which is
//! forwarded to the recorder as chunks.

use crate::recorder::{EncoderEvent, EncodingSession, EventSender, RecorderError};
use facetrace_hw::{AudioInput, Frame};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::watch;
use tracing::{debug, info, warn};

const READ_BUFFER: usize = 64 * 1024;

#[derive(Error, Debug)]
pub enum EncoderError {
    #[error("ffmpeg not found: {0}")]
    NotFound(#[from] which::Error),
    #[error("failed to query ffmpeg encoders: {0}")]
    Probe(#[from] std::io::Error),
    #[error("ffmpeg has no usable video encoder (need libvpx-vp9, libvpx, libx264 or mpeg4)")]
    NoUsableEncoder,
}

/// Output container and codecs, in preference order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Container {
    WebmVp9,
    WebmVp8,
    MatroskaH264,
    MatroskaMpeg4,
}

impl Container {
    const PREFERENCE: [Container; 4] = [
        Container::WebmVp9,
        Container::WebmVp8,
        Container::MatroskaH264,
        Container::MatroskaMpeg4,
    ];

    pub fn mime(&self) -> &'static str {
        match self {
            Self::WebmVp9 | Self::WebmVp8 => "video/webm",
            Self::MatroskaH264 | Self::MatroskaMpeg4 => "video/x-matroska",
        }
    }

    fn muxer(&self) -> &'static str {
        match self {
            Self::WebmVp9 | Self::WebmVp8 => "webm",
            Self::MatroskaH264 | Self::MatroskaMpeg4 => "matroska",
        }
    }

    fn video_codec(&self) -> &'static str {
        match self {
            Self::WebmVp9 => "libvpx-vp9",
            Self::WebmVp8 => "libvpx",
            Self::MatroskaH264 => "libx264",
            Self::MatroskaMpeg4 => "mpeg4",
        }
    }

    fn audio_codec(&self) -> &'static str {
        match self {
            Self::WebmVp9 | Self::WebmVp8 => "libopus",
            Self::MatroskaH264 | Self::MatroskaMpeg4 => "aac",
        }
    }

    fn video_options(&self) -> &'static [&'static str] {
        match self {
            Self::WebmVp9 => &["-deadline", "realtime", "-cpu-used", "8", "-row-mt", "1", "-b:v", "2M"],
            Self::WebmVp8 => &["-deadline", "realtime", "-cpu-used", "8", "-b:v", "2M"],
            Self::MatroskaH264 => &["-preset", "veryfast", "-tune", "zerolatency"],
            Self::MatroskaMpeg4 => &["-q:v", "5"],
        }
    }

    /// Pick the first container whose encoders appear in `ffmpeg -encoders`.
    /// The audio encoder only matters when there is audio to encode.
    pub fn negotiate(encoders_listing: &str, with_audio: bool) -> Option<Self> {
        let available: Vec<&str> = encoders_listing
            .lines()
            .filter_map(|line| {
                let mut fields = line.split_whitespace();
                let flags = fields.next()?;
                let name = fields.next()?;
                // Encoder rows start with a 6-char capability column like "V....D".
                (flags.len() == 6 && matches!(flags.as_bytes()[0], b'V' | b'A' | b'S'))
                    .then_some(name)
            })
            .collect();

        Self::PREFERENCE.into_iter().find(|c| {
            available.contains(&c.video_codec())
                && (!with_audio || available.contains(&c.audio_codec()))
        })
    }
}

/// Assemble the ffmpeg command line for one session.
pub fn build_args(
    container: Container,
    width: u32,
    height: u32,
    fps: u32,
    audio: Option<&AudioInput>,
) -> Vec<String> {
    let mut args: Vec<String> = ["-hide_banner", "-loglevel", "warning", "-nostdin"]
        .iter()
        .map(ToString::to_string)
        .collect();

    // Composited frames, raw on stdin
    args.extend(
        [
            "-f", "rawvideo",
            "-pix_fmt", "rgb24",
            "-video_size", &format!("{width}x{height}"),
            "-framerate", &fps.to_string(),
            "-i", "pipe:0",
        ]
        .iter()
        .map(ToString::to_string),
    );

    if let Some(input) = audio {
        args.extend(
            [
                "-thread_queue_size", "512",
                "-f", input.backend.as_str(),
                "-i", &input.device,
            ]
            .iter()
            .map(ToString::to_string),
        );
    }

    args.extend(["-map", "0:v"].iter().map(ToString::to_string));
    if audio.is_some() {
        args.extend(["-map", "1:a"].iter().map(ToString::to_string));
    }

    args.push("-c:v".into());
    args.push(container.video_codec().into());
    args.extend(container.video_options().iter().map(ToString::to_string));
    args.extend(["-pix_fmt", "yuv420p"].iter().map(ToString::to_string));

    if audio.is_some() {
        args.push("-c:a".into());
        args.push(container.audio_codec().into());
        // The microphone never ends on its own; stop with the video.
        args.push("-shortest".into());
    }

    args.extend(["-f", container.muxer(), "pipe:1"].iter().map(ToString::to_string));
    args
}

/// Encoding session backed by an ffmpeg subprocess per recording.
pub struct FfmpegEncoder {
    ffmpeg: PathBuf,
    container: Container,
    frames: watch::Receiver<Option<Arc<Frame>>>,
    audio: Option<AudioInput>,
    fps: u32,
    stop_tx: Option<watch::Sender<bool>>,
}

impl FfmpegEncoder {
    /// Locate ffmpeg and negotiate the container once.
    pub async fn new(
        ffmpeg: Option<PathBuf>,
        frames: watch::Receiver<Option<Arc<Frame>>>,
        audio: Option<AudioInput>,
        fps: u32,
    ) -> Result<Self, EncoderError> {
        let ffmpeg = match ffmpeg {
            Some(path) => path,
            None => which::which("ffmpeg")?,
        };

        let output = Command::new(&ffmpeg)
            .args(["-hide_banner", "-encoders"])
            .stdin(Stdio::null())
            .stderr(Stdio::null())
            .output()
            .await?;
        let listing = String::from_utf8_lossy(&output.stdout);
        let container =
            Container::negotiate(&listing, audio.is_some()).ok_or(EncoderError::NoUsableEncoder)?;

        info!(
            ffmpeg = %ffmpeg.display(),
            codec = container.video_codec(),
            mime = container.mime(),
            audio = audio.is_some(),
            "encoder negotiated"
        );

        Ok(Self::with_container(ffmpeg, container, frames, audio, fps))
    }

    pub fn with_container(
        ffmpeg: PathBuf,
        container: Container,
        frames: watch::Receiver<Option<Arc<Frame>>>,
        audio: Option<AudioInput>,
        fps: u32,
    ) -> Self {
        Self {
            ffmpeg,
            container,
            frames,
            audio,
            fps,
            stop_tx: None,
        }
    }

    pub fn container(&self) -> Container {
        self.container
    }
}

/// The frame a session starts from. Marks it seen so the feeder's first
/// `changed()` waits for a newer one.
fn take_first_frame(
    frames: &mut watch::Receiver<Option<Arc<Frame>>>,
) -> Result<Arc<Frame>, RecorderError> {
    frames
        .borrow_and_update()
        .clone()
        .filter(|f| f.has_dimensions())
        .ok_or(RecorderError::NoFrame)
}

impl EncodingSession for FfmpegEncoder {
    fn start(&mut self, events: EventSender) -> Result<(), RecorderError> {
        let mut frames = self.frames.clone();
        let first = take_first_frame(&mut frames)?;
        let (width, height) = (first.width(), first.height());

        let args = build_args(self.container, width, height, self.fps, self.audio.as_ref());
        debug!("ffmpeg args: {:?}", args);

        let mut child = Command::new(&self.ffmpeg)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let mut stdin = child.stdin.take().ok_or(RecorderError::Stdio("stdin"))?;
        let mut stdout = child.stdout.take().ok_or(RecorderError::Stdio("stdout"))?;
        let stderr = child.stderr.take().ok_or(RecorderError::Stdio("stderr"))?;

        let (stop_tx, mut stop_rx) = watch::channel(false);
        // Replacing a stale sender ends any feeder left from a failed session.
        self.stop_tx = Some(stop_tx);

        // Feeder: every new composited frame of the starting size, until stop.
        tokio::spawn(async move {
            let mut written = 0u64;
            let mut skipped = 0u64;
            let mut next = Some(first);
            loop {
                if let Some(frame) = next.take() {
                    if frame.image.dimensions() != (width, height) {
                        skipped += 1;
                    } else if let Err(e) = stdin.write_all(frame.image.as_raw()).await {
                        warn!(error = %e, "ffmpeg stdin closed");
                        break;
                    } else {
                        written += 1;
                    }
                }

                tokio::select! {
                    biased;
                    _ = stop_rx.changed() => break,
                    changed = frames.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        next = frames.borrow_and_update().clone();
                    }
                }
            }
            // Closing stdin lets ffmpeg flush and exit.
            drop(stdin);
            debug!(written, skipped, "encoder feeder finished");
        });

        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if line.contains("Error") || line.contains("error") {
                    warn!("ffmpeg: {}", line);
                } else {
                    debug!("ffmpeg: {}", line);
                }
            }
        });

        // Reader: stdout → chunks, then exit status → final event.
        tokio::spawn(async move {
            let mut buffer = vec![0u8; READ_BUFFER];
            let mut total_bytes = 0u64;
            loop {
                match stdout.read(&mut buffer).await {
                    Ok(0) => break,
                    Ok(n) => {
                        total_bytes += n as u64;
                        let _ = events.send(EncoderEvent::Chunk(buffer[..n].to_vec()));
                    }
                    Err(e) => {
                        let _ = child.start_kill();
                        let _ = events.send(EncoderEvent::Failed(format!("reading ffmpeg output: {e}")));
                        return;
                    }
                }
            }

            let event = match child.wait().await {
                Ok(status) if status.success() => {
                    debug!(total_bytes, "ffmpeg finished");
                    EncoderEvent::Finalized
                }
                Ok(status) => EncoderEvent::Failed(format!("ffmpeg exited with status: {status}")),
                Err(e) => EncoderEvent::Failed(format!("waiting for ffmpeg: {e}")),
            };
            let _ = events.send(event);
        });

        info!(width, height, fps = self.fps, "encoder session started");
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            stop_tx.send_replace(true);
        }
    }

    fn mime(&self) -> &str {
        self.container.mime()
    }
}
