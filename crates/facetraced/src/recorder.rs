//! Recorder: collects encoder chunks for one session and persists the result.
//!
//! A single actor task owns all recorder state. Commands arrive from
//! [`RecorderHandle`]s; encoder events arrive on a per-session channel, so an
//! old session can never append to a new one.

use facetrace_store::{Artifact, ArtifactId, ArtifactSink};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;

#[derive(Error, Debug)]
pub enum RecorderError {
    #[error("no composited frame available yet")]
    NoFrame,
    #[error("failed to spawn encoder: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("encoder {0} pipe unavailable")]
    Stdio(&'static str),
    #[error("recorder task exited")]
    ChannelClosed,
}

/// Output of an encoding session.
#[derive(Debug)]
pub enum EncoderEvent {
    Chunk(Vec<u8>),
    /// All chunks have been delivered.
    Finalized,
    /// The session died; no `Finalized` will follow.
    Failed(String),
}

pub type EventSender = mpsc::UnboundedSender<EncoderEvent>;

/// An encoder the recorder can start and stop.
pub trait EncodingSession: Send + 'static {
    /// Begin encoding; every chunk and the final event go to `events`.
    fn start(&mut self, events: EventSender) -> Result<(), RecorderError>;
    /// Ask the session to flush and finish. Completion arrives as an event.
    fn stop(&mut self);
    /// MIME type of the container this session produces.
    fn mime(&self) -> &str;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RecorderState {
    pub recording: bool,
    pub finalizing: bool,
    /// Artifacts handed to the store whose `put` has not finished.
    pub saving: usize,
}

impl RecorderState {
    /// Nothing recording, finalizing or being written.
    pub fn is_settled(&self) -> bool {
        !self.recording && !self.finalizing && self.saving == 0
    }
}

enum RecorderCommand {
    Start { reply: oneshot::Sender<bool> },
    Stop { reply: oneshot::Sender<bool> },
    State { reply: oneshot::Sender<RecorderState> },
}

/// Clone-safe handle to the recorder actor.
#[derive(Clone)]
pub struct RecorderHandle {
    tx: mpsc::Sender<RecorderCommand>,
    saved: broadcast::Sender<ArtifactId>,
}

impl RecorderHandle {
    /// Start a session. `false` if nothing started (no encoder, already
    /// recording, still finalizing, or the encoder failed to launch).
    pub async fn start(&self) -> Result<bool, RecorderError> {
        self.request(|reply| RecorderCommand::Start { reply }).await
    }

    /// Stop the active session. `false` if nothing was recording.
    pub async fn stop(&self) -> Result<bool, RecorderError> {
        self.request(|reply| RecorderCommand::Stop { reply }).await
    }

    pub async fn state(&self) -> Result<RecorderState, RecorderError> {
        self.request(|reply| RecorderCommand::State { reply }).await
    }

    pub async fn is_recording(&self) -> Result<bool, RecorderError> {
        Ok(self.state().await?.recording)
    }

    /// Receive the id of every artifact stored from now on.
    pub fn subscribe_saved(&self) -> broadcast::Receiver<ArtifactId> {
        self.saved.subscribe()
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> RecorderCommand,
    ) -> Result<T, RecorderError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(make(reply_tx))
            .await
            .map_err(|_| RecorderError::ChannelClosed)?;
        reply_rx.await.map_err(|_| RecorderError::ChannelClosed)
    }
}

pub struct Recorder<S: ArtifactSink> {
    session: Option<Box<dyn EncodingSession>>,
    sink: Arc<S>,
    chunks: Vec<Vec<u8>>,
    recording: bool,
    finalizing: bool,
    mime: String,
    events: Option<mpsc::UnboundedReceiver<EncoderEvent>>,
    saved: broadcast::Sender<ArtifactId>,
    saving: Arc<AtomicUsize>,
}

impl<S: ArtifactSink> Recorder<S> {
    pub fn new(session: Option<Box<dyn EncodingSession>>, sink: Arc<S>) -> Self {
        let (saved, _) = broadcast::channel(16);
        Self {
            session,
            sink,
            chunks: Vec::new(),
            recording: false,
            finalizing: false,
            mime: String::new(),
            events: None,
            saved,
            saving: Arc::default(),
        }
    }

    pub fn state(&self) -> RecorderState {
        RecorderState {
            recording: self.recording,
            finalizing: self.finalizing,
            saving: self.saving.load(Ordering::SeqCst),
        }
    }

    pub fn start(&mut self) -> bool {
        let Some(session) = self.session.as_mut() else {
            tracing::debug!("start ignored: no encoding session");
            return false;
        };
        if self.recording {
            tracing::debug!("start ignored: already recording");
            return false;
        }
        if self.finalizing {
            tracing::debug!("start ignored: previous recording still finalizing");
            return false;
        }

        self.chunks.clear();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        if let Err(e) = session.start(events_tx) {
            tracing::error!(error = %e, "failed to start recording");
            return false;
        }

        self.mime = session.mime().to_string();
        self.events = Some(events_rx);
        self.recording = true;
        tracing::info!(mime = %self.mime, "recording started");
        true
    }

    pub fn stop(&mut self) -> bool {
        if !self.recording {
            tracing::debug!("stop ignored: not recording");
            return false;
        }
        self.recording = false;
        self.finalizing = true;
        if let Some(session) = self.session.as_mut() {
            session.stop();
        }
        tracing::info!(chunks = self.chunks.len(), "recording stopped, finalizing");
        true
    }

    /// Apply one encoder event. `None` means the session's event stream
    /// closed without a final event.
    pub fn handle_event(&mut self, event: Option<EncoderEvent>) {
        match event {
            Some(EncoderEvent::Chunk(data)) => {
                if (self.recording || self.finalizing) && !data.is_empty() {
                    self.chunks.push(data);
                }
            }
            Some(EncoderEvent::Finalized) => {
                self.events = None;
                if self.recording || self.finalizing {
                    self.recording = false;
                    self.finalizing = false;
                    self.assemble();
                }
            }
            Some(EncoderEvent::Failed(reason)) => self.fail(&reason),
            None => self.fail("encoder event stream closed"),
        }
    }

    fn fail(&mut self, reason: &str) {
        tracing::error!(reason, dropped_chunks = self.chunks.len(), "recording failed");
        self.events = None;
        self.chunks.clear();
        self.recording = false;
        self.finalizing = false;
    }

    /// Concatenate the session's chunks and persist them on a separate task.
    fn assemble(&mut self) {
        let chunks = std::mem::take(&mut self.chunks);
        if chunks.is_empty() {
            tracing::warn!("no video data to save");
            return;
        }

        let data = chunks.concat();
        let artifact = Artifact::new(data, self.mime.clone());
        let sink = Arc::clone(&self.sink);
        let saved = self.saved.clone();
        let saving = Arc::clone(&self.saving);
        saving.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(async move {
            let size = artifact.data.len();
            match sink.put(artifact).await {
                Ok(id) => {
                    tracing::info!(id = %id, size, "recording saved");
                    let _ = saved.send(id);
                }
                Err(e) => tracing::error!(error = %e, size, "failed to save recording"),
            }
            saving.fetch_sub(1, Ordering::SeqCst);
        });
    }

    /// Run the recorder as an actor task.
    pub fn spawn(self) -> (RecorderHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(16);
        let handle = RecorderHandle {
            tx,
            saved: self.saved.clone(),
        };
        let task = tokio::spawn(self.run(rx));
        (handle, task)
    }

    async fn run(mut self, mut commands: mpsc::Receiver<RecorderCommand>) {
        loop {
            tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(RecorderCommand::Start { reply }) => {
                        let _ = reply.send(self.start());
                    }
                    Some(RecorderCommand::Stop { reply }) => {
                        let _ = reply.send(self.stop());
                    }
                    Some(RecorderCommand::State { reply }) => {
                        let _ = reply.send(self.state());
                    }
                    None => break,
                },
                event = next_event(&mut self.events) => self.handle_event(event),
            }
        }

        if self.recording {
            self.stop();
        }
        // Let an in-flight session finish so its artifact is still saved.
        while self.events.is_some() {
            let event = next_event(&mut self.events).await;
            self.handle_event(event);
        }
        tracing::debug!("recorder task exiting");
    }
}

async fn next_event(events: &mut Option<mpsc::UnboundedReceiver<EncoderEvent>>) -> Option<EncoderEvent> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use facetrace_store::StoreError;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct MemorySink {
        puts: Mutex<Vec<Artifact>>,
    }

    impl MemorySink {
        fn puts(&self) -> Vec<Artifact> {
            self.puts.lock().unwrap().clone()
        }
    }

    impl ArtifactSink for MemorySink {
        async fn put(&self, artifact: Artifact) -> Result<ArtifactId, StoreError> {
            let mut puts = self.puts.lock().unwrap();
            puts.push(artifact);
            Ok(ArtifactId(puts.len() as i64))
        }
    }

    struct FailingSink;

    impl ArtifactSink for FailingSink {
        async fn put(&self, _artifact: Artifact) -> Result<ArtifactId, StoreError> {
            Err(StoreError::Io(std::io::Error::other("disk full")))
        }
    }

    /// Session that hands its event sender to the test and, optionally,
    /// reports `Finalized` as soon as it is stopped.
    struct FakeSession {
        events: Arc<Mutex<Option<EventSender>>>,
        starts: Arc<Mutex<usize>>,
        stops: Arc<Mutex<usize>>,
        finalize_on_stop: bool,
        fail_start: bool,
    }

    impl EncodingSession for FakeSession {
        fn start(&mut self, events: EventSender) -> Result<(), RecorderError> {
            if self.fail_start {
                return Err(RecorderError::NoFrame);
            }
            *self.starts.lock().unwrap() += 1;
            *self.events.lock().unwrap() = Some(events);
            Ok(())
        }

        fn stop(&mut self) {
            *self.stops.lock().unwrap() += 1;
            if self.finalize_on_stop {
                if let Some(tx) = self.events.lock().unwrap().as_ref() {
                    let _ = tx.send(EncoderEvent::Finalized);
                }
            }
        }

        fn mime(&self) -> &str {
            "video/webm"
        }
    }

    struct Fixture {
        events: Arc<Mutex<Option<EventSender>>>,
        starts: Arc<Mutex<usize>>,
        stops: Arc<Mutex<usize>>,
        sink: Arc<MemorySink>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                events: Arc::default(),
                starts: Arc::default(),
                stops: Arc::default(),
                sink: Arc::default(),
            }
        }

        fn session(&self, finalize_on_stop: bool) -> Box<dyn EncodingSession> {
            Box::new(FakeSession {
                events: Arc::clone(&self.events),
                starts: Arc::clone(&self.starts),
                stops: Arc::clone(&self.stops),
                finalize_on_stop,
                fail_start: false,
            })
        }

        fn emit(&self, event: EncoderEvent) {
            let guard = self.events.lock().unwrap();
            guard.as_ref().unwrap().send(event).unwrap();
        }
    }

    /// Wait until the recorder has processed the final event.
    async fn wait_idle(handle: &RecorderHandle) {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let state = handle.state().await.unwrap();
                if state.is_settled() {
                    return;
                }
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("recorder never became idle");
    }

    #[tokio::test]
    async fn test_three_chunks_stored_once_with_concatenation() {
        let fx = Fixture::new();
        let (handle, _task) = Recorder::new(Some(fx.session(true)), Arc::clone(&fx.sink)).spawn();
        let mut saved = handle.subscribe_saved();

        assert!(handle.start().await.unwrap());
        fx.emit(EncoderEvent::Chunk(vec![1, 2]));
        fx.emit(EncoderEvent::Chunk(vec![3]));
        fx.emit(EncoderEvent::Chunk(vec![4, 5, 6]));
        assert!(handle.stop().await.unwrap());

        let id = tokio::time::timeout(Duration::from_secs(5), saved.recv())
            .await
            .expect("no saved notification")
            .unwrap();
        assert_eq!(id, ArtifactId(1));

        let puts = fx.sink.puts();
        assert_eq!(puts.len(), 1);
        assert_eq!(puts[0].data, vec![1, 2, 3, 4, 5, 6]);
        assert_eq!(puts[0].mime, "video/webm");

        // Exactly one notification for one artifact.
        wait_idle(&handle).await;
        assert!(matches!(
            saved.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }

    #[tokio::test]
    async fn test_zero_chunks_never_puts() {
        let fx = Fixture::new();
        let (handle, _task) = Recorder::new(Some(fx.session(true)), Arc::clone(&fx.sink)).spawn();
        let mut saved = handle.subscribe_saved();

        assert!(handle.start().await.unwrap());
        fx.emit(EncoderEvent::Chunk(Vec::new()));
        assert!(handle.stop().await.unwrap());
        wait_idle(&handle).await;

        assert!(fx.sink.puts().is_empty());
        assert!(matches!(
            saved.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }

    #[tokio::test]
    async fn test_start_resets_chunks() {
        let fx = Fixture::new();
        let mut recorder = Recorder::new(Some(fx.session(false)), Arc::clone(&fx.sink));
        let mut saved = recorder.saved.subscribe();

        assert!(recorder.start());
        recorder.handle_event(Some(EncoderEvent::Chunk(b"first".to_vec())));
        recorder.stop();
        recorder.handle_event(Some(EncoderEvent::Finalized));
        saved.recv().await.unwrap();

        assert!(recorder.start());
        recorder.handle_event(Some(EncoderEvent::Chunk(b"second".to_vec())));
        recorder.stop();
        recorder.handle_event(Some(EncoderEvent::Finalized));
        saved.recv().await.unwrap();

        let puts = fx.sink.puts();
        assert_eq!(puts.len(), 2);
        assert_eq!(puts[1].data, b"second");
    }

    #[tokio::test]
    async fn test_start_rejected_while_recording_or_finalizing() {
        let fx = Fixture::new();
        let mut recorder = Recorder::new(Some(fx.session(false)), Arc::clone(&fx.sink));

        assert!(recorder.start());
        assert!(!recorder.start());
        recorder.handle_event(Some(EncoderEvent::Chunk(vec![9])));
        assert!(recorder.stop());
        assert!(!recorder.stop());
        assert!(recorder.state().finalizing);
        assert!(!recorder.start());

        // Late chunk while finalizing still counts.
        recorder.handle_event(Some(EncoderEvent::Chunk(vec![10])));
        assert_eq!(recorder.chunks, vec![vec![9u8], vec![10u8]]);
        assert_eq!(*fx.starts.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_no_session_start_is_noop() {
        let sink = Arc::new(MemorySink::default());
        let mut recorder = Recorder::new(None, sink);
        assert!(!recorder.start());
        assert_eq!(recorder.state(), RecorderState::default());
    }

    #[tokio::test]
    async fn test_failed_start_stays_idle() {
        let fx = Fixture::new();
        let session = Box::new(FakeSession {
            events: Arc::clone(&fx.events),
            starts: Arc::clone(&fx.starts),
            stops: Arc::clone(&fx.stops),
            finalize_on_stop: false,
            fail_start: true,
        });
        let mut recorder = Recorder::new(Some(session), Arc::clone(&fx.sink));
        assert!(!recorder.start());
        assert!(!recorder.state().recording);
    }

    #[tokio::test]
    async fn test_chunks_ignored_when_idle() {
        let fx = Fixture::new();
        let mut recorder = Recorder::new(Some(fx.session(false)), Arc::clone(&fx.sink));
        recorder.handle_event(Some(EncoderEvent::Chunk(vec![1])));
        assert!(recorder.chunks.is_empty());
    }

    #[tokio::test]
    async fn test_encoder_failure_returns_to_idle() {
        let fx = Fixture::new();
        let (handle, _task) = Recorder::new(Some(fx.session(false)), Arc::clone(&fx.sink)).spawn();

        assert!(handle.start().await.unwrap());
        fx.emit(EncoderEvent::Chunk(vec![1, 2, 3]));
        fx.emit(EncoderEvent::Failed("ffmpeg exited with status 1".into()));
        wait_idle(&handle).await;

        assert!(fx.sink.puts().is_empty());
        // A fresh session can start afterwards.
        assert!(handle.start().await.unwrap());
    }

    #[tokio::test]
    async fn test_failed_put_drops_artifact_and_keeps_recording_available() {
        let fx = Fixture::new();
        let (handle, _task) = Recorder::new(Some(fx.session(true)), Arc::new(FailingSink)).spawn();
        let mut saved = handle.subscribe_saved();

        assert!(handle.start().await.unwrap());
        fx.emit(EncoderEvent::Chunk(vec![7, 7, 7]));
        assert!(handle.stop().await.unwrap());
        wait_idle(&handle).await;

        assert_eq!(handle.state().await.unwrap().saving, 0);
        assert!(matches!(
            saved.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
        assert!(handle.start().await.unwrap());
    }

    #[tokio::test]
    async fn test_closed_commands_still_finish_recording() {
        let fx = Fixture::new();
        let (handle, task) = Recorder::new(Some(fx.session(false)), Arc::clone(&fx.sink)).spawn();
        let mut saved = handle.subscribe_saved();

        assert!(handle.start().await.unwrap());
        fx.emit(EncoderEvent::Chunk(vec![1, 2]));
        drop(handle);

        // The actor stops the session once every handle is gone.
        tokio::time::timeout(Duration::from_secs(5), async {
            while *fx.stops.lock().unwrap() == 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("session was never stopped");

        fx.emit(EncoderEvent::Chunk(vec![3]));
        fx.emit(EncoderEvent::Finalized);

        let id = tokio::time::timeout(Duration::from_secs(5), saved.recv())
            .await
            .expect("no saved notification")
            .unwrap();
        assert_eq!(id, ArtifactId(1));
        assert_eq!(fx.sink.puts()[0].data, vec![1, 2, 3]);
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("recorder task did not exit")
            .unwrap();
    }
}
