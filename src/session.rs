//! Recording session lifecycle
//!
//! `RecordingSession` owns one user's capture: the transport connection,
//! the speaker channel registry, the mixer task and the output sink, tied
//! together by an `Idle -> Connecting -> Active -> Stopping -> Closed`
//! state machine. `SessionManager` is the upstream command surface and
//! the only process-wide registry of active sessions.

use crate::audio::channel::ChannelRegistry;
use crate::audio::decode::DecoderFactory;
use crate::audio::mixer;
use crate::audio::sink::{FileSink, OutputSink, SinkError};
use crate::config::{AudioConfig, Config};
use crate::transport::{ChannelRef, TransportError, TransportEvent, TransportHandle, VoiceTransport};
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Transport events buffered ahead of the session's event pump
const EVENT_QUEUE_DEPTH: usize = 1024;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("A recording is already active for this user")]
    AlreadyRecording,
    #[error("Voice connect timed out after {0:?}")]
    ConnectTimeout(Duration),
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("Voice transport disconnected")]
    TransportLost,
    #[error("Output sink error: {0}")]
    Sink(#[from] SinkError),
    #[error("Session already started")]
    NotIdle,
    #[error("Session stopped during connect")]
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Active,
    Stopping,
    Closed,
}

/// Completed raw recording, handed to downstream processing
#[derive(Debug, Clone)]
pub struct RecordingHandle {
    /// Raw little-endian 16-bit stereo 48kHz PCM stream
    pub output_path: Option<PathBuf>,
    pub started_at: DateTime<Utc>,
    pub stopped_at: DateTime<Utc>,
}

impl RecordingHandle {
    pub fn duration(&self) -> chrono::Duration {
        self.stopped_at - self.started_at
    }
}

/// One user's recording session
pub struct RecordingSession {
    user_id: u64,
    audio: AudioConfig,
    state: Mutex<SessionState>,
    registry: Arc<ChannelRegistry>,
    sink: Arc<dyn OutputSink>,
    output_path: Option<PathBuf>,
    started_at: DateTime<Utc>,
    transport_handle: Mutex<Option<Box<dyn TransportHandle>>>,
    mixer_task: Mutex<Option<JoinHandle<()>>>,
    pump_task: Mutex<Option<JoinHandle<()>>>,
    /// Set by the error watchdog; collected by the next stop
    terminal_error: Mutex<Option<SessionError>>,
}

impl RecordingSession {
    pub fn new(
        user_id: u64,
        decoders: Arc<dyn DecoderFactory>,
        sink: Arc<dyn OutputSink>,
        output_path: Option<PathBuf>,
        audio: &AudioConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            user_id,
            audio: audio.clone(),
            state: Mutex::new(SessionState::Idle),
            registry: ChannelRegistry::new(decoders, audio),
            sink,
            output_path,
            started_at: Utc::now(),
            transport_handle: Mutex::new(None),
            mixer_task: Mutex::new(None),
            pump_task: Mutex::new(None),
            terminal_error: Mutex::new(None),
        })
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    pub fn is_active(&self) -> bool {
        matches!(
            self.state(),
            SessionState::Connecting | SessionState::Active
        )
    }

    fn record_terminal_error(&self, err: SessionError) {
        *self.terminal_error.lock() = Some(err);
    }

    fn take_terminal_error(&self) -> Option<SessionError> {
        self.terminal_error.lock().take()
    }

    /// Establish the voice connection (bounded by the connect timeout) and
    /// spawn the event pump and mixer. Valid only from `Idle`; any failure
    /// leaves the session `Closed` with its resources released.
    pub async fn start(
        self: &Arc<Self>,
        transport: &dyn VoiceTransport,
        channel: ChannelRef,
        error_tx: mpsc::Sender<SessionError>,
    ) -> Result<(), SessionError> {
        {
            let mut state = self.state.lock();
            if *state != SessionState::Idle {
                return Err(SessionError::NotIdle);
            }
            *state = SessionState::Connecting;
        }

        let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
        let connect = transport.connect(channel, event_tx);
        let handle = match tokio::time::timeout(self.audio.connect_timeout, connect).await {
            Ok(Ok(handle)) => handle,
            Ok(Err(e)) => {
                self.close_after_failed_start();
                return Err(e.into());
            }
            Err(_) => {
                self.close_after_failed_start();
                return Err(SessionError::ConnectTimeout(self.audio.connect_timeout));
            }
        };

        // Promote to Active unless a stop() raced the connect. The task
        // handles are stored under the state lock so a concurrent stop
        // either sees none of them or all of them.
        let mut handle = Some(handle);
        let raced = {
            let mut state = self.state.lock();
            if *state == SessionState::Connecting {
                *state = SessionState::Active;
                *self.transport_handle.lock() = handle.take();
                *self.pump_task.lock() = Some(tokio::spawn(run_event_pump(
                    event_rx,
                    self.registry.clone(),
                    error_tx.clone(),
                )));
                *self.mixer_task.lock() = Some(mixer::spawn_mixer(
                    self.registry.clone(),
                    self.sink.clone(),
                    error_tx,
                    self.audio.mix_tick,
                ));
                false
            } else {
                true
            }
        };

        if raced {
            if let Some(mut handle) = handle {
                let _ = handle.disconnect().await;
            }
            return Err(SessionError::Stopped);
        }

        info!("Session for user {} is active", self.user_id);
        Ok(())
    }

    fn close_after_failed_start(&self) {
        let _ = self.sink.close();
        *self.state.lock() = SessionState::Closed;
    }

    /// Stop the session. Idempotent: returns `Ok(true)` on the call that
    /// performed the teardown, `Ok(false)` when there was nothing to stop.
    pub async fn stop(&self) -> Result<bool, SessionError> {
        {
            let mut state = self.state.lock();
            match *state {
                SessionState::Active | SessionState::Connecting => {
                    *state = SessionState::Stopping;
                }
                SessionState::Idle => {
                    *state = SessionState::Closed;
                    return Ok(false);
                }
                SessionState::Stopping | SessionState::Closed => return Ok(false),
            }
        }
        self.shutdown().await?;
        Ok(true)
    }

    /// Synchronous, total teardown. Once this returns, no tick fires, no
    /// chunk moves, and nothing touches the sink again.
    async fn shutdown(&self) -> Result<(), SessionError> {
        // The mixer must die before any further queue draining
        let mixer = self.mixer_task.lock().take();
        if let Some(task) = mixer {
            task.abort();
            let _ = task.await;
        }
        let pump = self.pump_task.lock().take();
        if let Some(task) = pump {
            task.abort();
            let _ = task.await;
        }
        self.registry.unsubscribe_all();
        let handle = self.transport_handle.lock().take();
        if let Some(mut handle) = handle {
            if let Err(e) = handle.disconnect().await {
                warn!("Voice disconnect failed for user {}: {}", self.user_id, e);
            }
        }
        let closed = self.sink.close();
        *self.state.lock() = SessionState::Closed;
        info!("Session for user {} closed", self.user_id);
        closed?;
        Ok(())
    }
}

impl Drop for RecordingSession {
    fn drop(&mut self) {
        if let Some(task) = self.mixer_task.lock().take() {
            task.abort();
        }
        if let Some(task) = self.pump_task.lock().take() {
            task.abort();
        }
    }
}

/// Route transport events into the speaker channel registry
async fn run_event_pump(
    mut events: mpsc::Receiver<TransportEvent>,
    registry: Arc<ChannelRegistry>,
    error_tx: mpsc::Sender<SessionError>,
) {
    while let Some(event) = events.recv().await {
        match event {
            TransportEvent::SpeakingStarted { speaker } => registry.subscribe(speaker),
            TransportEvent::Frame { speaker, payload } => registry.push_frame(speaker, payload),
            TransportEvent::SpeakerLeft { speaker } => registry.end_subscription(speaker),
            TransportEvent::Disconnected => {
                let _ = error_tx.send(SessionError::TransportLost).await;
                return;
            }
        }
    }
}

/// Upstream command surface over all users' recording sessions
pub struct SessionManager {
    sessions: Arc<DashMap<u64, Arc<RecordingSession>>>,
    transport: Arc<dyn VoiceTransport>,
    decoders: Arc<dyn DecoderFactory>,
    config: Arc<Config>,
}

impl SessionManager {
    pub fn new(
        transport: Arc<dyn VoiceTransport>,
        decoders: Arc<dyn DecoderFactory>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            sessions: Arc::new(DashMap::new()),
            transport,
            decoders,
            config,
        }
    }

    /// Start recording for a user. At most one non-closed session may
    /// exist per user; a second start is rejected with no side effects.
    pub async fn start_session(
        &self,
        user_id: u64,
        channel: ChannelRef,
    ) -> Result<(), SessionError> {
        std::fs::create_dir_all(&self.config.recordings_dir).map_err(SinkError::from)?;
        let file_name = format!("recording_{}_{}.pcm", user_id, Utc::now().timestamp());
        let path = self.config.recordings_dir.join(file_name);

        let session = {
            let entry = self.sessions.entry(user_id);
            if let Entry::Occupied(ref slot) = entry {
                // Only a closed session (torn down by the watchdog, error
                // not yet collected) may be replaced
                if slot.get().state() != SessionState::Closed {
                    return Err(SessionError::AlreadyRecording);
                }
            }
            let sink = Arc::new(FileSink::create(&path)?);
            let session = RecordingSession::new(
                user_id,
                self.decoders.clone(),
                sink,
                Some(path.clone()),
                &self.config.audio,
            );
            match entry {
                Entry::Occupied(mut slot) => {
                    slot.insert(session.clone());
                }
                Entry::Vacant(slot) => {
                    slot.insert(session.clone());
                }
            }
            session
        };

        let (error_tx, error_rx) = mpsc::channel(4);
        match session.start(self.transport.as_ref(), channel, error_tx).await {
            Ok(()) => {
                self.spawn_error_watchdog(session, error_rx);
                info!("Recording started for user {}", user_id);
                Ok(())
            }
            // A stop that raced the connect owns the teardown and has
            // already handed out the recording handle; the file stays
            Err(SessionError::Stopped) => Err(SessionError::Stopped),
            Err(e) => {
                self.sessions.remove(&user_id);
                let _ = std::fs::remove_file(&path);
                Err(e)
            }
        }
    }

    /// Stop a user's recording. Returns the completed raw stream handle,
    /// or `Ok(None)` when there is nothing to stop (double stop is a
    /// no-op, not an error).
    pub async fn stop_session(
        &self,
        user_id: u64,
    ) -> Result<Option<RecordingHandle>, SessionError> {
        let Some((_, session)) = self.sessions.remove(&user_id) else {
            return Ok(None);
        };
        let stopped = session.stop().await?;
        // A session the watchdog already tore down reports its fatal
        // error here instead of a handle
        if let Some(err) = session.take_terminal_error() {
            return Err(err);
        }
        if !stopped {
            return Ok(None);
        }
        info!("Recording stopped for user {}", user_id);
        Ok(Some(RecordingHandle {
            output_path: session.output_path.clone(),
            started_at: session.started_at,
            stopped_at: Utc::now(),
        }))
    }

    pub fn is_active(&self, user_id: u64) -> bool {
        self.sessions
            .get(&user_id)
            .map(|s| s.is_active())
            .unwrap_or(false)
    }

    /// Runtime errors (sink write failure, transport loss) arrive on the
    /// session's error channel and trigger the same teardown as stop().
    /// The closed session stays registered so the next stop can report
    /// the error.
    fn spawn_error_watchdog(
        &self,
        session: Arc<RecordingSession>,
        mut error_rx: mpsc::Receiver<SessionError>,
    ) {
        tokio::spawn(async move {
            if let Some(err) = error_rx.recv().await {
                error!(
                    "Fatal error in session for user {}: {}",
                    session.user_id, err
                );
                session.record_terminal_error(err);
                if let Err(e) = session.stop().await {
                    error!(
                        "Teardown after fatal error failed for user {}: {}",
                        session.user_id, e
                    );
                }
            }
        });
    }
}
