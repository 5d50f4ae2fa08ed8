//! Drives one conversation: a single event queue feeds the session, which
//! owns the connection, the history and the tool round-trips.

use super::{
    machine::{ConnectionState, ProtocolMachine},
    protocol::{ConversationItem, InboundEnvelope, OutboundEnvelope},
    transport::{self, Link},
};
use crate::{
    audio_utils::{AudioIo, decode_frame, encode_frame},
    error::{SessionError, UserError, UserErrors},
};
use anyhow::{Result, anyhow};
use bytes::Bytes;
use parley_core::{
    dispatcher::ToolDispatch,
    history::RawHistory,
    memory::MemoryStore,
    turn::{SessionConfig, ToolCall, Turn},
};
use serde_json::Value;
use std::{ops::ControlFlow, sync::Arc};
use tokio::sync::mpsc;
use tracing::{Instrument, debug, error, info, instrument, warn};

const EVENT_QUEUE_CAPACITY: usize = 256;

/// Everything the session reacts to, processed strictly in arrival order.
#[derive(Debug)]
pub enum SessionEvent {
    Connect,
    Disconnect,
    /// One inbound text frame from the connection tagged `link`.
    Frame {
        link: u64,
        text: String,
    },
    PeerClosed {
        link: u64,
    },
    SendFailed {
        link: u64,
        reason: String,
    },
    /// One captured microphone frame.
    Microphone(Bytes),
    /// A finished tool call, tagged with the voice that requested it.
    ToolCompleted {
        voice: String,
        call: ToolCall,
        result: Value,
    },
    /// New instructions or voice. Forces a disconnect.
    ChangeConfig(SessionConfig),
    DismissError(u64),
    Shutdown,
}

/// Cloneable entry point into a running session's queue.
#[derive(Clone, Debug)]
pub struct SessionHandle {
    events: mpsc::Sender<SessionEvent>,
}

impl SessionHandle {
    pub async fn send(&self, event: SessionEvent) -> Result<()> {
        self.events
            .send(event)
            .await
            .map_err(|_| anyhow!("Session has stopped"))
    }
}

pub struct Session {
    config: SessionConfig,
    backend_url: Option<String>,
    history: RawHistory,
    memory: MemoryStore,
    dispatcher: Arc<dyn ToolDispatch>,
    audio: Arc<dyn AudioIo>,
    machine: ProtocolMachine,
    errors: UserErrors,
    debug: Value,
    link: Option<Link>,
    next_link_id: u64,
    events: mpsc::Sender<SessionEvent>,
}

impl Session {
    /// Creates a session scoped to `config.voice_name`, loading its stored
    /// history. The tool declarations are taken from `dispatcher`.
    pub fn new(
        mut config: SessionConfig,
        backend_url: Option<String>,
        memory: MemoryStore,
        dispatcher: Arc<dyn ToolDispatch>,
        audio: Arc<dyn AudioIo>,
    ) -> (Self, mpsc::Receiver<SessionEvent>) {
        let (events, events_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        config.tool_declarations = dispatcher.declarations();
        let history = memory.load(&config.voice_name);
        let session = Self {
            config,
            backend_url,
            history,
            memory,
            dispatcher,
            audio,
            machine: ProtocolMachine::new(),
            errors: UserErrors::default(),
            debug: Value::Null,
            link: None,
            next_link_id: 0,
            events,
        };
        (session, events_rx)
    }

    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            events: self.events.clone(),
        }
    }

    pub fn history(&self) -> &RawHistory {
        &self.history
    }

    pub fn errors(&self) -> &[UserError] {
        self.errors.entries()
    }

    pub fn state(&self) -> ConnectionState {
        self.machine.state()
    }

    /// The latest debug dictionary pushed by the backend.
    pub fn debug(&self) -> &Value {
        &self.debug
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Processes events until [`SessionEvent::Shutdown`], then tears down and
    /// persists.
    #[instrument(name = "session", skip_all, fields(voice = %self.config.voice_name))]
    pub async fn run(&mut self, mut events: mpsc::Receiver<SessionEvent>) {
        info!(turns = self.history.len(), "Session started.");
        while let Some(event) = events.recv().await {
            if self.handle_event(event).await.is_break() {
                break;
            }
        }
        self.teardown();
        self.persist();
        info!("Session finished.");
    }

    pub async fn handle_event(&mut self, event: SessionEvent) -> ControlFlow<()> {
        match event {
            SessionEvent::Connect => self.connect().await,
            SessionEvent::Disconnect => {
                info!("Disconnect requested.");
                self.teardown();
            }
            SessionEvent::Frame { link, text } => {
                if self.is_current(link) {
                    self.on_frame(&text).await;
                } else {
                    debug!(link, "Dropping frame from a closed connection.");
                }
            }
            SessionEvent::PeerClosed { link } => {
                if self.is_current(link) {
                    info!(link, "Connection closed by peer.");
                    self.teardown();
                }
            }
            SessionEvent::SendFailed { link, reason } => {
                if self.is_current(link) {
                    self.report(SessionError::Transport(reason));
                }
            }
            SessionEvent::Microphone(frame) => {
                if self.machine.can_send() {
                    let audio = encode_frame(&frame);
                    self.send(OutboundEnvelope::InputAudioBufferAppend { audio })
                        .await;
                }
            }
            SessionEvent::ToolCompleted {
                voice,
                call,
                result,
            } => self.on_tool_completed(voice, call, result).await,
            SessionEvent::ChangeConfig(config) => self.change_config(config),
            SessionEvent::DismissError(id) => {
                if !self.errors.dismiss(id) {
                    debug!(id, "No error to dismiss.");
                }
            }
            SessionEvent::Shutdown => return ControlFlow::Break(()),
        }
        ControlFlow::Continue(())
    }

    async fn connect(&mut self) {
        let url = match self.machine.begin_connect(self.backend_url.as_deref()) {
            Ok(url) => url,
            Err(e) => return self.report(e),
        };
        self.next_link_id += 1;
        match transport::connect(&url, self.next_link_id, self.events.clone()).await {
            Ok(link) => self.on_open(link).await,
            Err(e) => self.report(e),
        }
    }

    /// Adopts `link`, then pushes the session config and replays the history.
    async fn on_open(&mut self, link: Link) {
        if let Err(e) = self.machine.opened() {
            link.shutdown();
            return self.report(e);
        }
        self.link = Some(link);

        if !self.send(OutboundEnvelope::session_update(&self.config)).await {
            return;
        }
        let items: Vec<ConversationItem> = self
            .history
            .iter()
            .filter_map(ConversationItem::from_turn)
            .collect();
        info!(
            turns = self.history.len(),
            replayed = items.len(),
            "Session configured; replaying history."
        );
        for item in items {
            if !self.send(OutboundEnvelope::item(item)).await {
                return;
            }
        }
    }

    async fn on_frame(&mut self, raw: &str) {
        let Some((kind, envelope)) = ProtocolMachine::classify(raw) else {
            return;
        };
        match envelope {
            InboundEnvelope::AudioDelta { delta } => match decode_frame(&delta) {
                Ok(frame) => self.audio.play(frame),
                Err(e) => warn!(error = %e, "Dropping undecodable audio delta."),
            },
            InboundEnvelope::TextDelta { delta } => self.history.push(Turn::assistant(delta)),
            InboundEnvelope::TranscriptionDelta { delta } => self.history.push(Turn::user(delta)),
            InboundEnvelope::ResponseDone { response } => {
                self.dispatch_tool_calls(response.tool_calls());
                self.persist();
            }
            InboundEnvelope::Error { error } => {
                if error.is_warning() {
                    warn!(message = %error.message, "Server warning.");
                } else {
                    self.report(SessionError::Protocol {
                        kind: error.kind,
                        message: error.message,
                    });
                }
            }
            InboundEnvelope::AdditionalOutputs { args } => self.debug = args.debug_dict,
            InboundEnvelope::Status => debug!(%kind, "Status update."),
            InboundEnvelope::Unknown => warn!(%kind, "Ignoring unrecognized envelope type."),
        }
    }

    /// Records each call, then runs all of them concurrently. Each result
    /// comes back through the queue as [`SessionEvent::ToolCompleted`].
    fn dispatch_tool_calls(&mut self, calls: Vec<ToolCall>) {
        for call in calls {
            info!(call_id = %call.id, name = %call.function.name, "Tool call requested.");
            self.history.push(Turn::tool_request(vec![call.clone()]));

            let dispatcher = Arc::clone(&self.dispatcher);
            let events = self.events.clone();
            let voice = self.config.voice_name.clone();
            tokio::spawn(
                async move {
                    let result = dispatcher.dispatch(&call).await;
                    if events
                        .send(SessionEvent::ToolCompleted {
                            voice,
                            call,
                            result,
                        })
                        .await
                        .is_err()
                    {
                        warn!("Session stopped before a tool result was delivered.");
                    }
                }
                .in_current_span(),
            );
        }
    }

    async fn on_tool_completed(&mut self, voice: String, call: ToolCall, result: Value) {
        let output = result.to_string();
        if voice != self.config.voice_name {
            self.record_for_other_voice(&voice, Turn::tool_result(&call.id, output));
            return;
        }
        self.history.push(Turn::tool_result(&call.id, output.clone()));
        self.persist();

        if !self.machine.can_send() {
            info!(call_id = %call.id, "Tool finished after disconnect; result kept in history only.");
            return;
        }
        let item = ConversationItem::function_output(call.id, output);
        if self.send(OutboundEnvelope::item(item)).await {
            self.send(OutboundEnvelope::ResponseCreate).await;
        }
    }

    /// Appends `turn` to the stored history of a voice that is no longer active.
    fn record_for_other_voice(&self, voice: &str, turn: Turn) {
        info!(%voice, "Tool finished after a voice switch; result stored under its voice.");
        let mut history = self.memory.load(voice);
        history.push(turn);
        if let Err(e) = self.memory.save(voice, &history) {
            error!(%voice, error = %e, "Failed to persist history.");
        }
    }

    fn change_config(&mut self, mut config: SessionConfig) {
        config.tool_declarations = self.dispatcher.declarations();
        self.teardown();
        self.audio.stop();
        self.persist();
        if config.voice_name != self.config.voice_name {
            info!(from = %self.config.voice_name, to = %config.voice_name, "Switching voice.");
            self.history = self.memory.load(&config.voice_name);
        }
        self.config = config;
    }

    /// Sends through the current link. Returns false if nothing was sent.
    async fn send(&mut self, envelope: OutboundEnvelope) -> bool {
        if !self.machine.can_send() {
            debug!(state = self.machine.state().as_str(), "Dropping outbound envelope.");
            return false;
        }
        let Some(link) = self.link.as_ref() else {
            return false;
        };
        match link.send(envelope).await {
            Ok(()) => true,
            Err(e) => {
                self.report(e);
                false
            }
        }
    }

    fn report(&mut self, error: SessionError) {
        match &error {
            SessionError::Transport(_) => {
                error!(error = %error, "Transport failure.");
                self.machine.fault();
                self.teardown();
                self.errors.push(&error);
            }
            SessionError::Configuration(_) | SessionError::Protocol { .. } => {
                error!(error = %error, "Session error.");
                self.errors.push(&error);
            }
            SessionError::InvalidState { .. } => warn!(error = %error, "Ignoring request."),
        }
    }

    /// Stops audio, drops the link and persists. No-op unless something is live.
    fn teardown(&mut self) {
        if !self.machine.begin_close() {
            return;
        }
        self.audio.stop();
        if let Some(link) = self.link.take() {
            link.shutdown();
        }
        self.machine.closed();
        self.persist();
        info!("Connection torn down.");
    }

    fn is_current(&self, link: u64) -> bool {
        self.link.as_ref().map(Link::id) == Some(link)
    }

    fn persist(&self) {
        if let Err(e) = self.memory.save(&self.config.voice_name, &self.history) {
            error!(voice = %self.config.voice_name, error = %e, "Failed to persist history.");
        }
    }
}
