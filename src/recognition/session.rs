//! Recognition session state machine
//!
//! All transitions go through [`Session::handle`], which updates the session
//! and returns the effects the driver must execute (send a frame, start or
//! stop pacing, close the transport, deliver the outcome). The session itself
//! never touches the network or the clock.
//!
//! ```text
//! Idle ─▶ Connecting ─▶ Streaming ─▶ Finalizing ─▶ Closed
//!   └──────────┴────────────┴────────────┴──────▶ Failed
//! ```

use std::fmt;
use std::time::Duration;

use super::framer::{AudioFrame, AudioFramer};
use super::protocol::{decode_inbound, Inbound};
use super::transcript::{TranscriptAssembler, TranscriptFragment};
use super::transport::NORMAL_CLOSURE;
use super::{RecognitionError, SignedEndpoint};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Streaming,
    Finalizing,
    Closed,
    Failed,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Failed)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Inputs to the state machine
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// Credentials resolved and endpoint signed
    Start { endpoint: SignedEndpoint },
    /// Credentials could not be resolved
    CredentialsUnavailable { error: RecognitionError },
    /// The transport reports the connection open
    TransportOpened,
    /// The pacing timer fired
    PacingTick,
    /// A text message arrived
    Inbound { text: String },
    /// The transport failed (including failure to connect)
    TransportError { error: RecognitionError },
    /// The transport closed
    TransportClosed { code: Option<u16>, reason: String },
    /// No inbound frame within the silence window after the LAST frame
    SilenceElapsed,
    /// The caller gave up
    Cancel,
}

impl SessionEvent {
    fn name(&self) -> &'static str {
        match self {
            SessionEvent::Start { .. } => "Start",
            SessionEvent::CredentialsUnavailable { .. } => "CredentialsUnavailable",
            SessionEvent::TransportOpened => "TransportOpened",
            SessionEvent::PacingTick => "PacingTick",
            SessionEvent::Inbound { .. } => "Inbound",
            SessionEvent::TransportError { .. } => "TransportError",
            SessionEvent::TransportClosed { .. } => "TransportClosed",
            SessionEvent::SilenceElapsed => "SilenceElapsed",
            SessionEvent::Cancel => "Cancel",
        }
    }
}

/// Work for the driver, in order
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    Connect { endpoint: SignedEndpoint },
    Send(AudioFrame),
    StartPacing,
    StopPacing,
    /// (Re)start the silence window
    ArmSilenceTimer,
    Close { code: u16 },
    /// Deliver the single outcome of the session
    Finish(Result<String, RecognitionError>),
}

/// An event the current state cannot accept
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Invalid session transition: {event} in state {state}")]
pub struct TransitionError {
    pub state: SessionState,
    pub event: &'static str,
}

/// One recognition attempt
#[derive(Debug)]
pub struct Session {
    state: SessionState,
    framer: AudioFramer,
    transcript: TranscriptAssembler,
    frames_sent: u64,
    malformed_count: u32,
    max_malformed: u32,
    silence_timeout: Duration,
    last_error: Option<RecognitionError>,
}

impl Session {
    pub fn new(framer: AudioFramer, max_malformed: u32, silence_timeout: Duration) -> Self {
        Self {
            state: SessionState::Idle,
            framer,
            transcript: TranscriptAssembler::new(),
            frames_sent: 0,
            malformed_count: 0,
            max_malformed,
            silence_timeout,
            last_error: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn transcript(&self) -> &str {
        self.transcript.text()
    }

    pub fn frames_sent(&self) -> u64 {
        self.frames_sent
    }

    pub fn malformed_count(&self) -> u32 {
        self.malformed_count
    }

    pub fn last_error(&self) -> Option<&RecognitionError> {
        self.last_error.as_ref()
    }

    /// Apply one event
    ///
    /// Events in a terminal state are ignored. Events the current state
    /// cannot accept return a [`TransitionError`] and leave the session
    /// unchanged.
    pub fn handle(&mut self, event: SessionEvent) -> Result<Vec<Effect>, TransitionError> {
        use SessionEvent::*;
        use SessionState::*;

        if self.state.is_terminal() {
            log::debug!("Session: ignoring {} after {}", event.name(), self.state);
            return Ok(vec![]);
        }

        let effects = match (self.state, event) {
            // -----------------
            // Idle
            // -----------------
            (Idle, Start { endpoint }) => {
                log::info!("Session: connecting to {}", endpoint.redacted());
                self.state = Connecting;
                vec![Effect::Connect { endpoint }]
            }
            (Idle, CredentialsUnavailable { error }) => self.fail(error, false),

            // -----------------
            // Connecting
            // -----------------
            (Connecting, TransportOpened) => {
                log::info!("Session: connected, sending first frame");
                self.state = Streaming;
                let mut effects = Vec::with_capacity(2);
                if let Some(first) = self.next_frame() {
                    effects.push(Effect::Send(first));
                }
                effects.push(Effect::StartPacing);
                effects
            }

            // -----------------
            // Streaming
            // -----------------
            (Streaming, PacingTick) => match self.next_frame() {
                Some(frame) if frame.is_last() => {
                    log::info!(
                        "Session: audio exhausted after {} frames, sending last frame",
                        self.frames_sent
                    );
                    self.state = Finalizing;
                    vec![Effect::Send(frame), Effect::StopPacing, Effect::ArmSilenceTimer]
                }
                Some(frame) => {
                    if self.frames_sent % 50 == 0 {
                        log::debug!("Session: sent {} frames", self.frames_sent);
                    }
                    vec![Effect::Send(frame)]
                }
                None => {
                    // The LAST frame always ends streaming, so the framer
                    // cannot run dry here.
                    self.state = Finalizing;
                    vec![Effect::StopPacing, Effect::ArmSilenceTimer]
                }
            },

            (Streaming | Finalizing, Inbound { text }) => self.on_inbound(&text),

            (Finalizing, SilenceElapsed) => {
                log::warn!(
                    "Session: no response within {:?} after last frame",
                    self.silence_timeout
                );
                self.fail(RecognitionError::Timeout(self.silence_timeout), true)
            }

            // -----------------
            // Any non-terminal state
            // -----------------
            (Connecting | Streaming | Finalizing, TransportError { error }) => {
                log::warn!("Session: transport error in {}: {}", self.state, error);
                self.fail(error, true)
            }
            (Connecting | Streaming | Finalizing, TransportClosed { code, reason }) => {
                log::warn!(
                    "Session: connection closed before final result (code: {:?}, reason: {:?})",
                    code,
                    reason
                );
                self.fail(RecognitionError::IncompleteRecognition { code, reason }, false)
            }
            (_, Cancel) => {
                log::info!("Session: cancelled in {}", self.state);
                let had_transport = self.state != Idle;
                self.fail(RecognitionError::Cancelled, had_transport)
            }

            // -----------------
            // Everything else is a bug in the driver
            // -----------------
            (state, event) => {
                log::error!("Session: {} is not valid in {}", event.name(), state);
                return Err(TransitionError {
                    state,
                    event: event.name(),
                });
            }
        };

        Ok(effects)
    }

    fn next_frame(&mut self) -> Option<AudioFrame> {
        let frame = self.framer.next()?;
        self.frames_sent += 1;
        Some(frame)
    }

    fn on_inbound(&mut self, text: &str) -> Vec<Effect> {
        let mut effects = Vec::new();
        // Any inbound frame restarts the silence window.
        if self.state == SessionState::Finalizing {
            effects.push(Effect::ArmSilenceTimer);
        }

        match decode_inbound(text) {
            Inbound::Fragment(fragment) => {
                effects.extend(self.on_fragment(fragment));
                effects
            }
            Inbound::Ack => {
                log::debug!("Session: acknowledgement received");
                effects
            }
            Inbound::ProviderError { code, message, sid } => {
                log::error!(
                    "Session: provider error {} (sid: {:?}): {}",
                    code,
                    sid,
                    message
                );
                self.fail(RecognitionError::ProviderError { code, message, sid }, true)
            }
            Inbound::Malformed(e) => {
                self.malformed_count += 1;
                let preview: String = text.chars().take(200).collect();
                log::warn!(
                    "Session: discarding message ({}/{}): {} (body: {})",
                    self.malformed_count,
                    self.max_malformed,
                    e,
                    preview
                );
                if self.malformed_count >= self.max_malformed {
                    return self.fail(
                        RecognitionError::TooManyMalformedMessages {
                            limit: self.max_malformed,
                        },
                        true,
                    );
                }
                effects
            }
        }
    }

    fn on_fragment(&mut self, fragment: TranscriptFragment) -> Vec<Effect> {
        let current = self.transcript.push(&fragment);
        log::debug!(
            "Session: fragment (replace: {}, final: {}), transcript now {} chars",
            fragment.replace,
            fragment.is_final,
            current.len()
        );

        if !fragment.is_final {
            return vec![];
        }

        let transcript = self.transcript.take();
        log::info!(
            "Session: final result after {} frames ({} chars)",
            self.frames_sent,
            transcript.len()
        );
        self.state = SessionState::Closed;
        vec![
            Effect::StopPacing,
            Effect::Close {
                code: NORMAL_CLOSURE,
            },
            Effect::Finish(Ok(transcript)),
        ]
    }

    /// Move to Failed. Any accumulated text is dropped.
    fn fail(&mut self, error: RecognitionError, close_transport: bool) -> Vec<Effect> {
        self.state = SessionState::Failed;
        self.last_error = Some(error.clone());
        let discarded = self.transcript.take();
        if !discarded.is_empty() {
            log::debug!(
                "Session: discarding {} chars of partial transcript",
                discarded.len()
            );
        }

        let mut effects = vec![Effect::StopPacing];
        if close_transport {
            effects.push(Effect::Close {
                code: NORMAL_CLOSURE,
            });
        }
        effects.push(Effect::Finish(Err(error)));
        effects
    }
}
