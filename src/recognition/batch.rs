//! Single-call recognition over a complete audio buffer
//!
//! [`Recognizer`] hides the session machinery behind one call:
//!
//! ```ignore
//! let recognizer = Recognizer::new(store, RecognizerSettings::default());
//! let text = recognizer.recognize("account-42", pcm_bytes).await?;
//! ```
//!
//! Each call resolves credentials, signs a fresh endpoint and runs its own
//! isolated session. The result resolves exactly once.
//!
//! # Retry Strategy
//!
//! Transient connection failures are retried `connect_retries` times with
//! exponential backoff (1s, 2s, 4s, ...). Every attempt is signed with a new
//! timestamp. Authentication failures and mid-session failures are never
//! retried.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, DropGuard};

use super::auth::{Clock, ConnectionAuthenticator, SignedEndpoint};
use super::driver::{drive, DriverTiming};
use super::framer::AudioFramer;
use super::protocol::{FrameEncoder, RecognitionParams};
use super::session::{Effect, Session, SessionEvent};
use super::transport::{Connector, WsConnector};
use super::RecognitionError;
use crate::credentials::{resolve_credentials, CredentialSet, CredentialStore};
use crate::settings::RecognizerSettings;

/// Base delay for exponential backoff (doubles each retry)
const RETRY_BASE_DELAY: Duration = Duration::from_secs(1);

/// Recognizes complete audio buffers, one session per call
pub struct Recognizer<C: Connector = WsConnector> {
    store: Arc<dyn CredentialStore>,
    connector: C,
    authenticator: ConnectionAuthenticator,
    settings: RecognizerSettings,
}

impl Recognizer<WsConnector> {
    /// Recognizer backed by a real WebSocket connector
    pub fn new(store: Arc<dyn CredentialStore>, settings: RecognizerSettings) -> Self {
        let connector = WsConnector::new(settings.connect_timeout());
        Self::with_connector(store, settings, connector)
    }
}

impl<C: Connector> Recognizer<C> {
    pub fn with_connector(
        store: Arc<dyn CredentialStore>,
        settings: RecognizerSettings,
        connector: C,
    ) -> Self {
        let authenticator = ConnectionAuthenticator::new(&settings.host, &settings.path);
        Self {
            store,
            connector,
            authenticator,
            settings,
        }
    }

    /// Replace the signing clock
    pub fn with_clock(mut self, clock: impl Clock + 'static) -> Self {
        self.authenticator =
            ConnectionAuthenticator::with_clock(&self.settings.host, &self.settings.path, clock);
        self
    }

    pub fn settings(&self) -> &RecognizerSettings {
        &self.settings
    }

    /// Recognize a complete PCM buffer (16-bit mono at the configured rate)
    ///
    /// Dropping the returned future abandons the session: the connection and
    /// the pacing timer are released and nothing else is delivered, but the
    /// socket is torn down without a close frame. Callers that may give up on
    /// a request should use [`spawn`](Self::spawn) or
    /// [`recognize_with_cancel`](Self::recognize_with_cancel), which close
    /// with a normal closure.
    pub async fn recognize(
        &self,
        account_id: &str,
        audio: Vec<u8>,
    ) -> Result<String, RecognitionError> {
        self.recognize_with_cancel(account_id, audio, CancellationToken::new())
            .await
    }

    /// Like [`recognize`](Self::recognize), but stops with `Cancelled` as soon
    /// as `cancel` fires, closing the connection normally.
    pub async fn recognize_with_cancel(
        &self,
        account_id: &str,
        audio: Vec<u8>,
        cancel: CancellationToken,
    ) -> Result<String, RecognitionError> {
        self.settings
            .validate()
            .map_err(RecognitionError::InvalidSettings)?;

        log::info!(
            "Recognizer: {} bytes of audio for account {}",
            audio.len(),
            account_id
        );

        let framer = AudioFramer::new(audio, self.settings.chunk_size()).ok_or_else(|| {
            RecognitionError::InvalidSettings("chunk size must be nonzero".to_string())
        })?;
        let mut session = Session::new(
            framer,
            self.settings.max_malformed_messages,
            self.settings.silence_timeout(),
        );

        let credentials = match resolve_credentials(self.store.as_ref(), account_id) {
            Ok(credentials) => credentials,
            Err(error) => {
                let effects = session.handle(SessionEvent::CredentialsUnavailable { error })?;
                return outcome(effects);
            }
        };

        let endpoint = self.authenticator.sign(&credentials);
        let encoder = FrameEncoder::new(
            credentials.app_id.clone(),
            RecognitionParams::from(&self.settings),
        );
        let timing = DriverTiming {
            frame_interval: self.settings.frame_interval(),
            silence_timeout: self.settings.silence_timeout(),
        };

        let credentials = &credentials;
        drive(session, endpoint, encoder, timing, cancel, |endpoint| {
            self.connect_with_retry(credentials, endpoint)
        })
        .await
    }

    /// Run a recognition on a background task
    ///
    /// Dropping the handle (or calling [`RecognitionHandle::cancel`]) cancels
    /// the session.
    pub fn spawn(self: &Arc<Self>, account_id: impl Into<String>, audio: Vec<u8>) -> RecognitionHandle
    where
        C: 'static,
        C::Transport: 'static,
    {
        let recognizer = Arc::clone(self);
        let account_id = account_id.into();
        let cancel = CancellationToken::new();
        let (tx, rx) = oneshot::channel();

        let token = cancel.clone();
        let task = tokio::spawn(async move {
            let result = recognizer
                .recognize_with_cancel(&account_id, audio, token)
                .await;
            if tx.send(result).is_err() {
                log::debug!("Recognizer: result dropped, handle already gone");
            }
        });

        RecognitionHandle {
            cancel: cancel.clone(),
            result: rx,
            task,
            guard: cancel.drop_guard(),
        }
    }

    async fn connect_with_retry(
        &self,
        credentials: &CredentialSet,
        endpoint: SignedEndpoint,
    ) -> Result<C::Transport, RecognitionError> {
        let mut endpoint = endpoint;
        let mut attempt: u32 = 0;

        loop {
            match self.connector.connect(&endpoint).await {
                Ok(transport) => return Ok(transport),
                Err(e) if e.is_retryable() && attempt < self.settings.connect_retries => {
                    attempt += 1;
                    let delay = RETRY_BASE_DELAY * 2u32.pow((attempt - 1).min(6));
                    log::info!(
                        "Recognizer: connection failed ({}), retrying in {:?} (attempt {}/{})",
                        e,
                        delay,
                        attempt.saturating_add(1),
                        self.settings.connect_retries.saturating_add(1)
                    );
                    tokio::time::sleep(delay).await;
                    // The signature is bound to its timestamp; sign again.
                    endpoint = self.authenticator.sign(credentials);
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Extract the outcome from a terminal transition
fn outcome(effects: Vec<Effect>) -> Result<String, RecognitionError> {
    effects
        .into_iter()
        .find_map(|effect| match effect {
            Effect::Finish(result) => Some(result),
            _ => None,
        })
        .unwrap_or(Err(RecognitionError::Cancelled))
}

/// A recognition running on a background task
pub struct RecognitionHandle {
    cancel: CancellationToken,
    result: oneshot::Receiver<Result<String, RecognitionError>>,
    task: JoinHandle<()>,
    /// Cancels the session if the handle is dropped unawaited
    guard: DropGuard,
}

impl RecognitionHandle {
    /// Ask the session to stop; `result()` then yields `Cancelled`
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the single outcome
    pub async fn result(self) -> Result<String, RecognitionError> {
        let RecognitionHandle { result, guard, .. } = self;
        let outcome = match result.await {
            Ok(outcome) => outcome,
            Err(_) => Err(RecognitionError::Cancelled),
        };
        drop(guard);
        outcome
    }
}
