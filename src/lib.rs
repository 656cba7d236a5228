//! Real-time streaming speech recognition for the iFlytek IAT WebSocket API.
//!
//! Hand [`Recognizer::recognize`] a complete 16-bit mono PCM buffer and it
//! streams the audio at real-time cadence over one signed WebSocket session,
//! returning the final transcript or a single error.

pub mod credentials;
pub mod recognition;
pub mod settings;

pub use credentials::{
    CredentialField, CredentialSet, CredentialStore, EnvCredentialStore, KeyringCredentialStore,
    LayeredCredentialStore, MemoryCredentialStore,
};
pub use recognition::{RecognitionError, RecognitionHandle, Recognizer};
pub use settings::RecognizerSettings;
