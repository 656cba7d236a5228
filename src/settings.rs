use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

const SETTINGS_DIR_NAME: &str = "iat-stream";
const SETTINGS_FILE_NAME: &str = "settings.json";

/// Bytes per PCM sample (16-bit mono).
const BYTES_PER_SAMPLE: u32 = 2;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecognizerSettings {
    /// Recognition service host, used both for the URL and the signature.
    pub host: String,

    /// Request path on the service host.
    pub path: String,

    pub language: String,
    pub accent: String,

    /// Recognition domain ("slm" is the large-model dictation domain).
    pub domain: String,

    /// Trailing silence (ms) after which the service ends recognition on its own.
    pub eos_ms: u32,

    /// Ask the service for dynamic correction (`dwa=wpgs`), which enables
    /// replace fragments.
    pub dynamic_correction: bool,

    /// Sample rate of the PCM audio handed to `recognize`.
    pub sample_rate: u32,

    /// Pacing cadence. Each frame carries exactly this much audio.
    pub frame_interval_ms: u32,

    /// Upper bound on the WebSocket handshake.
    pub connect_timeout_ms: u64,

    /// Extra connection attempts after a transient connection failure.
    pub connect_retries: u32,

    /// How long to wait for any inbound frame once the last audio frame is sent.
    pub silence_timeout_ms: u64,

    /// Malformed inbound messages tolerated in one session before giving up.
    pub max_malformed_messages: u32,
}

impl Default for RecognizerSettings {
    fn default() -> Self {
        Self {
            host: "iat.xf-yun.com".to_string(),
            path: "/v1".to_string(),
            language: "zh_cn".to_string(),
            accent: "mandarin".to_string(),
            domain: "slm".to_string(),
            eos_ms: 6000,
            dynamic_correction: true,
            sample_rate: 16000,
            frame_interval_ms: 40,
            connect_timeout_ms: 10_000,
            connect_retries: 2,
            silence_timeout_ms: 10_000,
            max_malformed_messages: 8,
        }
    }
}

impl RecognizerSettings {
    /// Audio bytes carried by one middle frame.
    ///
    /// 16 kHz * 2 bytes * 40 ms = 1280 bytes with the defaults. Zero if the
    /// product does not fit; `validate()` rejects both cases.
    pub fn chunk_size(&self) -> usize {
        self.checked_chunk_size().unwrap_or(0)
    }

    fn checked_chunk_size(&self) -> Option<usize> {
        let bytes = u64::from(self.sample_rate)
            .checked_mul(u64::from(BYTES_PER_SAMPLE))?
            .checked_mul(u64::from(self.frame_interval_ms))?
            / 1000;
        usize::try_from(bytes).ok()
    }

    /// Reject values that would make a session impossible to run.
    pub fn validate(&self) -> Result<(), String> {
        if self.frame_interval_ms == 0 {
            return Err("frame_interval_ms must be greater than zero".to_string());
        }
        match self.checked_chunk_size() {
            None => {
                return Err(format!(
                    "{} Hz at {} ms per frame overflows the frame size",
                    self.sample_rate, self.frame_interval_ms
                ))
            }
            Some(0) => {
                return Err(format!(
                    "{} Hz at {} ms per frame yields empty frames",
                    self.sample_rate, self.frame_interval_ms
                ))
            }
            Some(_) => {}
        }
        if self.silence_timeout_ms == 0 {
            return Err("silence_timeout_ms must be greater than zero".to_string());
        }
        if self.max_malformed_messages == 0 {
            return Err("max_malformed_messages must be at least 1".to_string());
        }
        if self.host.is_empty() || !self.path.starts_with('/') {
            return Err(format!("invalid endpoint {:?}{:?}", self.host, self.path));
        }
        Ok(())
    }

    pub fn frame_interval(&self) -> Duration {
        Duration::from_millis(self.frame_interval_ms as u64)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn silence_timeout(&self) -> Duration {
        Duration::from_millis(self.silence_timeout_ms)
    }
}

/// Default location: `<config dir>/iat-stream/settings.json`.
pub fn default_settings_path() -> Result<PathBuf, String> {
    let dir = dirs::config_dir().ok_or_else(|| "Could not determine config directory".to_string())?;
    Ok(dir.join(SETTINGS_DIR_NAME).join(SETTINGS_FILE_NAME))
}

/// Load settings from the default location, falling back to defaults.
pub fn load_default_settings() -> RecognizerSettings {
    match default_settings_path() {
        Ok(path) => load_settings(&path),
        Err(e) => {
            log::warn!("Settings: {}", e);
            RecognizerSettings::default()
        }
    }
}

pub fn load_settings(path: &Path) -> RecognizerSettings {
    match std::fs::read_to_string(path) {
        Ok(contents) => match serde_json::from_str::<RecognizerSettings>(&contents) {
            Ok(settings) => settings,
            Err(e) => {
                log::warn!("Settings: failed to parse {:?}: {}", path, e);
                RecognizerSettings::default()
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => RecognizerSettings::default(),
        Err(e) => {
            log::warn!("Settings: failed to read {:?}: {}", path, e);
            RecognizerSettings::default()
        }
    }
}

pub fn save_settings(path: &Path, settings: &RecognizerSettings) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create config directory {:?}: {}", parent, e))?;
    }

    let contents =
        serde_json::to_string_pretty(settings).map_err(|e| format!("Serialize settings: {}", e))?;

    // Write to a sibling temp file, then rename over the target.
    let tmp_path = path.with_extension("json.tmp");
    std::fs::write(&tmp_path, &contents)
        .map_err(|e| format!("Write temp settings {:?}: {}", tmp_path, e))?;

    // rename() does not replace an existing file on Windows.
    if cfg!(windows) && path.exists() {
        if let Err(e) = std::fs::remove_file(path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                return Err(format!("Remove existing settings file {:?}: {}", path, e));
            }
        }
    }

    std::fs::rename(&tmp_path, path)
        .map_err(|e| format!("Rename temp settings {:?} to {:?}: {}", tmp_path, path, e))?;
    Ok(())
}
