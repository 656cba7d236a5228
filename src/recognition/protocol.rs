//! IAT WebSocket protocol types
//!
//! # Protocol Overview
//!
//! 1. Connect to the signed `wss://iat.xf-yun.com/v1?authorization=…` URL
//! 2. Send the FIRST frame: header, recognition parameters, empty audio
//! 3. Send MIDDLE frames, one paced interval of base64 PCM each
//! 4. Send the LAST frame with empty audio
//! 5. Receive envelopes until one is marked final
//!
//! Inbound results are wrapped twice. The envelope is JSON; its
//! `payload.result.text` is base64 of a second JSON document holding the
//! word segments. The two layers are decoded in separate stages so a failure
//! is attributed to the right one.

use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};

use super::framer::{AudioFrame, FramePosition};
use super::transcript::TranscriptFragment;
use crate::settings::RecognizerSettings;

/// `status` value marking the last result of a session
const STATUS_LAST: u8 = 2;

/// `pgs` value asking the client to replace the transcript
const PGS_REPLACE: &str = "rpl";

/// Recognition parameters carried by the FIRST frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecognitionParams {
    pub language: String,
    pub accent: String,
    pub domain: String,
    pub eos_ms: u32,
    pub dynamic_correction: bool,
    pub sample_rate: u32,
}

impl Default for RecognitionParams {
    fn default() -> Self {
        Self::from(&RecognizerSettings::default())
    }
}

impl From<&RecognizerSettings> for RecognitionParams {
    fn from(settings: &RecognizerSettings) -> Self {
        Self {
            language: settings.language.clone(),
            accent: settings.accent.clone(),
            domain: settings.domain.clone(),
            eos_ms: settings.eos_ms,
            dynamic_correction: settings.dynamic_correction,
            sample_rate: settings.sample_rate,
        }
    }
}

// ============================================================================
// Client Frames (sent TO the service)
// ============================================================================

#[derive(Debug, Serialize)]
struct ClientFrame<'a> {
    header: ClientHeader<'a>,
    #[serde(skip_serializing_if = "Option::is_none")]
    parameter: Option<Parameter<'a>>,
    payload: ClientPayload,
}

#[derive(Debug, Serialize)]
struct ClientHeader<'a> {
    app_id: &'a str,
    status: u8,
}

#[derive(Debug, Serialize)]
struct Parameter<'a> {
    iat: IatParameter<'a>,
}

#[derive(Debug, Serialize)]
struct IatParameter<'a> {
    domain: &'a str,
    language: &'a str,
    accent: &'a str,
    /// Trailing silence in ms before the service ends recognition
    eos: u32,
    /// "wpgs" turns on dynamic correction
    #[serde(skip_serializing_if = "Option::is_none")]
    dwa: Option<&'a str>,
    result: ResultFormat,
}

#[derive(Debug, Serialize)]
struct ResultFormat {
    encoding: &'static str,
    compress: &'static str,
    format: &'static str,
}

#[derive(Debug, Serialize)]
struct ClientPayload {
    audio: AudioPayload,
}

#[derive(Debug, Serialize)]
struct AudioPayload {
    /// "raw" is PCM
    encoding: &'static str,
    sample_rate: u32,
    channels: u8,
    bit_depth: u8,
    seq: u64,
    status: u8,
    /// Base64 PCM, empty for FIRST and LAST
    audio: String,
}

/// Serializes frames for one session
#[derive(Debug, Clone)]
pub struct FrameEncoder {
    app_id: String,
    params: RecognitionParams,
}

impl FrameEncoder {
    pub fn new(app_id: impl Into<String>, params: RecognitionParams) -> Self {
        Self {
            app_id: app_id.into(),
            params,
        }
    }

    /// Encode one frame as a JSON text message
    ///
    /// Only the FIRST frame carries the `parameter` block.
    pub fn encode(&self, frame: &AudioFrame) -> Result<String, serde_json::Error> {
        let parameter = (frame.position == FramePosition::First).then(|| Parameter {
            iat: IatParameter {
                domain: &self.params.domain,
                language: &self.params.language,
                accent: &self.params.accent,
                eos: self.params.eos_ms,
                dwa: self.params.dynamic_correction.then_some("wpgs"),
                result: ResultFormat {
                    encoding: "utf8",
                    compress: "raw",
                    format: "json",
                },
            },
        });

        let audio = if frame.payload.is_empty() {
            String::new()
        } else {
            STANDARD.encode(&frame.payload)
        };

        let client_frame = ClientFrame {
            header: ClientHeader {
                app_id: &self.app_id,
                status: frame.position.status(),
            },
            parameter,
            payload: ClientPayload {
                audio: AudioPayload {
                    encoding: "raw",
                    sample_rate: self.params.sample_rate,
                    channels: 1,
                    bit_depth: 16,
                    seq: frame.sequence,
                    status: frame.position.status(),
                    audio,
                },
            },
        };

        serde_json::to_string(&client_frame)
    }
}

// ============================================================================
// Server Envelopes (received FROM the service)
// ============================================================================

/// Outer JSON envelope of every inbound message
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServerEnvelope {
    #[serde(default)]
    pub header: ServerHeader,
    #[serde(default)]
    pub payload: Option<ServerPayload>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServerHeader {
    /// 0 on success, provider error code otherwise
    #[serde(default)]
    pub code: i64,
    /// May be absent or null on error envelopes
    #[serde(default)]
    pub message: Option<String>,
    /// Provider session id, useful when reporting errors
    #[serde(default)]
    pub sid: Option<String>,
    #[serde(default)]
    pub status: Option<u8>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServerPayload {
    #[serde(default)]
    pub result: Option<ResultBlock>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResultBlock {
    #[serde(default)]
    pub status: Option<u8>,
    #[serde(default)]
    pub seq: Option<u64>,
    /// Base64 of the nested [`RecognizedText`] JSON
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub pgs: Option<String>,
}

/// Nested result block, after base64 decoding
#[derive(Debug, Clone, Default, Deserialize)]
struct RecognizedText {
    #[serde(default)]
    sn: Option<u64>,
    /// Last result of the session
    #[serde(default)]
    ls: bool,
    /// "apd" (append) or "rpl" (replace) when dynamic correction is on
    #[serde(default)]
    pgs: Option<String>,
    #[serde(default)]
    ws: Vec<WordSegment>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct WordSegment {
    #[serde(default)]
    cw: Vec<CandidateWord>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct CandidateWord {
    #[serde(default)]
    w: String,
}

/// Which decode stage rejected a message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MalformedSite {
    /// The outer JSON envelope
    Envelope,
    /// The base64 + JSON result nested in the envelope
    Payload,
}

/// An inbound message that could not be decoded
///
/// Recoverable: the session logs and skips it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Malformed {site:?} in inbound message: {detail}")]
pub struct MalformedMessage {
    pub site: MalformedSite,
    pub detail: String,
}

impl MalformedMessage {
    fn envelope(detail: impl ToString) -> Self {
        Self {
            site: MalformedSite::Envelope,
            detail: detail.to_string(),
        }
    }

    fn payload(detail: impl ToString) -> Self {
        Self {
            site: MalformedSite::Payload,
            detail: detail.to_string(),
        }
    }
}

impl ServerEnvelope {
    /// Stage one: parse the outer envelope
    pub fn parse(text: &str) -> Result<Self, MalformedMessage> {
        serde_json::from_str(text).map_err(MalformedMessage::envelope)
    }

    pub fn is_error(&self) -> bool {
        self.header.code != 0
    }

    fn result(&self) -> Option<&ResultBlock> {
        self.payload.as_ref()?.result.as_ref()
    }

    /// Stage two: decode the nested result into a fragment
    ///
    /// Returns `Ok(None)` for envelopes that carry no text and are not final
    /// (e.g. the handshake acknowledgement).
    pub fn fragment(&self) -> Result<Option<TranscriptFragment>, MalformedMessage> {
        let header_final = self.header.status == Some(STATUS_LAST);

        let Some(result) = self.result() else {
            return Ok(header_final.then(|| TranscriptFragment::default().into_final()));
        };

        let result_final = header_final || result.status == Some(STATUS_LAST);

        let encoded = match result.text.as_deref() {
            Some(text) if !text.is_empty() => text,
            _ => {
                return Ok(result_final.then(|| TranscriptFragment::default().into_final()));
            }
        };

        let decoded = STANDARD
            .decode(encoded)
            .map_err(|e| MalformedMessage::payload(format!("base64: {}", e)))?;
        let nested: RecognizedText = serde_json::from_slice(&decoded)
            .map_err(|e| MalformedMessage::payload(format!("json: {}", e)))?;

        let words: String = nested
            .ws
            .iter()
            .flat_map(|segment| segment.cw.iter())
            .map(|candidate| candidate.w.as_str())
            .collect();

        let pgs = nested.pgs.as_deref().or(result.pgs.as_deref());

        log::trace!(
            "Protocol: result sn={:?} seq={:?} pgs={:?} ls={}",
            nested.sn,
            result.seq,
            pgs,
            nested.ls
        );

        Ok(Some(TranscriptFragment {
            words,
            replace: pgs == Some(PGS_REPLACE),
            is_final: result_final || nested.ls,
        }))
    }
}

/// Classified inbound message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// Recognized text (possibly empty, possibly final)
    Fragment(TranscriptFragment),
    /// Valid envelope with nothing to apply
    Ack,
    /// Nonzero status code
    ProviderError {
        code: i64,
        message: String,
        sid: Option<String>,
    },
    Malformed(MalformedMessage),
}

/// Decode one inbound text message through both stages
pub fn decode_inbound(text: &str) -> Inbound {
    let envelope = match ServerEnvelope::parse(text) {
        Ok(envelope) => envelope,
        Err(e) => return Inbound::Malformed(e),
    };

    if envelope.is_error() {
        let message = envelope
            .header
            .message
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| "Unknown error".to_string());
        return Inbound::ProviderError {
            code: envelope.header.code,
            message,
            sid: envelope.header.sid,
        };
    }

    match envelope.fragment() {
        Ok(Some(fragment)) => Inbound::Fragment(fragment),
        Ok(None) => Inbound::Ack,
        Err(e) => Inbound::Malformed(e),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde_json::{json, Value};

    /// Build an inbound envelope the way the service does
    pub(crate) fn result_message(words: &[&str], pgs: &str, status: u8) -> String {
        let nested = json!({
            "sn": 1,
            "ls": status == 2,
            "pgs": pgs,
            "ws": words.iter().map(|w| json!({"bg": 0, "cw": [{"w": w, "sc": 0}]})).collect::<Vec<_>>(),
        });
        json!({
            "header": {"code": 0, "message": "success", "sid": "iat000", "status": status},
            "payload": {"result": {
                "compress": "raw", "encoding": "utf8", "format": "json",
                "seq": 1, "status": status,
                "text": STANDARD.encode(nested.to_string()),
            }}
        })
        .to_string()
    }

    fn frame(position: FramePosition, payload: Vec<u8>) -> AudioFrame {
        AudioFrame {
            sequence: 7,
            position,
            payload,
        }
    }

    #[test]
    fn test_first_frame_carries_parameters() {
        let encoder = FrameEncoder::new("app-1", RecognitionParams::default());
        let json: Value =
            serde_json::from_str(&encoder.encode(&frame(FramePosition::First, vec![])).unwrap())
                .unwrap();

        assert_eq!(json["header"]["app_id"], "app-1");
        assert_eq!(json["header"]["status"], 0);
        assert_eq!(json["parameter"]["iat"]["domain"], "slm");
        assert_eq!(json["parameter"]["iat"]["language"], "zh_cn");
        assert_eq!(json["parameter"]["iat"]["accent"], "mandarin");
        assert_eq!(json["parameter"]["iat"]["eos"], 6000);
        assert_eq!(json["parameter"]["iat"]["dwa"], "wpgs");
        assert_eq!(json["parameter"]["iat"]["result"]["format"], "json");
        assert_eq!(json["payload"]["audio"]["sample_rate"], 16000);
        assert_eq!(json["payload"]["audio"]["bit_depth"], 16);
        assert_eq!(json["payload"]["audio"]["audio"], "");
    }

    #[test]
    fn test_middle_frame_has_base64_audio_and_no_parameters() {
        let encoder = FrameEncoder::new("app-1", RecognitionParams::default());
        let json: Value = serde_json::from_str(
            &encoder
                .encode(&frame(FramePosition::Middle, vec![0x34, 0x12, 0x78, 0x56]))
                .unwrap(),
        )
        .unwrap();

        assert!(json.get("parameter").is_none());
        assert_eq!(json["header"]["status"], 1);
        assert_eq!(json["payload"]["audio"]["status"], 1);
        assert_eq!(json["payload"]["audio"]["seq"], 7);
        let audio = json["payload"]["audio"]["audio"].as_str().unwrap();
        assert_eq!(STANDARD.decode(audio).unwrap(), vec![0x34, 0x12, 0x78, 0x56]);
    }

    #[test]
    fn test_last_frame_is_empty() {
        let encoder = FrameEncoder::new("app-1", RecognitionParams::default());
        let json: Value =
            serde_json::from_str(&encoder.encode(&frame(FramePosition::Last, vec![])).unwrap())
                .unwrap();
        assert_eq!(json["header"]["status"], 2);
        assert_eq!(json["payload"]["audio"]["audio"], "");
    }

    #[test]
    fn test_dynamic_correction_off_omits_dwa() {
        let params = RecognitionParams {
            dynamic_correction: false,
            ..Default::default()
        };
        let encoder = FrameEncoder::new("app-1", params);
        let json: Value =
            serde_json::from_str(&encoder.encode(&frame(FramePosition::First, vec![])).unwrap())
                .unwrap();
        assert!(json["parameter"]["iat"].get("dwa").is_none());
    }

    #[test]
    fn test_decode_fragment_concatenates_words() {
        let msg = result_message(&["今天", "天气", "很好"], "apd", 1);
        assert_eq!(
            decode_inbound(&msg),
            Inbound::Fragment(TranscriptFragment::append("今天天气很好"))
        );
    }

    #[test]
    fn test_decode_replace_and_final() {
        let msg = result_message(&["你好"], "rpl", 2);
        assert_eq!(
            decode_inbound(&msg),
            Inbound::Fragment(TranscriptFragment::replace("你好").into_final())
        );
    }

    #[test]
    fn test_missing_pgs_means_append() {
        let nested = json!({"sn": 1, "ls": false, "ws": [{"cw": [{"w": "x"}]}]});
        let msg = json!({
            "header": {"code": 0, "status": 1},
            "payload": {"result": {"status": 1, "text": STANDARD.encode(nested.to_string())}}
        })
        .to_string();
        assert_eq!(
            decode_inbound(&msg),
            Inbound::Fragment(TranscriptFragment::append("x"))
        );
    }

    #[test]
    fn test_pgs_on_envelope_result_is_honoured() {
        let nested = json!({"sn": 2, "ls": false, "ws": [{"cw": [{"w": "y"}]}]});
        let msg = json!({
            "header": {"code": 0, "status": 1},
            "payload": {"result": {"status": 1, "pgs": "rpl", "text": STANDARD.encode(nested.to_string())}}
        })
        .to_string();
        assert_eq!(
            decode_inbound(&msg),
            Inbound::Fragment(TranscriptFragment::replace("y"))
        );
    }

    #[test]
    fn test_ls_marks_final() {
        let nested = json!({"sn": 3, "ls": true, "ws": []});
        let msg = json!({
            "header": {"code": 0, "status": 1},
            "payload": {"result": {"status": 1, "text": STANDARD.encode(nested.to_string())}}
        })
        .to_string();
        assert_eq!(
            decode_inbound(&msg),
            Inbound::Fragment(TranscriptFragment::default().into_final())
        );
    }

    #[test]
    fn test_provider_error() {
        let msg = r#"{"header":{"code":10313,"message":"invalid appid","sid":"iat42","status":2}}"#;
        assert_eq!(
            decode_inbound(msg),
            Inbound::ProviderError {
                code: 10313,
                message: "invalid appid".to_string(),
                sid: Some("iat42".to_string()),
            }
        );
    }

    #[test]
    fn test_provider_error_without_message() {
        for msg in [
            r#"{"header":{"code":10165,"message":null,"sid":"iat1","status":2}}"#,
            r#"{"header":{"code":10165,"message":"","sid":"iat1","status":2}}"#,
            r#"{"header":{"code":10165}}"#,
        ] {
            match decode_inbound(msg) {
                Inbound::ProviderError { code, message, .. } => {
                    assert_eq!(code, 10165);
                    assert_eq!(message, "Unknown error");
                }
                other => panic!("Expected ProviderError for {}, got {:?}", msg, other),
            }
        }
    }

    #[test]
    fn test_handshake_ack() {
        let msg = r#"{"header":{"code":0,"message":"success","sid":"iat1","status":0}}"#;
        assert_eq!(decode_inbound(msg), Inbound::Ack);
    }

    #[test]
    fn test_final_header_without_result_is_final_fragment() {
        let msg = r#"{"header":{"code":0,"message":"success","status":2}}"#;
        assert_eq!(
            decode_inbound(msg),
            Inbound::Fragment(TranscriptFragment::default().into_final())
        );
    }

    #[test]
    fn test_envelope_failure_site() {
        match decode_inbound("not json") {
            Inbound::Malformed(e) => assert_eq!(e.site, MalformedSite::Envelope),
            other => panic!("Expected Malformed, got {:?}", other),
        }
    }

    #[test]
    fn test_bad_base64_is_payload_failure() {
        let msg = r#"{"header":{"code":0,"status":1},"payload":{"result":{"status":1,"text":"%%%"}}}"#;
        match decode_inbound(msg) {
            Inbound::Malformed(e) => {
                assert_eq!(e.site, MalformedSite::Payload);
                assert!(e.detail.starts_with("base64"));
            }
            other => panic!("Expected Malformed, got {:?}", other),
        }
    }

    #[test]
    fn test_bad_nested_json_is_payload_failure() {
        let msg = json!({
            "header": {"code": 0, "status": 1},
            "payload": {"result": {"status": 1, "text": STANDARD.encode("{broken")}}
        })
        .to_string();
        match decode_inbound(&msg) {
            Inbound::Malformed(e) => {
                assert_eq!(e.site, MalformedSite::Payload);
                assert!(e.detail.starts_with("json"));
            }
            other => panic!("Expected Malformed, got {:?}", other),
        }
    }
}
