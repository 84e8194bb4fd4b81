//! Wire messages for the remote agent endpoint and the inbound decoder that
//! turns them into [`TransportEvent`]s.

use crate::codec::{self, AudioFormat, OutboundFrame};
use crate::config::LiveConfig;
use crate::error::{LiveError, LiveResult};
use crate::tools::{FunctionDeclaration, ToolCallRequest, ToolCallResponse};
use crate::transport::TransportEvent;
use crate::turn::Role;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, trace, warn};

// -----------------------------------------------------------------------------
// Outbound
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ClientMessage {
    Setup(Setup),
    RealtimeInput(RealtimeInput),
    ClientContent(ClientContent),
    ToolResponse(ToolResponse),
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Setup {
    pub model: String,
    pub generation_config: GenerationConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<Content>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolDeclarations>,
    pub input_audio_transcription: Empty,
    pub output_audio_transcription: Empty,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Empty {}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    pub response_modalities: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speech_config: Option<SpeechConfig>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeechConfig {
    pub voice_config: VoiceConfig,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceConfig {
    pub prebuilt_voice_config: PrebuiltVoiceConfig,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PrebuiltVoiceConfig {
    pub voice_name: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDeclarations {
    pub function_declarations: Vec<FunctionDeclaration>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInput {
    pub media_chunks: Vec<Blob>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientContent {
    pub turns: Vec<Content>,
    pub turn_complete: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResponse {
    pub function_responses: Vec<FunctionResponse>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FunctionResponse {
    pub id: String,
    pub name: String,
    pub response: Value,
}

// -----------------------------------------------------------------------------
// Shared
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Content {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default)]
    pub parts: Vec<Part>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inline_data: Option<Blob>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Blob {
    pub mime_type: String,
    pub data: String,
}

// -----------------------------------------------------------------------------
// Inbound
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerMessage {
    #[serde(default)]
    pub setup_complete: Option<Value>,
    #[serde(default)]
    pub server_content: Option<ServerContent>,
    #[serde(default)]
    pub tool_call: Option<ToolCall>,
    #[serde(default)]
    pub tool_call_cancellation: Option<ToolCallCancellation>,
    #[serde(default)]
    pub go_away: Option<GoAway>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerContent {
    #[serde(default)]
    pub model_turn: Option<Content>,
    #[serde(default)]
    pub turn_complete: bool,
    #[serde(default)]
    pub interrupted: bool,
    #[serde(default)]
    pub input_transcription: Option<Transcription>,
    #[serde(default)]
    pub output_transcription: Option<Transcription>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Transcription {
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCall {
    #[serde(default)]
    pub function_calls: Vec<FunctionCall>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FunctionCall {
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub args: Option<Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ToolCallCancellation {
    #[serde(default)]
    pub ids: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GoAway {
    #[serde(default)]
    pub time_left: Option<String>,
}

// -----------------------------------------------------------------------------
// Builders
// -----------------------------------------------------------------------------

pub fn setup_message(config: &LiveConfig, declarations: Vec<FunctionDeclaration>) -> ClientMessage {
    let tools = if declarations.is_empty() {
        Vec::new()
    } else {
        vec![ToolDeclarations {
            function_declarations: declarations,
        }]
    };
    ClientMessage::Setup(Setup {
        model: config.model.clone(),
        generation_config: GenerationConfig {
            response_modalities: vec!["AUDIO".to_string()],
            speech_config: config.voice.as_ref().map(|voice| SpeechConfig {
                voice_config: VoiceConfig {
                    prebuilt_voice_config: PrebuiltVoiceConfig {
                        voice_name: voice.clone(),
                    },
                },
            }),
        },
        system_instruction: config.system_instruction.as_ref().map(|text| Content {
            role: None,
            parts: vec![Part {
                text: Some(text.clone()),
                inline_data: None,
            }],
        }),
        tools,
        input_audio_transcription: Empty {},
        output_audio_transcription: Empty {},
    })
}

pub fn audio_message(frame: &OutboundFrame) -> ClientMessage {
    ClientMessage::RealtimeInput(RealtimeInput {
        media_chunks: vec![Blob {
            mime_type: frame.format().mime_type(),
            data: codec::encode_base64(frame),
        }],
    })
}

pub fn text_message(text: &str, turn_complete: bool) -> ClientMessage {
    ClientMessage::ClientContent(ClientContent {
        turns: vec![Content {
            role: Some("user".to_string()),
            parts: vec![Part {
                text: Some(text.to_string()),
                inline_data: None,
            }],
        }],
        turn_complete,
    })
}

pub fn tool_response_message(response: &ToolCallResponse) -> ClientMessage {
    ClientMessage::ToolResponse(ToolResponse {
        function_responses: vec![FunctionResponse {
            id: response.id.clone(),
            name: response.name.clone(),
            response: response.payload(),
        }],
    })
}

// -----------------------------------------------------------------------------
// Decoder
// -----------------------------------------------------------------------------

/// Stateful decoder for inbound messages.
///
/// The wire carries no explicit end-of-user-turn signal: the user's turn is
/// closed the first time agent output follows user transcript fragments.
#[derive(Debug)]
pub struct InboundDecoder {
    output_rate: u32,
    user_turn_open: bool,
}

impl InboundDecoder {
    pub fn new(output_format: AudioFormat) -> Self {
        Self {
            output_rate: output_format.sample_rate,
            user_turn_open: false,
        }
    }

    /// Decode one message. Malformed JSON is an error (a protocol violation
    /// for the caller to log and drop); malformed parts inside an otherwise
    /// valid message are skipped.
    pub fn decode(&mut self, raw: &[u8]) -> LiveResult<Vec<TransportEvent>> {
        let msg: ServerMessage = serde_json::from_slice(raw)
            .map_err(|e| LiveError::Protocol(format!("malformed server message: {}", e)))?;

        let mut events = Vec::new();

        if msg.setup_complete.is_some() {
            events.push(TransportEvent::SetupComplete);
        }
        if let Some(content) = msg.server_content {
            self.decode_content(content, &mut events);
        }
        if let Some(call) = msg.tool_call {
            self.close_user_turn(&mut events);
            for fc in call.function_calls {
                match fc.id {
                    Some(id) if !id.is_empty() => {
                        events.push(TransportEvent::ToolCallRequested(ToolCallRequest {
                            id,
                            name: fc.name,
                            arguments: fc.args.unwrap_or_else(|| Value::Object(Default::default())),
                        }))
                    }
                    _ => warn!(tool = %fc.name, "dropping tool call without id"),
                }
            }
        }
        if let Some(cancel) = msg.tool_call_cancellation {
            if !cancel.ids.is_empty() {
                events.push(TransportEvent::ToolCallCancelled(cancel.ids));
            }
        }
        if let Some(go_away) = msg.go_away {
            events.push(TransportEvent::GoAway {
                time_left: go_away.time_left,
            });
        }

        if events.is_empty() {
            debug!("server message carried nothing actionable");
        }
        Ok(events)
    }

    fn decode_content(&mut self, content: ServerContent, events: &mut Vec<TransportEvent>) {
        if let Some(text) = content.input_transcription.and_then(|t| t.text) {
            if !text.is_empty() {
                self.user_turn_open = true;
                events.push(TransportEvent::TranscriptDelta {
                    role: Role::User,
                    text,
                });
            }
        }

        let agent_output = content.model_turn.is_some()
            || content.output_transcription.is_some()
            || content.turn_complete;
        if agent_output {
            self.close_user_turn(events);
        }

        if content.interrupted {
            events.push(TransportEvent::Interrupted);
        }

        // Replies are audio; the agent's words come from outputTranscription
        // and text parts would only repeat them.
        if let Some(turn) = content.model_turn {
            for part in turn.parts {
                if let Some(blob) = part.inline_data {
                    match self.decode_audio(&blob) {
                        Ok(event) => events.push(event),
                        Err(e) => warn!("dropping audio part: {}", e),
                    }
                }
                if let Some(text) = part.text {
                    trace!(len = text.len(), "ignoring text part of audio reply");
                }
            }
        }

        if let Some(text) = content.output_transcription.and_then(|t| t.text) {
            if !text.is_empty() {
                events.push(TransportEvent::TranscriptDelta {
                    role: Role::Agent,
                    text,
                });
            }
        }

        if content.turn_complete {
            events.push(TransportEvent::TurnComplete(Role::Agent));
        }
    }

    fn decode_audio(&self, blob: &Blob) -> LiveResult<TransportEvent> {
        let format = AudioFormat::from_mime(&blob.mime_type, self.output_rate)?;
        let data = codec::decode_base64(&blob.data)?;
        Ok(TransportEvent::AudioChunk { data, format })
    }

    fn close_user_turn(&mut self, events: &mut Vec<TransportEvent>) {
        if self.user_turn_open {
            self.user_turn_open = false;
            events.push(TransportEvent::TurnComplete(Role::User));
        }
    }
}
