//! Defines the JSON envelope protocol spoken over the realtime connection.

use parley_core::turn::{Role, SessionConfig, ToolCall, ToolSchema, Turn};
use serde::{Deserialize, Serialize};

/// Session parameters pushed to the backend when a connection opens.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct SessionUpdate {
    pub instructions: String,
    pub voice: String,
    pub allow_recording: bool,
    pub tools: Vec<ToolSchema>,
    pub tool_choice: String,
}

/// An item added to the backend's view of the conversation.
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConversationItem {
    Message {
        role: Role,
        content: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        tool_calls: Option<Vec<ToolCall>>,
    },
    FunctionCallOutput {
        call_id: String,
        output: String,
    },
}

impl ConversationItem {
    pub fn function_output(call_id: impl Into<String>, output: impl Into<String>) -> Self {
        Self::FunctionCallOutput {
            call_id: call_id.into(),
            output: output.into(),
        }
    }

    /// Translates a history turn for replay, or `None` if it carries nothing worth sending.
    ///
    /// - Tool turns need both a `tool_call_id` and content.
    /// - Assistant turns with tool calls are sent with the calls verbatim.
    /// - Anything else needs non-empty text.
    pub fn from_turn(turn: &Turn) -> Option<Self> {
        match turn.role {
            Role::Tool => {
                let call_id = turn.tool_call_id.as_ref()?;
                let output = turn.content.as_ref()?;
                Some(Self::function_output(call_id.clone(), output.clone()))
            }
            Role::Assistant if turn.has_tool_calls() => Some(Self::Message {
                role: Role::Assistant,
                content: turn.content.clone(),
                tool_calls: turn.tool_calls.clone(),
            }),
            role => {
                let content = turn.content.as_ref().filter(|c| !c.is_empty())?;
                Some(Self::Message {
                    role,
                    content: Some(content.clone()),
                    tool_calls: None,
                })
            }
        }
    }
}

/// Messages sent from the client to the backend.
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(tag = "type")]
pub enum OutboundEnvelope {
    #[serde(rename = "session.update")]
    SessionUpdate { session: SessionUpdate },
    #[serde(rename = "input_audio_buffer.append")]
    InputAudioBufferAppend {
        /// Base64-encoded audio frame.
        audio: String,
    },
    #[serde(rename = "conversation.item.create")]
    ConversationItemCreate { item: ConversationItem },
    /// Asks the backend to continue generating.
    #[serde(rename = "response.create")]
    ResponseCreate,
}

impl OutboundEnvelope {
    pub fn session_update(config: &SessionConfig) -> Self {
        Self::SessionUpdate {
            session: SessionUpdate {
                instructions: config.instructions.clone(),
                voice: config.voice_id.clone(),
                allow_recording: config.allow_recording,
                tools: config.tool_declarations.clone(),
                tool_choice: "auto".to_string(),
            },
        }
    }

    pub fn item(item: ConversationItem) -> Self {
        Self::ConversationItemCreate { item }
    }
}

/// One entry of a completed response's output.
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type")]
pub enum OutputItem {
    #[serde(rename = "function_call")]
    FunctionCall {
        call_id: String,
        name: String,
        #[serde(default)]
        arguments: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Deserialize, Debug, Clone, PartialEq, Default)]
pub struct ResponseBody {
    #[serde(default)]
    pub output: Vec<OutputItem>,
}

impl ResponseBody {
    /// The tool calls requested by this response, in output order.
    pub fn tool_calls(&self) -> Vec<ToolCall> {
        self.output
            .iter()
            .filter_map(|item| match item {
                OutputItem::FunctionCall {
                    call_id,
                    name,
                    arguments,
                } => Some(ToolCall::function(call_id, name, arguments)),
                OutputItem::Other => None,
            })
            .collect()
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct ErrorDetail {
    /// `"warning"` for non-fatal notices; anything else is an error.
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub message: String,
}

impl ErrorDetail {
    pub fn is_warning(&self) -> bool {
        self.kind == "warning"
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct AdditionalOutputsArgs {
    #[serde(default)]
    pub debug_dict: serde_json::Value,
}

/// Messages sent from the backend to the client.
///
/// Unrecognized types deserialize to [`InboundEnvelope::Unknown`] so new
/// server messages never break the client.
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type")]
pub enum InboundEnvelope {
    #[serde(rename = "response.audio.delta")]
    AudioDelta {
        /// Base64-encoded audio frame.
        delta: String,
    },
    #[serde(rename = "response.text.delta")]
    TextDelta { delta: String },
    #[serde(rename = "conversation.item.input_audio_transcription.delta")]
    TranscriptionDelta { delta: String },
    #[serde(rename = "response.done")]
    ResponseDone {
        #[serde(default)]
        response: ResponseBody,
    },
    #[serde(rename = "error")]
    Error { error: ErrorDetail },
    #[serde(rename = "unmute.additional_outputs")]
    AdditionalOutputs { args: AdditionalOutputsArgs },
    /// Benign lifecycle notices that need no handling.
    #[serde(
        rename = "session.updated",
        alias = "response.created",
        alias = "response.text.done",
        alias = "response.audio.done",
        alias = "input_audio_buffer.speech_started",
        alias = "input_audio_buffer.speech_stopped",
        alias = "conversation.item.input_audio_transcription.completed",
        alias = "unmute.interrupted_by_vad",
        alias = "unmute.response.text.delta.ready",
        alias = "unmute.response.audio.delta.ready"
    )]
    Status,
    #[serde(other)]
    Unknown,
}
