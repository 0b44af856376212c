//! Typed payload records for model and inference operations (§3, §6).
//!
//! These are `serde`-mapped directly onto [`crate::Envelope::payload`] —
//! callers deserialize with [`crate::Envelope::payload_as`] rather than
//! hand-rolling `Value` field lookups.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SamplingParams {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(rename = "topP", skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(rename = "topK", skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
    #[serde(rename = "repetitionPenalty", skip_serializing_if = "Option::is_none")]
    pub repetition_penalty: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerateRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(rename = "maxTokens", skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sampling: Option<SamplingParams>,
}

impl GenerateRequest {
    /// Split `messages` into `(prompt, history)` per §4.4: the content of
    /// the last `user` message is the active prompt; everything before it
    /// (preserving order and roles) is history. Absent a `user` message,
    /// the prompt is empty and history is the full list.
    pub fn split_prompt_and_history(&self) -> (String, Vec<ChatMessage>) {
        match self.messages.iter().rposition(|m| m.role == Role::User) {
            Some(idx) => {
                let prompt = self.messages[idx].content.clone();
                let history = self.messages[..idx].to_vec();
                (prompt, history)
            }
            None => (String::new(), self.messages.clone()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(rename = "promptTokens", skip_serializing_if = "Option::is_none")]
    pub prompt_tokens: Option<u32>,
    #[serde(rename = "completionTokens", skip_serializing_if = "Option::is_none")]
    pub completion_tokens: Option<u32>,
    #[serde(rename = "totalTokens", skip_serializing_if = "Option::is_none")]
    pub total_tokens: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Timings {
    #[serde(rename = "ttftMs")]
    pub ttft_ms: u64,
    #[serde(rename = "totalMs")]
    pub total_ms: u64,
    #[serde(rename = "tokensPerSecond")]
    pub tokens_per_second: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerateResponse {
    #[serde(rename = "requestId")]
    pub request_id: String,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timings: Option<Timings>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum DownloadSource {
    Huggingface {
        repo: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        revision: Option<String>,
    },
    LocalPath { path: String },
}

/// Payload of `model.download`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadRequest {
    pub source: DownloadSource,
    #[serde(rename = "modelsDir", skip_serializing_if = "Option::is_none")]
    pub models_dir: Option<String>,
}

/// Reply payload of `model.download.ok`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadResult {
    pub model: String,
    #[serde(rename = "localPath")]
    pub local_path: String,
}

/// Reply payload of `model.list.ok`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelListResult {
    pub cached: Vec<String>,
    pub loaded: Vec<String>,
}

/// Payload of `reset`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResetRequest {
    #[serde(rename = "unloadAll", default = "default_true")]
    pub unload_all: bool,
    #[serde(rename = "clearCache", default)]
    pub clear_cache: bool,
}

fn default_true() -> bool {
    true
}

/// The logical stream event sequence: exactly one `Start` precedes zero or
/// more `Token`s; exactly one `End` or `Error` terminates it. Wire-encoded
/// as distinct envelope `type`s (see [`crate::types`]), this is the shape
/// client code actually consumes after demultiplexing.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Start { request_id: String },
    Token { request_id: String, text: String },
    End { request_id: String, final_response: GenerateResponse },
    Error { request_id: String, code: String, message: String },
}

impl StreamEvent {
    pub fn request_id(&self) -> &str {
        match self {
            StreamEvent::Start { request_id }
            | StreamEvent::Token { request_id, .. }
            | StreamEvent::End { request_id, .. }
            | StreamEvent::Error { request_id, .. } => request_id,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::End { .. } | StreamEvent::Error { .. })
    }
}
