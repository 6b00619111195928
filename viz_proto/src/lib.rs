//! Wire contracts between the visualization server and viewer clients.
//!
//! Every frame is a JSON object tagged by `type`. Inbound frames may carry
//! `step` or `n_sims` next to `data`; outbound commands always nest their
//! arguments under `data`.

use ahash::RandomState;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::hash::{BuildHasher, Hasher};
use thiserror::Error;

/// Plain-text greeting some servers send before the first JSON frame.
pub const CONNECTED_GREETING: &str = "connected";

/// `type` values accepted by [`decode_server_message`].
pub const SERVER_MESSAGE_KINDS: &[&str] = &[
    "model_state",
    "end",
    "model_params",
    "vega_specs",
    "init",
    "reset",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// One state per replica for `step`, in replica order.
    ModelState { step: u64, data: Vec<EncodedJson> },
    /// No replica is running any more.
    End,
    ModelParams {
        #[serde(default, alias = "params")]
        data: Vec<Value>,
    },
    VegaSpecs {
        #[serde(default)]
        data: Vec<EncodedJson>,
        #[serde(default)]
        n_sims: Option<usize>,
    },
    #[serde(alias = "reset")]
    Init { n_sims: usize },
}

/// A JSON document that the server may send either pre-encoded as a string
/// or inline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EncodedJson {
    Text(String),
    Inline(Value),
}

impl EncodedJson {
    pub fn decode(&self) -> serde_json::Result<Value> {
        match self {
            EncodedJson::Text(text) => serde_json::from_str(text),
            EncodedJson::Inline(value) => Ok(value.clone()),
        }
    }
}

impl From<Value> for EncodedJson {
    fn from(value: Value) -> Self {
        EncodedJson::Text(value.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyPayload {
    pub key: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ClientCommand {
    Reset {},
    Step {
        step: u64,
    },
    CallMethod {
        model_id: usize,
        data: Map<String, Value>,
    },
    KeyPress {
        model_id: usize,
        data: KeyPayload,
    },
}

impl ClientCommand {
    pub fn kind(&self) -> &'static str {
        match self {
            ClientCommand::Reset {} => "reset",
            ClientCommand::Step { .. } => "step",
            ClientCommand::CallMethod { .. } => "call_method",
            ClientCommand::KeyPress { .. } => "key_press",
        }
    }
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("frame is not valid JSON: {0}")]
    Json(#[source] serde_json::Error),
    #[error("frame has no string `type` field")]
    MissingKind,
    #[error("unknown message type '{0}'")]
    UnknownKind(String),
    #[error("malformed '{kind}' message: {source}")]
    Malformed {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
}

impl DecodeError {
    /// Unknown kinds are tolerated as warnings; everything else is a
    /// rejected frame.
    pub fn is_unknown_kind(&self) -> bool {
        matches!(self, DecodeError::UnknownKind(_))
    }
}

pub fn decode_server_message(text: &str) -> Result<ServerMessage, DecodeError> {
    let value: Value = serde_json::from_str(text).map_err(DecodeError::Json)?;
    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or(DecodeError::MissingKind)?
        .to_owned();
    if !SERVER_MESSAGE_KINDS.contains(&kind.as_str()) {
        return Err(DecodeError::UnknownKind(kind));
    }
    serde_json::from_value(value).map_err(|source| DecodeError::Malformed { kind, source })
}

pub fn encode_server_message_json(message: &ServerMessage) -> serde_json::Result<String> {
    serde_json::to_string(message)
}

pub fn encode_command_json(command: &ClientCommand) -> serde_json::Result<String> {
    serde_json::to_string(command)
}

pub fn decode_command_json(text: &str) -> serde_json::Result<ClientCommand> {
    serde_json::from_str(text)
}

/// Stable 64-bit fingerprint of a JSON value. Object keys are sorted by
/// `serde_json::Map`, so equal documents hash equally regardless of the
/// order the server emitted them in.
pub fn fingerprint_json(value: &Value) -> u64 {
    let encoded = value.to_string();
    let mut hasher = RandomState::with_seeds(0, 0, 0, 0).build_hasher();
    hasher.write(encoded.as_bytes());
    hasher.finish()
}
