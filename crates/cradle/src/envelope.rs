//! Wire message exchanged with the client in both directions.
//!
//! Every frame is one JSON object. Unknown fields are ignored and absent
//! fields take the defaults below, so clients can send only what they use.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Function name carried by the termination sentinel.
pub const TERMINATE_FUNCTION: &str = "TERMINATE";

const DEFAULT_FUNCTION: &str = "chat";

/// Errors produced while decoding or encoding envelopes.
#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("malformed envelope: {0}")]
    Malformed(#[source] serde_json::Error),

    #[error("envelope fields must be a JSON object, got {0}")]
    NotAnObject(&'static str),

    #[error("failed to encode envelope: {0}")]
    Encode(#[source] serde_json::Error),
}

/// The message unit flowing between client and worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Envelope {
    /// Operation selector ("chat", or the sentinel "TERMINATE").
    pub function: String,
    /// Primary payload, usually the user's request.
    pub main_input: String,
    pub llm_kwargs: Map<String, Value>,
    pub plugin_kwargs: Map<String, Value>,
    /// Display transcript: one `(user, bot)` pair per turn.
    pub chatbot: Vec<(String, String)>,
    /// Model transcript.
    pub history: Vec<String>,
    pub system_prompt: String,
    pub user_request: String,
    pub special_kwargs: Map<String, Value>,
    /// Out-of-band signalling, e.g. `{"stop": true}`.
    pub special_state: Map<String, Value>,
    /// Realtime frames bypass the inbound queue.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub realtime: bool,
}

impl Default for Envelope {
    fn default() -> Self {
        Self {
            function: DEFAULT_FUNCTION.to_string(),
            main_input: String::new(),
            llm_kwargs: Map::new(),
            plugin_kwargs: Map::new(),
            chatbot: Vec::new(),
            history: Vec::new(),
            system_prompt: String::new(),
            user_request: String::new(),
            special_kwargs: Map::new(),
            special_state: Map::new(),
            realtime: false,
        }
    }
}

impl Envelope {
    /// A `chat` request with the given input.
    pub fn chat(main_input: impl Into<String>) -> Self {
        Self {
            main_input: main_input.into(),
            ..Self::default()
        }
    }

    /// The local termination sentinel.
    ///
    /// Never forwarded to the worker or written to the client; it only
    /// stands in for the termination flag inside the loops.
    pub fn terminate() -> Self {
        let mut special_state = Map::new();
        special_state.insert("stop".to_string(), Value::Bool(true));
        Self {
            function: TERMINATE_FUNCTION.to_string(),
            special_state,
            ..Self::default()
        }
    }

    /// Sentinel recognition looks at `function` only.
    pub fn is_terminate(&self) -> bool {
        self.function == TERMINATE_FUNCTION
    }

    /// True when `special_state.stop` is `true`.
    pub fn is_stop_requested(&self) -> bool {
        matches!(self.special_state.get("stop"), Some(Value::Bool(true)))
    }

    /// Parse a text frame.
    pub fn from_json(text: &str) -> Result<Self, EnvelopeError> {
        serde_json::from_str(text).map_err(EnvelopeError::Malformed)
    }

    /// Build an envelope from a partial set of fields, defaults filling the rest.
    ///
    /// This is the shape of the worker callback: `{"chatbot": [["hi", "hello"]]}`
    /// becomes a full `chat` envelope.
    pub fn from_fields(fields: Value) -> Result<Self, EnvelopeError> {
        match fields {
            Value::Object(_) => serde_json::from_value(fields).map_err(EnvelopeError::Malformed),
            Value::Null => Err(EnvelopeError::NotAnObject("null")),
            Value::Bool(_) => Err(EnvelopeError::NotAnObject("bool")),
            Value::Number(_) => Err(EnvelopeError::NotAnObject("number")),
            Value::String(_) => Err(EnvelopeError::NotAnObject("string")),
            Value::Array(_) => Err(EnvelopeError::NotAnObject("array")),
        }
    }

    /// Serialize for the wire.
    pub fn to_json_bytes(&self) -> Result<Vec<u8>, EnvelopeError> {
        serde_json::to_vec(self).map_err(EnvelopeError::Encode)
    }
}
