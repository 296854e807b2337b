//! JSON envelopes exchanged with tenant agents over the bus.
//!
//! Byte arrays travel as base64 strings; header multimaps travel as
//! `[[name, [values...]], ...]`.

use crate::model::EnumRepr;
use serde::{Deserialize, Serialize};

/// Ordered header multimap: `(name, values)` pairs.
pub type HeaderList = Vec<(String, Vec<String>)>;

/// An inbound HTTP request serialized for the tenant's agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpRequestModel {
    pub request_url: String,
    pub method: String,
    #[serde(default)]
    pub headers: HeaderList,
    #[serde(
        default,
        with = "base64_bytes::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub bytes: Option<Vec<u8>>,
}

impl HttpRequestModel {
    /// Methods defined to carry no body worth forwarding.
    pub fn method_has_no_body(method: &str) -> bool {
        ["GET", "HEAD", "DELETE", "TRACE"]
            .iter()
            .any(|m| m.eq_ignore_ascii_case(method))
    }
}

/// The agent's reply to an [`HttpRequestModel`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpResponseModel {
    #[serde(default)]
    pub content_type: Option<String>,
    #[serde(default)]
    pub headers: HeaderList,
    #[serde(default)]
    pub string_content: Option<String>,
    #[serde(default, with = "base64_bytes::option")]
    pub bytes: Option<Vec<u8>>,
    pub http_status_code: u16,
    #[serde(default)]
    pub is_success_status_code: bool,
    #[serde(default)]
    pub is_redirected: bool,
    #[serde(default)]
    pub redirect_url: Option<String>,
}

impl HttpResponseModel {
    /// A plain response with a string body.
    pub fn text(status: u16, content: impl Into<String>) -> Self {
        Self {
            content_type: Some("text/plain; charset=utf-8".to_string()),
            headers: Vec::new(),
            string_content: Some(content.into()),
            bytes: None,
            http_status_code: status,
            is_success_status_code: (200..300).contains(&status),
            is_redirected: false,
            redirect_url: None,
        }
    }

    /// A redirect response pointing at `url`.
    pub fn redirect(status: u16, url: impl Into<String>) -> Self {
        Self {
            content_type: None,
            headers: Vec::new(),
            string_content: None,
            bytes: None,
            http_status_code: status,
            is_success_status_code: false,
            is_redirected: true,
            redirect_url: Some(url.into()),
        }
    }
}

/// WebSocket frame kind, numbered as the agents expect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "EnumRepr", into = "u8")]
pub enum MessageType {
    Text,
    Binary,
    Close,
}

impl From<MessageType> for u8 {
    fn from(t: MessageType) -> u8 {
        match t {
            MessageType::Text => 0,
            MessageType::Binary => 1,
            MessageType::Close => 2,
        }
    }
}

impl TryFrom<EnumRepr> for MessageType {
    type Error = String;

    fn try_from(repr: EnumRepr) -> Result<Self, Self::Error> {
        match repr {
            EnumRepr::Number(0) => Ok(Self::Text),
            EnumRepr::Number(1) => Ok(Self::Binary),
            EnumRepr::Number(2) => Ok(Self::Close),
            EnumRepr::Name(name) if name.eq_ignore_ascii_case("text") => Ok(Self::Text),
            EnumRepr::Name(name) if name.eq_ignore_ascii_case("binary") => Ok(Self::Binary),
            EnumRepr::Name(name) if name.eq_ignore_ascii_case("close") => Ok(Self::Close),
            other => Err(format!("unknown message type: {other:?}")),
        }
    }
}

/// One WebSocket frame relayed over the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebSocketData {
    #[serde(with = "base64_bytes")]
    pub payload: Vec<u8>,
    pub payload_count: usize,
    pub message_type: MessageType,
    pub end_of_message: bool,
}

impl WebSocketData {
    pub fn new(payload: Vec<u8>, message_type: MessageType, end_of_message: bool) -> Self {
        Self {
            payload_count: payload.len(),
            payload,
            message_type,
            end_of_message,
        }
    }

    /// The meaningful prefix of the payload, as declared by `payload_count`.
    ///
    /// Senders may ship a larger buffer than they filled.
    pub fn payload(&self) -> &[u8] {
        &self.payload[..self.payload_count.min(self.payload.len())]
    }
}

/// Serde adapter for byte arrays encoded as standard base64 strings.
pub mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }

    pub mod option {
        use super::STANDARD;
        use base64::Engine;
        use serde::{Deserialize, Deserializer, Serializer};

        pub fn serialize<S: Serializer>(
            bytes: &Option<Vec<u8>>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match bytes {
                Some(b) => serializer.serialize_str(&STANDARD.encode(b)),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<Vec<u8>>, D::Error> {
            match Option::<String>::deserialize(deserializer)? {
                Some(encoded) => STANDARD
                    .decode(encoded.as_bytes())
                    .map(Some)
                    .map_err(serde::de::Error::custom),
                None => Ok(None),
            }
        }
    }
}
