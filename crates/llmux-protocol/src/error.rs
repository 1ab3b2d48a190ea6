use serde::{Deserialize, Serialize};

/// Error body shape shared by most providers (`{"error": {...}}`). Google
/// uses `code`/`status` inside; OpenAI uses `type`/`code`; the classifier
/// reads whichever is present.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpstreamErrorEnvelope {
    #[serde(default)]
    pub error: UpstreamErrorBody,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpstreamErrorBody {
    #[serde(default)]
    pub message: String,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl UpstreamErrorEnvelope {
    pub fn parse(body: &[u8]) -> UpstreamErrorEnvelope {
        serde_json::from_slice(body).unwrap_or_default()
    }
}

/// The payload the proxy itself returns to clients on failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyErrorPayload {
    pub error: ProxyErrorDetail,
    pub proxy_note: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyErrorDetail {
    pub message: String,
    #[serde(rename = "type")]
    pub error_type: String,
}

impl ProxyErrorPayload {
    pub fn new(
        error_type: impl Into<String>,
        message: impl Into<String>,
        proxy_note: impl Into<String>,
    ) -> Self {
        Self {
            error: ProxyErrorDetail {
                message: message.into(),
                error_type: error_type.into(),
            },
            proxy_note: proxy_note.into(),
        }
    }
}
