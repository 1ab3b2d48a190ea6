use bytes::Bytes;
use http::StatusCode;

use llmux_protocol::error::ProxyErrorPayload;

/// The typed error union every pipeline stage classifies into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    BadRequest,
    ContextTooLarge,
    NoKeysAvailable,
    UpstreamRateLimited,
    UpstreamUnavailable,
    KeyRevoked,
    KeyOverQuota,
    ClientCancelled,
    InternalError,
}

impl ErrorKind {
    pub fn wire_name(self) -> &'static str {
        match self {
            ErrorKind::BadRequest => "bad_request",
            ErrorKind::ContextTooLarge => "context_too_large",
            ErrorKind::NoKeysAvailable => "no_keys_available",
            ErrorKind::UpstreamRateLimited => "upstream_rate_limited",
            ErrorKind::UpstreamUnavailable => "upstream_unavailable",
            ErrorKind::KeyRevoked => "key_revoked",
            ErrorKind::KeyOverQuota => "key_over_quota",
            ErrorKind::ClientCancelled => "client_cancelled",
            ErrorKind::InternalError => "internal_error",
        }
    }

    pub fn status(self) -> StatusCode {
        match self {
            ErrorKind::BadRequest | ErrorKind::ContextTooLarge => StatusCode::BAD_REQUEST,
            ErrorKind::NoKeysAvailable => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::UpstreamRateLimited => StatusCode::TOO_MANY_REQUESTS,
            ErrorKind::UpstreamUnavailable => StatusCode::BAD_GATEWAY,
            ErrorKind::KeyRevoked | ErrorKind::KeyOverQuota => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::ClientCancelled => StatusCode::BAD_REQUEST,
            ErrorKind::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether the queue may take this request back (bounded by the
    /// retry cap).
    pub fn retryable(self) -> bool {
        matches!(
            self,
            ErrorKind::UpstreamRateLimited | ErrorKind::UpstreamUnavailable
        )
    }
}

#[derive(Debug)]
pub struct ProxyError {
    pub kind: ErrorKind,
    pub message: String,
    /// Verbatim upstream body to pass through (content-policy 400s keep
    /// the provider's own payload, with the proxy note added alongside).
    pub passthrough: Option<(StatusCode, Bytes)>,
}

impl ProxyError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            passthrough: None,
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::BadRequest, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InternalError, message)
    }

    pub fn with_passthrough(mut self, status: StatusCode, body: Bytes) -> Self {
        self.passthrough = Some((status, body));
        self
    }

    pub fn status(&self) -> StatusCode {
        self.passthrough
            .as_ref()
            .map(|(status, _)| *status)
            .unwrap_or_else(|| self.kind.status())
    }

    /// Client-facing JSON body. Passthrough bodies are forwarded verbatim
    /// with the proxy note injected when they parse as an object.
    pub fn payload_bytes(&self) -> Bytes {
        if let Some((_, body)) = &self.passthrough {
            if let Ok(mut value) = serde_json::from_slice::<serde_json::Value>(body)
                && let Some(object) = value.as_object_mut()
            {
                object.insert(
                    "proxy_note".to_string(),
                    serde_json::Value::String(self.message.clone()),
                );
                if let Ok(bytes) = serde_json::to_vec(&value) {
                    return Bytes::from(bytes);
                }
            }
            return body.clone();
        }
        let payload = ProxyErrorPayload::new(
            self.kind.wire_name(),
            self.message.clone(),
            format!("llmux: {}", self.kind.wire_name()),
        );
        serde_json::to_vec(&payload)
            .map(Bytes::from)
            .unwrap_or_else(|_| Bytes::from_static(b"{}"))
    }
}

impl std::fmt::Display for ProxyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind.wire_name(), self.message)
    }
}

impl std::error::Error for ProxyError {}
