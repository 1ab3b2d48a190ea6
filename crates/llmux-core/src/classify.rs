use llmux_common::{ModelFamily, Service};
use llmux_protocol::error::UpstreamErrorEnvelope;

use crate::error::ErrorKind;

/// What the pipeline must do after a non-2xx upstream response: mutate
/// key state, re-enqueue, surface, or some combination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamAction {
    /// 429-style: lock the key out and retry on another one.
    RateLimitRetry,
    /// Google AI quota exhaustion scoped to one family; the key stays
    /// usable for its other families.
    FamilyQuotaRetry { family: ModelFamily },
    /// Credential is gone for good; retry lets another key absorb it.
    DisableRevokedRetry,
    /// Billing/quota exhausted; credential valid but unusable.
    DisableQuotaRetry,
    /// Anthropic wants the conversation to open with a Human turn.
    RequirePreambleRetry,
    /// Anthropic denied multimodal input for this key.
    DisallowMultimodalRetry,
    /// AWS denied one model; narrow the key instead of disabling it.
    NarrowFamilyRetry { family: ModelFamily },
    /// Transient upstream trouble; plain re-enqueue.
    TransientRetry,
    /// Hand the provider's body to the client unchanged (plus proxy note)
    /// and refund the attempt's token credit.
    SurfaceRefund,
    /// Hand the provider's body to the client unchanged; key untouched.
    Surface { kind: ErrorKind },
}

impl UpstreamAction {
    pub fn retries(&self) -> bool {
        !matches!(
            self,
            UpstreamAction::SurfaceRefund | UpstreamAction::Surface { .. }
        )
    }
}

/// Map an upstream failure to its action using per-service rules layered
/// over the canonical table.
pub fn classify_upstream(
    service: Service,
    family: ModelFamily,
    status: u16,
    body: &[u8],
) -> UpstreamAction {
    let envelope = UpstreamErrorEnvelope::parse(body);
    let message = envelope.error.message.to_ascii_lowercase();
    let error_type = envelope
        .error
        .error_type
        .as_deref()
        .unwrap_or("")
        .to_ascii_lowercase();
    let google_status = envelope
        .error
        .status
        .as_deref()
        .unwrap_or("")
        .to_ascii_uppercase();
    let raw = String::from_utf8_lossy(body).to_ascii_lowercase();

    match status {
        400 => {
            if error_type.contains("content_filter")
                || error_type.contains("content_policy")
                || message.contains("content management policy")
                || message.contains("flagged")
                || message.contains("moderation")
            {
                return UpstreamAction::SurfaceRefund;
            }
            if message.contains("billing_hard_limit_reached")
                || error_type.contains("billing_hard_limit_reached")
            {
                return UpstreamAction::DisableQuotaRetry;
            }
            if service == Service::Anthropic
                && message.contains("prompt must start")
                && message.contains("human:")
            {
                return UpstreamAction::RequirePreambleRetry;
            }
            UpstreamAction::Surface {
                kind: ErrorKind::BadRequest,
            }
        }
        401 => UpstreamAction::DisableRevokedRetry,
        402 if service == Service::Deepseek => UpstreamAction::DisableQuotaRetry,
        403 => {
            if matches!(service, Service::Anthropic | Service::Aws | Service::Gcp)
                && (message.contains("multimodal") || message.contains("image"))
            {
                return UpstreamAction::DisallowMultimodalRetry;
            }
            if service == Service::Aws && raw.contains("accessdeniedexception") {
                return UpstreamAction::NarrowFamilyRetry { family };
            }
            UpstreamAction::DisableRevokedRetry
        }
        404 => UpstreamAction::Surface {
            kind: ErrorKind::BadRequest,
        },
        405 if service == Service::Xai && message.contains("balance") => {
            UpstreamAction::DisableQuotaRetry
        }
        429 => {
            if service == Service::GoogleAi {
                // quota_limit_value of zero is Google's hard-disabled
                // signature: the key will never serve this project again.
                if raw.contains("\"quota_limit_value\":\"0\"")
                    || raw.contains("\"quotalimitvalue\":\"0\"")
                {
                    return UpstreamAction::DisableRevokedRetry;
                }
                if google_status.contains("RESOURCE_EXHAUSTED") || raw.contains("quota") {
                    return UpstreamAction::FamilyQuotaRetry { family };
                }
            }
            if message.contains("per day") || message.contains("daily") || raw.contains("per-day")
            {
                // Day-scale limits are not worth holding the request for.
                return UpstreamAction::Surface {
                    kind: ErrorKind::UpstreamRateLimited,
                };
            }
            UpstreamAction::RateLimitRetry
        }
        503 if service == Service::Aws => UpstreamAction::TransientRetry,
        500..=599 => UpstreamAction::Surface {
            kind: ErrorKind::UpstreamUnavailable,
        },
        _ => {
            let truncated: String = raw.chars().take(128).collect();
            tracing::error!(service = %service, status, body = %truncated, "unclassified upstream error");
            UpstreamAction::Surface {
                kind: ErrorKind::InternalError,
            }
        }
    }
}
