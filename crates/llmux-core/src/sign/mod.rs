//! Per-service request finalization: URL assembly, authentication
//! headers, and provider body quirks. Every mutation lands in a
//! [`ChangeLog`] so a re-enqueued request can be restored to its
//! pre-sign form and signed cleanly on the next attempt.

pub mod gcp;
pub mod sigv4;

use bytes::Bytes;
use time::OffsetDateTime;

use llmux_common::Service;
use llmux_pool::{KeyRecord, ServiceKeyExtra};

use crate::error::ProxyError;
use sigv4::SigV4Signer;

/// The finalized upstream call under construction; the only form the
/// proxy actually sends.
#[derive(Debug, Clone, Default)]
pub struct SignedRequest {
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

#[derive(Debug)]
enum Change {
    Url(String),
    Header {
        name: String,
        previous: Option<String>,
    },
    Body(Bytes),
}

/// Revertable log of request mutations.
#[derive(Debug, Default)]
pub struct ChangeLog {
    entries: Vec<Change>,
}

impl ChangeLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_url(&mut self, req: &mut SignedRequest, url: String) {
        self.entries
            .push(Change::Url(std::mem::replace(&mut req.url, url)));
    }

    pub fn set_header(&mut self, req: &mut SignedRequest, name: &str, value: String) {
        let previous = match req
            .headers
            .iter_mut()
            .find(|(existing, _)| existing.eq_ignore_ascii_case(name))
        {
            Some((_, existing)) => Some(std::mem::replace(existing, value)),
            None => {
                req.headers.push((name.to_string(), value));
                None
            }
        };
        self.entries.push(Change::Header {
            name: name.to_string(),
            previous,
        });
    }

    pub fn set_body(&mut self, req: &mut SignedRequest, body: Bytes) {
        self.entries
            .push(Change::Body(std::mem::replace(&mut req.body, body)));
    }

    /// Undo every recorded mutation, newest first, so per-attempt signing
    /// never accumulates across retries.
    pub fn revert(&mut self, req: &mut SignedRequest) {
        while let Some(change) = self.entries.pop() {
            match change {
                Change::Url(previous) => req.url = previous,
                Change::Header { name, previous } => match previous {
                    Some(value) => {
                        if let Some((_, existing)) = req
                            .headers
                            .iter_mut()
                            .find(|(existing, _)| existing.eq_ignore_ascii_case(&name))
                        {
                            *existing = value;
                        }
                    }
                    None => {
                        req.headers
                            .retain(|(existing, _)| !existing.eq_ignore_ascii_case(&name));
                    }
                },
                Change::Body(previous) => req.body = previous,
            }
        }
    }
}

pub struct SignContext<'a> {
    pub key: &'a KeyRecord,
    pub service: Service,
    /// Upstream model id, already normalized.
    pub model: &'a str,
    pub stream: bool,
    pub base_url: &'a str,
}

/// Run the per-service mutator chain against the request.
///
/// GCP requests need a pre-fetched OAuth token (`gcp_token`), obtained by
/// the pipeline through [`gcp::GcpTokenBroker`] before signing.
pub fn sign_request(
    req: &mut SignedRequest,
    log: &mut ChangeLog,
    ctx: &SignContext<'_>,
    gcp_token: Option<&str>,
) -> Result<(), ProxyError> {
    log.set_header(req, "content-type", "application/json".to_string());

    match ctx.service {
        Service::Openai
        | Service::Deepseek
        | Service::Xai
        | Service::Qwen
        | Service::Moonshot
        | Service::MistralAi => {
            log.set_url(req, format!("{}/v1/chat/completions", ctx.base_url));
            log.set_header(
                req,
                "authorization",
                format!("Bearer {}", ctx.key.secret),
            );
            if ctx.service == Service::Openai
                && let ServiceKeyExtra::OpenAi {
                    organization_id: Some(org),
                    ..
                } = &ctx.key.extra
            {
                log.set_header(req, "openai-organization", org.clone());
            }
            if ctx.service == Service::Qwen && !ctx.stream {
                // Qwen3 rejects thinking mode on blocking calls.
                patch_body(req, log, |body| {
                    body.insert("enable_thinking".to_string(), serde_json::Value::Bool(false));
                })?;
            }
        }
        Service::Cohere => {
            log.set_url(
                req,
                format!("{}/compatibility/v1/chat/completions", ctx.base_url),
            );
            log.set_header(
                req,
                "authorization",
                format!("Bearer {}", ctx.key.secret),
            );
        }
        Service::Anthropic => {
            log.set_url(req, format!("{}/v1/messages", ctx.base_url));
            log.set_header(req, "x-api-key", ctx.key.secret.clone());
            log.set_header(req, "anthropic-version", "2023-06-01".to_string());
            if let ServiceKeyExtra::Anthropic {
                requires_preamble: true,
                ..
            } = &ctx.key.extra
            {
                ensure_leading_human_turn(req, log)?;
            }
        }
        Service::GoogleAi => {
            let action = if ctx.stream {
                "streamGenerateContent?alt=sse&"
            } else {
                "generateContent?"
            };
            log.set_url(
                req,
                format!(
                    "{}/v1beta/models/{}:{}key={}",
                    ctx.base_url, ctx.model, action, ctx.key.secret
                ),
            );
        }
        Service::Aws => {
            sign_aws(req, log, ctx)?;
        }
        Service::Gcp => {
            let ServiceKeyExtra::Gcp {
                region, project_id, ..
            } = &ctx.key.extra
            else {
                return Err(ProxyError::internal("gcp key missing credentials"));
            };
            let token =
                gcp_token.ok_or_else(|| ProxyError::internal("gcp token not fetched"))?;
            let verb = if ctx.stream {
                "streamRawPredict"
            } else {
                "rawPredict"
            };
            log.set_url(
                req,
                format!(
                    "https://{region}-aiplatform.googleapis.com/v1/projects/{project_id}/locations/{region}/publishers/anthropic/models/{}:{verb}",
                    ctx.model
                ),
            );
            log.set_header(req, "authorization", format!("Bearer {token}"));
            patch_body(req, log, |body| {
                body.remove("model");
                body.insert(
                    "anthropic_version".to_string(),
                    serde_json::Value::String("vertex-2023-10-16".to_string()),
                );
            })?;
        }
        Service::Azure => {
            let parts: Vec<&str> = ctx.key.secret.splitn(3, ':').collect();
            let [resource, deployment, api_key] = parts.as_slice() else {
                return Err(ProxyError::internal(
                    "azure credential must be resource:deployment:key",
                ));
            };
            log.set_url(
                req,
                format!(
                    "https://{resource}.openai.azure.com/openai/deployments/{deployment}/chat/completions?api-version=2024-06-01"
                ),
            );
            log.set_header(req, "api-key", (*api_key).to_string());
        }
    }

    Ok(())
}

fn sign_aws(
    req: &mut SignedRequest,
    log: &mut ChangeLog,
    ctx: &SignContext<'_>,
) -> Result<(), ProxyError> {
    let parts: Vec<&str> = ctx.key.secret.splitn(3, ':').collect();
    let [access_key, secret_key, region] = parts.as_slice() else {
        return Err(ProxyError::internal(
            "aws credential must be accessKey:secretKey:region",
        ));
    };

    // The invocation body is Anthropic-shaped minus routing fields, plus
    // the Bedrock API version marker.
    patch_body(req, log, |body| {
        body.remove("model");
        body.remove("stream");
        body.insert(
            "anthropic_version".to_string(),
            serde_json::Value::String("bedrock-2023-05-31".to_string()),
        );
    })?;

    let host = format!("bedrock-runtime.{region}.amazonaws.com");
    let verb = if ctx.stream {
        "invoke-with-response-stream"
    } else {
        "invoke"
    };
    let path = format!("/model/{}/{verb}", ctx.model);
    log.set_url(req, format!("https://{host}{path}"));

    let signer = SigV4Signer {
        access_key,
        secret_key,
        region,
        service: "bedrock",
    };
    let signed = signer
        .sign_headers(&host, &path, &req.body, OffsetDateTime::now_utc())
        .map_err(|err| ProxyError::internal(err.to_string()))?;
    for (name, value) in signed {
        log.set_header(req, &name, value);
    }
    Ok(())
}

/// Anthropic keys flagged `requires_preamble` reject conversations that
/// do not open with a Human turn; splice one in.
fn ensure_leading_human_turn(
    req: &mut SignedRequest,
    log: &mut ChangeLog,
) -> Result<(), ProxyError> {
    patch_body(req, log, |body| {
        let Some(serde_json::Value::Array(messages)) = body.get_mut("messages") else {
            return;
        };
        let first_is_user = messages
            .first()
            .and_then(|message| message.get("role"))
            .and_then(|role| role.as_str())
            == Some("user");
        if !first_is_user {
            messages.insert(
                0,
                serde_json::json!({"role": "user", "content": "Hello"}),
            );
        }
    })
}

fn patch_body(
    req: &mut SignedRequest,
    log: &mut ChangeLog,
    patch: impl FnOnce(&mut serde_json::Map<String, serde_json::Value>),
) -> Result<(), ProxyError> {
    let mut value: serde_json::Value = serde_json::from_slice(&req.body)
        .map_err(|err| ProxyError::internal(format!("body not json at sign time: {err}")))?;
    let Some(object) = value.as_object_mut() else {
        return Err(ProxyError::internal("body is not a json object"));
    };
    patch(object);
    let bytes = serde_json::to_vec(&value)
        .map_err(|err| ProxyError::internal(format!("re-serialize body: {err}")))?;
    log.set_body(req, Bytes::from(bytes));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn key(service: Service, secret: &str) -> KeyRecord {
        KeyRecord::new(service, secret.to_string(), BTreeSet::new())
    }

    fn base_request() -> SignedRequest {
        SignedRequest {
            url: String::new(),
            headers: Vec::new(),
            body: Bytes::from_static(br#"{"model":"claude-3-5-sonnet-20241022","stream":true,"messages":[]}"#),
        }
    }

    #[test]
    fn bearer_services_get_authorization_header() {
        let key = key(Service::Deepseek, "sk-ds");
        let ctx = SignContext {
            key: &key,
            service: Service::Deepseek,
            model: "deepseek-chat",
            stream: false,
            base_url: "https://api.deepseek.com",
        };
        let mut req = base_request();
        let mut log = ChangeLog::new();
        sign_request(&mut req, &mut log, &ctx, None).unwrap();
        assert_eq!(req.url, "https://api.deepseek.com/v1/chat/completions");
        assert!(req
            .headers
            .iter()
            .any(|(name, value)| name == "authorization" && value == "Bearer sk-ds"));
    }

    #[test]
    fn google_key_rides_the_query_string() {
        let key = key(Service::GoogleAi, "g-key");
        let ctx = SignContext {
            key: &key,
            service: Service::GoogleAi,
            model: "gemini-1.5-pro",
            stream: true,
            base_url: "https://generativelanguage.googleapis.com",
        };
        let mut req = base_request();
        let mut log = ChangeLog::new();
        sign_request(&mut req, &mut log, &ctx, None).unwrap();
        assert!(req.url.contains(":streamGenerateContent?alt=sse&key=g-key"));
    }

    #[test]
    fn aws_body_loses_routing_fields_and_gains_version() {
        let key = key(Service::Aws, "AKID:secret:us-east-1");
        let ctx = SignContext {
            key: &key,
            service: Service::Aws,
            model: "anthropic.claude-3-5-sonnet-20241022-v1:0",
            stream: false,
            base_url: "",
        };
        let mut req = base_request();
        let mut log = ChangeLog::new();
        sign_request(&mut req, &mut log, &ctx, None).unwrap();

        let body: serde_json::Value = serde_json::from_slice(&req.body).unwrap();
        assert!(body.get("model").is_none());
        assert!(body.get("stream").is_none());
        assert_eq!(
            body.get("anthropic_version").and_then(|v| v.as_str()),
            Some("bedrock-2023-05-31")
        );
        assert!(req.headers.iter().any(|(name, _)| name == "authorization"));
        assert!(req.url.ends_with("/invoke"));
    }

    #[test]
    fn revert_restores_presign_state_exactly() {
        let key = key(Service::Aws, "AKID:secret:us-east-1");
        let ctx = SignContext {
            key: &key,
            service: Service::Aws,
            model: "anthropic.claude-3-5-sonnet-20241022-v1:0",
            stream: true,
            base_url: "",
        };
        let mut req = base_request();
        let original_body = req.body.clone();
        let mut log = ChangeLog::new();
        sign_request(&mut req, &mut log, &ctx, None).unwrap();
        assert_ne!(req.body, original_body);

        log.revert(&mut req);
        assert_eq!(req.body, original_body);
        assert_eq!(req.url, "");
        assert!(req.headers.is_empty());
    }

    #[test]
    fn preamble_key_gets_leading_human_turn() {
        let mut record = key(Service::Anthropic, "sk-ant");
        record.extra = ServiceKeyExtra::Anthropic {
            tier: None,
            is_pozzed: false,
            allows_multimodality: true,
            requires_preamble: true,
        };
        let ctx = SignContext {
            key: &record,
            service: Service::Anthropic,
            model: "claude-3-5-sonnet-20241022",
            stream: false,
            base_url: "https://api.anthropic.com",
        };
        let mut req = SignedRequest {
            url: String::new(),
            headers: Vec::new(),
            body: Bytes::from_static(
                br#"{"model":"claude-3-5-sonnet-20241022","messages":[{"role":"assistant","content":"hi"}]}"#,
            ),
        };
        let mut log = ChangeLog::new();
        sign_request(&mut req, &mut log, &ctx, None).unwrap();
        let body: serde_json::Value = serde_json::from_slice(&req.body).unwrap();
        assert_eq!(body["messages"][0]["role"], "user");
    }
}
