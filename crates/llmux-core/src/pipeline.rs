use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio::time::Instant;

use llmux_common::{
    Dialect, ModelFamily, Service, context_window_for, default_family, normalize_model,
    resolve_family,
};
use llmux_pool::{DisableReason, KeyPatch, KeyRecord, ServiceKeyExtra};
use llmux_protocol::sse::{SseEvent, SseParser, frame_event};
use llmux_protocol::{anthropic, google, openai};
use llmux_queue::PartitionKey;
use llmux_transform::{
    ChatRequest, ChatResponse, StreamTransformer, TransformMeta, count_completion_tokens,
    count_prompt_tokens, transform_request, transform_response,
};

use crate::classify::{UpstreamAction, classify_upstream};
use crate::client::{UpstreamBody, UpstreamRequest, UpstreamResponse};
use crate::error::{ErrorKind, ProxyError};
use crate::response::{ProxyResponse, StreamBody};
use crate::sign::{ChangeLog, SignContext, SignedRequest, sign_request};
use crate::state::AppState;

/// A request is re-enqueued at most this many times; on exhaustion the
/// most recent error surfaces.
pub const MAX_RETRIES: u32 = 3;

/// Per-request state threaded through the stages.
struct RequestContext {
    trace_id: String,
    in_dialect: Dialect,
    out_dialect: Dialect,
    service: Service,
    family: ModelFamily,
    /// Upstream model id, normalized at preprocess and stable thereafter.
    model: String,
    prompt_tokens: u32,
    output_tokens: u32,
    is_streaming: bool,
    retry_count: u32,
    meta: TransformMeta,
    signed: SignedRequest,
    change_log: ChangeLog,
    user_token: Option<String>,
}

/// Drive one chat request through preprocess, admission, upstream I/O and
/// postprocess. This is the whole request lifecycle; the router only
/// parses and serializes.
pub async fn handle_chat(
    state: &Arc<AppState>,
    service: Service,
    inbound: ChatRequest,
    user_token: Option<String>,
) -> Result<ProxyResponse, ProxyError> {
    let config = state.config.load();
    let mut ctx = preprocess(service, inbound, user_token, &config)?;
    tracing::debug!(
        trace = %ctx.trace_id,
        service = %ctx.service,
        family = %ctx.family,
        model = %ctx.model,
        prompt_tokens = ctx.prompt_tokens,
        streaming = ctx.is_streaming,
        "request admitted to queue"
    );

    let partition = PartitionKey {
        service: ctx.service,
        family: ctx.family,
    };
    let first_enqueued = Instant::now();
    let mut last_error: Option<ProxyError> = None;

    // Dispatch attempts: the first plus at most MAX_RETRIES re-enqueues.
    while ctx.retry_count <= MAX_RETRIES {
        // When no key owns the partition at all (none configured, or every
        // owner lost the family), queuing would wait forever; refuse now.
        if matches!(
            state.pool.lockout_period(ctx.service, ctx.family),
            llmux_pool::LockoutPeriod::NoKeys
        ) {
            return Err(last_error.unwrap_or_else(|| {
                ProxyError::new(
                    ErrorKind::NoKeysAvailable,
                    format!("no keys available for {}/{}", ctx.service, ctx.family),
                )
            }));
        }

        let grant_rx = state
            .queue
            .enqueue_from(partition, ctx.model.clone(), first_enqueued);
        let grant = grant_rx
            .await
            .map_err(|_| ProxyError::internal("dispatcher dropped the request"))?;
        let key = grant.key;

        // The attempt is billed at dispatch; policy rejections refund it.
        state
            .pool
            .increment_usage(&key.hash, ctx.family, ctx.prompt_tokens as u64, 0);
        if let Some(token) = &ctx.user_token {
            state.users.increment_prompt_count(token);
        }

        let outcome = attempt_upstream(state, &mut ctx, &key).await;
        state.queue.kick();

        match outcome {
            AttemptOutcome::Respond(response) => return Ok(response),
            AttemptOutcome::Retry(error) => {
                ctx.change_log.revert(&mut ctx.signed);
                ctx.retry_count += 1;
                last_error = Some(error);
            }
            AttemptOutcome::Fail(error) => return Err(error),
        }
    }

    Err(last_error.unwrap_or_else(|| ProxyError::internal("retries exhausted")))
}

fn preprocess(
    service: Service,
    mut inbound: ChatRequest,
    user_token: Option<String>,
    config: &llmux_common::GlobalConfig,
) -> Result<RequestContext, ProxyError> {
    let in_dialect = inbound.dialect();
    let out_dialect = service.dialect();

    // (a) normalize loose client model names to canonical upstream ids.
    let model = normalize_model(service, inbound.model());
    let family = resolve_family(service, &model).unwrap_or_else(|| default_family(service));
    if !config.family_visible(family) {
        return Err(ProxyError::bad_request(format!(
            "model family {family} is not available on this proxy"
        )));
    }
    inbound.set_model(model.clone());

    let client_max_tokens = inbound.max_tokens();
    let is_streaming = inbound.is_streaming();

    // (b) dialect translation into the upstream's shape.
    let outbound = transform_request(inbound, out_dialect, family.default_max_output())
        .map_err(|err| ProxyError::bad_request(err.to_string()))?;

    // (d) token counting on the fully-transformed prompt.
    let tokenizer_info = count_prompt_tokens(&outbound);
    let prompt_tokens = tokenizer_info.prompt_tokens;
    let output_tokens = client_max_tokens.unwrap_or_else(|| family.default_max_output());

    // (e) context validation.
    let model_max = context_window_for(&model, family);
    let proxy_max = config.proxy_max_context(family);
    let limit = model_max.min(proxy_max);
    if prompt_tokens + output_tokens > limit {
        return Err(ProxyError::new(
            ErrorKind::ContextTooLarge,
            format!(
                "prompt ({prompt_tokens}) plus max_tokens ({output_tokens}) exceeds the {limit}-token limit"
            ),
        ));
    }

    let trace_id = uuid::Uuid::new_v4().simple().to_string();
    let created = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs() as i64)
        .unwrap_or(0);
    let meta = TransformMeta {
        request_id: trace_id.clone(),
        model: model.clone(),
        created,
    };

    let body = serialize_outbound(&outbound)?;
    tracing::trace!(trace = %trace_id, tokenizer = tokenizer_info.tokenizer, "prompt counted");

    Ok(RequestContext {
        trace_id,
        in_dialect,
        out_dialect,
        service,
        family,
        model,
        prompt_tokens,
        output_tokens,
        is_streaming,
        retry_count: 0,
        meta,
        signed: SignedRequest {
            url: String::new(),
            headers: Vec::new(),
            body,
        },
        change_log: ChangeLog::new(),
        user_token,
    })
}

fn serialize_outbound(outbound: &ChatRequest) -> Result<Bytes, ProxyError> {
    let encoded = match outbound {
        ChatRequest::OpenAi(body) => serde_json::to_vec(body),
        ChatRequest::Anthropic(body) => serde_json::to_vec(body),
        // Model and stream mode ride the URL for Google.
        ChatRequest::Google(body) => serde_json::to_vec(&body.body),
        ChatRequest::Mistral(body) => serde_json::to_vec(body),
    };
    encoded
        .map(Bytes::from)
        .map_err(|err| ProxyError::internal(format!("serialize upstream body: {err}")))
}

enum AttemptOutcome {
    Respond(ProxyResponse),
    Retry(ProxyError),
    Fail(ProxyError),
}

async fn attempt_upstream(
    state: &Arc<AppState>,
    ctx: &mut RequestContext,
    key: &KeyRecord,
) -> AttemptOutcome {
    // GCP needs its OAuth token before the signing chain runs.
    let gcp_token = if ctx.service == Service::Gcp {
        let ServiceKeyExtra::Gcp {
            client_email,
            private_key,
            ..
        } = &key.extra
        else {
            return AttemptOutcome::Fail(ProxyError::internal("gcp key missing credentials"));
        };
        match state
            .gcp_tokens
            .access_token(&key.hash, client_email, private_key)
            .await
        {
            Ok(token) => Some(token),
            Err(error) => return AttemptOutcome::Retry(error),
        }
    } else {
        None
    };

    let base_url = state.config.load().base_url(ctx.service).to_string();
    let sign_ctx = SignContext {
        key,
        service: ctx.service,
        model: &ctx.model,
        stream: ctx.is_streaming,
        base_url: &base_url,
    };
    if let Err(error) = sign_request(
        &mut ctx.signed,
        &mut ctx.change_log,
        &sign_ctx,
        gcp_token.as_deref(),
    ) {
        return AttemptOutcome::Fail(error);
    }

    let request = UpstreamRequest {
        url: ctx.signed.url.clone(),
        headers: ctx.signed.headers.clone(),
        body: ctx.signed.body.clone(),
        want_stream: ctx.is_streaming,
    };

    let response = match state.client.send(request).await {
        Ok(response) => response,
        Err(transport) => {
            tracing::warn!(
                trace = %ctx.trace_id,
                key = %key.hash,
                error = %transport,
                stage = "upstream-io",
                "transport failure"
            );
            return AttemptOutcome::Retry(ProxyError::new(
                ErrorKind::UpstreamUnavailable,
                transport.message,
            ));
        }
    };

    if (200..300).contains(&response.status) {
        track_rate_limit_headers(state, key, &response);
        return match finish_success(state, ctx, key, response).await {
            Ok(proxy_response) => AttemptOutcome::Respond(proxy_response),
            Err(error) => AttemptOutcome::Fail(error),
        };
    }

    // Failure path: the transport already read the full body.
    let status = response.status;
    let body = match response.body {
        UpstreamBody::Bytes(bytes) => bytes,
        UpstreamBody::Stream(_) => Bytes::new(),
    };
    let action = classify_upstream(ctx.service, ctx.family, status, &body);
    tracing::warn!(
        trace = %ctx.trace_id,
        key = %key.hash,
        status,
        action = ?action,
        stage = "classify",
        "upstream error"
    );
    apply_key_action(state, key, &action);

    let status_code =
        StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let error = match &action {
        UpstreamAction::SurfaceRefund => {
            state
                .pool
                .refund_usage(&key.hash, ctx.family, ctx.prompt_tokens as u64, 0);
            ProxyError::new(
                ErrorKind::BadRequest,
                "the upstream provider rejected this prompt as policy-violating",
            )
            .with_passthrough(status_code, body)
        }
        UpstreamAction::Surface { kind } => {
            ProxyError::new(*kind, format!("upstream returned {status}"))
                .with_passthrough(status_code, body)
        }
        UpstreamAction::RateLimitRetry => ProxyError::new(
            ErrorKind::UpstreamRateLimited,
            "upstream rate limit exhausted all retries",
        ),
        UpstreamAction::DisableRevokedRetry => ProxyError::new(
            ErrorKind::KeyRevoked,
            "no remaining credential could serve this request",
        ),
        UpstreamAction::DisableQuotaRetry => ProxyError::new(
            ErrorKind::KeyOverQuota,
            "no remaining credential has quota for this request",
        ),
        UpstreamAction::FamilyQuotaRetry { family } => ProxyError::new(
            ErrorKind::KeyOverQuota,
            format!("quota exhausted for the {family} family"),
        ),
        _ => ProxyError::new(
            ErrorKind::UpstreamUnavailable,
            format!("upstream returned {status}"),
        ),
    };

    if action.retries() {
        AttemptOutcome::Retry(error)
    } else {
        AttemptOutcome::Fail(error)
    }
}

fn apply_key_action(state: &Arc<AppState>, key: &KeyRecord, action: &UpstreamAction) {
    match action {
        UpstreamAction::RateLimitRetry => state.pool.mark_rate_limited(&key.hash),
        UpstreamAction::FamilyQuotaRetry { family } => state.pool.update(
            &key.hash,
            &KeyPatch {
                over_quota_families_add: Some(std::iter::once(*family).collect()),
                ..KeyPatch::default()
            },
        ),
        UpstreamAction::DisableRevokedRetry => {
            state.pool.disable(&key.hash, DisableReason::Revoked)
        }
        UpstreamAction::DisableQuotaRetry => state.pool.disable(&key.hash, DisableReason::Quota),
        UpstreamAction::RequirePreambleRetry => state.pool.update(
            &key.hash,
            &KeyPatch {
                requires_preamble: Some(true),
                ..KeyPatch::default()
            },
        ),
        UpstreamAction::DisallowMultimodalRetry => state.pool.update(
            &key.hash,
            &KeyPatch {
                allows_multimodality: Some(false),
                ..KeyPatch::default()
            },
        ),
        UpstreamAction::NarrowFamilyRetry { family } => {
            state.pool.remove_family(&key.hash, *family)
        }
        UpstreamAction::TransientRetry
        | UpstreamAction::SurfaceRefund
        | UpstreamAction::Surface { .. } => {}
    }
}

fn track_rate_limit_headers(state: &Arc<AppState>, key: &KeyRecord, resp: &UpstreamResponse) {
    let drained = ["x-ratelimit-remaining-requests", "x-ratelimit-remaining-tokens"]
        .iter()
        .any(|name| resp.header(name).map(str::trim) == Some("0"));
    if drained {
        state.pool.mark_rate_limited(&key.hash);
    }
}

async fn finish_success(
    state: &Arc<AppState>,
    ctx: &mut RequestContext,
    key: &KeyRecord,
    response: UpstreamResponse,
) -> Result<ProxyResponse, ProxyError> {
    match response.body {
        UpstreamBody::Bytes(body) => finish_blocking(state, ctx, key, body),
        UpstreamBody::Stream(rx) => finish_streaming(state, ctx, key, rx),
    }
}

fn finish_blocking(
    state: &Arc<AppState>,
    ctx: &mut RequestContext,
    key: &KeyRecord,
    body: Bytes,
) -> Result<ProxyResponse, ProxyError> {
    let upstream = parse_upstream_response(ctx.out_dialect, &body)?;

    // Postprocess: the actual completion size replaces the admission-time
    // ceiling, then the key and user are credited.
    let output_tokens = upstream.reported_output_tokens().unwrap_or_else(|| {
        count_completion_tokens(ctx.out_dialect, &ctx.model, &upstream.completion_text())
    });
    ctx.output_tokens = output_tokens;
    state
        .pool
        .increment_usage(&key.hash, ctx.family, 0, output_tokens as u64);
    if let Some(token) = &ctx.user_token {
        state.users.increment_token_count(
            token,
            &ctx.model,
            ctx.in_dialect,
            ctx.prompt_tokens as u64,
            output_tokens as u64,
        );
    }
    tracing::info!(
        trace = %ctx.trace_id,
        key = %key.hash,
        prompt_tokens = ctx.prompt_tokens,
        output_tokens,
        "completion served"
    );

    let client_response = transform_response(upstream, ctx.in_dialect, &ctx.meta)
        .map_err(|err| ProxyError::internal(err.to_string()))?;
    let payload = match &client_response {
        ChatResponse::OpenAi(resp) => serde_json::to_vec(resp),
        ChatResponse::Anthropic(resp) => serde_json::to_vec(resp),
        ChatResponse::Google(resp) => serde_json::to_vec(resp),
    }
    .map_err(|err| ProxyError::internal(format!("serialize response: {err}")))?;

    Ok(ProxyResponse::Json {
        status: StatusCode::OK,
        headers: response_headers(ctx),
        body: Bytes::from(payload),
    })
}

fn parse_upstream_response(dialect: Dialect, body: &[u8]) -> Result<ChatResponse, ProxyError> {
    let parsed = match dialect {
        Dialect::Openai | Dialect::Mistral => {
            serde_json::from_slice::<openai::ChatCompletionResponse>(body).map(ChatResponse::OpenAi)
        }
        Dialect::Anthropic => {
            serde_json::from_slice::<anthropic::MessagesResponse>(body).map(ChatResponse::Anthropic)
        }
        Dialect::GoogleAi => serde_json::from_slice::<google::GenerateContentResponse>(body)
            .map(ChatResponse::Google),
    };
    parsed.map_err(|err| {
        ProxyError::new(
            ErrorKind::UpstreamUnavailable,
            format!("unparseable upstream response: {err}"),
        )
    })
}

/// Accumulates whatever usage the upstream reports mid-stream so the key
/// is credited with real output tokens even on client disconnect.
struct UsageScanner {
    dialect: Dialect,
    output_tokens: u32,
    text_chars: u64,
}

impl UsageScanner {
    fn new(dialect: Dialect) -> Self {
        Self {
            dialect,
            output_tokens: 0,
            text_chars: 0,
        }
    }

    fn observe(&mut self, event: &SseEvent) {
        match self.dialect {
            Dialect::Openai | Dialect::Mistral => {
                if let Ok(chunk) =
                    serde_json::from_str::<openai::ChatCompletionChunk>(&event.data)
                {
                    if let Some(usage) = chunk.usage {
                        self.output_tokens = self.output_tokens.max(usage.completion_tokens);
                    }
                    if let Some(choice) = chunk.choices.first()
                        && let Some(content) = &choice.delta.content
                    {
                        self.text_chars += content.chars().count() as u64;
                    }
                }
            }
            Dialect::Anthropic => {
                if let Ok(parsed) = serde_json::from_str::<anthropic::StreamEvent>(&event.data) {
                    match parsed {
                        anthropic::StreamEvent::MessageDelta {
                            usage: Some(usage), ..
                        } => {
                            self.output_tokens = self.output_tokens.max(usage.output_tokens);
                        }
                        anthropic::StreamEvent::ContentBlockDelta {
                            delta: anthropic::ContentDelta::TextDelta { text },
                            ..
                        } => {
                            self.text_chars += text.chars().count() as u64;
                        }
                        _ => {}
                    }
                }
            }
            Dialect::GoogleAi => {
                if let Ok(parsed) =
                    serde_json::from_str::<google::GenerateContentResponse>(&event.data)
                    && let Some(usage) = parsed.usage_metadata
                {
                    self.output_tokens = self.output_tokens.max(usage.candidates_token_count);
                }
            }
        }
    }

    /// Reported usage when available, character-estimate otherwise.
    fn final_output_tokens(&self) -> u32 {
        if self.output_tokens > 0 {
            self.output_tokens
        } else {
            (self.text_chars as u32).div_ceil(4)
        }
    }
}

fn finish_streaming(
    state: &Arc<AppState>,
    ctx: &mut RequestContext,
    key: &KeyRecord,
    mut upstream_rx: mpsc::Receiver<Bytes>,
) -> Result<ProxyResponse, ProxyError> {
    let mut transformer =
        StreamTransformer::new(ctx.out_dialect, ctx.in_dialect, ctx.meta.clone())
            .map_err(|err| ProxyError::internal(err.to_string()))?;

    let (tx, rx) = mpsc::channel::<Result<Bytes, std::io::Error>>(32);
    let pool = state.pool.clone();
    let users = state.users.clone();
    let queue = state.queue.clone();
    let key_hash = key.hash.clone();
    let family = ctx.family;
    let trace_id = ctx.trace_id.clone();
    let model = ctx.model.clone();
    let in_dialect = ctx.in_dialect;
    let out_dialect = ctx.out_dialect;
    let prompt_tokens = ctx.prompt_tokens;
    let user_token = ctx.user_token.clone();

    tokio::spawn(async move {
        let mut parser = SseParser::new();
        let mut scanner = UsageScanner::new(out_dialect);
        let mut client_gone = false;

        'pump: while let Some(chunk) = upstream_rx.recv().await {
            for event in parser.push(&chunk) {
                scanner.observe(&event);
                for out_event in transformer.push(&event) {
                    if tx.send(Ok(frame_event(&out_event))).await.is_err() {
                        // Client disconnected: closing upstream_rx drops
                        // the transport task and with it the socket.
                        client_gone = true;
                        break 'pump;
                    }
                }
            }
        }
        upstream_rx.close();

        if !client_gone {
            let mut tail = Vec::new();
            for event in parser.finish() {
                scanner.observe(&event);
                tail.extend(transformer.push(&event));
            }
            tail.extend(transformer.close());
            for out_event in tail {
                if tx.send(Ok(frame_event(&out_event))).await.is_err() {
                    break;
                }
            }
        }

        // Postprocess runs whether the stream finished or the client bailed:
        // whatever output was received is billed.
        let output_tokens = scanner.final_output_tokens();
        pool.increment_usage(&key_hash, family, 0, output_tokens as u64);
        if let Some(token) = &user_token {
            users.increment_token_count(
                token,
                &model,
                in_dialect,
                prompt_tokens as u64,
                output_tokens as u64,
            );
        }
        queue.kick();
        tracing::info!(
            trace = %trace_id,
            key = %key_hash,
            output_tokens,
            cancelled = client_gone,
            "stream finished"
        );
    });

    Ok(ProxyResponse::Stream {
        status: StatusCode::OK,
        headers: response_headers(ctx),
        body: StreamBody::new("text/event-stream", ReceiverStream::new(rx)),
    })
}

fn response_headers(ctx: &RequestContext) -> HeaderMap {
    let mut headers = HeaderMap::new();
    if let Ok(value) = http::HeaderValue::from_str(&ctx.trace_id) {
        headers.insert("x-llmux-trace", value);
    }
    headers
}
