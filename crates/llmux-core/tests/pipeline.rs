use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use tokio::sync::mpsc;

use llmux_common::{GlobalConfig, ModelFamily, Service, ServiceKeys};
use llmux_core::{
    AppState, ErrorKind, ProxyResponse, TransportError, UpstreamBody, UpstreamClient,
    UpstreamRequest, UpstreamResponse, handle_chat,
};
use llmux_protocol::openai;
use llmux_protocol::sse::SseParser;
use llmux_transform::ChatRequest;

enum Scripted {
    Json { status: u16, body: &'static str },
    Stream { chunks: Vec<&'static str> },
}

struct ScriptedClient {
    script: Mutex<VecDeque<Scripted>>,
    seen: Mutex<Vec<UpstreamRequest>>,
}

impl ScriptedClient {
    fn new(script: Vec<Scripted>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            seen: Mutex::new(Vec::new()),
        })
    }

    fn seen(&self) -> Vec<UpstreamRequest> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl UpstreamClient for ScriptedClient {
    async fn send(&self, req: UpstreamRequest) -> Result<UpstreamResponse, TransportError> {
        self.seen.lock().unwrap().push(req);
        let next = self.script.lock().unwrap().pop_front();
        match next {
            Some(Scripted::Json { status, body }) => Ok(UpstreamResponse {
                status,
                headers: Vec::new(),
                body: UpstreamBody::Bytes(Bytes::from_static(body.as_bytes())),
            }),
            Some(Scripted::Stream { chunks }) => {
                let (tx, rx) = mpsc::channel(8);
                tokio::spawn(async move {
                    for chunk in chunks {
                        if tx.send(Bytes::from_static(chunk.as_bytes())).await.is_err() {
                            return;
                        }
                    }
                });
                Ok(UpstreamResponse {
                    status: 200,
                    headers: Vec::new(),
                    body: UpstreamBody::Stream(rx),
                })
            }
            None => Err(TransportError {
                timed_out: false,
                message: "script exhausted".to_string(),
            }),
        }
    }
}

fn config_with(service: Service, secrets: &[&str]) -> GlobalConfig {
    GlobalConfig {
        service_keys: vec![ServiceKeys {
            service,
            secrets: secrets.iter().map(|s| s.to_string()).collect(),
        }],
        ..GlobalConfig::default()
    }
}

fn openai_chat(model: &str, text: &str, max_tokens: u32, stream: bool) -> ChatRequest {
    ChatRequest::OpenAi(openai::ChatCompletionRequest {
        model: model.to_string(),
        messages: vec![openai::ChatMessage {
            role: openai::ChatRole::User,
            content: openai::MessageContent::Text(text.to_string()),
            name: None,
        }],
        max_tokens: Some(max_tokens),
        max_completion_tokens: None,
        temperature: None,
        top_p: None,
        frequency_penalty: None,
        presence_penalty: None,
        stop: None,
        stream: Some(stream),
        stream_options: None,
        n: None,
        seed: None,
        logit_bias: None,
        user: None,
    })
}

const ANTHROPIC_OK: &str = r#"{"id":"msg_up","type":"message","role":"assistant","model":"claude-3-5-sonnet-20241022","content":[{"type":"text","text":"hello there"}],"stop_reason":"end_turn","usage":{"input_tokens":9,"output_tokens":2}}"#;

#[tokio::test]
async fn openai_dialect_request_reaches_anthropic_and_returns_openai_shape() {
    let client = ScriptedClient::new(vec![Scripted::Json {
        status: 200,
        body: ANTHROPIC_OK,
    }]);
    let state = AppState::new(config_with(Service::Anthropic, &["sk-ant"]), client.clone()).await;

    let response = handle_chat(
        &state,
        Service::Anthropic,
        openai_chat("claude-3-5-sonnet-latest", "hi", 64, false),
        None,
    )
    .await
    .unwrap();

    // Upstream saw the canonical dated model on /v1/messages with the key
    // attached and an empty system prompt.
    let seen = client.seen();
    assert_eq!(seen.len(), 1);
    assert!(seen[0].url.ends_with("/v1/messages"));
    assert!(seen[0].headers.iter().any(|(name, _)| name == "x-api-key"));
    let body: serde_json::Value = serde_json::from_slice(&seen[0].body).unwrap();
    assert_eq!(body["model"], "claude-3-5-sonnet-20241022");
    assert_eq!(body["system"], "");
    assert_eq!(body["max_tokens"], 64);

    // Client got an OpenAI chat.completion.
    let ProxyResponse::Json { status, body, .. } = response else {
        panic!("expected blocking response");
    };
    assert_eq!(status, 200);
    let parsed: openai::ChatCompletionResponse = serde_json::from_slice(&body).unwrap();
    assert_eq!(parsed.choices[0].message.role, openai::ChatRole::Assistant);
    assert_eq!(
        parsed.choices[0].message.content.as_deref(),
        Some("hello there")
    );
    // Output tokens were recounted from the upstream-reported usage.
    assert_eq!(parsed.usage.map(|u| u.completion_tokens), Some(2));
}

#[tokio::test]
async fn rate_limited_key_is_benched_and_request_retries_on_another() {
    let client = ScriptedClient::new(vec![
        Scripted::Json {
            status: 429,
            body: r#"{"error":{"type":"rate_limit_error","message":"slow down"}}"#,
        },
        Scripted::Json {
            status: 200,
            body: ANTHROPIC_OK,
        },
    ]);
    let state = AppState::new(
        config_with(Service::Anthropic, &["key-a", "key-b"]),
        client.clone(),
    )
    .await;

    let response = handle_chat(
        &state,
        Service::Anthropic,
        openai_chat("claude-3-5-sonnet-latest", "hi", 64, false),
        None,
    )
    .await
    .unwrap();

    assert!(matches!(response, ProxyResponse::Json { status, .. } if status == 200));

    // Two dispatches on two different keys.
    let seen = client.seen();
    assert_eq!(seen.len(), 2);
    let key_of = |req: &UpstreamRequest| {
        req.headers
            .iter()
            .find(|(name, _)| name == "x-api-key")
            .map(|(_, value)| value.clone())
    };
    assert_ne!(key_of(&seen[0]), key_of(&seen[1]));

    // The 429'd key sits inside its lockout window.
    let benched = state
        .pool
        .list(Service::Anthropic)
        .into_iter()
        .filter(|record| !record.pending_lockout(tokio::time::Instant::now()).is_zero())
        .count();
    assert!(benched >= 1);
}

#[tokio::test]
async fn oversized_context_fails_without_touching_upstream_or_queue() {
    let client = ScriptedClient::new(vec![]);
    let state = AppState::new(config_with(Service::Openai, &["sk-1"]), client.clone()).await;

    let huge = "word ".repeat(40_000);
    let err = handle_chat(
        &state,
        Service::Openai,
        openai_chat("gpt-4-0613", &huge, 4096, false),
        None,
    )
    .await
    .unwrap_err();

    assert_eq!(err.kind, ErrorKind::ContextTooLarge);
    assert!(client.seen().is_empty());
    assert_eq!(
        state.queue.queued_count(llmux_queue::PartitionKey {
            service: Service::Openai,
            family: ModelFamily::Gpt4,
        }),
        0
    );
}

#[tokio::test]
async fn retries_are_capped_at_max_plus_one_dispatches() {
    let unavailable = || Scripted::Json {
        status: 503,
        body: "",
    };
    // AWS 503s re-enqueue unconditionally, so the cap is what stops them.
    let client = ScriptedClient::new(vec![
        unavailable(),
        unavailable(),
        unavailable(),
        unavailable(),
        unavailable(),
        unavailable(),
    ]);
    let state = AppState::new(
        config_with(Service::Aws, &["AKID:secret:us-east-1"]),
        client.clone(),
    )
    .await;

    let err = handle_chat(
        &state,
        Service::Aws,
        openai_chat("claude-3-5-sonnet-latest", "hi", 32, false),
        None,
    )
    .await
    .unwrap_err();

    assert_eq!(err.kind, ErrorKind::UpstreamUnavailable);
    assert_eq!(client.seen().len(), (llmux_core::MAX_RETRIES + 1) as usize);
}

#[tokio::test]
async fn content_policy_rejection_passes_through_with_refund() {
    let client = ScriptedClient::new(vec![Scripted::Json {
        status: 400,
        body: r#"{"error":{"type":"content_filter_error","message":"Your request was flagged"}}"#,
    }]);
    let state = AppState::new(config_with(Service::Openai, &["sk-1"]), client.clone()).await;

    let err = handle_chat(
        &state,
        Service::Openai,
        openai_chat("gpt-4o", "hi", 32, false),
        None,
    )
    .await
    .unwrap_err();

    assert_eq!(err.status(), 400);
    let payload: serde_json::Value = serde_json::from_slice(&err.payload_bytes()).unwrap();
    // Verbatim provider body plus the proxy note.
    assert_eq!(payload["error"]["type"], "content_filter_error");
    assert!(payload["proxy_note"].is_string());

    // The billed prompt credit came back.
    let record = &state.pool.list(Service::Openai)[0];
    let usage = record
        .token_usage
        .get(&ModelFamily::Gpt4o)
        .copied()
        .unwrap_or_default();
    assert_eq!(usage.input, 0);
}

const GOOGLE_OK: &str = r#"{"candidates":[{"content":{"role":"model","parts":[{"text":"salut"}]},"finishReason":"STOP","index":0}],"usageMetadata":{"promptTokenCount":4,"candidatesTokenCount":1,"totalTokenCount":5}}"#;

fn google_chat(model: &str) -> ChatRequest {
    ChatRequest::Google(llmux_transform::GoogleChat {
        model: model.to_string(),
        stream: false,
        body: llmux_protocol::google::GenerateContentRequest {
            contents: vec![llmux_protocol::google::Content {
                role: Some(llmux_protocol::google::ContentRole::User),
                parts: vec![llmux_protocol::google::Part::Text("hi".to_string())],
            }],
            system_instruction: None,
            generation_config: None,
            safety_settings: None,
        },
    })
}

#[tokio::test]
async fn google_family_quota_spares_the_other_family() {
    let client = ScriptedClient::new(vec![
        Scripted::Json {
            status: 429,
            body: r#"{"error":{"message":"Quota exceeded for quota metric","status":"RESOURCE_EXHAUSTED"}}"#,
        },
        Scripted::Json {
            status: 200,
            body: GOOGLE_OK,
        },
    ]);
    let state = AppState::new(config_with(Service::GoogleAi, &["g-key"]), client.clone()).await;

    // The pro request exhausts the family on the only key and surfaces.
    let err = handle_chat(
        &state,
        Service::GoogleAi,
        google_chat("gemini-1.5-pro"),
        None,
    )
    .await
    .unwrap_err();
    assert_eq!(err.kind, ErrorKind::KeyOverQuota);

    // Flash still dispatches on the very same key.
    let response = handle_chat(
        &state,
        Service::GoogleAi,
        google_chat("gemini-1.5-flash"),
        None,
    )
    .await
    .unwrap();
    assert!(matches!(response, ProxyResponse::Json { status, .. } if status == 200));

    // The second call used ?key= query auth on the flash endpoint.
    let seen = client.seen();
    assert_eq!(seen.len(), 2);
    assert!(seen[1].url.contains("gemini-1.5-flash:generateContent?key=g-key"));
}

#[tokio::test]
async fn streaming_request_transforms_events_and_terminates_once() {
    let client = ScriptedClient::new(vec![Scripted::Stream {
        chunks: vec![
            "event: message_start\ndata: {\"type\":\"message_start\",\"message\":{\"id\":\"msg_1\",\"type\":\"message\",\"role\":\"assistant\",\"model\":\"claude-3-5-sonnet-20241022\",\"content\":[],\"usage\":{\"input_tokens\":9,\"output_tokens\":0}}}\n\n",
            "event: content_block_start\ndata: {\"type\":\"content_block_start\",\"index\":0,\"content_block\":{\"type\":\"text\",\"text\":\"\"}}\n\n",
            "event: content_block_delta\ndata: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"Hel\"}}\n\n",
            "event: content_block_delta\ndata: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"lo\"}}\n\n",
            "event: message_delta\ndata: {\"type\":\"message_delta\",\"delta\":{\"stop_reason\":\"end_turn\"},\"usage\":{\"output_tokens\":2}}\n\n",
            "event: message_stop\ndata: {\"type\":\"message_stop\"}\n\n",
        ],
    }]);
    let state = AppState::new(config_with(Service::Anthropic, &["sk-ant"]), client.clone()).await;

    let response = handle_chat(
        &state,
        Service::Anthropic,
        openai_chat("claude-3-5-sonnet-latest", "hi", 64, true),
        None,
    )
    .await
    .unwrap();

    let ProxyResponse::Stream { mut body, .. } = response else {
        panic!("expected stream");
    };

    let mut parser = SseParser::new();
    let mut events = Vec::new();
    while let Some(frame) = body.stream.next().await {
        events.extend(parser.push(&frame.unwrap()));
    }

    // role chunk, two deltas, finish chunk, exactly one [DONE].
    assert!(events.len() >= 5);
    let first: openai::ChatCompletionChunk = serde_json::from_str(&events[0].data).unwrap();
    assert_eq!(first.choices[0].delta.role, Some(openai::ChatRole::Assistant));
    let texts: Vec<String> = events
        .iter()
        .filter_map(|event| {
            serde_json::from_str::<openai::ChatCompletionChunk>(&event.data)
                .ok()
                .and_then(|chunk| chunk.choices.first().and_then(|c| c.delta.content.clone()))
        })
        .collect();
    assert!(texts.contains(&"Hel".to_string()));
    assert!(texts.contains(&"lo".to_string()));
    assert_eq!(events.iter().filter(|e| e.is_done_sentinel()).count(), 1);
    assert!(events.last().unwrap().is_done_sentinel());

    // Postprocess credited the streamed output tokens to the key.
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    let record = &state.pool.list(Service::Anthropic)[0];
    let usage = record
        .token_usage
        .get(&ModelFamily::Claude)
        .copied()
        .unwrap_or_default();
    assert_eq!(usage.output, 2);
}
