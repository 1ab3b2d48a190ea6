use llmux_common::Dialect;
use llmux_protocol::openai::ChatCompletionChunk;
use llmux_protocol::sse::SseEvent;
use llmux_transform::{StreamTransformer, TransformMeta};

fn meta() -> TransformMeta {
    TransformMeta {
        request_id: "deadbeef".to_string(),
        model: "claude-3-5-sonnet-20241022".to_string(),
        created: 1_700_000_000,
    }
}

fn anthropic_event(name: &str, data: &str) -> SseEvent {
    SseEvent {
        event: Some(name.to_string()),
        data: data.to_string(),
    }
}

fn chunk_of(event: &SseEvent) -> ChatCompletionChunk {
    serde_json::from_str(&event.data).expect("chunk json")
}

#[test]
fn anthropic_stream_becomes_openai_chunks_in_order() {
    let mut tx = StreamTransformer::new(Dialect::Anthropic, Dialect::Openai, meta()).unwrap();
    let mut out = Vec::new();

    out.extend(tx.push(&anthropic_event(
        "message_start",
        r#"{"type":"message_start","message":{"id":"msg_1","type":"message","role":"assistant","model":"claude-3-5-sonnet-20241022","content":[],"usage":{"input_tokens":9,"output_tokens":0}}}"#,
    )));
    out.extend(tx.push(&anthropic_event(
        "content_block_start",
        r#"{"type":"content_block_start","index":0,"content_block":{"type":"text","text":""}}"#,
    )));
    out.extend(tx.push(&anthropic_event(
        "content_block_delta",
        r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Hel"}}"#,
    )));
    out.extend(tx.push(&anthropic_event(
        "content_block_delta",
        r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"lo"}}"#,
    )));
    out.extend(tx.push(&anthropic_event(
        "message_delta",
        r#"{"type":"message_delta","delta":{"stop_reason":"end_turn"},"usage":{"output_tokens":2}}"#,
    )));
    out.extend(tx.push(&anthropic_event("message_stop", r#"{"type":"message_stop"}"#)));
    out.extend(tx.close());

    // Initial role chunk first.
    let first = chunk_of(&out[0]);
    assert_eq!(
        first.choices[0].delta.role,
        Some(llmux_protocol::openai::ChatRole::Assistant)
    );
    assert_eq!(first.choices[0].delta.content.as_deref(), Some(""));

    // Then the two text deltas in order.
    assert_eq!(chunk_of(&out[1]).choices[0].delta.content.as_deref(), Some("Hel"));
    assert_eq!(chunk_of(&out[2]).choices[0].delta.content.as_deref(), Some("lo"));

    // A finish chunk carrying the reason and usage.
    let finish = chunk_of(&out[3]);
    assert_eq!(
        finish.choices[0].finish_reason,
        Some(llmux_protocol::openai::FinishReason::Stop)
    );
    assert_eq!(finish.usage.map(|u| u.completion_tokens), Some(2));

    // Exactly one [DONE] terminator, last.
    let done_count = out.iter().filter(|e| e.is_done_sentinel()).count();
    assert_eq!(done_count, 1);
    assert!(out.last().unwrap().is_done_sentinel());
}

#[test]
fn ping_and_unknown_events_produce_no_output() {
    let mut tx = StreamTransformer::new(Dialect::Anthropic, Dialect::Openai, meta()).unwrap();
    assert!(tx.push(&anthropic_event("ping", r#"{"type":"ping"}"#)).is_empty());
    assert!(
        tx.push(&anthropic_event(
            "vendor_heartbeat",
            r#"{"type":"vendor_heartbeat"}"#
        ))
        .is_empty()
    );
}

#[test]
fn upstream_drop_still_terminates_exactly_once() {
    let mut tx = StreamTransformer::new(Dialect::Anthropic, Dialect::Openai, meta()).unwrap();
    tx.push(&anthropic_event(
        "content_block_delta",
        r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"par"}}"#,
    ));
    let closed = tx.close();
    assert!(closed.last().unwrap().is_done_sentinel());
    // A second close emits nothing.
    assert!(tx.close().is_empty());
}

#[test]
fn parse_error_emits_typed_error_then_done() {
    let mut tx = StreamTransformer::new(Dialect::Anthropic, Dialect::Openai, meta()).unwrap();
    let out = tx.push(&SseEvent::data_only("not json"));
    assert_eq!(out.len(), 2);
    assert!(out[0].data.contains("proxy_stream_error"));
    assert!(out[1].is_done_sentinel());
    assert!(tx.close().is_empty());
}

#[test]
fn azure_prompt_filter_preamble_is_dropped() {
    let mut tx = StreamTransformer::new(Dialect::Openai, Dialect::Openai, meta()).unwrap();
    let filtered = tx.push(&SseEvent::data_only(
        r#"{"id":"","object":"chat.completion.chunk","created":0,"model":"","choices":[],"prompt_filter_results":[{"prompt_index":0}]}"#,
    ));
    assert!(filtered.is_empty());

    let content = tx.push(&SseEvent::data_only(
        r#"{"id":"c1","object":"chat.completion.chunk","created":1,"model":"gpt-4o","choices":[{"index":0,"delta":{"content":"hi"}}]}"#,
    ));
    // Role chunk synthesized ahead of the first content chunk.
    assert_eq!(content.len(), 2);
    assert_eq!(
        chunk_of(&content[0]).choices[0].delta.role,
        Some(llmux_protocol::openai::ChatRole::Assistant)
    );
    assert_eq!(
        chunk_of(&content[1]).choices[0].delta.content.as_deref(),
        Some("hi")
    );
}

#[test]
fn google_stream_synthesizes_first_event_and_done() {
    let mut tx = StreamTransformer::new(Dialect::GoogleAi, Dialect::Openai, meta()).unwrap();
    let out = tx.push(&SseEvent::data_only(
        r#"{"candidates":[{"content":{"role":"model","parts":[{"text":"Bonjour"}]},"index":0}]}"#,
    ));
    assert_eq!(out.len(), 2);
    assert!(chunk_of(&out[0]).choices[0].delta.role.is_some());
    assert_eq!(
        chunk_of(&out[1]).choices[0].delta.content.as_deref(),
        Some("Bonjour")
    );

    let tail = tx.push(&SseEvent::data_only(
        r#"{"candidates":[{"finishReason":"STOP","index":0}],"usageMetadata":{"promptTokenCount":4,"candidatesTokenCount":3,"totalTokenCount":7}}"#,
    ));
    assert!(tail.is_empty());

    let closed = tx.close();
    let finish = chunk_of(&closed[0]);
    assert_eq!(
        finish.choices[0].finish_reason,
        Some(llmux_protocol::openai::FinishReason::Stop)
    );
    assert_eq!(finish.usage.map(|u| u.total_tokens), Some(7));
    assert!(closed.last().unwrap().is_done_sentinel());
}

#[test]
fn openai_chunks_become_anthropic_events() {
    let mut tx = StreamTransformer::new(Dialect::Openai, Dialect::Anthropic, meta()).unwrap();
    let mut out = Vec::new();
    out.extend(tx.push(&SseEvent::data_only(
        r#"{"id":"c1","object":"chat.completion.chunk","created":1,"model":"gpt-4o","choices":[{"index":0,"delta":{"role":"assistant","content":""}}]}"#,
    )));
    out.extend(tx.push(&SseEvent::data_only(
        r#"{"id":"c1","object":"chat.completion.chunk","created":1,"model":"gpt-4o","choices":[{"index":0,"delta":{"content":"hey"}}]}"#,
    )));
    out.extend(tx.push(&SseEvent::data_only(
        r#"{"id":"c1","object":"chat.completion.chunk","created":1,"model":"gpt-4o","choices":[{"index":0,"delta":{},"finish_reason":"stop"}]}"#,
    )));
    out.extend(tx.push(&SseEvent::data_only("[DONE]")));

    let names: Vec<&str> = out.iter().filter_map(|e| e.event.as_deref()).collect();
    assert_eq!(
        names,
        vec![
            "message_start",
            "content_block_start",
            "content_block_delta",
            "content_block_stop",
            "message_delta",
            "message_stop",
        ]
    );
    // The terminator came from [DONE]; close() owes nothing more.
    assert!(tx.close().is_empty());
}
