use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use bytes::Bytes;

use llmux_common::Service;
use llmux_core::{AppState, ErrorKind, ProxyError, ProxyResponse, handle_chat};
use llmux_protocol::{anthropic, google, mistral, openai};
use llmux_transform::{ChatRequest, GoogleChat};

use crate::models::models_payload;

/// End-to-end ceiling on one proxied request, queue wait included.
const REQUEST_DEADLINE: Duration = Duration::from_secs(600);

pub fn proxy_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/{service}/v1/models", get(list_models))
        .route("/{service}/v1/chat/completions", post(chat_completions))
        .route("/{service}/v1/messages", post(messages))
        .route(
            "/{service}/v1beta/models/{model_action}",
            post(google_generate),
        )
        .route(
            "/{service}/v1alpha/models/{model_action}",
            post(google_generate),
        )
        .with_state(state)
}

fn resolve_service(slug: &str) -> Result<Service, ProxyError> {
    Service::from_slug(slug)
        .ok_or_else(|| ProxyError::bad_request(format!("unknown service: {slug}")))
}

/// The caller's user token, handed to the external accounting store.
fn user_token(headers: &HeaderMap) -> Option<String> {
    let bearer = headers
        .get("authorization")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "));
    bearer
        .or_else(|| {
            headers
                .get("x-api-key")
                .and_then(|value| value.to_str().ok())
        })
        .map(str::to_string)
}

async fn run_pipeline(
    state: Arc<AppState>,
    service: Service,
    inbound: ChatRequest,
    headers: HeaderMap,
) -> Response {
    let token = user_token(&headers);
    let outcome = tokio::time::timeout(
        REQUEST_DEADLINE,
        handle_chat(&state, service, inbound, token),
    )
    .await;
    match outcome {
        Ok(Ok(response)) => proxy_response_into_axum(response),
        Ok(Err(error)) => proxy_error_into_axum(&error),
        Err(_) => proxy_error_into_axum(&ProxyError::new(
            ErrorKind::UpstreamUnavailable,
            "request deadline exceeded",
        )),
    }
}

async fn chat_completions(
    State(state): State<Arc<AppState>>,
    Path(service): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let service = match resolve_service(&service) {
        Ok(service) => service,
        Err(error) => return proxy_error_into_axum(&error),
    };
    // Mistral's native dialect shares this path shape; everyone else
    // speaks OpenAI here.
    let inbound = if service == Service::MistralAi {
        parse_json::<mistral::ChatRequest>(&body).map(ChatRequest::Mistral)
    } else {
        parse_json::<openai::ChatCompletionRequest>(&body).map(ChatRequest::OpenAi)
    };
    match inbound {
        Ok(inbound) => run_pipeline(state, service, inbound, headers).await,
        Err(error) => proxy_error_into_axum(&error),
    }
}

async fn messages(
    State(state): State<Arc<AppState>>,
    Path(service): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let service = match resolve_service(&service) {
        Ok(service) => service,
        Err(error) => return proxy_error_into_axum(&error),
    };
    if !matches!(service, Service::Anthropic | Service::Aws | Service::Gcp) {
        return proxy_error_into_axum(&ProxyError::bad_request(
            "this service has no native messages endpoint",
        ));
    }
    match parse_json::<anthropic::MessagesRequest>(&body) {
        Ok(request) => {
            run_pipeline(state, service, ChatRequest::Anthropic(request), headers).await
        }
        Err(error) => proxy_error_into_axum(&error),
    }
}

async fn google_generate(
    State(state): State<Arc<AppState>>,
    Path((service, model_action)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let service = match resolve_service(&service) {
        Ok(service) => service,
        Err(error) => return proxy_error_into_axum(&error),
    };
    if service != Service::GoogleAi {
        return proxy_error_into_axum(&ProxyError::bad_request(
            "native generateContent is only served for google-ai",
        ));
    }
    let Some((model, action)) = model_action.split_once(':') else {
        return proxy_error_into_axum(&ProxyError::bad_request(
            "expected models/{model}:{action}",
        ));
    };
    let stream = match action {
        "generateContent" => false,
        "streamGenerateContent" => true,
        other => {
            return proxy_error_into_axum(&ProxyError::bad_request(format!(
                "unsupported action: {other}"
            )));
        }
    };
    match parse_json::<google::GenerateContentRequest>(&body) {
        Ok(request) => {
            let inbound = ChatRequest::Google(GoogleChat {
                model: model.to_string(),
                stream,
                body: request,
            });
            run_pipeline(state, service, inbound, headers).await
        }
        Err(error) => proxy_error_into_axum(&error),
    }
}

async fn list_models(
    State(state): State<Arc<AppState>>,
    Path(service): Path<String>,
) -> Response {
    let service = match resolve_service(&service) {
        Ok(service) => service,
        Err(error) => return proxy_error_into_axum(&error),
    };
    let payload = models_payload(&state, service);
    match serde_json::to_vec(&payload) {
        Ok(body) => json_response(StatusCode::OK, Bytes::from(body)),
        Err(err) => proxy_error_into_axum(&ProxyError::internal(err.to_string())),
    }
}

fn parse_json<T: serde::de::DeserializeOwned>(body: &[u8]) -> Result<T, ProxyError> {
    if body.is_empty() {
        return Err(ProxyError::bad_request("missing request body"));
    }
    serde_json::from_slice(body)
        .map_err(|err| ProxyError::bad_request(format!("invalid json: {err}")))
}

fn proxy_response_into_axum(response: ProxyResponse) -> Response {
    match response {
        ProxyResponse::Json {
            status,
            headers,
            body,
        } => {
            let mut response = json_response(status, body);
            response.headers_mut().extend(headers);
            response
        }
        ProxyResponse::Stream {
            status,
            headers,
            body,
        } => {
            let mut response = Response::builder()
                .status(status)
                .header("content-type", body.content_type)
                .header("cache-control", "no-cache")
                .body(Body::from_stream(body.stream))
                .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response());
            response.headers_mut().extend(headers);
            response
        }
    }
}

fn proxy_error_into_axum(error: &ProxyError) -> Response {
    tracing::warn!(kind = ?error.kind, message = %error.message, "request failed");
    json_response(error.status(), error.payload_bytes())
}

fn json_response(status: StatusCode, body: Bytes) -> Response {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Body::from(body))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}
