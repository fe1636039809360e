use axum::{
    body::Body,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::dispatch::DispatchError;
use crate::mappers::estimate::estimate_input_tokens;
use crate::mappers::models::{ClaudeRequest, CountTokensRequest};

use super::server::AppState;

pub async fn handle_health(State(state): State<AppState>) -> Response {
    Json(json!({
        "status": "ok",
        "accounts": state.accounts.len(),
    }))
    .into_response()
}

pub async fn handle_messages(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    if let Err(response) = check_api_key(&state, &headers) {
        return response;
    }

    let request: ClaudeRequest = match serde_json::from_value(body) {
        Ok(request) => request,
        Err(e) => return invalid_request(format!("Invalid request body: {}", e)),
    };
    info!(
        model = %request.model,
        stream = request.stream,
        messages = request.messages.len(),
        "inbound message request"
    );

    if request.stream {
        handle_messages_stream(state, request).await
    } else {
        handle_messages_json(state, request).await
    }
}

// Dispatch runs in its own task so that a dropped connection cancels the
// state machine (and triggers the token refund) instead of silently
// abandoning it.
async fn handle_messages_json(state: AppState, request: ClaudeRequest) -> Response {
    let cancel = CancellationToken::new();
    let guard = cancel.clone().drop_guard();
    let engine = state.engine.clone();
    let task = tokio::spawn(async move { engine.dispatch(&request, &cancel).await });

    let result = match task.await {
        Ok(result) => result,
        Err(e) => {
            warn!("dispatch task failed: {}", e);
            return error_response(DispatchError::Api {
                status: 500,
                message: "dispatch task failed".to_string(),
            });
        }
    };
    drop(guard);

    match result {
        Ok(message) => Json(message).into_response(),
        Err(e) => error_response(e),
    }
}

async fn handle_messages_stream(state: AppState, request: ClaudeRequest) -> Response {
    let cancel = CancellationToken::new();
    let guard = cancel.clone().drop_guard();
    let engine = state.engine.clone();
    let task = tokio::spawn(async move { engine.dispatch_stream(&request, &cancel).await });

    let result = match task.await {
        Ok(result) => result,
        Err(e) => {
            warn!("stream dispatch task failed: {}", e);
            return error_response(DispatchError::Api {
                status: 500,
                message: "dispatch task failed".to_string(),
            });
        }
    };

    match result {
        Ok(stream) => {
            // The stream is live; from here on the client's disconnect is the
            // cancellation signal, carried by the channel closing.
            guard.disarm();
            Response::builder()
                .header("Content-Type", "text/event-stream")
                .header("Cache-Control", "no-cache")
                .header("Connection", "keep-alive")
                .header("X-Accel-Buffering", "no")
                .body(Body::from_stream(stream))
                .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
        }
        Err(e) => error_response(e),
    }
}

pub async fn handle_count_tokens(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    if let Err(response) = check_api_key(&state, &headers) {
        return response;
    }

    let request: CountTokensRequest = match serde_json::from_value(body) {
        Ok(request) => request,
        Err(e) => return invalid_request(format!("Invalid request body: {}", e)),
    };

    // Text-only input is estimated locally; binary blocks need the upstream
    // tokenizer, reached through a one-token generate call.
    let probe = ClaudeRequest {
        model: request.model.clone(),
        messages: request.messages.clone(),
        system: request.system.clone(),
        max_tokens: Some(1),
        temperature: None,
        top_p: None,
        stop_sequences: None,
        stream: false,
        tools: request.tools.clone(),
        tool_choice: None,
        thinking: None,
    };

    if !probe.has_binary_content() {
        let estimate = estimate_input_tokens(&request);
        debug!(model = %request.model, tokens = estimate, "local token estimate");
        return Json(json!({ "input_tokens": estimate })).into_response();
    }

    let cancel = CancellationToken::new();
    match state.engine.dispatch(&probe, &cancel).await {
        Ok(message) => {
            let tokens = message
                .get("usage")
                .and_then(|u| u.get("input_tokens"))
                .and_then(|v| v.as_u64())
                .unwrap_or(0);
            Json(json!({ "input_tokens": tokens })).into_response()
        }
        Err(e) => error_response(e),
    }
}

fn check_api_key(state: &AppState, headers: &HeaderMap) -> Result<(), Response> {
    let expected = &state.config.proxy.api_key;
    if expected.is_empty() {
        return Ok(());
    }
    let provided = headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .or_else(|| {
            headers
                .get("authorization")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.strip_prefix("Bearer "))
        });
    if provided == Some(expected.as_str()) {
        Ok(())
    } else {
        Err((
            StatusCode::UNAUTHORIZED,
            Json(json!({
                "type": "error",
                "error": { "type": "authentication_error", "message": "invalid api key" }
            })),
        )
            .into_response())
    }
}

fn invalid_request(message: String) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({
            "type": "error",
            "error": { "type": "invalid_request_error", "message": message }
        })),
    )
        .into_response()
}

// Dispatch errors in the Anthropic error envelope, with a Retry-After hint
// where the wait is known.
pub fn error_response(error: DispatchError) -> Response {
    let (status, error_type, retry_after_secs) = match &error {
        DispatchError::ResourceExhausted { wait_ms, .. } => (
            StatusCode::TOO_MANY_REQUESTS,
            "rate_limit_error",
            Some(wait_ms.div_ceil(1_000)),
        ),
        DispatchError::QuotaExhausted { reset_ms, .. } => (
            StatusCode::TOO_MANY_REQUESTS,
            "rate_limit_error",
            Some(reset_ms.div_ceil(1_000)),
        ),
        DispatchError::RateLimited { .. } | DispatchError::RateLimitedDedup { .. } => {
            (StatusCode::TOO_MANY_REQUESTS, "rate_limit_error", None)
        }
        DispatchError::AuthInvalidPermanent { .. } | DispatchError::AuthInvalid { .. } => {
            (StatusCode::BAD_GATEWAY, "api_error", None)
        }
        DispatchError::Api { status, .. } => {
            let code = StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY);
            let error_type = match *status {
                400 => "invalid_request_error",
                403 => "permission_error",
                404 => "not_found_error",
                429 => "rate_limit_error",
                529 => "overloaded_error",
                _ => "api_error",
            };
            (code, error_type, None)
        }
        DispatchError::Network { .. } => (StatusCode::BAD_GATEWAY, "api_error", None),
        DispatchError::NoAccounts { .. } => {
            (StatusCode::SERVICE_UNAVAILABLE, "overloaded_error", None)
        }
        DispatchError::MaxRetriesExceeded { .. } => {
            (StatusCode::from_u16(529).unwrap_or(StatusCode::SERVICE_UNAVAILABLE), "overloaded_error", None)
        }
        DispatchError::Cancelled => (StatusCode::INTERNAL_SERVER_ERROR, "api_error", None),
    };

    let mut builder = Response::builder()
        .status(status)
        .header("Content-Type", "application/json");
    if let Some(secs) = retry_after_secs {
        builder = builder.header("Retry-After", secs.to_string());
    }
    let body = json!({
        "type": "error",
        "error": { "type": error_type, "message": error.to_string() }
    });
    builder
        .body(Body::from(body.to_string()))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}
