use bytes::Bytes;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::mappers::models::ClaudeRequest;
use crate::mappers::request::build_cloud_code_request;
use crate::mappers::streaming::{synthetic_recovery_stream, StreamingState};
use crate::models::Account;
use crate::upstream::sse::{
    peek_first_payload, FirstPayload, SseError, SseLineStream, UpstreamByteStream,
};

use super::classify::is_permanent_auth_failure;
use super::engine::{DispatchEngine, RateLimitAction, RequestContext};
use super::reset_parser::parse_reset_ms;
use super::timing::sleep_cancellable;
use super::DispatchError;

// How long to wait for the first upstream SSE payload before declaring the
// response empty.
const FIRST_PAYLOAD_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

pub type EventStream = ReceiverStream<Result<Bytes, std::io::Error>>;

// Result of getting one account+endpoint to produce a stream.
enum StreamOutcome {
    // Upstream is live: first payload already read, rest still flowing.
    Live {
        first: Value,
        sse: SseLineStream<UpstreamByteStream>,
    },
    // Every empty-response retry came back blank.
    Synthetic,
}

impl DispatchEngine {
    // Streaming entry point. Mirrors `dispatch` including the single
    // fallback-model substitution.
    pub async fn dispatch_stream(
        &self,
        request: &ClaudeRequest,
        cancel: &CancellationToken,
    ) -> Result<EventStream, DispatchError> {
        let mut model = request.model.clone();
        let mut fallback_allowed = self.config.fallback_enabled;
        loop {
            match self.dispatch_stream_model(request, &model, cancel).await {
                Ok(stream) => return Ok(stream),
                Err(e) if fallback_allowed && e.wants_model_fallback() => {
                    match self.fallback.fallback_for(&model) {
                        Some(substitute) => {
                            warn!(
                                requested = %model,
                                fallback = %substitute,
                                "model unavailable for streaming, switching to fallback model"
                            );
                            model = substitute.to_string();
                            fallback_allowed = false;
                        }
                        None => return Err(e),
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn dispatch_stream_model(
        &self,
        request: &ClaudeRequest,
        model: &str,
        cancel: &CancellationToken,
    ) -> Result<EventStream, DispatchError> {
        let mut ctx = RequestContext::default();
        let max_attempts = self.config.max_retries.max(self.accounts.len() + 1);
        let mut last_permanent_auth: Option<DispatchError> = None;

        while ctx.attempt < max_attempts {
            ctx.attempt += 1;
            let account = match self.next_account(model, cancel).await {
                Ok(Some(account)) => account,
                Ok(None) => continue,
                Err(DispatchError::NoAccounts { model }) => {
                    return Err(last_permanent_auth
                        .unwrap_or(DispatchError::NoAccounts { model }))
                }
                Err(e) => return Err(e),
            };

            debug!(
                email = %account.email,
                model,
                attempt = ctx.attempt,
                "dispatching streaming request"
            );
            match self
                .attempt_stream_account(&account, model, request, &mut ctx, cancel)
                .await
            {
                Ok(StreamOutcome::Live { first, sse }) => {
                    self.state.dedup.clear(model);
                    self.strategy.on_success(&account.email);
                    return Ok(self.spawn_forwarder(&request.model, first, sse, cancel.child_token()));
                }
                Ok(StreamOutcome::Synthetic) => {
                    warn!(
                        email = %account.email,
                        model,
                        "empty-response retries exhausted, emitting recovery stream"
                    );
                    return Ok(synthetic_stream(&request.model));
                }
                Err(DispatchError::Cancelled) => {
                    self.strategy.on_cancel(&account.email);
                    return Err(DispatchError::Cancelled);
                }
                Err(e) => {
                    if let DispatchError::AuthInvalidPermanent { email, reason } = &e {
                        last_permanent_auth = Some(DispatchError::AuthInvalidPermanent {
                            email: email.clone(),
                            reason: reason.clone(),
                        });
                    }
                    self.handle_outer_error(&account, model, e, cancel).await?;
                }
            }
        }

        Err(DispatchError::MaxRetriesExceeded {
            model: model.to_string(),
        })
    }

    // Endpoint loop for one account, streaming flavor: the 200 branch peeks
    // the first payload and runs empty-response recovery when there is none.
    async fn attempt_stream_account(
        &self,
        account: &Account,
        model: &str,
        request: &ClaudeRequest,
        ctx: &mut RequestContext,
        cancel: &CancellationToken,
    ) -> Result<StreamOutcome, DispatchError> {
        let (token, project) = self.acquire_auth(account).await?;
        let payload = build_cloud_code_request(request, model, &project);
        let endpoints = self.upstream.endpoints().to_vec();

        let mut last_error: Option<DispatchError> = None;
        let mut endpoint_index = 0;
        while endpoint_index < endpoints.len() {
            ctx.endpoint_index = endpoint_index;
            if cancel.is_cancelled() {
                return Err(DispatchError::Cancelled);
            }
            let base_url = &endpoints[endpoint_index];

            let response = match self
                .upstream
                .stream_generate_content(base_url, &token, &payload)
                .await
            {
                Ok(response) => response,
                Err(e) => {
                    return Err(DispatchError::Network {
                        message: e.to_string(),
                    })
                }
            };

            let status = response.status();
            if status.is_success() {
                let mut sse =
                    SseLineStream::new(Box::pin(response.bytes_stream()) as UpstreamByteStream);
                match peek_first_payload(&mut sse, FIRST_PAYLOAD_TIMEOUT).await {
                    FirstPayload::Payload(first) => {
                        return Ok(StreamOutcome::Live { first, sse })
                    }
                    FirstPayload::Transport(e) => {
                        return Err(DispatchError::Network { message: e })
                    }
                    FirstPayload::Empty => {
                        return self
                            .recover_empty_response(account, model, base_url, &token, &payload, ctx, cancel)
                            .await
                    }
                }
            }

            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .map(String::from);
            let body = response.text().await.unwrap_or_default();

            match status.as_u16() {
                401 if is_permanent_auth_failure(&body) => {
                    self.ledger.mark_invalid(&account.email, "token revoked");
                    return Err(DispatchError::AuthInvalidPermanent {
                        email: account.email.clone(),
                        reason: body,
                    });
                }
                401 => {
                    debug!(email = %account.email, "401 from upstream, clearing cached credentials");
                    self.auth.clear_token_cache(&account.email);
                    self.auth.clear_project_cache(&account.email);
                    endpoint_index += 1;
                }
                429 => {
                    match self
                        .handle_rate_limited(account, model, retry_after.as_deref(), &body, ctx, cancel)
                        .await
                    {
                        RateLimitAction::StaySameEndpoint => continue,
                        RateLimitAction::Fail(e) => return Err(e),
                    }
                }
                code if code >= 500 => {
                    warn!(email = %account.email, status = code, endpoint = %base_url, "server error, rotating endpoint");
                    last_error = Some(DispatchError::Api {
                        status: code,
                        message: super::engine::truncate(&body, 500),
                    });
                    if !sleep_cancellable(1_000, cancel).await {
                        return Err(DispatchError::Cancelled);
                    }
                    endpoint_index += 1;
                }
                code => {
                    warn!(email = %account.email, status = code, endpoint = %base_url, "client error, rotating endpoint");
                    last_error = Some(DispatchError::Api {
                        status: code,
                        message: super::engine::truncate(&body, 500),
                    });
                    endpoint_index += 1;
                }
            }
        }

        match last_error {
            Some(e) => Err(e),
            None => Err(DispatchError::AuthInvalid {
                message: "endpoints exhausted after transient auth failures".to_string(),
            }),
        }
    }

    // Empty-response recovery: exponential backoff re-POSTs of the same
    // request on the same endpoint. Runs until a payload arrives, a
    // classified error escalates, or the retry budget is spent.
    #[allow(clippy::too_many_arguments)]
    async fn recover_empty_response(
        &self,
        account: &Account,
        model: &str,
        base_url: &str,
        token: &str,
        payload: &Value,
        ctx: &mut RequestContext,
        cancel: &CancellationToken,
    ) -> Result<StreamOutcome, DispatchError> {
        while ctx.empty_retries < self.config.max_empty_response_retries {
            let backoff = crate::constants::EMPTY_RETRY_BACKOFF_MS
                [(ctx.empty_retries as usize).min(crate::constants::EMPTY_RETRY_BACKOFF_MS.len() - 1)];
            ctx.empty_retries += 1;
            info!(
                email = %account.email,
                model,
                retry = ctx.empty_retries,
                backoff_ms = backoff,
                "upstream returned empty stream, retrying"
            );
            if !sleep_cancellable(backoff, cancel).await {
                return Err(DispatchError::Cancelled);
            }

            let mut response = match self
                .upstream
                .stream_generate_content(base_url, token, payload)
                .await
            {
                Ok(response) => response,
                Err(e) => {
                    return Err(DispatchError::Network {
                        message: e.to_string(),
                    })
                }
            };

            // One in-place retry for a transient server error, outside the
            // empty-response budget.
            if response.status().as_u16() >= 500 {
                warn!(
                    email = %account.email,
                    status = response.status().as_u16(),
                    "server error during empty-response retry, retrying once after 1s"
                );
                if !sleep_cancellable(1_000, cancel).await {
                    return Err(DispatchError::Cancelled);
                }
                response = match self
                    .upstream
                    .stream_generate_content(base_url, token, payload)
                    .await
                {
                    Ok(response) => response,
                    Err(e) => {
                        return Err(DispatchError::Network {
                            message: e.to_string(),
                        })
                    }
                };
            }

            let status = response.status();
            if status.is_success() {
                let mut sse =
                    SseLineStream::new(Box::pin(response.bytes_stream()) as UpstreamByteStream);
                match peek_first_payload(&mut sse, FIRST_PAYLOAD_TIMEOUT).await {
                    FirstPayload::Payload(first) => return Ok(StreamOutcome::Live { first, sse }),
                    FirstPayload::Transport(e) => {
                        return Err(DispatchError::Network { message: e })
                    }
                    FirstPayload::Empty => continue,
                }
            }

            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .map(String::from);
            let body = response.text().await.unwrap_or_default();
            match status.as_u16() {
                401 if is_permanent_auth_failure(&body) => {
                    self.ledger.mark_invalid(&account.email, "token revoked");
                    return Err(DispatchError::AuthInvalidPermanent {
                        email: account.email.clone(),
                        reason: body,
                    });
                }
                401 => {
                    self.auth.clear_token_cache(&account.email);
                    self.auth.clear_project_cache(&account.email);
                    return Err(DispatchError::AuthInvalid {
                        message: "401 during empty-response retry".to_string(),
                    });
                }
                429 => {
                    let reset_ms = parse_reset_ms(retry_after.as_deref(), &body)
                        .unwrap_or(self.config.default_cooldown_ms);
                    self.ledger.mark_rate_limited(&account.email, reset_ms, model);
                    return Err(DispatchError::RateLimited {
                        email: account.email.clone(),
                    });
                }
                code => {
                    return Err(DispatchError::Api {
                        status: code,
                        message: super::engine::truncate(&body, 500),
                    });
                }
            }
        }

        Ok(StreamOutcome::Synthetic)
    }

    // Pump translated events from the live upstream into a channel the HTTP
    // layer can stream. The upstream connection is dropped on client
    // disconnect (send error) and on cancellation.
    fn spawn_forwarder(
        &self,
        requested_model: &str,
        first: Value,
        mut sse: SseLineStream<UpstreamByteStream>,
        cancel: CancellationToken,
    ) -> EventStream {
        let (tx, rx) = mpsc::channel::<Result<Bytes, std::io::Error>>(32);
        let model = requested_model.to_string();
        tokio::spawn(async move {
            let mut state = StreamingState::new(&model);
            for event in state.process_chunk(&first) {
                if tx.send(Ok(event)).await.is_err() {
                    return;
                }
            }
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("stream cancelled by caller, dropping upstream connection");
                        return;
                    }
                    payload = sse.next_payload() => match payload {
                        Some(Ok(chunk)) => {
                            for event in state.process_chunk(&chunk) {
                                if tx.send(Ok(event)).await.is_err() {
                                    return;
                                }
                            }
                        }
                        Some(Err(SseError::Transport(e))) => {
                            warn!("upstream stream error mid-flight: {}", e);
                            let _ = tx
                                .send(Err(std::io::Error::other(e)))
                                .await;
                            return;
                        }
                        None => break,
                    }
                }
            }
            for event in state.finish() {
                if tx.send(Ok(event)).await.is_err() {
                    return;
                }
            }
        });
        ReceiverStream::new(rx)
    }
}

fn synthetic_stream(model: &str) -> EventStream {
    let (tx, rx) = mpsc::channel(8);
    for event in synthetic_recovery_stream(model) {
        // Channel capacity exceeds the event count; this cannot fail.
        let _ = tx.try_send(Ok(event));
    }
    ReceiverStream::new(rx)
}
