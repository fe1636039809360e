use serde_json::Value;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::accounts::AccountStore;
use crate::auth::AuthBroker;
use crate::constants::now_ms;
use crate::error::AppError;
use crate::mappers::models::ClaudeRequest;
use crate::mappers::request::build_cloud_code_request;
use crate::mappers::response::{merge_sse_chunks, translate_response};
use crate::models::{Account, DispatchConfig};
use crate::upstream::sse::{SseError, SseLineStream};
use crate::upstream::UpstreamClient;

use super::classify::{is_model_capacity_exhausted, is_network_error, is_permanent_auth_failure};
use super::fallback::FallbackModelMap;
use super::ledger::RateLimitLedger;
use super::reset_parser::parse_reset_ms;
use super::strategy::SelectionStrategy;
use super::timing::{jitter_ms, sleep_cancellable};
use super::{DispatchError, DispatchState};

// Scratch state for one dispatcher call. Survives account switches within the
// call; dies with it.
#[derive(Debug, Default)]
pub(crate) struct RequestContext {
    pub attempt: usize,
    pub endpoint_index: usize,
    pub retried_once: bool,
    pub capacity_retry_count: u32,
    pub empty_retries: u32,
}

// What a classified 429 asks the endpoint loop to do next.
pub(crate) enum RateLimitAction {
    StaySameEndpoint,
    Fail(DispatchError),
}

pub struct DispatchEngine {
    pub(super) accounts: Arc<AccountStore>,
    pub(super) auth: Arc<AuthBroker>,
    pub(super) upstream: Arc<UpstreamClient>,
    pub(super) ledger: Arc<RateLimitLedger>,
    pub(super) strategy: Arc<SelectionStrategy>,
    pub(super) state: Arc<DispatchState>,
    pub(super) fallback: FallbackModelMap,
    pub(super) config: DispatchConfig,
}

impl DispatchEngine {
    pub fn new(
        config: DispatchConfig,
        accounts: Arc<AccountStore>,
        auth: Arc<AuthBroker>,
    ) -> Self {
        let state = Arc::new(DispatchState::new(&config));
        Self::with_state(config, accounts, auth, state)
    }

    pub fn with_state(
        config: DispatchConfig,
        accounts: Arc<AccountStore>,
        auth: Arc<AuthBroker>,
        state: Arc<DispatchState>,
    ) -> Self {
        let upstream = Arc::new(UpstreamClient::new(config.endpoints.clone()));
        let ledger = Arc::new(RateLimitLedger::new(accounts.clone(), auth.clone()));
        let strategy = Arc::new(SelectionStrategy::new(
            config.policy,
            config.max_wait_before_error_ms,
            accounts.clone(),
            state.health.clone(),
            state.buckets.clone(),
            state.quota.clone(),
        ));
        let fallback = FallbackModelMap::new(&config.fallback_models);
        Self {
            accounts,
            auth,
            upstream,
            ledger,
            strategy,
            state,
            fallback,
            config,
        }
    }

    pub fn state(&self) -> &Arc<DispatchState> {
        &self.state
    }

    pub fn ledger(&self) -> &Arc<RateLimitLedger> {
        &self.ledger
    }

    pub fn accounts(&self) -> &Arc<AccountStore> {
        &self.accounts
    }

    // Non-streaming entry point. Walks the retry state machine for the
    // requested model; on terminal exhaustion, substitutes the fallback model
    // once and runs the machine again with fallback disabled.
    pub async fn dispatch(
        &self,
        request: &ClaudeRequest,
        cancel: &CancellationToken,
    ) -> Result<Value, DispatchError> {
        let mut model = request.model.clone();
        let mut fallback_allowed = self.config.fallback_enabled;
        loop {
            match self.dispatch_model(request, &model, cancel).await {
                Ok(value) => return Ok(value),
                Err(e) if fallback_allowed && e.wants_model_fallback() => {
                    match self.fallback.fallback_for(&model) {
                        Some(substitute) => {
                            warn!(
                                requested = %model,
                                fallback = %substitute,
                                "model unavailable, switching to fallback model"
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

    async fn dispatch_model(
        &self,
        request: &ClaudeRequest,
        model: &str,
        cancel: &CancellationToken,
    ) -> Result<Value, DispatchError> {
        let mut ctx = RequestContext::default();
        let max_attempts = self.config.max_retries.max(self.accounts.len() + 1);
        // Carried so that a pool emptied by credential revocation reports the
        // revocation, not a generic "no accounts".
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
                "dispatching request"
            );
            match self.attempt_account(&account, model, request, &mut ctx, cancel).await {
                Ok(value) => {
                    self.state.dedup.clear(model);
                    self.strategy.on_success(&account.email);
                    return Ok(value);
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

    // One round of pool maintenance plus selection. Ok(None) means "go around
    // again" (any required cooldown sleep already happened).
    pub(crate) async fn next_account(
        &self,
        model: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<Account>, DispatchError> {
        if cancel.is_cancelled() {
            return Err(DispatchError::Cancelled);
        }
        self.ledger.clear_expired();

        let pool = self.ledger.available_accounts(model);
        if pool.is_empty() {
            if self.ledger.is_all_rate_limited(model) {
                let wait_ms = self.ledger.min_wait_ms(model);
                if wait_ms > self.config.max_wait_before_error_ms {
                    return Err(DispatchError::ResourceExhausted {
                        model: model.to_string(),
                        wait_ms,
                        reset_at_ms: now_ms() + wait_ms as i64,
                    });
                }
                info!(
                    model,
                    wait_ms, "all accounts rate limited, waiting for first reset"
                );
                if !sleep_cancellable(wait_ms + 500, cancel).await {
                    return Err(DispatchError::Cancelled);
                }
                return Ok(None);
            }
            return Err(DispatchError::NoAccounts {
                model: model.to_string(),
            });
        }

        let selection = self.strategy.select(&pool, model);
        match selection.account {
            Some(account) => Ok(Some(account)),
            None => {
                if selection.wait_ms > 0 {
                    debug!(
                        model,
                        wait_ms = selection.wait_ms,
                        "selection asked for a short wait"
                    );
                    if !sleep_cancellable(selection.wait_ms + 500, cancel).await {
                        return Err(DispatchError::Cancelled);
                    }
                }
                Ok(None)
            }
        }
    }

    // Outer exception handling: rate limits and auth faults rotate accounts;
    // server and network faults are charged to health and may extend the
    // cooldown; everything else propagates.
    pub(crate) async fn handle_outer_error(
        &self,
        account: &Account,
        model: &str,
        error: DispatchError,
        cancel: &CancellationToken,
    ) -> Result<(), DispatchError> {
        if error.is_rate_limit() {
            debug!(email = %account.email, %error, "rate limited, rotating account");
            self.strategy.on_rate_limit(&account.email);
            return Ok(());
        }
        if error.is_auth() {
            debug!(email = %account.email, %error, "auth failure, rotating account");
            return Ok(());
        }
        let is_network = matches!(error, DispatchError::Network { .. });
        if error.is_server_error() || is_network {
            warn!(email = %account.email, %error, "upstream failure");
            self.strategy.on_failure(&account.email);
            if self.state.health.get_consecutive_failures(&account.email)
                >= self.config.max_consecutive_failures
            {
                warn!(
                    email = %account.email,
                    "too many consecutive failures, applying extended cooldown"
                );
                self.ledger
                    .mark_rate_limited(&account.email, self.config.extended_cooldown_ms, model);
            }
            if is_network && !sleep_cancellable(jitter_ms(1_000, 0.1), cancel).await {
                return Err(DispatchError::Cancelled);
            }
            return Ok(());
        }
        Err(error)
    }

    // Obtain bearer and project, classifying auth failures into the
    // permanent / transient split.
    pub(crate) async fn acquire_auth(
        &self,
        account: &Account,
    ) -> Result<(String, String), DispatchError> {
        let token = match self.auth.token_for(account).await {
            Ok(token) => token,
            Err(e) => return Err(self.classify_auth_error(account, e)),
        };
        let project = match self.auth.project_for(account, &token).await {
            Ok(project) => project,
            Err(e) => return Err(self.classify_auth_error(account, e)),
        };
        Ok((token, project))
    }

    fn classify_auth_error(&self, account: &Account, error: AppError) -> DispatchError {
        let text = error.to_string();
        if is_permanent_auth_failure(&text) {
            self.ledger.mark_invalid(&account.email, "token revoked");
            DispatchError::AuthInvalidPermanent {
                email: account.email.clone(),
                reason: text,
            }
        } else if is_network_error(&text) {
            DispatchError::Network { message: text }
        } else {
            DispatchError::AuthInvalid { message: text }
        }
    }

    // Classify a 429 for `account`/`model` and either hold the current
    // endpoint (after sleeping out the hinted delay) or fail the attempt.
    pub(crate) async fn handle_rate_limited(
        &self,
        account: &Account,
        model: &str,
        retry_after: Option<&str>,
        body: &str,
        ctx: &mut RequestContext,
        cancel: &CancellationToken,
    ) -> RateLimitAction {
        let reset_ms = parse_reset_ms(retry_after, body);
        let default_ms = self.config.default_cooldown_ms;

        if is_model_capacity_exhausted(body) && ctx.capacity_retry_count < self.config.max_capacity_retries
        {
            ctx.capacity_retry_count += 1;
            let delay = reset_ms.unwrap_or(self.config.capacity_retry_delay_ms);
            info!(
                email = %account.email,
                model,
                retry = ctx.capacity_retry_count,
                delay_ms = delay,
                "model capacity exhausted, retrying same endpoint"
            );
            if !sleep_cancellable(delay, cancel).await {
                return RateLimitAction::Fail(DispatchError::Cancelled);
            }
            return RateLimitAction::StaySameEndpoint;
        }

        if self.state.dedup.should_skip_retry(model) {
            self.ledger
                .mark_rate_limited(&account.email, reset_ms.unwrap_or(default_ms), model);
            return RateLimitAction::Fail(DispatchError::RateLimitedDedup {
                email: account.email.clone(),
            });
        }

        match reset_ms {
            // Long limit: per-user quota gone for a while, cool the account
            Some(ms) if ms > default_ms => {
                self.ledger.mark_rate_limited(&account.email, ms, model);
                RateLimitAction::Fail(DispatchError::QuotaExhausted {
                    email: account.email.clone(),
                    reset_ms: ms,
                })
            }
            // Short limit: retry once in place, then give the account up
            _ => {
                if !ctx.retried_once {
                    ctx.retried_once = true;
                    self.state.dedup.record(model);
                    let delay = reset_ms.unwrap_or(default_ms);
                    info!(
                        email = %account.email,
                        model,
                        delay_ms = delay,
                        "short rate limit, retrying same endpoint once"
                    );
                    if !sleep_cancellable(delay, cancel).await {
                        return RateLimitAction::Fail(DispatchError::Cancelled);
                    }
                    RateLimitAction::StaySameEndpoint
                } else {
                    self.ledger
                        .mark_rate_limited(&account.email, reset_ms.unwrap_or(default_ms), model);
                    RateLimitAction::Fail(DispatchError::RateLimited {
                        email: account.email.clone(),
                    })
                }
            }
        }
    }

    // Endpoint loop for one account: walk the roster in order, classifying
    // each response by status class.
    async fn attempt_account(
        &self,
        account: &Account,
        model: &str,
        request: &ClaudeRequest,
        ctx: &mut RequestContext,
        cancel: &CancellationToken,
    ) -> Result<Value, DispatchError> {
        let (token, project) = self.acquire_auth(account).await?;
        let payload = build_cloud_code_request(request, model, &project);
        let endpoints = self.upstream.endpoints().to_vec();
        let thinking = request.is_thinking_model();

        let mut last_error: Option<DispatchError> = None;
        let mut endpoint_index = 0;
        while endpoint_index < endpoints.len() {
            ctx.endpoint_index = endpoint_index;
            if cancel.is_cancelled() {
                return Err(DispatchError::Cancelled);
            }
            let base_url = &endpoints[endpoint_index];

            let result = if thinking {
                self.upstream
                    .stream_generate_content(base_url, &token, &payload)
                    .await
            } else {
                self.upstream.generate_content(base_url, &token, &payload).await
            };
            let response = match result {
                Ok(response) => response,
                Err(e) => {
                    return Err(DispatchError::Network {
                        message: e.to_string(),
                    })
                }
            };

            let status = response.status();
            if status.is_success() {
                return self.read_success(response, request, thinking).await;
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
                        message: truncate(&body, 500),
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
                        message: truncate(&body, 500),
                    });
                    endpoint_index += 1;
                }
            }
        }

        match last_error {
            Some(e) => Err(e),
            // Only transient 401s can get here; rotate to the next account.
            None => Err(DispatchError::AuthInvalid {
                message: "endpoints exhausted after transient auth failures".to_string(),
            }),
        }
    }

    async fn read_success(
        &self,
        response: reqwest::Response,
        request: &ClaudeRequest,
        thinking: bool,
    ) -> Result<Value, DispatchError> {
        if thinking {
            // Thinking models only speak SSE; assemble the chunks into one
            // response before translating.
            let mut sse = SseLineStream::new(
                Box::pin(response.bytes_stream()) as crate::upstream::sse::UpstreamByteStream
            );
            let mut chunks = Vec::new();
            loop {
                match sse.next_payload().await {
                    Some(Ok(payload)) => chunks.push(payload),
                    Some(Err(SseError::Transport(e))) => {
                        return Err(DispatchError::Network { message: e })
                    }
                    None => break,
                }
            }
            let merged = merge_sse_chunks(&chunks);
            Ok(translate_response(&merged, &request.model))
        } else {
            let value: Value = response.json().await.map_err(|e| DispatchError::Api {
                status: 200,
                message: format!("invalid upstream JSON: {}", e),
            })?;
            Ok(translate_response(&value, &request.model))
        }
    }
}

pub(crate) fn truncate(text: &str, max: usize) -> String {
    if text.len() <= max {
        text.to_string()
    } else {
        let mut cut = max;
        while !text.is_char_boundary(cut) {
            cut -= 1;
        }
        format!("{}…", &text[..cut])
    }
}
