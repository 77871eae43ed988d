//! Request orchestration
//!
//! The end-to-end pipeline for one inbound call: parse, fingerprint,
//! deduplicate, select candidates, resolve credentials, translate, call the
//! upstream, probe the result for health signals, fail over, reply. The
//! streaming path pre-reads a short lookahead so an upstream that errors
//! immediately can be failed over before any byte reaches the client.

use crate::errors::{error_body, error_response, error_response_with_status};
use crate::state::AppState;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures::StreamExt;
use nimbus_core::config::{AuthKind, ConfigSnapshot, ProviderConfig, ProviderKind, Settings};
use nimbus_core::normalized::{NormalizedRequest, NormalizedStreamEvent};
use nimbus_core::provider::{EventStream, Provider};
use nimbus_core::{Error, ErrorKind, Fingerprint};
use nimbus_egress::{anthropic::AnthropicConnector, openai::OpenAIConnector, ResolvedAuth};
use nimbus_ingress::anthropic::{self, AnthropicMessagesRequest};
use nimbus_ingress::count_tokens::estimate_input_tokens;
use nimbus_ingress::sse::{AnthropicSseEncoder, SseFrame};
use nimbus_routing::{
    classify_error, classify_response_body, select_candidates, Candidate, FailureClass,
    SelectionOutcome,
};
use nimbus_stream::broadcaster::{BroadcastOptions, Broadcaster, Subscription, Terminal};
use nimbus_stream::dedup::{BeginStream, BeginUnary, UnaryOutcome};
use std::convert::Infallible;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Events pre-read before the first byte is committed to the client
const STREAM_LOOKAHEAD: usize = 4;

/// `POST /v1/messages`
pub async fn messages(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let wire: AnthropicMessagesRequest = match serde_json::from_slice(&body) {
        Ok(req) => req,
        Err(e) => {
            return error_response(ErrorKind::InvalidRequest, &format!("malformed JSON: {}", e))
        }
    };
    let normalized = match anthropic::to_normalized(wire) {
        Ok(normalized) => normalized,
        Err(e) => return e.into_response(),
    };

    let snapshot = state.config.load();
    state
        .dedup
        .evict_expired(Duration::from_secs(snapshot.settings.deduplication_ttl));

    if normalized.stream {
        handle_streaming(state, headers, normalized, snapshot).await
    } else {
        handle_unary(state, headers, normalized, snapshot).await
    }
}

/// `POST /v1/messages/count_tokens`
pub async fn count_tokens(State(_state): State<Arc<AppState>>, body: Bytes) -> Response {
    let wire: AnthropicMessagesRequest = match serde_json::from_slice(&body) {
        Ok(req) => req,
        Err(e) => {
            return error_response(ErrorKind::InvalidRequest, &format!("malformed JSON: {}", e))
        }
    };
    let normalized = match anthropic::to_normalized(wire) {
        Ok(normalized) => normalized,
        Err(e) => return e.into_response(),
    };
    let input_tokens = estimate_input_tokens(&normalized);
    axum::Json(serde_json::json!({ "input_tokens": input_tokens })).into_response()
}

// Non-streaming path

async fn handle_unary(
    state: Arc<AppState>,
    headers: HeaderMap,
    normalized: NormalizedRequest,
    snapshot: Arc<ConfigSnapshot>,
) -> Response {
    let fp = nimbus_core::fingerprint::fingerprint(&normalized);
    let ttl = Duration::from_secs(snapshot.settings.deduplication_ttl);

    if snapshot.settings.deduplication_enabled {
        // A vanished owner closes the waiter channel; retry a bounded number
        // of times, taking ownership if the slot is free.
        for _ in 0..3 {
            match state.dedup.begin_unary(fp.clone(), ttl) {
                BeginUnary::Owner(owner) => {
                    // Run the owner's call on its own task: if this client
                    // disconnects mid-flight, the call still completes and
                    // feeds any duplicate waiters.
                    let task = {
                        let state = Arc::clone(&state);
                        let headers = headers.clone();
                        let normalized = normalized.clone();
                        let snapshot = Arc::clone(&snapshot);
                        let fp = fp.clone();
                        tokio::spawn(async move {
                            let outcome =
                                execute_unary(&state, &headers, &normalized, &snapshot, &fp)
                                    .await;
                            owner.complete(outcome.clone());
                            outcome
                        })
                    };
                    return match task.await {
                        Ok(outcome) => unary_response(outcome),
                        Err(_) => error_response_with_status(
                            500,
                            ErrorKind::Api,
                            "request task failed",
                        ),
                    };
                }
                BeginUnary::Waiter(mut rx) => {
                    debug!(fingerprint = %fp, "joining in-flight duplicate request");
                    match rx.recv().await {
                        Ok(outcome) => return unary_response(outcome),
                        Err(_) => continue,
                    }
                }
            }
        }
    }

    let outcome = execute_unary(&state, &headers, &normalized, &snapshot, &fp).await;
    unary_response(outcome)
}

fn unary_response(outcome: UnaryOutcome) -> Response {
    let status = axum::http::StatusCode::from_u16(outcome.status)
        .unwrap_or(axum::http::StatusCode::INTERNAL_SERVER_ERROR);
    (status, axum::Json(outcome.body)).into_response()
}

async fn execute_unary(
    state: &Arc<AppState>,
    headers: &HeaderMap,
    normalized: &NormalizedRequest,
    snapshot: &ConfigSnapshot,
    fp: &Fingerprint,
) -> UnaryOutcome {
    let settings = &snapshot.settings;
    let candidates = match select_candidates(
        &normalized.model,
        snapshot,
        &state.health,
        &state.sticky,
        &state.round_robin,
    ) {
        SelectionOutcome::NoRoute => {
            return UnaryOutcome {
                status: 404,
                body: error_body(
                    ErrorKind::NotFound,
                    &format!("no route matches model '{}'", normalized.model),
                ),
            }
        }
        SelectionOutcome::AllUnhealthy => {
            return UnaryOutcome {
                status: 503,
                body: error_body(
                    ErrorKind::Api,
                    &format!(
                        "all providers for model '{}' are unavailable",
                        normalized.model
                    ),
                ),
            }
        }
        SelectionOutcome::Candidates(candidates) => candidates,
    };

    let mut attempts = 0u32;
    let mut last_error: Option<(ErrorKind, String)> = None;

    for candidate in candidates {
        attempts += 1;
        let provider_name = candidate.provider.name.clone();

        let provider = match build_provider(state, headers, &candidate) {
            Ok(provider) => provider,
            Err(e) => {
                warn!(provider = %provider_name, error = %e, "skipping candidate: credentials unavailable");
                last_error = Some((e.kind(), e.to_string()));
                continue;
            }
        };

        let mut request = normalized.clone();
        request.model = candidate.upstream_model.clone();
        request.stream = false;

        debug!(
            provider = %provider_name,
            upstream_model = %candidate.upstream_model,
            fingerprint = %fp,
            attempt = attempts,
            "attempting upstream call"
        );

        let _permit = state
            .limits
            .acquire(&provider_name, settings.max_upstream_connections_per_provider)
            .await;
        let call = tokio::time::timeout(
            Duration::from_secs(settings.request_timeout),
            provider.send(request),
        )
        .await;
        let result = match call {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(settings.request_timeout)),
        };

        match result {
            Ok(mut response) => {
                // Clients see the model they asked for, not the upstream's
                response.model = normalized.model.clone();
                let wire = anthropic::from_normalized(response);
                let body = match serde_json::to_value(&wire) {
                    Ok(body) => body,
                    Err(e) => {
                        return UnaryOutcome {
                            status: 500,
                            body: error_body(ErrorKind::Api, &e.to_string()),
                        }
                    }
                };

                // A 2xx body can still carry an unhealthy signal
                if let Some(pattern) = classify_response_body(&body.to_string(), settings) {
                    let class = FailureClass::BodyPattern(pattern.clone());
                    let marked = state.health.record_failure(
                        &provider_name,
                        &class,
                        settings.unhealthy_threshold,
                    );
                    warn!(
                        provider = %provider_name,
                        pattern = %pattern,
                        marked_unhealthy = marked,
                        "response body matched unhealthy pattern"
                    );
                    if marked {
                        last_error = Some((ErrorKind::Api, format!("body pattern '{}'", pattern)));
                        continue;
                    }
                    // Below threshold: surface to the client without retry
                    return UnaryOutcome {
                        status: 502,
                        body: error_body(
                            ErrorKind::Api,
                            &format!("upstream response matched error pattern '{}'", pattern),
                        ),
                    };
                }

                state.health.record_success(&provider_name);
                state.sticky.record(&provider_name);
                info!(provider = %provider_name, model = %normalized.model, "request succeeded");
                return UnaryOutcome { status: 200, body };
            }
            Err(err) => {
                let class = classify_error(&err, settings);
                if class.is_qualifying() {
                    let marked = state.health.record_failure(
                        &provider_name,
                        &class,
                        settings.unhealthy_threshold,
                    );
                    warn!(
                        provider = %provider_name,
                        reason = %class.reason(),
                        marked_unhealthy = marked,
                        "attempt failed, trying next candidate"
                    );
                    last_error = Some((err.kind(), err.to_string()));
                    continue;
                }
                // Auth and validation failures are surfaced verbatim;
                // retrying elsewhere will not help.
                debug!(provider = %provider_name, error = %err, "non-retriable failure");
                return unary_error_outcome(&err);
            }
        }
    }

    let (kind, detail) = last_error.unwrap_or((ErrorKind::Api, "no candidates attempted".into()));
    UnaryOutcome {
        status: 503,
        body: error_body(
            kind,
            &format!("all {} provider attempts failed; last error: {}", attempts, detail),
        ),
    }
}

fn unary_error_outcome(err: &Error) -> UnaryOutcome {
    let kind = err.kind();
    let status = match err {
        Error::UpstreamStatus { status, .. } => *status,
        _ => kind.http_status(),
    };
    UnaryOutcome {
        status,
        body: error_body(kind, &err.to_string()),
    }
}

// Streaming path

async fn handle_streaming(
    state: Arc<AppState>,
    headers: HeaderMap,
    normalized: NormalizedRequest,
    snapshot: Arc<ConfigSnapshot>,
) -> Response {
    let fp = nimbus_core::fingerprint::fingerprint(&normalized);
    let ttl = Duration::from_secs(snapshot.settings.deduplication_ttl);

    if snapshot.settings.deduplication_enabled {
        for _ in 0..3 {
            match state.dedup.begin_stream(fp.clone(), ttl) {
                BeginStream::Owner(owner) => {
                    return run_stream_owner(state, headers, normalized, snapshot, Some(owner))
                        .await;
                }
                BeginStream::Subscriber(follower) => {
                    debug!(fingerprint = %fp, "joining in-flight duplicate stream");
                    match follower.broadcaster().await {
                        Some(broadcaster) => {
                            return subscription_response(broadcaster.subscribe())
                        }
                        // Owner gave up before streaming started; retry and
                        // possibly take over
                        None => continue,
                    }
                }
            }
        }
    }

    run_stream_owner(state, headers, normalized, snapshot, None).await
}

async fn run_stream_owner(
    state: Arc<AppState>,
    headers: HeaderMap,
    normalized: NormalizedRequest,
    snapshot: Arc<ConfigSnapshot>,
    mut owner: Option<nimbus_stream::dedup::StreamOwner>,
) -> Response {
    let settings = snapshot.settings.clone();
    let candidates = match select_candidates(
        &normalized.model,
        &snapshot,
        &state.health,
        &state.sticky,
        &state.round_robin,
    ) {
        SelectionOutcome::NoRoute => {
            return error_response(
                ErrorKind::NotFound,
                &format!("no route matches model '{}'", normalized.model),
            )
        }
        SelectionOutcome::AllUnhealthy => {
            return error_response_with_status(
                503,
                ErrorKind::Api,
                &format!("all providers for model '{}' are unavailable", normalized.model),
            )
        }
        SelectionOutcome::Candidates(candidates) => candidates,
    };

    let idle_timeout = Duration::from_secs(settings.streaming_idle_timeout);
    let mut attempts = 0u32;
    let mut last_error: Option<(ErrorKind, String)> = None;

    for candidate in candidates {
        attempts += 1;
        let provider_name = candidate.provider.name.clone();

        let provider = match build_provider(&state, &headers, &candidate) {
            Ok(provider) => provider,
            Err(e) => {
                warn!(provider = %provider_name, error = %e, "skipping candidate: credentials unavailable");
                last_error = Some((e.kind(), e.to_string()));
                continue;
            }
        };

        let mut request = normalized.clone();
        request.model = candidate.upstream_model.clone();
        request.stream = true;

        debug!(provider = %provider_name, attempt = attempts, "opening upstream stream");

        let permit = state
            .limits
            .acquire(&provider_name, settings.max_upstream_connections_per_provider)
            .await;
        let open = tokio::time::timeout(
            Duration::from_secs(settings.request_timeout),
            provider.stream(request),
        )
        .await;
        let mut events: EventStream = match open {
            Ok(Ok(events)) => events,
            Ok(Err(err)) => {
                match stream_attempt_failure(&state, &provider_name, err, &settings, &mut last_error)
                {
                    AttemptVerdict::Failover => continue,
                    AttemptVerdict::Surface(response) => {
                        if let Some(owner) = owner.take() {
                            owner.abandon();
                        }
                        return response;
                    }
                }
            }
            Err(_) => {
                let err = Error::Timeout(settings.request_timeout);
                match stream_attempt_failure(&state, &provider_name, err, &settings, &mut last_error)
                {
                    AttemptVerdict::Failover => continue,
                    AttemptVerdict::Surface(response) => {
                        if let Some(owner) = owner.take() {
                            owner.abandon();
                        }
                        return response;
                    }
                }
            }
        };

        // Pre-read a short lookahead: an upstream that errors in its first
        // events is failed over while the client has received nothing.
        match lookahead_events(&mut events, idle_timeout).await {
            Lookahead::EarlyError(err) => {
                debug!(provider = %provider_name, error = %err, "upstream stream failed before first byte");
                match stream_attempt_failure(&state, &provider_name, err, &settings, &mut last_error)
                {
                    AttemptVerdict::Failover => continue,
                    AttemptVerdict::Surface(response) => {
                        if let Some(owner) = owner.take() {
                            owner.abandon();
                        }
                        return response;
                    }
                }
            }
            Lookahead::Clean(buffered) => {
                let encoder = AnthropicSseEncoder::new(&normalized.model);
                let health = Arc::new(StreamHealth::default());
                let frames =
                    build_frame_stream(buffered, events, encoder, Arc::clone(&health)).boxed();
                let broadcaster = Broadcaster::spawn(
                    frames,
                    BroadcastOptions {
                        idle_timeout,
                        total_timeout: Duration::from_secs(settings.streaming_total_timeout),
                        backlog_max: settings.subscriber_backlog_max,
                    },
                );

                if let Some(mut stream_owner) = owner.take() {
                    stream_owner.publish(Arc::clone(&broadcaster));
                }
                spawn_stream_health_watch(
                    Arc::clone(&state),
                    provider_name.clone(),
                    Arc::clone(&broadcaster),
                    health,
                    settings.clone(),
                    permit,
                );

                info!(provider = %provider_name, model = %normalized.model, "streaming from upstream");
                return subscription_response(broadcaster.subscribe());
            }
        }
    }

    if let Some(owner) = owner.take() {
        owner.abandon();
    }
    let (kind, detail) = last_error.unwrap_or((ErrorKind::Api, "no candidates attempted".into()));
    error_response_with_status(
        503,
        kind,
        &format!("all {} provider attempts failed; last error: {}", attempts, detail),
    )
}

enum AttemptVerdict {
    Failover,
    Surface(Response),
}

fn stream_attempt_failure(
    state: &Arc<AppState>,
    provider_name: &str,
    err: Error,
    settings: &Settings,
    last_error: &mut Option<(ErrorKind, String)>,
) -> AttemptVerdict {
    let class = classify_error(&err, settings);
    if class.is_qualifying() {
        let marked =
            state
                .health
                .record_failure(provider_name, &class, settings.unhealthy_threshold);
        warn!(
            provider = %provider_name,
            reason = %class.reason(),
            marked_unhealthy = marked,
            "stream attempt failed, trying next candidate"
        );
        *last_error = Some((err.kind(), err.to_string()));
        AttemptVerdict::Failover
    } else {
        debug!(provider = %provider_name, error = %err, "non-retriable stream failure");
        let kind = err.kind();
        let status = match &err {
            Error::UpstreamStatus { status, .. } => *status,
            _ => kind.http_status(),
        };
        AttemptVerdict::Surface(error_response_with_status(status, kind, &err.to_string()))
    }
}

fn subscription_response(subscription: Subscription) -> Response {
    let stream = subscription
        .map(|frame| Ok::<Event, Infallible>(Event::default().event(frame.event).data(frame.data)));
    Sse::new(stream).keep_alive(KeepAlive::default()).into_response()
}

// Candidate plumbing

fn build_provider(
    state: &Arc<AppState>,
    headers: &HeaderMap,
    candidate: &Candidate,
) -> Result<Box<dyn Provider>, Error> {
    let auth = resolve_auth(&candidate.provider, headers, state)?;
    let client = state
        .clients
        .get(&candidate.provider.base_url, candidate.provider.http_proxy.as_deref())
        .map_err(nimbus_core::Error::from)?;

    Ok(match candidate.provider.kind {
        ProviderKind::Anthropic => Box::new(AnthropicConnector::new(
            client,
            candidate.provider.base_url.clone(),
            auth,
        )),
        ProviderKind::OpenAI => Box::new(OpenAIConnector::new(
            client,
            candidate.provider.base_url.clone(),
            auth,
        )),
    })
}

fn resolve_auth(
    provider: &ProviderConfig,
    headers: &HeaderMap,
    state: &Arc<AppState>,
) -> Result<ResolvedAuth, Error> {
    if provider.uses_passthrough_auth() {
        let header_value = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(String::from)
        };
        return Ok(ResolvedAuth::Passthrough {
            api_key: header_value("x-api-key"),
            authorization: header_value("authorization"),
        });
    }
    if provider.uses_oauth() {
        let (token, account) = state.oauth.issue_token().map_err(nimbus_core::Error::from)?;
        debug!(provider = %provider.name, account = %account, "issued OAuth token");
        return Ok(ResolvedAuth::Bearer(token));
    }
    Ok(match provider.auth_type {
        AuthKind::ApiKey => ResolvedAuth::ApiKey(provider.auth_value.clone()),
        AuthKind::AuthToken | AuthKind::OAuth => ResolvedAuth::Bearer(provider.auth_value.clone()),
    })
}

// Streaming internals

/// Health-relevant outcome of one owned stream, written by the translating
/// stage and read after the broadcaster terminates.
#[derive(Default)]
struct StreamHealth {
    error: Mutex<Option<Error>>,
}

impl StreamHealth {
    fn record(&self, error: Error) {
        let mut guard = self.error.lock().unwrap_or_else(|p| p.into_inner());
        if guard.is_none() {
            *guard = Some(error);
        }
    }

    fn take(&self) -> Option<Error> {
        self.error.lock().unwrap_or_else(|p| p.into_inner()).take()
    }
}

/// What the lookahead saw before the first client byte.
enum Lookahead {
    /// Stream looks healthy; buffered events must be replayed first
    Clean(Vec<NormalizedStreamEvent>),
    /// The upstream failed before any byte was committed downstream
    EarlyError(Error),
}

async fn lookahead_events(events: &mut EventStream, idle_timeout: Duration) -> Lookahead {
    let mut buffered = Vec::new();
    for _ in 0..STREAM_LOOKAHEAD {
        match tokio::time::timeout(idle_timeout, events.next()).await {
            Err(_) => {
                return Lookahead::EarlyError(Error::Timeout(idle_timeout.as_secs()));
            }
            Ok(None) => break,
            Ok(Some(Err(e))) => return Lookahead::EarlyError(e),
            Ok(Some(Ok(event))) => {
                if let NormalizedStreamEvent::Error {
                    error_type,
                    message,
                } = event
                {
                    return Lookahead::EarlyError(Error::StreamError {
                        error_type,
                        message,
                    });
                }
                let is_content = matches!(
                    event,
                    NormalizedStreamEvent::TextDelta { .. }
                        | NormalizedStreamEvent::ToolCallDelta { .. }
                        | NormalizedStreamEvent::End { .. }
                );
                buffered.push(event);
                if is_content {
                    break;
                }
            }
        }
    }
    Lookahead::Clean(buffered)
}

/// Translate the normalized event stream into wire-ready frames, recording
/// the first error for post-stream health evaluation. The stream ends once
/// the encoder has emitted its terminal frames.
fn build_frame_stream(
    buffered: Vec<NormalizedStreamEvent>,
    rest: EventStream,
    mut encoder: AnthropicSseEncoder,
    health: Arc<StreamHealth>,
) -> impl futures::Stream<Item = SseFrame> + Send {
    let finished = Arc::new(AtomicBool::new(false));
    let stop_flag = Arc::clone(&finished);

    futures::stream::iter(buffered.into_iter().map(Ok))
        .chain(rest)
        .take_while(move |_| {
            let stopped = stop_flag.load(Ordering::Acquire);
            futures::future::ready(!stopped)
        })
        .flat_map(move |item| {
            let frames = match item {
                Ok(event) => {
                    if let NormalizedStreamEvent::Error {
                        error_type,
                        message,
                    } = &event
                    {
                        health.record(Error::StreamError {
                            error_type: error_type.clone(),
                            message: message.clone(),
                        });
                    }
                    encoder.encode(event)
                }
                Err(e) => {
                    let kind = e.kind();
                    let message = e.to_string();
                    health.record(e);
                    if encoder.is_finished() {
                        Vec::new()
                    } else {
                        encoder.encode_failure(kind.wire_name(), &message)
                    }
                }
            };
            if encoder.is_finished() {
                finished.store(true, Ordering::Release);
            }
            futures::stream::iter(frames)
        })
}

/// Record the health outcome of an owned stream once its broadcaster ends.
/// The connection permit rides along so the per-provider bound covers the
/// whole stream lifetime.
fn spawn_stream_health_watch(
    state: Arc<AppState>,
    provider_name: String,
    broadcaster: Arc<Broadcaster>,
    health: Arc<StreamHealth>,
    settings: Settings,
    permit: tokio::sync::OwnedSemaphorePermit,
) {
    tokio::spawn(async move {
        let terminal = broadcaster.wait_terminal().await;
        drop(permit);
        let error = match terminal {
            Terminal::IdleTimeout => Some(Error::Timeout(settings.streaming_idle_timeout)),
            Terminal::TotalTimeout => Some(Error::Timeout(settings.streaming_total_timeout)),
            Terminal::Completed | Terminal::Cancelled => health.take(),
        };

        match error {
            Some(err) => {
                let class = classify_error(&err, &settings);
                let marked = state.health.record_failure(
                    &provider_name,
                    &class,
                    settings.unhealthy_threshold,
                );
                warn!(
                    provider = %provider_name,
                    reason = %class.reason(),
                    marked_unhealthy = marked,
                    "stream ended with an error"
                );
            }
            None => {
                state.health.record_success(&provider_name);
                state.sticky.record(&provider_name);
                debug!(provider = %provider_name, "stream completed");
            }
        }
    });
}
