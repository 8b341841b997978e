use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use http::HeaderMap;
use mgate_common::{ErrorKind, RelayStatus, Usage, new_request_id};
use mgate_dialect::canonical::{Aggregator, ChatRequest};
use mgate_dialect::{Dialect, Proto, RequestPayload};
use mgate_protocol::sse::SseParser;
use mgate_storage::{GatewayStore, LogDetailInput, LogRecordInput};
use tracing::{info, warn};

use crate::auth::{AuthContext, TokenAuth};
use crate::capture::Capture;
use crate::channel::Channel;
use crate::config::RelayConfig;
use crate::dispatch::Dispatcher;
use crate::error::RelayError;
use crate::ledger::{Ledger, PreCharge, QuotaAccount, QuotaStore};
use crate::reconcile;
use crate::transport::{
    self, TemplateContext, UpstreamBody, UpstreamClient, UpstreamRequest, UpstreamResponse,
};

/// Policy knobs resolving the source's open questions; defaults preserve its
/// behavior.
#[derive(Debug, Clone)]
pub struct RelayOptions {
    /// Refund the remainder when a streaming client disconnects mid-flight.
    /// Off by default: partial delivery was consumed, so it is billed.
    pub refund_on_disconnect: bool,
}

impl Default for RelayOptions {
    fn default() -> Self {
        Self {
            refund_on_disconnect: false,
        }
    }
}

/// Per-request scratch record assembled once authentication succeeds and
/// threaded through dispatch, metering, and logging.
#[derive(Debug, Clone)]
pub struct RelayInfo {
    pub request_id: String,
    pub dialect: Dialect,
    pub model: String,
    pub is_stream: bool,
    pub auth: AuthContext,
    pub channel_id: Option<i64>,
    pub first_channel_id: Option<i64>,
    pub deadline: Instant,
    pub started: Instant,
    pub first_byte_at: Option<Instant>,
    pub usage: Usage,
    pub tried_channels: HashSet<i64>,
    pub client_ip: Option<String>,
}

/// What the router turns into an HTTP response.
pub enum RelayResponse {
    Json {
        status: u16,
        content_type: &'static str,
        body: Bytes,
    },
    Stream {
        status: u16,
        content_type: &'static str,
        body: tokio::sync::mpsc::Receiver<Bytes>,
    },
}

pub struct InboundRequest {
    pub dialect: Dialect,
    pub headers: HeaderMap,
    pub body: Bytes,
    /// Model from the URL path, for dialects that put it there.
    pub path_model: Option<String>,
    /// Stream flag from the URL, for dialects that put it there.
    pub stream_hint: bool,
    pub client_ip: Option<String>,
}

struct AttemptSuccess {
    resp: UpstreamResponse,
    proto: Proto,
}

pub struct RelayController {
    config: RelayConfig,
    options: RelayOptions,
    auth: Arc<TokenAuth>,
    dispatcher: Dispatcher,
    ledger: Arc<Ledger<Arc<dyn QuotaStore>>>,
    client: Arc<dyn UpstreamClient>,
    store: Option<GatewayStore>,
}

impl RelayController {
    pub fn new(
        config: RelayConfig,
        options: RelayOptions,
        auth: Arc<TokenAuth>,
        dispatcher: Dispatcher,
        ledger: Arc<Ledger<Arc<dyn QuotaStore>>>,
        client: Arc<dyn UpstreamClient>,
        store: Option<GatewayStore>,
    ) -> Self {
        Self {
            config,
            options,
            auth,
            dispatcher,
            ledger,
            client,
            store,
        }
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Models the presented token can actually reach through its groups.
    pub fn list_models(&self, headers: &HeaderMap) -> Result<Vec<String>, RelayError> {
        let auth = self.auth.authenticate(headers)?;
        let mut models = self
            .dispatcher
            .registry()
            .visible_models(&auth.groups);
        if let Some(allowed) = &auth.allowed_models {
            models.retain(|model| allowed.contains(model));
        }
        Ok(models)
    }

    /// Synthetic probe used by admin tooling: one tiny non-streamed chat
    /// completion through a specific channel, outside quota accounting.
    /// Client-header placeholders in overrides resolve to empty here.
    pub async fn test_channel(
        &self,
        channel_id: i64,
        model: Option<&str>,
    ) -> Result<Duration, RelayError> {
        let channel = self
            .dispatcher
            .registry()
            .get(channel_id)
            .ok_or_else(|| RelayError::invalid_request("unknown channel"))?;
        let model = model
            .map(|model| model.to_string())
            .or_else(|| channel.visible_models().next().map(|m| m.to_string()))
            .ok_or_else(|| RelayError::invalid_request("channel serves no models"))?;

        let chat = ChatRequest {
            model,
            stream: false,
            messages: vec![mgate_dialect::canonical::InboundMessage::text("user", "hi")],
            max_output_tokens: Some(1),
            ..ChatRequest::default()
        };
        let started = Instant::now();
        let deadline = started + self.config.relay_timeout;
        let request_id = new_request_id();
        attempt_chat(&self.client, &channel, &chat, None, &request_id, deadline).await?;
        Ok(started.elapsed())
    }

    /// Entry point for opaque (multipart) bodies: the model rides in a form
    /// field instead of a JSON body, everything else follows the normal
    /// passthrough path.
    pub async fn handle_opaque(&self, inbound: InboundRequest) -> RelayResponse {
        let content_type = inbound
            .headers
            .get(http::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("application/octet-stream")
            .to_string();
        let Some(model) = extract_multipart_field(&inbound.body, "model") else {
            let err = RelayError::invalid_request("missing model field in multipart body");
            return error_response(&err, inbound.dialect);
        };
        let payload = RequestPayload::Opaque {
            dialect: inbound.dialect,
            model,
            content_type,
            body: inbound.body.clone(),
        };
        self.handle_inner(inbound, Some(payload)).await
    }

    /// The whole pipeline for one request. Always resolves to a response in
    /// the client's dialect; failures are normalised unless the serving
    /// channel is in pass-through mode.
    pub async fn handle(&self, inbound: InboundRequest) -> RelayResponse {
        self.handle_inner(inbound, None).await
    }

    async fn handle_inner(
        &self,
        inbound: InboundRequest,
        decoded: Option<RequestPayload>,
    ) -> RelayResponse {
        let request_id = new_request_id();
        let started = Instant::now();

        let auth = match self.auth.authenticate(&inbound.headers) {
            Ok(auth) => auth,
            Err(err) => {
                self.log_unroutable(&request_id, &inbound, None, &err, started);
                return error_response(&err, inbound.dialect);
            }
        };

        let payload = match decoded {
            Some(payload) => payload,
            None => match mgate_dialect::decode_request(
                inbound.dialect,
                &inbound.body,
                inbound.path_model.as_deref(),
                inbound.stream_hint,
            ) {
                Ok(payload) => payload,
                Err(err) => {
                    let err = RelayError::invalid_request(err.to_string());
                    self.log_unroutable(&request_id, &inbound, Some(&auth), &err, started);
                    return error_response(&err, inbound.dialect);
                }
            },
        };

        if !auth.may_use_model(payload.model()) {
            let err = RelayError::new(
                ErrorKind::ForbiddenModel,
                format!("model {} is not allowed for this token", payload.model()),
            );
            self.log_unroutable(&request_id, &inbound, Some(&auth), &err, started);
            return error_response(&err, inbound.dialect);
        }

        let info = RelayInfo {
            request_id,
            dialect: inbound.dialect,
            model: payload.model().to_string(),
            is_stream: payload.stream() || inbound.stream_hint,
            auth,
            channel_id: None,
            first_channel_id: None,
            deadline: started + self.config.deadline_for(payload.stream() || inbound.stream_hint),
            started,
            first_byte_at: None,
            usage: Usage::default(),
            tried_channels: HashSet::new(),
            client_ip: inbound.client_ip.clone(),
        };

        info!(
            event = "relay_received",
            request_id = %info.request_id,
            dialect = info.dialect.as_str(),
            model = %info.model,
            is_stream = info.is_stream,
            user_id = info.auth.user_id
        );

        let account = QuotaAccount {
            token_id: info.auth.token_id,
            user_id: info.auth.user_id,
            shared: info.auth.shared_quota,
            unlimited: info.auth.unlimited_quota,
        };
        let prompt_estimate = estimate_prompt_tokens(&payload);
        let max_output_hint = max_output_hint(&payload, self.config.max_output_tokens_default);
        let pre_charge = match self
            .ledger
            .pre_charge(
                &info.request_id,
                account,
                &info.model,
                prompt_estimate,
                max_output_hint,
            )
            .await
        {
            Ok(pre_charge) => pre_charge,
            Err(err) => {
                self.log_failure(&info, &err, Usage::default(), 0);
                return error_response(&err, inbound.dialect);
            }
        };

        match payload {
            RequestPayload::Chat(chat) => {
                self.relay_chat(info, inbound, chat, pre_charge).await
            }
            other => {
                self.relay_passthrough(info, inbound, other, pre_charge)
                    .await
            }
        }
    }

    async fn relay_chat(
        &self,
        mut info: RelayInfo,
        inbound: InboundRequest,
        chat: ChatRequest,
        pre_charge: PreCharge,
    ) -> RelayResponse {
        let client = self.client.clone();
        let deadline = info.deadline;
        let headers = inbound.headers.clone();
        let request_id = info.request_id.clone();
        let model = info.model.clone();

        let dispatched = self
            .dispatcher
            .dispatch(
                &model,
                &info.auth.groups,
                deadline,
                self.store.as_ref(),
                |channel, _attempt| {
                    let chat = chat.clone();
                    let client = client.clone();
                    let headers = headers.clone();
                    let request_id = request_id.clone();
                    async move {
                        attempt_chat(&client, &channel, &chat, Some(&headers), &request_id, deadline)
                            .await
                    }
                },
            )
            .await;

        let outcome = match dispatched {
            Ok(outcome) => outcome,
            Err(err) => {
                if err.kind.refundable() {
                    let _ = self.ledger.refund(&pre_charge).await;
                }
                self.log_failure(&info, &err, Usage::default(), 0);
                return self.render_error(&err, inbound.dialect, None);
            }
        };
        info.channel_id = Some(outcome.channel.id);
        info.first_channel_id = Some(outcome.first_channel_id);

        let success = outcome.value;
        let channel = outcome.channel;
        let mut request_capture = Capture::new();
        request_capture.set_body(&inbound.body);

        match success.resp.body {
            UpstreamBody::Bytes(body) => {
                self.finish_buffered(
                    info,
                    chat,
                    channel,
                    success.proto,
                    success.resp.status,
                    body,
                    request_capture,
                    pre_charge,
                )
                .await
            }
            UpstreamBody::Stream(rx) => {
                self.finish_stream(
                    info,
                    chat,
                    channel,
                    success.proto,
                    rx,
                    request_capture,
                    pre_charge,
                )
                .await
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn finish_buffered(
        &self,
        mut info: RelayInfo,
        chat: ChatRequest,
        channel: Arc<Channel>,
        proto: Proto,
        status: u16,
        body: Bytes,
        request_capture: Capture,
        pre_charge: PreCharge,
    ) -> RelayResponse {
        let canonical = match mgate_dialect::parse_buffered_response(proto, &body) {
            Ok(canonical) => canonical,
            Err(err) => {
                let err = RelayError::new(
                    ErrorKind::ChannelRetryable,
                    format!("upstream response decode failed: {err}"),
                )
                .with_upstream(status, body);
                let _ = self.ledger.refund(&pre_charge).await;
                self.log_failure(&info, &err, Usage::default(), 0);
                return self.render_error(&err, info.dialect, Some(&channel));
            }
        };

        let mut response_capture = Capture::new();
        response_capture.set_body(&body);
        info.first_byte_at = Some(Instant::now());

        let computed = compute_usage_blocking(&chat, canonical.countable_output()).await;
        let (usage, _authority) = reconcile::reconcile(canonical.usage, computed);
        info.usage = usage;
        let debited = self
            .ledger
            .settle(&pre_charge, &info.model, &usage)
            .await
            .unwrap_or(0);

        // Same wire protocol on both sides: hand back the upstream bytes
        // verbatim. Cross-dialect: re-emit the canonical response.
        let inbound_proto = chat_proto_for_dialect(info.dialect);
        let client_body = if inbound_proto == Some(proto) {
            body
        } else {
            match mgate_dialect::emit_buffered_response(
                info.dialect,
                &canonical,
                &info.model,
                now_unix(),
            ) {
                Ok(body) => Bytes::from(body),
                Err(err) => {
                    let err = RelayError::internal(format!("client emission failed: {err}"));
                    self.log_failure(&info, &err, usage, debited);
                    return self.render_error(&err, info.dialect, Some(&channel));
                }
            }
        };

        self.log_success(&info, RelayStatus::Ok, debited, request_capture, response_capture);
        RelayResponse::Json {
            status: 200,
            content_type: "application/json",
            body: client_body,
        }
    }

    async fn finish_stream(
        &self,
        mut info: RelayInfo,
        chat: ChatRequest,
        channel: Arc<Channel>,
        proto: Proto,
        mut rx_upstream: tokio::sync::mpsc::Receiver<Bytes>,
        request_capture: Capture,
        pre_charge: PreCharge,
    ) -> RelayResponse {
        let (tx_out, rx_out) = tokio::sync::mpsc::channel::<Bytes>(self.config.stream_buffer_events);

        let ledger = self.ledger.clone();
        let store = self.store.clone();
        let options = self.options.clone();
        let model = info.model.clone();
        let dialect = info.dialect;
        let deadline = info.deadline;
        let passthrough_raw = chat_proto_for_dialect(dialect) == Some(proto);
        let mut emitter = match mgate_dialect::emitter_for(dialect, &model, now_unix()) {
            Ok(emitter) => emitter,
            Err(err) => {
                let err = RelayError::internal(format!("no emitter: {err}"));
                let _ = self.ledger.refund(&pre_charge).await;
                self.log_failure(&info, &err, Usage::default(), 0);
                return self.render_error(&err, dialect, Some(&channel));
            }
        };

        tokio::spawn(async move {
            let mut sse = SseParser::new();
            let mut parser = mgate_dialect::stream_parser_for(proto);
            let mut aggregator = Aggregator::new();
            let mut response_capture = Capture::new();
            let mut delivered_any = false;
            let mut client_gone = false;
            let mut upstream_failed = false;
            let mut first_byte_at: Option<Instant> = None;

            'pump: loop {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    break;
                }
                let chunk = match tokio::time::timeout(remaining, rx_upstream.recv()).await {
                    Ok(Some(chunk)) => chunk,
                    // Upstream ended (normally or not) or the deadline hit;
                    // either way settle for what was delivered.
                    Ok(None) | Err(_) => break,
                };

                for frame in sse.push_bytes(&chunk) {
                    response_capture.push_chunk(&frame.data);
                    let deltas = match parser.push_frame(&frame) {
                        Ok(deltas) => deltas,
                        Err(err) => {
                            warn!(event = "stream_decode_error", error = %err);
                            upstream_failed = true;
                            break 'pump;
                        }
                    };
                    for delta in deltas {
                        aggregator.push(&delta);
                        let out_frames = if passthrough_raw {
                            Vec::new()
                        } else {
                            emitter.emit(&delta)
                        };
                        for out in out_frames {
                            if first_byte_at.is_none() {
                                first_byte_at = Some(Instant::now());
                            }
                            if tx_out.send(out.encode()).await.is_err() {
                                client_gone = true;
                                break 'pump;
                            }
                            delivered_any = true;
                        }
                    }
                }

                if passthrough_raw {
                    if first_byte_at.is_none() {
                        first_byte_at = Some(Instant::now());
                    }
                    if tx_out.send(chunk).await.is_err() {
                        client_gone = true;
                        break 'pump;
                    }
                    delivered_any = true;
                }
            }

            // Flush anything the parser still buffers.
            if !client_gone {
                for frame in sse.finish() {
                    response_capture.push_chunk(&frame.data);
                    if let Ok(deltas) = parser.push_frame(&frame) {
                        for delta in deltas {
                            aggregator.push(&delta);
                        }
                    }
                }
                if !passthrough_raw && !aggregator.saw_done() {
                    for out in emitter.tail() {
                        let _ = tx_out.send(out.encode()).await;
                    }
                }
            }
            drop(tx_out);

            // Settle after the last event, against what was delivered.
            let reported = aggregator.usage();
            let canonical = aggregator.finish();
            let computed = compute_usage_blocking(&chat, canonical.countable_output()).await;
            let (usage, _authority) = reconcile::reconcile(reported, computed);
            info.usage = usage;
            info.first_byte_at = first_byte_at;

            // An aborted client or a broken upstream both leave the client
            // with a partial response; either way what was delivered is
            // billed and the record says so.
            let status = if client_gone || upstream_failed {
                RelayStatus::PartiallyDelivered
            } else {
                RelayStatus::Ok
            };
            let debited = if client_gone && !delivered_any && options.refund_on_disconnect {
                let _ = ledger.refund(&pre_charge).await;
                0
            } else {
                ledger
                    .settle(&pre_charge, &model, &usage)
                    .await
                    .unwrap_or(0)
            };

            write_log(
                store.as_ref(),
                &info,
                status,
                None,
                debited,
                Some((request_capture, response_capture)),
            );
        });

        RelayResponse::Stream {
            status: 200,
            content_type: "text/event-stream",
            body: rx_out,
        }
    }

    async fn relay_passthrough(
        &self,
        mut info: RelayInfo,
        inbound: InboundRequest,
        payload: RequestPayload,
        pre_charge: PreCharge,
    ) -> RelayResponse {
        let client = self.client.clone();
        let deadline = info.deadline;
        let headers = inbound.headers.clone();
        let request_id = info.request_id.clone();
        let model = info.model.clone();
        let payload = Arc::new(payload);

        let dispatched = self
            .dispatcher
            .dispatch(
                &model,
                &info.auth.groups,
                deadline,
                self.store.as_ref(),
                |channel, _attempt| {
                    let payload = payload.clone();
                    let client = client.clone();
                    let headers = headers.clone();
                    let request_id = request_id.clone();
                    async move {
                        attempt_passthrough(
                            &client,
                            &channel,
                            payload.as_ref(),
                            Some(&headers),
                            &request_id,
                            deadline,
                        )
                        .await
                    }
                },
            )
            .await;

        let outcome = match dispatched {
            Ok(outcome) => outcome,
            Err(err) => {
                if err.kind.refundable() {
                    let _ = self.ledger.refund(&pre_charge).await;
                }
                self.log_failure(&info, &err, Usage::default(), 0);
                return self.render_error(&err, inbound.dialect, None);
            }
        };
        info.channel_id = Some(outcome.channel.id);
        info.first_channel_id = Some(outcome.first_channel_id);

        let UpstreamBody::Bytes(body) = outcome.value.resp.body else {
            let err = RelayError::internal("unexpected stream body on passthrough route");
            let _ = self.ledger.refund(&pre_charge).await;
            self.log_failure(&info, &err, Usage::default(), 0);
            return self.render_error(&err, inbound.dialect, Some(&outcome.channel));
        };
        info.first_byte_at = Some(Instant::now());

        let mut usage =
            mgate_dialect::passthrough_usage(info.dialect, &body).unwrap_or_default();
        // Image generations that report no usage still meter per image.
        if usage.is_empty()
            && info.dialect == Dialect::OpenAiImages
            && let RequestPayload::Passthrough { body, .. } = payload.as_ref()
        {
            usage.image_tokens = mgate_dialect::misc::image_count(body);
        }
        let usage = usage.with_totals();
        info.usage = usage;
        let debited = self
            .ledger
            .settle(&pre_charge, &info.model, &usage)
            .await
            .unwrap_or(0);

        let mut request_capture = Capture::new();
        request_capture.set_body(&inbound.body);
        let mut response_capture = Capture::new();
        response_capture.set_body(&body);
        self.log_success(&info, RelayStatus::Ok, debited, request_capture, response_capture);

        RelayResponse::Json {
            status: 200,
            content_type: "application/json",
            body,
        }
    }

    fn render_error(
        &self,
        err: &RelayError,
        dialect: Dialect,
        channel: Option<&Channel>,
    ) -> RelayResponse {
        // Pass-through mode forwards the upstream's raw error body; every
        // other channel gets the normalised message.
        if let Some(channel) = channel
            && channel.pass_through_errors
            && let Some(body) = &err.upstream_body
        {
            return RelayResponse::Json {
                status: err.upstream_status.unwrap_or(502),
                content_type: "application/json",
                body: body.clone(),
            };
        }
        error_response(err, dialect)
    }

    fn log_success(
        &self,
        info: &RelayInfo,
        status: RelayStatus,
        debited: i64,
        request_capture: Capture,
        response_capture: Capture,
    ) {
        info!(
            event = "relay_completed",
            request_id = %info.request_id,
            model = %info.model,
            channel_id = info.channel_id,
            status = status.as_str(),
            total_tokens = info.usage.total_tokens,
            debited,
            elapsed_ms = info.started.elapsed().as_millis()
        );
        write_log(
            self.store.as_ref(),
            info,
            status,
            None,
            debited,
            Some((request_capture, response_capture)),
        );
    }

    fn log_failure(&self, info: &RelayInfo, err: &RelayError, usage: Usage, debited: i64) {
        warn!(
            event = "relay_failed",
            request_id = %info.request_id,
            model = %info.model,
            kind = err.kind.as_str(),
            error = %err.message,
            elapsed_ms = info.started.elapsed().as_millis()
        );
        let mut info_for_log = info.clone();
        info_for_log.usage = usage;
        write_log(
            self.store.as_ref(),
            &info_for_log,
            RelayStatus::Failed,
            Some(err),
            debited,
            None,
        );
    }

    fn log_unroutable(
        &self,
        request_id: &str,
        inbound: &InboundRequest,
        auth: Option<&AuthContext>,
        err: &RelayError,
        started: Instant,
    ) {
        warn!(
            event = "relay_rejected",
            request_id,
            dialect = inbound.dialect.as_str(),
            kind = err.kind.as_str(),
            error = %err.message
        );
        let Some(store) = self.store.as_ref() else {
            return;
        };
        let record = LogRecordInput {
            request_id: request_id.to_string(),
            user_id: auth.map(|auth| auth.user_id),
            token_id: auth.map(|auth| auth.token_id),
            channel_id: None,
            first_channel_id: None,
            dialect: inbound.dialect.as_str().to_string(),
            model: String::new(),
            is_stream: false,
            status: RelayStatus::Failed.as_str().to_string(),
            error_kind: Some(err.kind.as_str().to_string()),
            usage: Usage::default(),
            quota_debited: 0,
            latency_ms: started.elapsed().as_millis() as i64,
            frt_ms: None,
            client_ip: inbound.client_ip.clone(),
        };
        let store = store.clone();
        tokio::spawn(async move {
            let _ = store.insert_log(record, None).await;
        });
    }
}

/// Log writes never block the request path; inserts are spawned and
/// best-effort.
fn write_log(
    store: Option<&GatewayStore>,
    info: &RelayInfo,
    status: RelayStatus,
    err: Option<&RelayError>,
    debited: i64,
    captures: Option<(Capture, Capture)>,
) {
    let Some(store) = store else {
        return;
    };
    let record = LogRecordInput {
        request_id: info.request_id.clone(),
        user_id: Some(info.auth.user_id),
        token_id: Some(info.auth.token_id),
        channel_id: info.channel_id,
        first_channel_id: info.first_channel_id,
        dialect: info.dialect.as_str().to_string(),
        model: info.model.clone(),
        is_stream: info.is_stream,
        status: status.as_str().to_string(),
        error_kind: err.map(|err| err.kind.as_str().to_string()),
        usage: info.usage,
        quota_debited: debited,
        latency_ms: info.started.elapsed().as_millis() as i64,
        frt_ms: info
            .first_byte_at
            .map(|at| at.duration_since(info.started).as_millis() as i64),
        client_ip: info.client_ip.clone(),
    };
    let detail = captures.map(|(request, response)| LogDetailInput {
        request_preview: request.preview(),
        request_full: request.full(),
        response_preview: response.preview(),
        response_full: response.full(),
    });
    let store = store.clone();
    tokio::spawn(async move {
        let _ = store.insert_log(record, detail).await;
    });
}

async fn attempt_chat(
    client: &Arc<dyn UpstreamClient>,
    channel: &Arc<Channel>,
    chat: &ChatRequest,
    inbound_headers: Option<&HeaderMap>,
    request_id: &str,
    deadline: Instant,
) -> Result<AttemptSuccess, RelayError> {
    let proto = channel.family.chat_proto();
    let upstream_model = channel.upstream_model(&chat.model).to_string();
    let plan = mgate_dialect::build_upstream_payload(proto, chat, &upstream_model)
        .map_err(|err| RelayError::invalid_request(err.to_string()))?;

    let url = transport::compose_chat_url(channel, plan.path, &upstream_model, plan.is_stream);
    let headers = attempt_headers(channel, inbound_headers, request_id)?;
    let body = Bytes::from(plan.body);

    let req = UpstreamRequest {
        method: wreq::Method::POST,
        url,
        headers,
        body: Some(body.clone()),
        is_stream: plan.is_stream,
        timeout: deadline.saturating_duration_since(Instant::now()).max(Duration::from_secs(1)),
    };
    let resp = client.send(req).await?;
    if !resp.is_success() {
        return Err(classify_upstream_failure(resp).await);
    }
    Ok(AttemptSuccess { resp, proto })
}

async fn attempt_passthrough(
    client: &Arc<dyn UpstreamClient>,
    channel: &Arc<Channel>,
    payload: &RequestPayload,
    inbound_headers: Option<&HeaderMap>,
    request_id: &str,
    deadline: Instant,
) -> Result<AttemptSuccess, RelayError> {
    let upstream_model = channel.upstream_model(payload.model()).to_string();
    let (path, body, content_type) = match payload {
        RequestPayload::Passthrough { dialect, body, .. } => {
            let rewritten = mgate_dialect::misc::rewrite_model(body, &upstream_model)
                .map_err(|err| RelayError::invalid_request(err.to_string()))?;
            (
                mgate_dialect::misc::upstream_path(*dialect),
                Bytes::from(rewritten),
                "application/json".to_string(),
            )
        }
        RequestPayload::Opaque {
            dialect,
            content_type,
            body,
            ..
        } => (
            mgate_dialect::misc::upstream_path(*dialect),
            body.clone(),
            content_type.clone(),
        ),
        RequestPayload::Chat(_) => {
            return Err(RelayError::internal("chat payload on passthrough route"));
        }
    };

    let url = transport::build_url(&channel.base_url, path, channel.family.openai_url_rule());
    let mut headers = attempt_headers(channel, inbound_headers, request_id)?;
    transport::header_set(&mut headers, "content-type", content_type);

    let req = UpstreamRequest {
        method: wreq::Method::POST,
        url,
        headers,
        body: Some(body.clone()),
        is_stream: false,
        timeout: deadline.saturating_duration_since(Instant::now()).max(Duration::from_secs(1)),
    };
    let resp = client.send(req).await?;
    if !resp.is_success() {
        return Err(classify_upstream_failure(resp).await);
    }
    Ok(AttemptSuccess {
        resp,
        proto: Proto::OpenAiChat,
    })
}

/// Outbound header assembly: inbound headers pass through the hygiene
/// filter, then the channel's credentials and overrides are layered on top.
/// `inbound_headers` is None for synthetic channel-test requests, where
/// client-header placeholders resolve to empty.
fn attempt_headers(
    channel: &Channel,
    inbound_headers: Option<&HeaderMap>,
    request_id: &str,
) -> Result<transport::Headers, RelayError> {
    let mut headers = inbound_headers
        .map(transport::filter_inbound_headers)
        .unwrap_or_default();
    transport::header_set(&mut headers, "content-type", "application/json");
    transport::header_set(&mut headers, "x-request-id", request_id);
    let key = channel.pick_key().to_string();
    for (name, value) in transport::auth_headers(channel.family, &key) {
        transport::header_set(&mut headers, name, value);
    }
    let ctx = TemplateContext {
        client_headers: inbound_headers,
        channel_key: &key,
        request_id,
    };
    for (name, template) in &channel.header_override {
        transport::validate_template(template)
            .map_err(|err| RelayError::internal(format!("bad header override: {err}")))?;
        transport::header_set(&mut headers, name.clone(), transport::resolve_template(template, &ctx));
    }
    Ok(headers)
}

/// Map an upstream HTTP failure onto the retry taxonomy.
async fn classify_upstream_failure(resp: UpstreamResponse) -> RelayError {
    let status = resp.status;
    let body = match resp.body {
        UpstreamBody::Bytes(body) => body,
        UpstreamBody::Stream(mut rx) => {
            let mut buffer = Vec::new();
            while let Some(chunk) = rx.recv().await {
                buffer.extend_from_slice(&chunk);
                if buffer.len() > 64 * 1024 {
                    break;
                }
            }
            Bytes::from(buffer)
        }
    };
    let text = String::from_utf8_lossy(&body).to_ascii_lowercase();

    let kind = match status {
        401 | 403 => ErrorKind::ChannelFatal,
        404 => ErrorKind::ChannelFatal,
        429 => {
            if text.contains("insufficient_quota") || text.contains("exceeded your current quota")
            {
                ErrorKind::ChannelFatal
            } else {
                ErrorKind::ChannelRetryable
            }
        }
        400 | 413 | 422 => {
            if text.contains("model") && text.contains("not") && text.contains("found") {
                ErrorKind::ChannelFatal
            } else {
                ErrorKind::InvalidRequest
            }
        }
        _ => ErrorKind::ChannelRetryable,
    };
    RelayError::new(kind, format!("upstream returned status {status}"))
        .with_upstream(status, body)
}

fn error_response(err: &RelayError, dialect: Dialect) -> RelayResponse {
    RelayResponse::Json {
        status: err.status().as_u16(),
        content_type: "application/json",
        body: err.to_body(dialect),
    }
}

fn chat_proto_for_dialect(dialect: Dialect) -> Option<Proto> {
    match dialect {
        Dialect::OpenAiChat => Some(Proto::OpenAiChat),
        Dialect::OpenAiResponses => Some(Proto::OpenAiResponses),
        Dialect::ClaudeMessages => Some(Proto::Claude),
        Dialect::GeminiGenerate => Some(Proto::Gemini),
        _ => None,
    }
}

fn estimate_prompt_tokens(payload: &RequestPayload) -> i64 {
    match payload {
        RequestPayload::Chat(chat) => {
            reconcile::TokenCounter::for_model(&chat.model).count_prompt(chat)
        }
        RequestPayload::Passthrough { body, .. } => {
            let n = body.to_string().chars().count() as i64;
            (n + 3) / 4
        }
        // Binary uploads carry no tokenisable prompt; hold a flat estimate
        // and let settlement correct it from reported usage.
        RequestPayload::Opaque { .. } => 500,
    }
}

fn max_output_hint(payload: &RequestPayload, default: i64) -> i64 {
    match payload {
        RequestPayload::Chat(chat) => chat.max_output_tokens.unwrap_or(default),
        // Non-generative payloads have no completion side.
        RequestPayload::Passthrough { .. } | RequestPayload::Opaque { .. } => 0,
    }
}

/// Tokenisation walks the whole prompt; keep it off the async workers.
async fn compute_usage_blocking(chat: &ChatRequest, countable_output: String) -> Option<Usage> {
    let chat = chat.clone();
    tokio::task::spawn_blocking(move || reconcile::compute_usage(&chat, &countable_output))
        .await
        .ok()
}

fn now_unix() -> i64 {
    time::OffsetDateTime::now_utc().unix_timestamp()
}

/// Minimal multipart scan for one text field. Audio uploads put the model in
/// a `model` form part; the body itself stays opaque and is forwarded as-is,
/// so full multipart parsing is unnecessary.
fn extract_multipart_field(body: &[u8], field: &str) -> Option<String> {
    let text = String::from_utf8_lossy(body);
    let marker = format!("name=\"{field}\"");
    let start = text.find(&marker)?;
    let rest = &text[start + marker.len()..];
    // The value follows the blank line after the part headers.
    let value_start = rest.find("\r\n\r\n").map(|pos| pos + 4).or_else(|| {
        rest.find("\n\n").map(|pos| pos + 2)
    })?;
    let value = &rest[value_start..];
    let value_end = value.find("\r\n").or_else(|| value.find('\n'))?;
    let value = value[..value_end].trim();
    (!value.is_empty()).then(|| value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multipart_model_field_extraction() {
        let body = b"--boundary\r\nContent-Disposition: form-data; name=\"model\"\r\n\r\nwhisper-1\r\n--boundary\r\nContent-Disposition: form-data; name=\"file\"; filename=\"a.mp3\"\r\n\r\n\xff\xfb\x90\r\n--boundary--\r\n";
        assert_eq!(
            extract_multipart_field(body, "model").as_deref(),
            Some("whisper-1")
        );
        assert!(extract_multipart_field(body, "missing").is_none());
    }

    #[test]
    fn chat_proto_mapping_matches_dialects() {
        assert_eq!(
            chat_proto_for_dialect(Dialect::OpenAiChat),
            Some(Proto::OpenAiChat)
        );
        assert_eq!(
            chat_proto_for_dialect(Dialect::ClaudeMessages),
            Some(Proto::Claude)
        );
        assert_eq!(chat_proto_for_dialect(Dialect::OpenAiEmbeddings), None);
    }

    #[test]
    fn output_hint_prefers_client_cap() {
        let chat = ChatRequest {
            model: "m".to_string(),
            max_output_tokens: Some(64),
            ..ChatRequest::default()
        };
        assert_eq!(max_output_hint(&RequestPayload::Chat(chat), 4096), 64);
        let uncapped = ChatRequest {
            model: "m".to_string(),
            ..ChatRequest::default()
        };
        assert_eq!(max_output_hint(&RequestPayload::Chat(uncapped), 4096), 4096);
    }
}
