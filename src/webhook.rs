use std::collections::HashMap;
use std::io::{self, Read};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use serde::Deserialize;
use serde_json::{Value, json};
use tiny_http::{Header, Response, Server};
use url::form_urlencoded;

use crate::error::Error;
use crate::{
    AppContext, NotificationEvent, NotificationItem, NotificationKind, ResourceIds,
    extract_resource_ids, now_rfc3339, parse_batch, project_channel_message,
    project_chat_message, project_email,
};

pub(crate) const VALIDATION_TOKEN_PARAM: &str = "validationToken";

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct HttpReply {
    pub(crate) status: u16,
    pub(crate) content_type: &'static str,
    pub(crate) body: String,
}

impl HttpReply {
    pub(crate) fn json(status: u16, value: Value) -> Self {
        Self {
            status,
            content_type: "application/json",
            body: value.to_string(),
        }
    }

    pub(crate) fn text(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            content_type: "text/plain; charset=utf-8",
            body: body.into(),
        }
    }

    fn error(err: &Error) -> Self {
        let mut payload = json!({ "error": err.to_string() });
        if let Some(detail) = err.detail() {
            payload["detail"] = json!(detail);
        }
        Self::json(err.http_status(), payload)
    }

    fn not_found(path: &str) -> Self {
        Self::json(404, json!({ "error": format!("no route for {path}") }))
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BatchSummary {
    pub(crate) processed: usize,
    pub(crate) forwarded: usize,
    pub(crate) rejected: usize,
    pub(crate) failed: usize,
}

#[derive(Debug, Deserialize)]
struct CreateSubscriptionRequest {
    resource: String,
    #[serde(default = "default_change_type")]
    change_type: String,
    webhook_path: String,
    #[serde(default)]
    expiration_hours: Option<i64>,
}

fn default_change_type() -> String {
    "created,updated".to_string()
}

#[derive(Debug, Default, Deserialize)]
struct SetupEmailRequest {
    #[serde(default)]
    user_id: Option<String>,
}

fn split_url(url: &str) -> (&str, HashMap<String, String>) {
    let (path, query) = match url.split_once('?') {
        Some((path, query)) => (path, query),
        None => (url, ""),
    };
    let params = form_urlencoded::parse(query.as_bytes()).into_owned().collect();
    (path, params)
}

fn webhook_kind(ctx: &AppContext, path: &str) -> Option<NotificationKind> {
    let hooks = &ctx.settings.webhook;
    if path == hooks.email_path {
        Some(NotificationKind::Email)
    } else if path == hooks.teams_chat_path {
        Some(NotificationKind::TeamsChat)
    } else if path == hooks.teams_channel_path {
        Some(NotificationKind::TeamsChannel)
    } else {
        None
    }
}

/// Route one request. Validation handshakes are answered before the body
/// is looked at.
pub(crate) fn handle_request(ctx: &AppContext, method: &str, url: &str, body: &str) -> HttpReply {
    let (path, params) = split_url(url);
    let path = if path.len() > 1 { path.trim_end_matches('/') } else { path };

    if let Some(kind) = webhook_kind(ctx, path) {
        if let Some(token) = params.get(VALIDATION_TOKEN_PARAM) {
            tracing::info!(kind = kind.as_str(), "answered subscription validation");
            return HttpReply::text(200, token.clone());
        }
        if method != "POST" {
            return HttpReply::json(400, json!({ "error": "missing validationToken" }));
        }
        return match handle_notification_batch(ctx, kind, body) {
            Ok(summary) => HttpReply::json(
                202,
                json!({
                    "status": "success",
                    "processed": summary.processed,
                    "forwarded": summary.forwarded,
                    "rejected": summary.rejected,
                    "failed": summary.failed,
                }),
            ),
            Err(err) => {
                tracing::warn!(kind = kind.as_str(), error = %err, "unusable notification body");
                HttpReply::json(400, json!({ "error": err.to_string() }))
            }
        };
    }

    let segments: Vec<&str> = path.trim_start_matches('/').split('/').collect();
    let result = match (method, segments.as_slice()) {
        ("GET", ["health"]) => Ok(json!({ "status": "healthy", "timestamp": now_rfc3339() })),
        ("POST", ["subscriptions", "create"]) => create_subscription(ctx, body),
        ("GET", ["subscriptions", "list"]) => list_subscriptions(ctx),
        ("POST", ["subscriptions", "setup-email"]) => setup_email(ctx, body),
        ("POST", ["subscriptions", "setup-teams"]) => setup_teams(ctx),
        ("POST", ["subscriptions", id, "renew"]) => renew_subscription(ctx, id, &params),
        ("DELETE", ["subscriptions", id]) => delete_subscription(ctx, id),
        ("GET", ["users", id, "teams"]) => ctx
            .graph
            .list_user_teams(&decode_segment(id))
            .map(|teams| json!({ "success": true, "teams": teams })),
        ("GET", ["teams", id, "channels"]) => ctx
            .graph
            .list_team_channels(&decode_segment(id))
            .map(|channels| json!({ "success": true, "channels": channels })),
        _ => return HttpReply::not_found(path),
    };
    match result {
        Ok(value) => HttpReply::json(200, value),
        Err(err) => {
            tracing::warn!(method, path, error = %err, "request failed");
            HttpReply::error(&err)
        }
    }
}

fn decode_segment(segment: &str) -> String {
    urlencoding::decode(segment)
        .map(|s| s.into_owned())
        .unwrap_or_else(|_| segment.to_string())
}

/// Process every item of a notification batch. Only an unusable body is an
/// error; item failures are logged and counted.
pub(crate) fn handle_notification_batch(
    ctx: &AppContext,
    kind: NotificationKind,
    body: &str,
) -> Result<BatchSummary, Error> {
    let entries = parse_batch(body).map_err(Error::Validation)?;
    let mut summary = BatchSummary::default();

    for entry in entries {
        summary.processed += 1;
        let item = match entry {
            Ok(item) => item,
            Err(reason) => {
                tracing::warn!(kind = kind.as_str(), %reason, "rejected notification");
                summary.rejected += 1;
                continue;
            }
        };
        if !item.client_state_matches(&ctx.settings.webhook.client_state) {
            tracing::warn!(
                kind = kind.as_str(),
                subscription_id = %item.subscription_id,
                "rejected notification with mismatched clientState"
            );
            summary.rejected += 1;
            continue;
        }

        let event = build_event(ctx, kind, &item);
        match ctx.forwarder.forward(&event) {
            Ok(_) => summary.forwarded += 1,
            Err(err) => {
                tracing::error!(
                    kind = kind.as_str(),
                    subscription_id = %item.subscription_id,
                    resource = %item.resource,
                    error = %err,
                    "failed to forward notification"
                );
                summary.failed += 1;
            }
        }
    }

    tracing::info!(
        kind = kind.as_str(),
        processed = summary.processed,
        forwarded = summary.forwarded,
        rejected = summary.rejected,
        failed = summary.failed,
        "notification batch handled"
    );
    Ok(summary)
}

fn build_event(ctx: &AppContext, kind: NotificationKind, item: &NotificationItem) -> NotificationEvent {
    let ids = extract_resource_ids(&item.resource);
    let details = match fetch_details(ctx, kind, &ids) {
        Ok(details) => details,
        Err(err) => {
            tracing::warn!(
                kind = kind.as_str(),
                resource = %item.resource,
                error = %err,
                "detail fetch failed; forwarding without details"
            );
            json!({})
        }
    };
    NotificationEvent::build(kind, item, ids, details, now_rfc3339())
}

fn fetch_details(ctx: &AppContext, kind: NotificationKind, ids: &ResourceIds) -> Result<Value, Error> {
    let graph = &ctx.graph;
    match kind {
        NotificationKind::Email => match (&ids.user_id, &ids.message_id) {
            (Some(user), Some(message)) => Ok(project_email(&graph.get_email(user, message)?)),
            _ => Ok(json!({})),
        },
        NotificationKind::TeamsChat => match (&ids.chat_id, &ids.message_id) {
            (Some(chat), Some(message)) => {
                Ok(project_chat_message(&graph.get_chat_message(chat, message)?))
            }
            _ => Ok(json!({})),
        },
        NotificationKind::TeamsChannel => match (&ids.team_id, &ids.channel_id, &ids.message_id) {
            (Some(team), Some(channel), Some(message)) => Ok(project_channel_message(
                &graph.get_channel_message(team, channel, message)?,
            )),
            _ => Ok(json!({})),
        },
    }
}

// ── Subscription control ────────────────────────────────────────────────

fn create_subscription(ctx: &AppContext, body: &str) -> Result<Value, Error> {
    let request: CreateSubscriptionRequest = serde_json::from_str(body)
        .map_err(|e| Error::Validation(format!("invalid create request: {e}")))?;
    let record = ctx.subscriptions.create(
        &request.resource,
        &request.change_type,
        &request.webhook_path,
        request.expiration_hours,
    )?;
    Ok(json!({ "success": true, "subscription": record }))
}

fn list_subscriptions(ctx: &AppContext) -> Result<Value, Error> {
    let listing = ctx.subscriptions.list()?;
    Ok(json!({
        "success": true,
        "subscriptions": listing.subscriptions,
        "stale": listing.stale,
        "local_subscriptions": ctx.subscriptions.local_records(),
    }))
}

fn renew_subscription(
    ctx: &AppContext,
    id: &str,
    params: &HashMap<String, String>,
) -> Result<Value, Error> {
    let hours = match params.get("expiration_hours") {
        Some(raw) => Some(raw.trim().parse::<i64>().map_err(|_| {
            Error::Validation(format!("expiration_hours must be an integer, got {raw}"))
        })?),
        None => None,
    };
    let record = ctx.subscriptions.renew(&decode_segment(id), hours)?;
    Ok(json!({ "success": true, "subscription": record }))
}

fn delete_subscription(ctx: &AppContext, id: &str) -> Result<Value, Error> {
    let id = decode_segment(id);
    let existed = ctx.subscriptions.delete(&id)?;
    Ok(json!({ "success": true, "deleted": existed, "subscription_id": id }))
}

fn setup_email(ctx: &AppContext, body: &str) -> Result<Value, Error> {
    let request: SetupEmailRequest = if body.trim().is_empty() {
        SetupEmailRequest::default()
    } else {
        serde_json::from_str(body)
            .map_err(|e| Error::Validation(format!("invalid setup request: {e}")))?
    };
    let record = ctx.subscriptions.setup_email(request.user_id.as_deref())?;
    Ok(json!({ "success": true, "subscription": record }))
}

fn setup_teams(ctx: &AppContext) -> Result<Value, Error> {
    let outcomes = ctx.subscriptions.setup_teams();
    let success = outcomes.iter().any(|o| o.subscription.is_some());
    Ok(json!({ "success": success, "results": outcomes }))
}

// ── Server ──────────────────────────────────────────────────────────────

fn read_body(request: &mut tiny_http::Request) -> io::Result<String> {
    let mut body = String::new();
    request.as_reader().read_to_string(&mut body)?;
    Ok(body)
}

fn respond(request: tiny_http::Request, reply: HttpReply) {
    let mut response = Response::from_string(reply.body).with_status_code(reply.status);
    if let Ok(header) = Header::from_bytes("Content-Type", reply.content_type) {
        response = response.with_header(header);
    }
    if let Err(err) = request.respond(response) {
        tracing::debug!(error = %err, "client went away before response");
    }
}

/// A panicking handler answers 500 and leaves the worker alive.
fn contain_panic(method: &str, url: &str, handler: impl FnOnce() -> HttpReply) -> HttpReply {
    match std::panic::catch_unwind(std::panic::AssertUnwindSafe(handler)) {
        Ok(reply) => reply,
        Err(_) => {
            tracing::error!(%method, %url, "request handler panicked");
            HttpReply::json(500, json!({ "error": "internal error" }))
        }
    }
}

fn serve_one(ctx: &AppContext, mut request: tiny_http::Request) {
    let method = request.method().as_str().to_ascii_uppercase();
    let url = request.url().to_string();
    let body = match read_body(&mut request) {
        Ok(body) => body,
        Err(err) => {
            respond(
                request,
                HttpReply::json(400, json!({ "error": format!("read body: {err}") })),
            );
            return;
        }
    };
    let reply = contain_panic(&method, &url, || handle_request(ctx, &method, &url, &body));
    tracing::debug!(%method, %url, status = reply.status, "request served");
    respond(request, reply);
}

fn spawn_renewal_worker(ctx: Arc<AppContext>) -> Option<thread::JoinHandle<()>> {
    let interval = ctx.settings.webhook.renew_interval_minutes;
    if interval == 0 {
        return None;
    }
    let margin = chrono::Duration::minutes(ctx.settings.webhook.renew_margin_minutes);
    Some(thread::spawn(move || {
        loop {
            thread::sleep(Duration::from_secs(interval.saturating_mul(60)));
            let results = ctx.subscriptions.renew_due(margin);
            if !results.is_empty() {
                let renewed = results.iter().filter(|(_, r)| r.is_ok()).count();
                tracing::info!(due = results.len(), renewed, "renewal sweep finished");
            }
        }
    }))
}

/// Serve webhooks and the control API on a fixed pool of worker threads.
pub(crate) fn run_webhook_server(ctx: Arc<AppContext>) -> Result<(), Box<dyn std::error::Error>> {
    let hooks = &ctx.settings.webhook;
    let addr = format!("{}:{}", hooks.host, hooks.port);
    let server = Arc::new(
        Server::http(&addr).map_err(|e| io::Error::new(io::ErrorKind::Other, format!("server: {e}")))?,
    );
    tracing::info!(
        %addr,
        email = %hooks.email_path,
        teams_chat = %hooks.teams_chat_path,
        teams_channel = %hooks.teams_channel_path,
        workflow = %ctx.forwarder.url(),
        "webhook server listening"
    );

    let _renewal = spawn_renewal_worker(Arc::clone(&ctx));
    let mut workers = Vec::with_capacity(hooks.workers);
    for _ in 0..hooks.workers {
        let server = Arc::clone(&server);
        let ctx = Arc::clone(&ctx);
        workers.push(thread::spawn(move || {
            for request in server.incoming_requests() {
                serve_one(&ctx, request);
            }
        }));
    }
    for worker in workers {
        if worker.join().is_err() {
            tracing::error!("webhook worker panicked");
        }
    }
    Ok(())
}
