use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use serde_json::{Value, json};

use crate::error::{Error, Result};
use crate::{GraphClient, RequestOptions, WebhookSettings, graph_timestamp, parse_graph_timestamp, str_field};

/// Graph's ceiling for mail and chat message subscriptions.
pub(crate) const GRAPH_MAX_EXPIRATION_MINUTES: i64 = 4230;

pub(crate) const INBOX_RESOURCE: &str = "me/mailFolders('Inbox')/messages";
pub(crate) const ALL_CHAT_MESSAGES_RESOURCE: &str = "chats/getAllMessages";
pub(crate) const ALL_CHANNEL_MESSAGES_RESOURCE: &str = "teams/getAllMessages";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum SubscriptionState {
    Active,
    Renewed,
    Expired,
    Deleted,
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct SubscriptionRecord {
    pub(crate) id: String,
    pub(crate) resource: String,
    pub(crate) change_type: String,
    pub(crate) notification_url: String,
    pub(crate) expiration: DateTime<Utc>,
    #[serde(skip_serializing)]
    pub(crate) client_state: Option<String>,
    pub(crate) created_at: DateTime<Utc>,
    pub(crate) renewed_at: Option<DateTime<Utc>>,
    pub(crate) state: SubscriptionState,
}

impl SubscriptionRecord {
    /// Build a record from a Graph subscription resource.
    pub(crate) fn from_graph(value: &Value) -> Option<Self> {
        let id = str_field(value, "id")?.to_string();
        let now = Utc::now();
        let expiration = str_field(value, "expirationDateTime")
            .and_then(parse_graph_timestamp)
            .unwrap_or(now);
        let mut record = Self {
            id,
            resource: str_field(value, "resource").unwrap_or_default().to_string(),
            change_type: str_field(value, "changeType").unwrap_or_default().to_string(),
            notification_url: str_field(value, "notificationUrl")
                .unwrap_or_default()
                .to_string(),
            expiration,
            client_state: str_field(value, "clientState").map(str::to_string),
            created_at: now,
            renewed_at: None,
            state: SubscriptionState::Active,
        };
        record.refresh_state(now);
        Some(record)
    }

    /// Expiry is evaluated on read; nothing polls the provider.
    pub(crate) fn refresh_state(&mut self, now: DateTime<Utc>) {
        if self.state != SubscriptionState::Deleted && now >= self.expiration {
            self.state = SubscriptionState::Expired;
        }
    }

    pub(crate) fn due_for_renewal(&self, now: DateTime<Utc>, margin: Duration) -> bool {
        self.state != SubscriptionState::Deleted && self.expiration - margin <= now
    }
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct SubscriptionListing {
    /// Subscriptions the provider confirmed, merged with local metadata.
    pub(crate) subscriptions: Vec<SubscriptionRecord>,
    /// Local records the provider no longer knows about. Dropped from the map.
    pub(crate) stale: Vec<SubscriptionRecord>,
}

#[derive(Debug, Serialize)]
pub(crate) struct SetupOutcome {
    pub(crate) resource: String,
    pub(crate) subscription: Option<SubscriptionRecord>,
    pub(crate) error: Option<String>,
}

pub(crate) struct SubscriptionManager {
    graph: Arc<GraphClient>,
    webhook: WebhookSettings,
    records: Mutex<HashMap<String, SubscriptionRecord>>,
}

impl SubscriptionManager {
    pub(crate) fn new(graph: Arc<GraphClient>, webhook: WebhookSettings) -> Self {
        Self {
            graph,
            webhook,
            records: Mutex::new(HashMap::new()),
        }
    }

    fn records(&self) -> MutexGuard<'_, HashMap<String, SubscriptionRecord>> {
        // a panic while holding the lock leaves the map usable
        self.records.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn expiration_for(&self, ttl_hours: Option<i64>) -> Result<DateTime<Utc>> {
        let hours = ttl_hours.unwrap_or(self.webhook.expiration_hours);
        if hours <= 0 {
            return Err(Error::Validation(format!(
                "expiration_hours must be positive, got {hours}"
            )));
        }
        let minutes = hours.saturating_mul(60).min(GRAPH_MAX_EXPIRATION_MINUTES);
        Ok(Utc::now() + Duration::minutes(minutes))
    }

    pub(crate) fn create(
        &self,
        resource: &str,
        change_type: &str,
        webhook_path: &str,
        ttl_hours: Option<i64>,
    ) -> Result<SubscriptionRecord> {
        if resource.trim().is_empty() {
            return Err(Error::Validation("resource is required".to_string()));
        }
        let expiration = self.expiration_for(ttl_hours)?;
        let notification_url = self.webhook.notification_url(webhook_path)?;
        let body = json!({
            "changeType": change_type,
            "notificationUrl": notification_url,
            "resource": resource,
            "expirationDateTime": graph_timestamp(expiration),
            "clientState": self.webhook.client_state,
            "latestSupportedTlsVersion": "v1_2",
        });

        let response = self
            .graph
            .send("POST", "subscriptions", &RequestOptions::default().json(body))
            .map_err(|err| match err {
                Error::Provider { status, body } => Error::Subscription(format!(
                    "failed to create subscription for {resource} ({status}): {body}"
                )),
                other => other,
            })?;
        if response.status != 201 {
            return Err(Error::Subscription(format!(
                "failed to create subscription for {resource} ({}): {}",
                response.status, response.body
            )));
        }

        let mut record = SubscriptionRecord::from_graph(&response.body).ok_or_else(|| {
            Error::Subscription(format!("provider response has no id: {}", response.body))
        })?;
        if record.resource.is_empty() {
            record.resource = resource.to_string();
        }
        if record.change_type.is_empty() {
            record.change_type = change_type.to_string();
        }
        if record.notification_url.is_empty() {
            record.notification_url = notification_url;
        }
        record.client_state = Some(self.webhook.client_state.clone());

        tracing::info!(subscription_id = %record.id, resource = %record.resource, expiration = %record.expiration, "subscription created");
        self.records().insert(record.id.clone(), record.clone());
        Ok(record)
    }

    /// Push the expiration out. Only expiration, renewal time and state change
    /// on a known record.
    pub(crate) fn renew(&self, id: &str, ttl_hours: Option<i64>) -> Result<SubscriptionRecord> {
        let expiration = self.expiration_for(ttl_hours)?;
        let body = json!({ "expirationDateTime": graph_timestamp(expiration) });
        let response = match self.graph.request(
            "PATCH",
            &format!("subscriptions/{}", urlencoding::encode(id)),
            &RequestOptions::default().json(body),
        ) {
            Ok(response) => response,
            Err(err) if err.is_not_found() => {
                // lapsed at the provider; it can only be recreated
                if let Some(mut record) = self.records().remove(id) {
                    record.state = SubscriptionState::Expired;
                    tracing::warn!(subscription_id = %id, state = ?record.state, expiration = %record.expiration, "subscription gone at provider; dropping");
                }
                return Err(err);
            }
            Err(err) => return Err(err),
        };
        let confirmed = str_field(&response, "expirationDateTime")
            .and_then(parse_graph_timestamp)
            .unwrap_or(expiration);
        let now = Utc::now();

        let mut records = self.records();
        let record = match records.get_mut(id) {
            Some(record) => {
                record.expiration = confirmed;
                record.renewed_at = Some(now);
                record.state = SubscriptionState::Renewed;
                record.clone()
            }
            None => {
                let mut adopted = SubscriptionRecord::from_graph(&response).unwrap_or(SubscriptionRecord {
                    id: id.to_string(),
                    resource: String::new(),
                    change_type: String::new(),
                    notification_url: String::new(),
                    expiration: confirmed,
                    client_state: None,
                    created_at: now,
                    renewed_at: None,
                    state: SubscriptionState::Active,
                });
                adopted.id = id.to_string();
                adopted.expiration = confirmed;
                adopted.renewed_at = Some(now);
                adopted.state = SubscriptionState::Renewed;
                records.insert(id.to_string(), adopted.clone());
                adopted
            }
        };
        tracing::info!(subscription_id = %id, expiration = %record.expiration, "subscription renewed");
        Ok(record)
    }

    /// Idempotent. Returns whether anything existed to delete.
    pub(crate) fn delete(&self, id: &str) -> Result<bool> {
        let provider_had_it = match self.graph.send(
            "DELETE",
            &format!("subscriptions/{}", urlencoding::encode(id)),
            &RequestOptions::default(),
        ) {
            Ok(_) => true,
            Err(err) if err.is_not_found() => {
                tracing::debug!(subscription_id = %id, "subscription already gone at provider");
                false
            }
            Err(err) => return Err(err),
        };
        let local_had_it = self.records().remove(id).is_some();
        if provider_had_it || local_had_it {
            tracing::info!(subscription_id = %id, "subscription deleted");
        }
        Ok(provider_had_it || local_had_it)
    }

    /// Provider list is authoritative; local-only records are reported stale
    /// and dropped.
    pub(crate) fn list(&self) -> Result<SubscriptionListing> {
        let mut remote = Vec::new();
        let mut next = Some("subscriptions".to_string());
        while let Some(path) = next.take() {
            let page = self.graph.get(&path)?;
            remote.extend(crate::collection_values(&page));
            next = str_field(&page, "@odata.nextLink").map(str::to_string);
        }

        let now = Utc::now();
        let mut records = self.records();
        let mut confirmed = Vec::with_capacity(remote.len());
        let mut seen = std::collections::HashSet::new();
        for value in &remote {
            let Some(mut fresh) = SubscriptionRecord::from_graph(value) else {
                continue;
            };
            seen.insert(fresh.id.clone());
            if let Some(local) = records.get_mut(&fresh.id) {
                local.expiration = fresh.expiration;
                if !fresh.resource.is_empty() {
                    local.resource = fresh.resource.clone();
                }
                if local.state == SubscriptionState::Expired && now < local.expiration {
                    local.state = SubscriptionState::Active;
                }
                local.refresh_state(now);
                confirmed.push(local.clone());
            } else {
                fresh.refresh_state(now);
                confirmed.push(fresh);
            }
        }

        let stale_ids: Vec<String> = records
            .keys()
            .filter(|id| !seen.contains(*id))
            .cloned()
            .collect();
        let mut stale = Vec::with_capacity(stale_ids.len());
        for id in stale_ids {
            if let Some(mut record) = records.remove(&id) {
                record.refresh_state(now);
                tracing::warn!(subscription_id = %id, "local subscription not confirmed by provider; dropping");
                stale.push(record);
            }
        }

        Ok(SubscriptionListing {
            subscriptions: confirmed,
            stale,
        })
    }

    pub(crate) fn local_records(&self) -> Vec<SubscriptionRecord> {
        let now = Utc::now();
        let mut out: Vec<SubscriptionRecord> = self
            .records()
            .values()
            .cloned()
            .map(|mut r| {
                r.refresh_state(now);
                r
            })
            .collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        out
    }

    pub(crate) fn get(&self, id: &str) -> Option<SubscriptionRecord> {
        self.records().get(id).cloned()
    }

    pub(crate) fn due_for_renewal(&self, margin: Duration) -> Vec<String> {
        let now = Utc::now();
        self.records()
            .values()
            .filter(|r| r.due_for_renewal(now, margin))
            .map(|r| r.id.clone())
            .collect()
    }

    /// Renew everything expiring within `margin`. Failures are logged and
    /// returned; they do not stop the sweep.
    pub(crate) fn renew_due(&self, margin: Duration) -> Vec<(String, Result<SubscriptionRecord>)> {
        self.due_for_renewal(margin)
            .into_iter()
            .map(|id| {
                let result = self.renew(&id, None);
                if let Err(err) = &result {
                    tracing::warn!(subscription_id = %id, error = %err, "scheduled renewal failed");
                }
                (id, result)
            })
            .collect()
    }

    pub(crate) fn setup_email(&self, user_id: Option<&str>) -> Result<SubscriptionRecord> {
        let resource = match user_id {
            Some(user) => format!("users/{user}/mailFolders('Inbox')/messages"),
            None => INBOX_RESOURCE.to_string(),
        };
        let path = self.webhook.email_path.clone();
        self.create(&resource, "created", &path, None)
    }

    /// Both tenant-wide Teams feeds. Each resource reports its own outcome.
    pub(crate) fn setup_teams(&self) -> Vec<SetupOutcome> {
        let targets = [
            (ALL_CHAT_MESSAGES_RESOURCE, self.webhook.teams_chat_path.clone()),
            (ALL_CHANNEL_MESSAGES_RESOURCE, self.webhook.teams_channel_path.clone()),
        ];
        targets
            .into_iter()
            .map(|(resource, path)| match self.create(resource, "created,updated", &path, None) {
                Ok(record) => SetupOutcome {
                    resource: resource.to_string(),
                    subscription: Some(record),
                    error: None,
                },
                Err(err) => {
                    tracing::warn!(resource, error = %err, "teams subscription setup failed");
                    SetupOutcome {
                        resource: resource.to_string(),
                        subscription: None,
                        error: Some(err.to_string()),
                    }
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TokenProvider;
    use crate::test_support::{MockReply, MockServer, is_token_request, settings_for, token_reply};

    fn manager_for(mock: &MockServer) -> SubscriptionManager {
        let settings = settings_for(mock.url(), &[]);
        let tokens = Arc::new(TokenProvider::new(&settings.graph).unwrap());
        let graph = Arc::new(GraphClient::new(&settings.graph, tokens));
        SubscriptionManager::new(graph, settings.webhook)
    }

    fn graph_subscription(id: &str, resource: &str, expiration: &str) -> Value {
        json!({
            "id": id,
            "resource": resource,
            "changeType": "created",
            "notificationUrl": "https://hooks.example.com/webhooks/email",
            "expirationDateTime": expiration,
            "clientState": "expected-state"
        })
    }

    /// Echo POST bodies back as the created subscription.
    fn echo_create(req: &crate::test_support::RecordedRequest, id: &str) -> MockReply {
        let mut body = req.json();
        body["id"] = json!(id);
        MockReply::json(201, body)
    }

    #[test]
    fn create_posts_contract_and_stores_record() {
        let mock = MockServer::start(|req, _| {
            if is_token_request(req) {
                return token_reply();
            }
            echo_create(req, "sub-1")
        });
        let manager = manager_for(&mock);

        let record = manager
            .create(INBOX_RESOURCE, "created", "/webhooks/email", Some(24))
            .unwrap();

        assert_eq!(record.id, "sub-1");
        assert_eq!(record.resource, INBOX_RESOURCE);
        assert_eq!(record.state, SubscriptionState::Active);
        assert!(manager.get("sub-1").is_some());
        let sent = mock
            .requests()
            .into_iter()
            .find(|r| r.path() == "/v1.0/subscriptions")
            .unwrap()
            .json();
        assert_eq!(sent["notificationUrl"], "https://hooks.example.com/webhooks/email");
        assert_eq!(sent["clientState"], "expected-state");
        assert_eq!(sent["latestSupportedTlsVersion"], "v1_2");
        assert!(sent["expirationDateTime"].as_str().unwrap().ends_with('Z'));
        let hours = (record.expiration - Utc::now()).num_minutes();
        assert!((23 * 60..=24 * 60).contains(&hours));
    }

    #[test]
    fn create_surfaces_provider_text() {
        let mock = MockServer::start(|req, _| {
            if is_token_request(req) {
                return token_reply();
            }
            MockReply::json(
                400,
                json!({ "error": { "code": "ExtensionError", "message": "Operation: Create; Exception: [Status Code: Forbidden]" } }),
            )
        });
        let manager = manager_for(&mock);

        let err = manager
            .create("chats/getAllMessages", "created", "/webhooks/teams/chat", None)
            .unwrap_err();

        match err {
            Error::Subscription(text) => {
                assert!(text.contains("400"));
                assert!(text.contains("Status Code: Forbidden"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(manager.local_records().is_empty());
    }

    #[test]
    fn create_requires_201() {
        let mock = MockServer::start(|req, _| {
            if is_token_request(req) {
                return token_reply();
            }
            MockReply::json(200, json!({ "id": "sub-x" }))
        });
        let manager = manager_for(&mock);
        let err = manager.create(INBOX_RESOURCE, "created", "/webhooks/email", None).unwrap_err();
        assert!(matches!(err, Error::Subscription(_)));
    }

    #[test]
    fn create_rejects_non_positive_ttl() {
        let mock = MockServer::start(|_, _| token_reply());
        let manager = manager_for(&mock);
        let err = manager.create(INBOX_RESOURCE, "created", "/webhooks/email", Some(0)).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert_eq!(mock.hits(), 0);
    }

    #[test]
    fn renewing_twice_only_moves_expiration() {
        let mock = MockServer::start(|req, _| {
            if is_token_request(req) {
                return token_reply();
            }
            if req.method == "POST" {
                return echo_create(req, "sub-2");
            }
            // PATCH echoes the requested expiration with a different resource
            // casing, as Graph does.
            let expiration = req.json()["expirationDateTime"].clone();
            MockReply::json(
                200,
                json!({ "id": "sub-2", "resource": "Me/MailFolders('Inbox')/Messages", "expirationDateTime": expiration }),
            )
        });
        let manager = manager_for(&mock);
        let created = manager
            .create(INBOX_RESOURCE, "created", "/webhooks/email", Some(1))
            .unwrap();

        let first = manager.renew("sub-2", Some(48)).unwrap();
        let second = manager.renew("sub-2", Some(48)).unwrap();

        for renewed in [&first, &second] {
            assert_eq!(renewed.id, created.id);
            assert_eq!(renewed.resource, created.resource);
            assert_eq!(renewed.change_type, created.change_type);
            assert_eq!(renewed.notification_url, created.notification_url);
            assert_eq!(renewed.created_at, created.created_at);
            assert_eq!(renewed.state, SubscriptionState::Renewed);
            assert!(renewed.expiration > created.expiration);
        }
        assert!(second.expiration >= first.expiration);
        let patches: Vec<_> = mock.requests().into_iter().filter(|r| r.method == "PATCH").collect();
        assert_eq!(patches.len(), 2);
        assert_eq!(patches[0].path(), "/v1.0/subscriptions/sub-2");
        assert_eq!(manager.local_records().len(), 1);
    }

    #[test]
    fn deleting_unknown_id_is_a_no_op() {
        let mock = MockServer::start(|req, _| {
            if is_token_request(req) {
                return token_reply();
            }
            MockReply::json(404, json!({ "error": { "code": "ResourceNotFound" } }))
        });
        let manager = manager_for(&mock);

        assert!(!manager.delete("missing").unwrap());
        assert!(!manager.delete("missing").unwrap());
    }

    #[test]
    fn delete_removes_local_record() {
        let mock = MockServer::start(|req, _| {
            if is_token_request(req) {
                return token_reply();
            }
            match req.method.as_str() {
                "POST" => echo_create(req, "sub-3"),
                _ => MockReply::empty(204),
            }
        });
        let manager = manager_for(&mock);
        manager.create(INBOX_RESOURCE, "created", "/webhooks/email", None).unwrap();

        assert!(manager.delete("sub-3").unwrap());
        assert!(manager.get("sub-3").is_none());
    }

    #[test]
    fn list_prefers_provider_and_drops_stale_local_records() {
        let mock = MockServer::start(|req, _| {
            if is_token_request(req) {
                return token_reply();
            }
            match req.method.as_str() {
                "POST" => {
                    let id = if req.json()["resource"] == "chats/getAllMessages" { "gone" } else { "kept" };
                    echo_create(req, id)
                }
                _ if req.url.contains("skiptoken") => MockReply::json(
                    200,
                    json!({ "value": [graph_subscription("remote-only", "teams/getAllMessages", "2099-01-01T00:00:00Z")] }),
                ),
                _ => {
                    let next = format!("http://{}/v1.0/subscriptions?$skiptoken=p2", req.header("host").unwrap_or(""));
                    MockReply::json(
                        200,
                        json!({
                            "value": [graph_subscription("kept", INBOX_RESOURCE, "2099-01-01T00:00:00Z")],
                            "@odata.nextLink": next
                        }),
                    )
                }
            }
        });
        let manager = manager_for(&mock);
        manager.create(INBOX_RESOURCE, "created", "/webhooks/email", None).unwrap();
        manager.create("chats/getAllMessages", "created", "/webhooks/teams/chat", None).unwrap();

        let listing = manager.list().unwrap();

        let ids: Vec<&str> = listing.subscriptions.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["kept", "remote-only"]);
        assert_eq!(listing.stale.len(), 1);
        assert_eq!(listing.stale[0].id, "gone");
        assert!(manager.get("gone").is_none());
        let kept = manager.get("kept").unwrap();
        assert_eq!(kept.expiration.to_rfc3339(), "2099-01-01T00:00:00+00:00");
    }

    #[test]
    fn records_expire_on_read() {
        let mut record = SubscriptionRecord::from_graph(&graph_subscription(
            "old",
            INBOX_RESOURCE,
            "2000-01-01T00:00:00Z",
        ))
        .unwrap();
        assert_eq!(record.state, SubscriptionState::Expired);
        record.expiration = Utc::now() + Duration::minutes(30);
        assert!(record.due_for_renewal(Utc::now(), Duration::minutes(60)));
        assert!(!record.due_for_renewal(Utc::now(), Duration::minutes(5)));
    }

    #[test]
    fn setup_teams_reports_each_resource() {
        let mock = MockServer::start(|req, _| {
            if is_token_request(req) {
                return token_reply();
            }
            if req.json()["resource"] == ALL_CHAT_MESSAGES_RESOURCE {
                echo_create(req, "chat-sub")
            } else {
                MockReply::json(403, json!({ "error": { "message": "license required" } }))
            }
        });
        let manager = manager_for(&mock);

        let outcomes = manager.setup_teams();

        assert_eq!(outcomes.len(), 2);
        assert_eq!(outcomes[0].subscription.as_ref().unwrap().id, "chat-sub");
        assert!(outcomes[1].error.as_ref().unwrap().contains("license required"));
    }

    #[test]
    fn oversized_ttl_is_capped() {
        let mock = MockServer::start(|req, _| {
            if is_token_request(req) {
                return token_reply();
            }
            let expiration = req.json()["expirationDateTime"].clone();
            MockReply::json(200, json!({ "id": "sub-9", "expirationDateTime": expiration }))
        });
        let manager = manager_for(&mock);

        let renewed = manager.renew("sub-9", Some(i64::MAX)).unwrap();

        let minutes = (renewed.expiration - Utc::now()).num_minutes();
        assert!(minutes > 0);
        assert!(minutes <= GRAPH_MAX_EXPIRATION_MINUTES);
    }

    #[test]
    fn renewal_sweep_drops_subscriptions_gone_at_provider() {
        let mock = MockServer::start(|req, _| {
            if is_token_request(req) {
                return token_reply();
            }
            match req.method.as_str() {
                "POST" => {
                    let id = if req.json()["resource"] == ALL_CHAT_MESSAGES_RESOURCE { "lapsed" } else { "live" };
                    echo_create(req, id)
                }
                "PATCH" if req.path().ends_with("/lapsed") => {
                    MockReply::json(404, json!({ "error": { "code": "ResourceNotFound" } }))
                }
                _ => {
                    let expiration = req.json()["expirationDateTime"].clone();
                    MockReply::json(200, json!({ "id": "live", "expirationDateTime": expiration }))
                }
            }
        });
        let manager = manager_for(&mock);
        manager.create(INBOX_RESOURCE, "created", "/webhooks/email", Some(1)).unwrap();
        manager
            .create(ALL_CHAT_MESSAGES_RESOURCE, "created", "/webhooks/teams/chat", Some(1))
            .unwrap();

        let mut results = manager.renew_due(Duration::minutes(120));
        results.sort_by(|a, b| a.0.cmp(&b.0));

        assert_eq!(results.len(), 2);
        assert_eq!(results[0].0, "lapsed");
        assert!(results[0].1.as_ref().unwrap_err().is_not_found());
        assert_eq!(results[1].0, "live");
        assert!(results[1].1.is_ok());
        assert!(manager.get("lapsed").is_none());
        assert_eq!(manager.get("live").unwrap().state, SubscriptionState::Renewed);
        assert!(manager.renew_due(Duration::minutes(120)).is_empty());
    }
}
