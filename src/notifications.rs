//! Inbound Graph change notifications and the normalized events built from them.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::{blake3_hash, secrets_match, str_field};

/// Which webhook endpoint a batch arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum NotificationKind {
    Email,
    TeamsChat,
    TeamsChannel,
}

impl NotificationKind {
    pub(crate) fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::Email => "email",
            NotificationKind::TeamsChat => "teams_chat",
            NotificationKind::TeamsChannel => "teams_channel",
        }
    }
}

/// One entry of the `value` array, validated at the boundary.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct NotificationItem {
    pub(crate) resource: String,
    pub(crate) change_type: String,
    pub(crate) subscription_id: String,
    // never echoed downstream
    #[serde(default, skip_serializing)]
    pub(crate) client_state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) resource_data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) tenant_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) subscription_expiration_date_time: Option<String>,
}

impl NotificationItem {
    pub(crate) fn client_state_matches(&self, expected: &str) -> bool {
        match self.client_state.as_deref() {
            Some(provided) => secrets_match(expected, provided),
            None => false,
        }
    }

    /// Stable digest so consumers can drop provider redeliveries.
    pub(crate) fn event_id(&self) -> String {
        let key = format!("{}\n{}\n{}", self.subscription_id, self.resource, self.change_type);
        blake3_hash(key.as_bytes()).to_hex().to_string()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub(crate) struct ResourceIds {
    pub(crate) user_id: Option<String>,
    pub(crate) message_id: Option<String>,
    pub(crate) chat_id: Option<String>,
    pub(crate) team_id: Option<String>,
    pub(crate) channel_id: Option<String>,
}

/// Split `Users('abc')` into (`Users`, `abc`).
fn keyed_segment(segment: &str) -> Option<(&str, &str)> {
    let open = segment.find('(')?;
    let inner = segment[open + 1..].strip_suffix(')')?;
    let inner = inner.trim_matches('\'').trim_matches('"');
    Some((&segment[..open], inner))
}

/// Take the segment following each known anchor. Anchors compare
/// case-insensitively; OData key syntax (`chats('19:x')`) is accepted too.
/// Missing anchors leave the field empty.
pub(crate) fn extract_resource_ids(resource: &str) -> ResourceIds {
    let mut ids = ResourceIds::default();
    let path = resource.split('?').next().unwrap_or("");
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

    let mut assign = |anchor: &str, value: &str| {
        let value = urlencoding::decode(value)
            .map(|v| v.into_owned())
            .unwrap_or_else(|_| value.to_string());
        if value.is_empty() {
            return;
        }
        let slot = match anchor.to_ascii_lowercase().as_str() {
            "users" => &mut ids.user_id,
            "messages" => &mut ids.message_id,
            "chats" => &mut ids.chat_id,
            "teams" => &mut ids.team_id,
            "channels" => &mut ids.channel_id,
            _ => return,
        };
        if slot.is_none() {
            *slot = Some(value);
        }
    };

    let mut index = 0;
    while index < segments.len() {
        let segment = segments[index];
        if let Some((anchor, key)) = keyed_segment(segment) {
            assign(anchor, key);
        } else if let Some(next) = segments.get(index + 1) {
            if keyed_segment(next).is_none() {
                assign(segment, next);
                if is_anchor(segment) {
                    index += 2;
                    continue;
                }
            }
        }
        index += 1;
    }
    ids
}

fn is_anchor(segment: &str) -> bool {
    matches!(
        segment.to_ascii_lowercase().as_str(),
        "users" | "messages" | "chats" | "teams" | "channels"
    )
}

/// Parse a webhook body into items. Only a body that is not a JSON object
/// with a `value` array is an error; malformed entries come back as `Err`
/// so the caller can count and skip them.
pub(crate) fn parse_batch(body: &str) -> Result<Vec<Result<NotificationItem, String>>, String> {
    let payload: Value = serde_json::from_str(body).map_err(|e| format!("invalid json: {e}"))?;
    let entries = payload
        .get("value")
        .and_then(|v| v.as_array())
        .ok_or_else(|| "notification body has no value array".to_string())?;
    Ok(entries
        .iter()
        .map(|entry| {
            serde_json::from_value::<NotificationItem>(entry.clone())
                .map_err(|e| format!("malformed notification: {e}"))
        })
        .collect())
}

/// Normalized event forwarded to the workflow engine.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub(crate) enum NotificationEvent {
    Email {
        event_id: String,
        change_type: String,
        resource: String,
        subscription_id: String,
        timestamp: String,
        user_id: Option<String>,
        message_id: Option<String>,
        email_details: Value,
        notification: Value,
    },
    TeamsChat {
        event_id: String,
        change_type: String,
        resource: String,
        subscription_id: String,
        timestamp: String,
        chat_id: Option<String>,
        message_id: Option<String>,
        message_details: Value,
        notification: Value,
    },
    TeamsChannel {
        event_id: String,
        change_type: String,
        resource: String,
        subscription_id: String,
        timestamp: String,
        team_id: Option<String>,
        channel_id: Option<String>,
        message_id: Option<String>,
        message_details: Value,
        notification: Value,
    },
}

impl NotificationEvent {
    pub(crate) fn build(
        kind: NotificationKind,
        item: &NotificationItem,
        ids: ResourceIds,
        details: Value,
        timestamp: String,
    ) -> Self {
        let event_id = item.event_id();
        let notification = serde_json::to_value(item).unwrap_or(Value::Null);
        let change_type = item.change_type.clone();
        let resource = item.resource.clone();
        let subscription_id = item.subscription_id.clone();
        match kind {
            NotificationKind::Email => NotificationEvent::Email {
                event_id,
                change_type,
                resource,
                subscription_id,
                timestamp,
                user_id: ids.user_id,
                message_id: ids.message_id,
                email_details: details,
                notification,
            },
            NotificationKind::TeamsChat => NotificationEvent::TeamsChat {
                event_id,
                change_type,
                resource,
                subscription_id,
                timestamp,
                chat_id: ids.chat_id,
                message_id: ids.message_id,
                message_details: details,
                notification,
            },
            NotificationKind::TeamsChannel => NotificationEvent::TeamsChannel {
                event_id,
                change_type,
                resource,
                subscription_id,
                timestamp,
                team_id: ids.team_id,
                channel_id: ids.channel_id,
                message_id: ids.message_id,
                message_details: details,
                notification,
            },
        }
    }

    pub(crate) fn kind(&self) -> NotificationKind {
        match self {
            NotificationEvent::Email { .. } => NotificationKind::Email,
            NotificationEvent::TeamsChat { .. } => NotificationKind::TeamsChat,
            NotificationEvent::TeamsChannel { .. } => NotificationKind::TeamsChannel,
        }
    }

    pub(crate) fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

// ── Detail projections ──────────────────────────────────────────────────

fn email_address(value: Option<&Value>) -> Value {
    let address = value.and_then(|v| v.get("emailAddress"));
    json!({
        "name": address.and_then(|a| str_field(a, "name")),
        "address": address.and_then(|a| str_field(a, "address")),
    })
}

fn body_fields(raw: &Value) -> (Option<&str>, Option<&str>) {
    let body = raw.get("body");
    (
        body.and_then(|b| str_field(b, "content")),
        body.and_then(|b| str_field(b, "contentType")),
    )
}

fn array_or_empty(raw: &Value, key: &str) -> Value {
    raw.get(key)
        .filter(|v| v.is_array())
        .cloned()
        .unwrap_or_else(|| json!([]))
}

pub(crate) fn project_email(raw: &Value) -> Value {
    let (body, body_type) = body_fields(raw);
    let to: Vec<Value> = raw
        .get("toRecipients")
        .and_then(|v| v.as_array())
        .map(|list| list.iter().map(|r| email_address(Some(r))).collect())
        .unwrap_or_default();
    json!({
        "id": str_field(raw, "id"),
        "subject": str_field(raw, "subject"),
        "from": email_address(raw.get("from")),
        "to": to,
        "body": body,
        "body_type": body_type,
        "received_date_time": str_field(raw, "receivedDateTime"),
        "importance": str_field(raw, "importance"),
        "has_attachments": raw.get("hasAttachments").and_then(|v| v.as_bool()).unwrap_or(false),
        "categories": array_or_empty(raw, "categories"),
        "conversation_id": str_field(raw, "conversationId"),
    })
}

fn chat_sender(raw: &Value) -> Value {
    let user = raw.get("from").and_then(|f| f.get("user"));
    json!({
        "id": user.and_then(|u| str_field(u, "id")),
        "display_name": user.and_then(|u| str_field(u, "displayName")),
    })
}

pub(crate) fn project_chat_message(raw: &Value) -> Value {
    let (body, body_type) = body_fields(raw);
    json!({
        "id": str_field(raw, "id"),
        "message_type": str_field(raw, "messageType"),
        "from": chat_sender(raw),
        "body": body,
        "body_type": body_type,
        "created_date_time": str_field(raw, "createdDateTime"),
        "mentions": array_or_empty(raw, "mentions"),
        "reactions": array_or_empty(raw, "reactions"),
        "attachments": array_or_empty(raw, "attachments"),
        "chat_id": str_field(raw, "chatId"),
        "subject": str_field(raw, "subject"),
    })
}

pub(crate) fn project_channel_message(raw: &Value) -> Value {
    let (body, body_type) = body_fields(raw);
    let identity = raw.get("channelIdentity");
    json!({
        "id": str_field(raw, "id"),
        "message_type": str_field(raw, "messageType"),
        "from": chat_sender(raw),
        "body": body,
        "body_type": body_type,
        "created_date_time": str_field(raw, "createdDateTime"),
        "mentions": array_or_empty(raw, "mentions"),
        "reactions": array_or_empty(raw, "reactions"),
        "attachments": array_or_empty(raw, "attachments"),
        "subject": str_field(raw, "subject"),
        "team_id": identity.and_then(|i| str_field(i, "teamId")),
        "channel_id": identity.and_then(|i| str_field(i, "channelId")),
        "reply_to_id": str_field(raw, "replyToId"),
    })
}
