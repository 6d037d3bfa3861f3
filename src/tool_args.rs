use serde::Deserialize;

fn default_user() -> String {
    "me".to_string()
}

fn default_folder() -> String {
    "inbox".to_string()
}

fn default_timezone() -> String {
    "UTC".to_string()
}

/// A list of addresses; a single comma-separated string is accepted too.
#[derive(Debug, Default, Deserialize)]
#[serde(untagged)]
pub(crate) enum AddressList {
    #[default]
    None,
    One(String),
    Many(Vec<String>),
}

impl AddressList {
    pub(crate) fn addresses(&self) -> Vec<String> {
        let raw: Vec<&str> = match self {
            AddressList::None => Vec::new(),
            AddressList::One(s) => s.split(',').collect(),
            AddressList::Many(v) => v.iter().map(String::as_str).collect(),
        };
        raw.into_iter()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    }
}

// ── Graph ───────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub(crate) struct ToolGetEmailsArgs {
    #[serde(default = "default_user")]
    pub(crate) user_id: String,
    #[serde(default = "default_folder")]
    pub(crate) folder: String,
    #[serde(default)]
    pub(crate) top: Option<u32>,
    #[serde(default)]
    pub(crate) filter: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ToolGraphSendEmailArgs {
    #[serde(default = "default_user")]
    pub(crate) user_id: String,
    #[serde(alias = "to_recipients")]
    pub(crate) to: AddressList,
    pub(crate) subject: String,
    pub(crate) body: String,
    #[serde(default)]
    pub(crate) body_type: Option<String>,
    #[serde(default, alias = "cc_recipients")]
    pub(crate) cc: AddressList,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ToolGraphSearchArgs {
    #[serde(default = "default_user")]
    pub(crate) user_id: String,
    #[serde(alias = "keywords")]
    pub(crate) query: String,
    #[serde(default)]
    pub(crate) top: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ToolTeamsMessagesArgs {
    #[serde(default)]
    pub(crate) team_id: Option<String>,
    #[serde(default)]
    pub(crate) channel_id: Option<String>,
    #[serde(default)]
    pub(crate) chat_id: Option<String>,
    #[serde(default)]
    pub(crate) top: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ToolTeamsSendArgs {
    #[serde(default)]
    pub(crate) team_id: Option<String>,
    #[serde(default)]
    pub(crate) channel_id: Option<String>,
    #[serde(default)]
    pub(crate) chat_id: Option<String>,
    pub(crate) message: String,
    #[serde(default)]
    pub(crate) message_type: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ToolUserChatsArgs {
    #[serde(default = "default_user")]
    pub(crate) user_id: String,
    #[serde(default)]
    pub(crate) top: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ToolTodoArgs {
    #[serde(default = "default_user")]
    pub(crate) user_id: String,
    pub(crate) title: String,
    #[serde(default, alias = "description")]
    pub(crate) body: Option<String>,
    #[serde(default)]
    pub(crate) due_date: Option<String>,
    #[serde(default)]
    pub(crate) list_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ToolMeetingArgs {
    #[serde(default = "default_user")]
    pub(crate) user_id: String,
    pub(crate) subject: String,
    #[serde(alias = "start_time")]
    pub(crate) start: String,
    #[serde(alias = "end_time")]
    pub(crate) end: String,
    #[serde(default)]
    pub(crate) attendees: AddressList,
    #[serde(default)]
    pub(crate) body: Option<String>,
    #[serde(default)]
    pub(crate) location: Option<String>,
    #[serde(default = "default_timezone")]
    pub(crate) timezone: String,
}

// ── Gmail ───────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub(crate) struct ToolInboxArgs {
    #[serde(default)]
    pub(crate) max_results: Option<u32>,
    #[serde(default)]
    pub(crate) query: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ToolGmailSendArgs {
    pub(crate) to: String,
    pub(crate) subject: String,
    pub(crate) body: String,
    #[serde(default)]
    pub(crate) cc: Option<String>,
    #[serde(default)]
    pub(crate) bcc: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ToolGmailSearchArgs {
    pub(crate) query: String,
    #[serde(default)]
    pub(crate) max_results: Option<u32>,
}

// ── Knowledge ───────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub(crate) struct ToolStoreEmailArgs {
    pub(crate) subject: String,
    pub(crate) sender: String,
    pub(crate) content: String,
    #[serde(default)]
    pub(crate) email_type: Option<String>,
    #[serde(default)]
    pub(crate) priority: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ToolStoreChatArgs {
    pub(crate) message: String,
    pub(crate) user: String,
    #[serde(default)]
    pub(crate) channel: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ToolVectorSearchArgs {
    pub(crate) query: String,
    #[serde(default)]
    pub(crate) n_results: Option<usize>,
    #[serde(default, rename = "where")]
    pub(crate) filter: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ToolFetchRecentArgs {
    #[serde(default)]
    pub(crate) max_results: Option<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn address_list_accepts_string_or_array() {
        let one: ToolGraphSendEmailArgs = serde_json::from_value(json!({
            "to": "a@example.com, b@example.com", "subject": "s", "body": "b"
        }))
        .unwrap();
        assert_eq!(one.to.addresses(), ["a@example.com", "b@example.com"]);
        assert!(one.cc.addresses().is_empty());
        assert_eq!(one.user_id, "me");

        let many: ToolGraphSendEmailArgs = serde_json::from_value(json!({
            "to_recipients": ["x@example.com"], "cc": ["y@example.com"], "subject": "s", "body": "b"
        }))
        .unwrap();
        assert_eq!(many.to.addresses(), ["x@example.com"]);
        assert_eq!(many.cc.addresses(), ["y@example.com"]);
    }

    #[test]
    fn legacy_names_are_accepted() {
        let search: ToolGraphSearchArgs =
            serde_json::from_value(json!({ "user_id": "u1", "keywords": "budget" })).unwrap();
        assert_eq!(search.query, "budget");
        let meeting: ToolMeetingArgs = serde_json::from_value(json!({
            "subject": "Sync", "start_time": "2024-05-01T10:00:00", "end_time": "2024-05-01T10:30:00"
        }))
        .unwrap();
        assert_eq!(meeting.timezone, "UTC");
        assert_eq!(meeting.start, "2024-05-01T10:00:00");
    }

    #[test]
    fn where_filter_is_renamed() {
        let args: ToolVectorSearchArgs =
            serde_json::from_value(json!({ "query": "q", "where": { "priority": "high" } })).unwrap();
        assert_eq!(args.filter.unwrap()["priority"], "high");
    }

    #[test]
    fn missing_required_field_fails() {
        assert!(serde_json::from_value::<ToolStoreChatArgs>(json!({ "message": "hi" })).is_err());
    }
}
