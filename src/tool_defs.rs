use serde_json::{Value, json};

/// Which tool catalog an MCP server instance exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub(crate) enum McpCatalog {
    Graph,
    Gmail,
    Knowledge,
}

impl McpCatalog {
    pub(crate) fn server_name(&self) -> &'static str {
        match self {
            McpCatalog::Graph => "inboxpilot-graph",
            McpCatalog::Gmail => "inboxpilot-gmail",
            McpCatalog::Knowledge => "inboxpilot-knowledge",
        }
    }

    pub(crate) fn has_resources(&self) -> bool {
        matches!(self, McpCatalog::Knowledge)
    }
}

pub(crate) fn tool_definitions_json(catalog: McpCatalog) -> Vec<Value> {
    match catalog {
        McpCatalog::Graph => graph_tools(),
        McpCatalog::Gmail => gmail_tools(),
        McpCatalog::Knowledge => knowledge_tools(),
    }
}

fn graph_tools() -> Vec<Value> {
    vec![
        json!({
            "name": "get_emails",
            "description": "Retrieve emails from an Outlook mail folder with optional OData filtering.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "user_id": { "type": "string", "description": "User id, UPN or 'me'", "default": "me" },
                    "folder": { "type": "string", "default": "inbox" },
                    "top": { "type": "integer", "description": "Max 50", "default": 10 },
                    "filter": { "type": "string", "description": "OData $filter expression" }
                }
            }
        }),
        json!({
            "name": "send_email",
            "description": "Send an email through Outlook.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "user_id": { "type": "string", "default": "me" },
                    "to": { "type": "array", "items": { "type": "string" } },
                    "subject": { "type": "string" },
                    "body": { "type": "string" },
                    "body_type": { "type": "string", "enum": ["text", "html"], "default": "html" },
                    "cc": { "type": "array", "items": { "type": "string" } }
                },
                "required": ["to", "subject", "body"]
            }
        }),
        json!({
            "name": "search_emails",
            "description": "Search a mailbox by keywords in subject and content.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "user_id": { "type": "string", "default": "me" },
                    "query": { "type": "string" },
                    "top": { "type": "integer", "default": 10 }
                },
                "required": ["query"]
            }
        }),
        json!({
            "name": "get_teams_messages",
            "description": "Read recent messages from a Teams channel, or from a chat when chat_id is given.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "team_id": { "type": "string" },
                    "channel_id": { "type": "string" },
                    "chat_id": { "type": "string" },
                    "top": { "type": "integer", "default": 20 }
                }
            }
        }),
        json!({
            "name": "send_teams_message",
            "description": "Post a message to a Teams channel, or to a chat when chat_id is given.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "team_id": { "type": "string" },
                    "channel_id": { "type": "string" },
                    "chat_id": { "type": "string" },
                    "message": { "type": "string" },
                    "message_type": { "type": "string", "enum": ["text", "html"], "default": "text" }
                },
                "required": ["message"]
            }
        }),
        json!({
            "name": "get_user_chats",
            "description": "List a user's Teams chats, most recently updated first.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "user_id": { "type": "string", "default": "me" },
                    "top": { "type": "integer", "default": 20 }
                }
            }
        }),
        json!({
            "name": "create_todo_task",
            "description": "Create a Microsoft To Do task. Uses the default list when list_id is omitted.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "user_id": { "type": "string", "default": "me" },
                    "title": { "type": "string" },
                    "body": { "type": "string" },
                    "due_date": { "type": "string", "description": "YYYY-MM-DD" },
                    "list_id": { "type": "string" }
                },
                "required": ["title"]
            }
        }),
        json!({
            "name": "schedule_meeting",
            "description": "Create an online meeting on the user's calendar.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "user_id": { "type": "string", "default": "me" },
                    "subject": { "type": "string" },
                    "start": { "type": "string", "description": "ISO 8601 local date-time" },
                    "end": { "type": "string", "description": "ISO 8601 local date-time" },
                    "attendees": { "type": "array", "items": { "type": "string" } },
                    "body": { "type": "string" },
                    "location": { "type": "string" },
                    "timezone": { "type": "string", "default": "UTC" }
                },
                "required": ["subject", "start", "end"]
            }
        }),
    ]
}

fn gmail_tools() -> Vec<Value> {
    vec![
        json!({
            "name": "get_inbox_messages",
            "description": "List Gmail inbox messages, optionally narrowed by a Gmail search query.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "max_results": { "type": "integer", "default": 10 },
                    "query": { "type": "string" }
                }
            }
        }),
        json!({
            "name": "send_email",
            "description": "Send a plain-text email from the connected Gmail account.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "to": { "type": "string" },
                    "subject": { "type": "string" },
                    "body": { "type": "string" },
                    "cc": { "type": "string" },
                    "bcc": { "type": "string" }
                },
                "required": ["to", "subject", "body"]
            }
        }),
        json!({
            "name": "search_emails",
            "description": "Search Gmail with the standard query syntax (from:, subject:, is:unread ...).",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "query": { "type": "string" },
                    "max_results": { "type": "integer", "default": 10 }
                },
                "required": ["query"]
            }
        }),
    ]
}

fn knowledge_tools() -> Vec<Value> {
    vec![
        json!({
            "name": "store_email",
            "description": "Store an email in the Outlook email collection.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "subject": { "type": "string" },
                    "sender": { "type": "string" },
                    "content": { "type": "string" },
                    "email_type": { "type": "string", "default": "general" },
                    "priority": { "type": "string", "enum": ["low", "normal", "high"], "default": "normal" }
                },
                "required": ["subject", "sender", "content"]
            }
        }),
        json!({
            "name": "store_chat_message",
            "description": "Store a Teams chat message in the chat collection.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "message": { "type": "string" },
                    "user": { "type": "string" },
                    "channel": { "type": "string", "default": "general" }
                },
                "required": ["message", "user"]
            }
        }),
        json!({
            "name": "search_emails",
            "description": "Semantic search over stored emails.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "query": { "type": "string" },
                    "n_results": { "type": "integer", "default": 5 },
                    "where": { "type": "object", "description": "Metadata filter, e.g. {\"priority\": \"high\"}" }
                },
                "required": ["query"]
            }
        }),
        json!({
            "name": "search_chats",
            "description": "Semantic search over stored Teams messages.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "query": { "type": "string" },
                    "n_results": { "type": "integer", "default": 5 },
                    "where": { "type": "object" }
                },
                "required": ["query"]
            }
        }),
        json!({
            "name": "get_statistics",
            "description": "Record counts and locations for each collection.",
            "inputSchema": { "type": "object", "properties": {} }
        }),
        json!({
            "name": "gmail_fetch_recent",
            "description": "Fetch recent Gmail inbox messages with truncated bodies.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "max_results": { "type": "integer", "default": 10 }
                }
            }
        }),
    ]
}

pub(crate) const OUTLOOK_RESOURCE_URI: &str = "chromadb://outlook-emails";
pub(crate) const TEAMS_RESOURCE_URI: &str = "chromadb://teams-chats";
pub(crate) const STATS_RESOURCE_URI: &str = "stats://chromadb";

pub(crate) fn resource_definitions_json() -> Vec<Value> {
    vec![
        json!({
            "uri": OUTLOOK_RESOURCE_URI,
            "name": "Outlook emails",
            "description": "Most recent matches from the email collection",
            "mimeType": "application/json"
        }),
        json!({
            "uri": TEAMS_RESOURCE_URI,
            "name": "Teams chats",
            "description": "Most recent matches from the Teams message collection",
            "mimeType": "application/json"
        }),
        json!({
            "uri": STATS_RESOURCE_URI,
            "name": "Collection statistics",
            "mimeType": "application/json"
        }),
    ]
}
