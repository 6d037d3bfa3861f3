use std::sync::Arc;

use serde_json::{Value, json};

use crate::error::Error;
use crate::{
    AddressList, GmailClient, GraphClient, McpCatalog, OUTLOOK_COLLECTION_KEY,
    OutgoingMail, RequestOptions, Settings, TEAMS_COLLECTION_KEY, TokenProvider, ToolFetchRecentArgs,
    ToolGetEmailsArgs, ToolGmailSearchArgs, ToolGmailSendArgs, ToolGraphSearchArgs,
    ToolGraphSendEmailArgs, ToolInboxArgs, ToolMeetingArgs, ToolStoreChatArgs, ToolStoreEmailArgs,
    ToolTeamsMessagesArgs, ToolTeamsSendArgs, ToolTodoArgs, ToolUserChatsArgs, ToolVectorSearchArgs,
    VectorStoreManager, collection_values, embedder_from_settings,
};

const GRAPH_MAX_TOP: u32 = 50;

#[derive(Debug, Clone)]
pub(crate) struct ToolExecution {
    pub(crate) output: String,
    pub(crate) details: Value,
    pub(crate) is_error: bool,
}

impl ToolExecution {
    fn ok(output: impl Into<String>, details: Value) -> Self {
        Self {
            output: output.into(),
            details,
            is_error: false,
        }
    }
}

/// Backends for tool calls, built on first use so `tools/list` works
/// without credentials.
pub(crate) struct ToolContext {
    settings: Settings,
    graph: Option<Arc<GraphClient>>,
    gmail: Option<GmailClient>,
    vector: Option<VectorStoreManager>,
}

impl ToolContext {
    pub(crate) fn new(settings: Settings) -> Self {
        Self {
            settings,
            graph: None,
            gmail: None,
            vector: None,
        }
    }

    #[cfg(test)]
    pub(crate) fn with_vector(settings: Settings, vector: VectorStoreManager) -> Self {
        Self {
            vector: Some(vector),
            ..Self::new(settings)
        }
    }

    fn graph(&mut self) -> Result<&GraphClient, String> {
        if self.graph.is_none() {
            let tokens = TokenProvider::new(&self.settings.graph).map_err(|e| e.to_string())?;
            self.graph = Some(Arc::new(GraphClient::new(&self.settings.graph, Arc::new(tokens))));
        }
        self.graph.as_deref().ok_or_else(|| "graph client unavailable".to_string())
    }

    fn gmail(&mut self) -> &GmailClient {
        let settings = &self.settings.gmail;
        self.gmail.get_or_insert_with(|| GmailClient::new(settings.clone()))
    }

    pub(crate) fn vector(&mut self) -> Result<&VectorStoreManager, String> {
        if self.vector.is_none() {
            let embedder = embedder_from_settings(&self.settings.vector.embedding).map_err(|e| e.to_string())?;
            let store = VectorStoreManager::new(self.settings.vector.clone(), embedder)
                .map_err(|e| e.to_string())?;
            self.vector = Some(store);
        }
        self.vector.as_ref().ok_or_else(|| "vector store unavailable".to_string())
    }
}

fn parse_args<T: serde::de::DeserializeOwned>(args: Value) -> Result<T, String> {
    serde_json::from_value(args).map_err(|e| format!("args: {e}"))
}

fn to_details<T: serde::Serialize>(value: &T) -> Result<Value, String> {
    serde_json::to_value(value).map_err(|e| e.to_string())
}

fn describe(err: Error) -> String {
    match err {
        Error::Provider { status, body } => format!("provider returned {status}: {body}"),
        other => other.to_string(),
    }
}

/// `me` addresses the signed-in principal; anything else is a user id or UPN.
fn user_path(user_id: &str) -> String {
    if user_id.is_empty() || user_id.eq_ignore_ascii_case("me") {
        "me".to_string()
    } else {
        format!("users/{}", urlencoding::encode(user_id))
    }
}

fn recipients(list: &AddressList) -> Vec<Value> {
    list.addresses()
        .into_iter()
        .map(|address| json!({ "emailAddress": { "address": address } }))
        .collect()
}

fn summarize_lines(items: &[Value], render: impl Fn(&Value) -> String) -> String {
    if items.is_empty() {
        return "No results.".to_string();
    }
    items
        .iter()
        .enumerate()
        .map(|(i, item)| format!("{}. {}", i + 1, render(item)))
        .collect::<Vec<_>>()
        .join("\n")
}

fn email_line(item: &Value) -> String {
    format!(
        "{} | {} | {}",
        item["receivedDateTime"].as_str().unwrap_or(""),
        item["from"]["emailAddress"]["address"].as_str().unwrap_or("unknown"),
        item["subject"].as_str().unwrap_or("(no subject)")
    )
}

fn channel_target(team_id: &Option<String>, channel_id: &Option<String>, chat_id: &Option<String>) -> Result<String, String> {
    if let Some(chat) = chat_id.as_deref().filter(|c| !c.is_empty()) {
        return Ok(format!("chats/{}/messages", urlencoding::encode(chat)));
    }
    match (team_id.as_deref(), channel_id.as_deref()) {
        (Some(team), Some(channel)) if !team.is_empty() && !channel.is_empty() => Ok(format!(
            "teams/{}/channels/{}/messages",
            urlencoding::encode(team),
            urlencoding::encode(channel)
        )),
        _ => Err("either chat_id or both team_id and channel_id are required".to_string()),
    }
}

pub(crate) fn execute_tool(
    catalog: McpCatalog,
    name: &str,
    args: Value,
    ctx: &mut ToolContext,
) -> Result<ToolExecution, String> {
    match catalog {
        McpCatalog::Graph => execute_graph_tool(name, args, ctx),
        McpCatalog::Gmail => execute_gmail_tool(name, args, ctx),
        McpCatalog::Knowledge => execute_knowledge_tool(name, args, ctx),
    }
}

fn execute_graph_tool(name: &str, args: Value, ctx: &mut ToolContext) -> Result<ToolExecution, String> {
    match name {
        "get_emails" => {
            let parsed: ToolGetEmailsArgs = parse_args(args)?;
            let top = parsed.top.unwrap_or(10).clamp(1, GRAPH_MAX_TOP);
            let mut options = RequestOptions::default()
                .query("$top", top.to_string())
                .query("$orderby", "receivedDateTime desc");
            if let Some(filter) = parsed.filter.filter(|f| !f.trim().is_empty()) {
                options = options.query("$filter", filter);
            }
            let path = format!(
                "{}/mailFolders/{}/messages",
                user_path(&parsed.user_id),
                urlencoding::encode(&parsed.folder)
            );
            let body = ctx.graph()?.request("GET", &path, &options).map_err(describe)?;
            let items = collection_values(&body);
            Ok(ToolExecution::ok(summarize_lines(&items, email_line), json!({ "value": items })))
        }
        "send_email" => {
            let parsed: ToolGraphSendEmailArgs = parse_args(args)?;
            let to = recipients(&parsed.to);
            if to.is_empty() {
                return Err("at least one recipient is required".into());
            }
            let content_type = match parsed.body_type.as_deref() {
                Some("text") => "Text",
                _ => "HTML",
            };
            let mut message = json!({
                "subject": parsed.subject,
                "body": { "contentType": content_type, "content": parsed.body },
                "toRecipients": to,
            });
            let cc = recipients(&parsed.cc);
            if !cc.is_empty() {
                message["ccRecipients"] = Value::Array(cc);
            }
            let path = format!("{}/sendMail", user_path(&parsed.user_id));
            let options = RequestOptions::default().json(json!({ "message": message, "saveToSentItems": true }));
            ctx.graph()?.request("POST", &path, &options).map_err(describe)?;
            Ok(ToolExecution::ok(
                format!("Email sent to {}.", parsed.to.addresses().join(", ")),
                json!({ "sent": true }),
            ))
        }
        "search_emails" => {
            let parsed: ToolGraphSearchArgs = parse_args(args)?;
            let top = parsed.top.unwrap_or(10).clamp(1, GRAPH_MAX_TOP);
            let options = RequestOptions::default()
                .query("$search", format!("\"{}\"", parsed.query.replace('"', "")))
                .query("$top", top.to_string())
                .header("ConsistencyLevel", "eventual");
            let path = format!("{}/messages", user_path(&parsed.user_id));
            let body = ctx.graph()?.request("GET", &path, &options).map_err(describe)?;
            let items = collection_values(&body);
            Ok(ToolExecution::ok(summarize_lines(&items, email_line), json!({ "value": items })))
        }
        "get_teams_messages" => {
            let parsed: ToolTeamsMessagesArgs = parse_args(args)?;
            let path = channel_target(&parsed.team_id, &parsed.channel_id, &parsed.chat_id)?;
            let top = parsed.top.unwrap_or(20).clamp(1, GRAPH_MAX_TOP);
            let options = RequestOptions::default().query("$top", top.to_string());
            let body = ctx.graph()?.request("GET", &path, &options).map_err(describe)?;
            let items = collection_values(&body);
            let output = summarize_lines(&items, |m| {
                format!(
                    "{}: {}",
                    m["from"]["user"]["displayName"].as_str().unwrap_or("unknown"),
                    crate::truncate_chars(m["body"]["content"].as_str().unwrap_or(""), 200)
                )
            });
            Ok(ToolExecution::ok(output, json!({ "value": items })))
        }
        "send_teams_message" => {
            let parsed: ToolTeamsSendArgs = parse_args(args)?;
            let path = channel_target(&parsed.team_id, &parsed.channel_id, &parsed.chat_id)?;
            let content_type = parsed.message_type.unwrap_or_else(|| "text".to_string());
            let options = RequestOptions::default()
                .json(json!({ "body": { "contentType": content_type, "content": parsed.message } }));
            let body = ctx.graph()?.request("POST", &path, &options).map_err(describe)?;
            Ok(ToolExecution::ok(
                format!("Message posted ({}).", body["id"].as_str().unwrap_or("no id")),
                body,
            ))
        }
        "get_user_chats" => {
            let parsed: ToolUserChatsArgs = parse_args(args)?;
            let top = parsed.top.unwrap_or(20).clamp(1, GRAPH_MAX_TOP);
            let options = RequestOptions::default()
                .query("$top", top.to_string())
                .query("$select", "id,topic,chatType,createdDateTime,lastUpdatedDateTime")
                .query("$orderby", "lastUpdatedDateTime desc");
            let path = format!("{}/chats", user_path(&parsed.user_id));
            let body = ctx.graph()?.request("GET", &path, &options).map_err(describe)?;
            let items = collection_values(&body);
            let output = summarize_lines(&items, |c| {
                format!(
                    "{} [{}] {}",
                    c["id"].as_str().unwrap_or(""),
                    c["chatType"].as_str().unwrap_or(""),
                    c["topic"].as_str().unwrap_or("(no topic)")
                )
            });
            Ok(ToolExecution::ok(output, json!({ "value": items })))
        }
        "create_todo_task" => {
            let parsed: ToolTodoArgs = parse_args(args)?;
            let user = user_path(&parsed.user_id);
            let graph = ctx.graph()?;
            let list_id = match parsed.list_id.filter(|l| !l.is_empty()) {
                Some(id) => id,
                None => {
                    let lists = graph.get(&format!("{user}/todo/lists")).map_err(describe)?;
                    collection_values(&lists)
                        .into_iter()
                        .find(|l| l["wellknownListName"] == "defaultList")
                        .and_then(|l| l["id"].as_str().map(str::to_string))
                        .ok_or_else(|| "no default To Do list found".to_string())?
                }
            };
            let mut task = json!({ "title": parsed.title });
            if let Some(body) = parsed.body.filter(|b| !b.is_empty()) {
                task["body"] = json!({ "content": body, "contentType": "text" });
            }
            if let Some(due) = parsed.due_date.filter(|d| !d.is_empty()) {
                task["dueDateTime"] = json!({ "dateTime": format!("{due}T23:59:59"), "timeZone": "UTC" });
            }
            let path = format!("{user}/todo/lists/{}/tasks", urlencoding::encode(&list_id));
            let created = graph
                .request("POST", &path, &RequestOptions::default().json(task))
                .map_err(describe)?;
            Ok(ToolExecution::ok(
                format!("Task created: {}", created["title"].as_str().unwrap_or("")),
                created,
            ))
        }
        "schedule_meeting" => {
            let parsed: ToolMeetingArgs = parse_args(args)?;
            let mut event = json!({
                "subject": parsed.subject,
                "start": { "dateTime": parsed.start, "timeZone": parsed.timezone },
                "end": { "dateTime": parsed.end, "timeZone": parsed.timezone },
                "isOnlineMeeting": true,
                "onlineMeetingProvider": "teamsForBusiness",
            });
            if let Some(body) = parsed.body.filter(|b| !b.is_empty()) {
                event["body"] = json!({ "contentType": "HTML", "content": body });
            }
            if let Some(location) = parsed.location.filter(|l| !l.is_empty()) {
                event["location"] = json!({ "displayName": location });
            }
            let attendees: Vec<Value> = parsed
                .attendees
                .addresses()
                .into_iter()
                .map(|address| json!({ "emailAddress": { "address": address, "name": address }, "type": "required" }))
                .collect();
            if !attendees.is_empty() {
                event["attendees"] = Value::Array(attendees);
            }
            let path = format!("{}/calendar/events", user_path(&parsed.user_id));
            let created = ctx
                .graph()?
                .request("POST", &path, &RequestOptions::default().json(event))
                .map_err(describe)?;
            let join = created["onlineMeeting"]["joinUrl"].as_str().unwrap_or("");
            Ok(ToolExecution::ok(
                format!("Meeting scheduled: {} {join}", created["subject"].as_str().unwrap_or("")).trim_end().to_string(),
                created,
            ))
        }
        _ => Err(format!("unknown tool: {name}")),
    }
}

fn execute_gmail_tool(name: &str, args: Value, ctx: &mut ToolContext) -> Result<ToolExecution, String> {
    match name {
        "get_inbox_messages" => {
            let parsed: ToolInboxArgs = parse_args(args)?;
            let messages = ctx
                .gmail()
                .list_inbox(parsed.max_results.unwrap_or(10), parsed.query.as_deref())
                .map_err(describe)?;
            let output = if messages.is_empty() {
                "No messages.".to_string()
            } else {
                messages
                    .iter()
                    .map(|m| format!("{}{} | {} | {}", if m.unread { "* " } else { "" }, m.date, m.from, m.subject))
                    .collect::<Vec<_>>()
                    .join("\n")
            };
            Ok(ToolExecution::ok(output, to_details(&messages)?))
        }
        "send_email" => {
            let parsed: ToolGmailSendArgs = parse_args(args)?;
            let sent = ctx
                .gmail()
                .send(&OutgoingMail {
                    to: &parsed.to,
                    subject: &parsed.subject,
                    body: &parsed.body,
                    cc: parsed.cc.as_deref(),
                    bcc: parsed.bcc.as_deref(),
                })
                .map_err(describe)?;
            Ok(ToolExecution::ok(format!("Email sent to {}.", parsed.to), sent))
        }
        "search_emails" => {
            let parsed: ToolGmailSearchArgs = parse_args(args)?;
            let messages = ctx
                .gmail()
                .search(&parsed.query, parsed.max_results.unwrap_or(10))
                .map_err(describe)?;
            let output = format!("{} message(s) matched.", messages.len());
            Ok(ToolExecution::ok(output, to_details(&messages)?))
        }
        _ => Err(format!("unknown tool: {name}")),
    }
}

fn execute_knowledge_tool(name: &str, args: Value, ctx: &mut ToolContext) -> Result<ToolExecution, String> {
    match name {
        "store_email" => {
            let parsed: ToolStoreEmailArgs = parse_args(args)?;
            let id = ctx
                .vector()?
                .store_email(
                    &parsed.subject,
                    &parsed.sender,
                    &parsed.content,
                    parsed.email_type.as_deref().unwrap_or("general"),
                    parsed.priority.as_deref().unwrap_or("normal"),
                )
                .map_err(describe)?;
            Ok(ToolExecution::ok(format!("Stored email {id}"), json!({ "id": id })))
        }
        "store_chat_message" => {
            let parsed: ToolStoreChatArgs = parse_args(args)?;
            let id = ctx
                .vector()?
                .store_chat(&parsed.message, &parsed.user, parsed.channel.as_deref().unwrap_or("general"))
                .map_err(describe)?;
            Ok(ToolExecution::ok(format!("Stored chat message {id}"), json!({ "id": id })))
        }
        "search_emails" | "search_chats" => {
            let parsed: ToolVectorSearchArgs = parse_args(args)?;
            let collection = if name == "search_emails" {
                OUTLOOK_COLLECTION_KEY
            } else {
                TEAMS_COLLECTION_KEY
            };
            let matches = ctx
                .vector()?
                .query(collection, &parsed.query, parsed.n_results.unwrap_or(5), parsed.filter.as_ref())
                .map_err(describe)?;
            let output = if matches.is_empty() {
                "No results.".to_string()
            } else {
                matches
                    .iter()
                    .enumerate()
                    .map(|(i, m)| {
                        let distance = m.distance.map(|d| format!(" ({d:.3})")).unwrap_or_default();
                        format!("{}. {}{distance}\n{}", i + 1, m.id, crate::truncate_chars(&m.content, 300))
                    })
                    .collect::<Vec<_>>()
                    .join("\n")
            };
            Ok(ToolExecution::ok(output, to_details(&matches)?))
        }
        "get_statistics" => {
            let stats = ctx.vector()?.stats().map_err(describe)?;
            let output = serde_json::to_string_pretty(&stats).map_err(|e| e.to_string())?;
            Ok(ToolExecution::ok(output, stats))
        }
        "gmail_fetch_recent" => {
            let parsed: ToolFetchRecentArgs = parse_args(args)?;
            let recent = ctx
                .gmail()
                .fetch_recent(parsed.max_results.unwrap_or(10))
                .map_err(describe)?;
            let output = format!("Fetched {} message(s).", recent.len());
            Ok(ToolExecution::ok(output, Value::Array(recent)))
        }
        _ => Err(format!("unknown tool: {name}")),
    }
}
