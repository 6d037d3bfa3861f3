use std::io::{self, BufRead, BufReader, Read, Write};

use serde_json::{Value, json};

use crate::{
    McpCatalog, OUTLOOK_COLLECTION_KEY, OUTLOOK_RESOURCE_URI, STATS_RESOURCE_URI, Settings,
    TEAMS_COLLECTION_KEY, TEAMS_RESOURCE_URI, ToolContext, execute_tool, resource_definitions_json,
    tool_definitions_json,
};

const MAX_MESSAGE_BYTES: usize = 10 * 1024 * 1024;
const RESOURCE_SAMPLE_SIZE: usize = 10;

/// Wire framing of an incoming message. Replies mirror it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Framing {
    ContentLength,
    Line,
}

pub(crate) fn read_mcp_message(reader: &mut impl BufRead) -> io::Result<Option<(Value, Framing)>> {
    let mut first_line = String::new();
    loop {
        first_line.clear();
        if reader.read_line(&mut first_line)? == 0 {
            return Ok(None);
        }
        if !first_line.trim().is_empty() {
            break;
        }
    }

    if first_line.to_ascii_lowercase().starts_with("content-length:") {
        let mut content_length = parse_content_length(&first_line);
        loop {
            let mut line = String::new();
            let read = reader.read_line(&mut line)?;
            if read == 0 || line == "\r\n" || line == "\n" {
                break;
            }
            if line.to_ascii_lowercase().starts_with("content-length:") {
                content_length = parse_content_length(&line).or(content_length);
            }
        }
        let len = content_length
            .filter(|len| *len > 0)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "missing content-length"))?;
        if len > MAX_MESSAGE_BYTES {
            return Err(io::Error::new(io::ErrorKind::InvalidData, format!("message too large ({len} bytes)")));
        }
        let mut buffer = vec![0u8; len];
        reader.read_exact(&mut buffer)?;
        let value = serde_json::from_slice(&buffer)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, format!("invalid json: {e}")))?;
        Ok(Some((value, Framing::ContentLength)))
    } else {
        let value = serde_json::from_str(first_line.trim())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, format!("invalid json: {e}")))?;
        Ok(Some((value, Framing::Line)))
    }
}

fn parse_content_length(line: &str) -> Option<usize> {
    line.split(':').nth(1).and_then(|v| v.trim().parse::<usize>().ok())
}

pub(crate) fn write_mcp_response(writer: &mut impl Write, value: &Value, framing: Framing) -> io::Result<()> {
    let payload = serde_json::to_vec(value)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, format!("{e}")))?;
    match framing {
        Framing::ContentLength => {
            write!(writer, "Content-Length: {}\r\n\r\n", payload.len())?;
            writer.write_all(&payload)?;
        }
        Framing::Line => {
            writer.write_all(&payload)?;
            writer.write_all(b"\n")?;
        }
    }
    writer.flush()
}

fn rpc_result(id: &Value, result: Value) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "result": result })
}

fn rpc_error(id: &Value, code: i64, message: impl Into<String>) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "error": { "code": code, "message": message.into() } })
}

fn read_resource(uri: &str, ctx: &mut ToolContext) -> Result<Value, String> {
    let data = match uri {
        OUTLOOK_RESOURCE_URI | TEAMS_RESOURCE_URI => {
            let collection = if uri == OUTLOOK_RESOURCE_URI {
                OUTLOOK_COLLECTION_KEY
            } else {
                TEAMS_COLLECTION_KEY
            };
            let matches = ctx
                .vector()?
                .query(collection, "recent", RESOURCE_SAMPLE_SIZE, None)
                .map_err(|e| e.to_string())?;
            serde_json::to_value(matches).map_err(|e| e.to_string())?
        }
        STATS_RESOURCE_URI => ctx.vector()?.stats().map_err(|e| e.to_string())?,
        other => return Err(format!("unknown resource: {other}")),
    };
    let text = serde_json::to_string_pretty(&data).map_err(|e| e.to_string())?;
    Ok(json!({ "contents": [{ "uri": uri, "mimeType": "application/json", "text": text }] }))
}

/// Handle one request. `None` means no reply is owed (a notification).
/// The flag is true when the server should stop after replying.
pub(crate) fn handle_mcp_message(catalog: McpCatalog, msg: &Value, ctx: &mut ToolContext) -> (Option<Value>, bool) {
    let id = msg.get("id").cloned().unwrap_or(Value::Null);
    let has_id = !id.is_null();
    let method = msg.get("method").and_then(|m| m.as_str()).unwrap_or("");
    let params = msg.get("params").cloned().unwrap_or_else(|| json!({}));

    if !has_id {
        tracing::debug!(method, "mcp notification ignored");
        return (None, false);
    }

    let response = match method {
        "initialize" => {
            let protocol = params
                .get("protocolVersion")
                .and_then(|v| v.as_str())
                .unwrap_or("2024-11-05");
            let mut capabilities = json!({ "tools": { "listChanged": false } });
            if catalog.has_resources() {
                capabilities["resources"] = json!({ "listChanged": false });
            }
            rpc_result(
                &id,
                json!({
                    "protocolVersion": protocol,
                    "capabilities": capabilities,
                    "serverInfo": { "name": catalog.server_name(), "version": env!("CARGO_PKG_VERSION") }
                }),
            )
        }
        "ping" => rpc_result(&id, json!({})),
        "tools/list" => rpc_result(&id, json!({ "tools": tool_definitions_json(catalog) })),
        "tools/call" => {
            let name = params.get("name").and_then(|v| v.as_str()).unwrap_or("");
            let arguments = params.get("arguments").cloned().unwrap_or_else(|| json!({}));
            let result = match execute_tool(catalog, name, arguments, ctx) {
                Ok(result) => {
                    tracing::info!(tool = name, is_error = result.is_error, "tool call finished");
                    json!({
                        "content": [{ "type": "text", "text": result.output }],
                        "details": result.details,
                        "isError": result.is_error
                    })
                }
                Err(err) => {
                    tracing::warn!(tool = name, error = %err, "tool call failed");
                    json!({
                        "content": [{ "type": "text", "text": err }],
                        "isError": true
                    })
                }
            };
            rpc_result(&id, result)
        }
        "resources/list" if catalog.has_resources() => {
            rpc_result(&id, json!({ "resources": resource_definitions_json() }))
        }
        "resources/read" if catalog.has_resources() => {
            let uri = params.get("uri").and_then(|v| v.as_str()).unwrap_or("");
            match read_resource(uri, ctx) {
                Ok(result) => rpc_result(&id, result),
                Err(err) => rpc_error(&id, -32002, err),
            }
        }
        "shutdown" => return (Some(rpc_result(&id, Value::Null)), true),
        _ => rpc_error(&id, -32601, "method not found"),
    };
    (Some(response), false)
}

pub(crate) fn serve_mcp<R: Read, W: Write>(
    catalog: McpCatalog,
    input: R,
    output: &mut W,
    ctx: &mut ToolContext,
) -> io::Result<()> {
    let mut reader = BufReader::new(input);
    loop {
        let (msg, framing) = match read_mcp_message(&mut reader) {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(err) if err.kind() == io::ErrorKind::InvalidData => {
                tracing::warn!(error = %err, "unreadable mcp message");
                write_mcp_response(output, &rpc_error(&Value::Null, -32700, err.to_string()), Framing::Line)?;
                continue;
            }
            Err(err) => return Err(err),
        };
        let (reply, stop) = handle_mcp_message(catalog, &msg, ctx);
        if let Some(reply) = reply {
            write_mcp_response(output, &reply, framing)?;
        }
        if stop {
            break;
        }
    }
    Ok(())
}

pub(crate) fn run_mcp_server(catalog: McpCatalog, settings: Settings) -> Result<(), Box<dyn std::error::Error>> {
    tracing::info!(server = catalog.server_name(), "mcp server starting on stdio");
    let mut ctx = ToolContext::new(settings);
    let mut stdout = io::stdout();
    serve_mcp(catalog, io::stdin(), &mut stdout, &mut ctx)?;
    Ok(())
}
