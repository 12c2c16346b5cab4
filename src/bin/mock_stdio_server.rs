//! Minimal MCP server speaking newline-delimited JSON-RPC over stdio.
//!
//! Used by the integration tests as the upstream child process.
//! `MOCK_CAPABILITIES` (comma separated, default `resources`) selects the
//! declared capabilities; `MOCK_GARBAGE_FIRST=1` emits one unparsable line
//! before anything else. The `log` tool emits a `notifications/message`
//! before replying.

use std::{
    env,
    io::{self, BufRead, Write},
    process,
    thread,
    time::Duration,
};

use serde_json::{json, Map, Value};

fn main() -> io::Result<()> {
    let capabilities: Map<String, Value> = env::var("MOCK_CAPABILITIES")
        .unwrap_or_else(|_| "resources".to_string())
        .split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(|name| (name.to_string(), json!({})))
        .collect();

    let stdout = io::stdout();
    if env::var("MOCK_GARBAGE_FIRST").is_ok_and(|value| value == "1") {
        writeln!(stdout.lock(), "this is not json")?;
    }
    eprintln!("mock server ready");

    for line in io::stdin().lock().lines() {
        let line = line?;
        let Ok(message) = serde_json::from_str::<Value>(&line) else {
            eprintln!("mock server ignoring unparsable line");
            continue;
        };
        let Some(method) = message.get("method").and_then(Value::as_str) else {
            continue;
        };
        let Some(id) = message.get("id").cloned() else {
            eprintln!("mock server got notification {method}");
            continue;
        };
        let params = message.get("params").cloned().unwrap_or(Value::Null);

        if method == "tools/call" && params.get("name").and_then(Value::as_str) == Some("log") {
            let notification = json!({
                "jsonrpc": "2.0",
                "method": "notifications/message",
                "params": {"level": "error", "logger": "mock", "data": "disk full"}
            });
            writeln!(stdout.lock(), "{notification}")?;
        }

        let reply = match handle(method, &params, &capabilities) {
            Ok(result) => json!({"jsonrpc": "2.0", "id": id, "result": result}),
            Err((code, text)) => json!({
                "jsonrpc": "2.0",
                "id": id,
                "error": {"code": code, "message": text}
            }),
        };

        let mut out = stdout.lock();
        writeln!(out, "{reply}")?;
        out.flush()?;
    }

    Ok(())
}

fn handle(
    method: &str,
    params: &Value,
    capabilities: &Map<String, Value>,
) -> Result<Value, (i64, String)> {
    match method {
        "initialize" => Ok(json!({
            "protocolVersion": "2024-11-05",
            "capabilities": capabilities,
            "serverInfo": {"name": "mock-stdio-server", "version": "1.0.0"},
        })),
        "ping" => Ok(json!({})),
        "resources/list" => Ok(json!({
            "resources": [{"uri": "file:///example.txt", "name": "Example Resource"}]
        })),
        "resources/templates/list" => Ok(json!({"resourceTemplates": []})),
        "resources/read" => match params.get("uri").and_then(Value::as_str) {
            Some("file:///example.txt") => Ok(json!({
                "contents": [{"uri": "file:///example.txt", "mimeType": "text/plain", "text": "hello"}]
            })),
            _ => Err((-32002, "Resource not found".to_string())),
        },
        "tools/list" => Ok(json!({
            "tools": [{"name": "echo", "inputSchema": {"type": "object"}}]
        })),
        "tools/call" => match params.get("name").and_then(Value::as_str) {
            Some("exit") => process::exit(3),
            Some("slow") => {
                thread::sleep(Duration::from_secs(2));
                Ok(json!({"content": [{"type": "text", "text": "slow"}]}))
            }
            Some("log") => Ok(json!({"content": [{"type": "text", "text": "logged"}]})),
            Some("echo") => {
                let text = params
                    .pointer("/arguments/text")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                Ok(json!({"content": [{"type": "text", "text": text}]}))
            }
            _ => Err((-32602, "Unknown tool".to_string())),
        },
        "prompts/list" => Ok(json!({"prompts": [{"name": "greeting"}]})),
        "prompts/get" => Ok(json!({
            "messages": [{"role": "user", "content": {"type": "text", "text": "hello"}}]
        })),
        "completion/complete" => Ok(json!({
            "completion": {"values": ["example"], "hasMore": false}
        })),
        _ => Err((-32601, "Method not found".to_string())),
    }
}
