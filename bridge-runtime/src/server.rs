//! MCP server over stdio, implemented in terms of the upstream session.
//!
//! The downstream contract is deliberately forgiving: `tools/list` never
//! fails (it degrades to the cached catalog), and every `tools/call`
//! failure is reported in-band as an `isError` result rather than as a
//! JSON-RPC fault. `resources/read` is the one structural fault.

use std::sync::Arc;

use serde_json::{Value, json};
use tokio::io::{
    self, AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
};

use crate::upstream::ProxySession;

pub const MCP_PROTOCOL_VERSION: &str = "2024-11-05";
pub const MCP_SERVER_NAME: &str = "jb-bridge";

pub struct McpServer {
    session: Arc<ProxySession>,
}

impl McpServer {
    pub fn new(session: Arc<ProxySession>) -> Self {
        Self { session }
    }

    pub async fn serve_stdio(&self) -> Result<(), String> {
        let stdin = io::stdin();
        let mut reader = BufReader::new(stdin);
        let mut stdout = io::stdout();

        loop {
            let incoming = read_framed_json(&mut reader)
                .await
                .map_err(|e| format!("Failed to read MCP message: {e}"))?;
            let Some(incoming) = incoming else {
                break;
            };

            let responses = self.handle_incoming_message(incoming).await;
            for response in responses {
                write_framed_json(&mut stdout, &response)
                    .await
                    .map_err(|e| format!("Failed to write MCP response: {e}"))?;
            }
        }

        Ok(())
    }

    async fn handle_incoming_message(&self, incoming: Value) -> Vec<Value> {
        let mut responses = Vec::new();

        if let Some(batch) = incoming.as_array() {
            if batch.is_empty() {
                responses.push(error_response(
                    Value::Null,
                    RpcError::invalid_request("Batch request must not be empty"),
                ));
                return responses;
            }
            for item in batch {
                if let Some(response) = self.handle_single_message(item.clone()).await {
                    responses.push(response);
                }
            }
            return responses;
        }

        if let Some(response) = self.handle_single_message(incoming).await {
            responses.push(response);
        }
        responses
    }

    async fn handle_single_message(&self, incoming: Value) -> Option<Value> {
        let Some(obj) = incoming.as_object() else {
            return Some(error_response(
                Value::Null,
                RpcError::invalid_request("Request must be a JSON object"),
            ));
        };

        if obj.get("jsonrpc").and_then(Value::as_str) != Some("2.0") {
            let id = obj.get("id").cloned().unwrap_or(Value::Null);
            return Some(error_response(
                id,
                RpcError::invalid_request("jsonrpc must be '2.0'"),
            ));
        }

        let Some(method) = obj.get("method").and_then(Value::as_str) else {
            // Most likely a client response; the bridge issues no outbound
            // requests to its client.
            return None;
        };

        let params = obj.get("params").cloned().unwrap_or(Value::Null);
        if let Some(id) = obj.get("id").cloned() {
            let result = self.handle_request(method, params).await;
            Some(match result {
                Ok(payload) => success_response(id, payload),
                Err(err) => error_response(id, err),
            })
        } else {
            self.handle_notification(method).await;
            None
        }
    }

    async fn handle_notification(&self, method: &str) {
        if matches!(
            method,
            "notifications/initialized" | "notifications/cancelled"
        ) {
            return;
        }
        // Unknown notifications are intentionally ignored.
    }

    async fn handle_request(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        match method {
            "initialize" => Ok(self.initialize_payload()),
            "ping" => Ok(json!({})),
            "tools/list" => Ok(self.tools_list_payload().await),
            "tools/call" => self.handle_tools_call(params).await,
            "resources/list" => Ok(json!({ "resources": [] })),
            "resources/read" => self.handle_resources_read(&params),
            "prompts/list" => Ok(json!({ "prompts": [] })),
            _ => Err(RpcError::method_not_found(method)),
        }
    }

    fn initialize_payload(&self) -> Value {
        json!({
            "protocolVersion": MCP_PROTOCOL_VERSION,
            "capabilities": {
                "tools": {
                    "listChanged": false
                },
                "resources": {
                    "listChanged": false
                },
                "prompts": {
                    "listChanged": false
                }
            },
            "serverInfo": {
                "name": MCP_SERVER_NAME,
                "version": env!("CARGO_PKG_VERSION")
            }
        })
    }

    /// Refresh opportunistically, then serve whatever the cache holds. A
    /// refresh failure is logged, never propagated.
    async fn tools_list_payload(&self) -> Value {
        if self.session.is_connected() {
            if let Err(err) = self.session.refresh_tools().await {
                tracing::warn!(error = %err, "tool refresh failed; serving the cached catalog");
            }
        }

        let tools: Vec<Value> = self
            .session
            .tools()
            .into_iter()
            .map(|tool| {
                let description = tool
                    .description
                    .unwrap_or_else(|| format!("JetBrains tool: {}", tool.name));
                json!({
                    "name": tool.name,
                    "description": description,
                    "inputSchema": tool.input_schema.unwrap_or_else(default_input_schema),
                })
            })
            .collect();
        json!({ "tools": tools })
    }

    async fn handle_tools_call(&self, params: Value) -> Result<Value, RpcError> {
        let params = params
            .as_object()
            .ok_or_else(|| RpcError::invalid_params("tools/call params must be an object"))?;

        let name = params
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| RpcError::invalid_params("tools/call requires string field 'name'"))?;

        let arguments = match params.get("arguments") {
            Some(Value::Object(map)) => Value::Object(map.clone()),
            Some(Value::Null) | None => json!({}),
            Some(_) => {
                return Err(RpcError::invalid_params(
                    "tools/call 'arguments' must be an object",
                ));
            }
        };

        match self.session.call_tool(name, arguments).await {
            Ok(result) => Ok(format_tool_result(result)),
            // Tool failures are part of the result contract, not faults.
            Err(err) => Ok(error_result(&err.to_string())),
        }
    }

    fn handle_resources_read(&self, params: &Value) -> Result<Value, RpcError> {
        let uri = params
            .get("uri")
            .and_then(Value::as_str)
            .ok_or_else(|| RpcError::invalid_params("resources/read requires string field 'uri'"))?;
        // No resources are bridged in this version.
        Err(RpcError::resource_not_found(uri))
    }
}

fn default_input_schema() -> Value {
    json!({
        "type": "object",
        "properties": {},
        "required": []
    })
}

/// Shape an upstream result for the downstream client: a pre-formatted
/// content envelope passes through unchanged; anything else becomes a
/// single text item.
fn format_tool_result(result: Value) -> Value {
    match result {
        Value::String(text) => text_result(text),
        Value::Object(map) => {
            if let Some(Value::Array(content)) = map.get("content") {
                return json!({ "content": content });
            }
            text_result(pretty_json(&Value::Object(map)))
        }
        raw @ Value::Array(_) => text_result(pretty_json(&raw)),
        other => text_result(other.to_string()),
    }
}

fn pretty_json(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}

fn text_result(text: impl Into<String>) -> Value {
    json!({
        "content": [{ "type": "text", "text": text.into() }]
    })
}

fn error_result(message: &str) -> Value {
    json!({
        "content": [{ "type": "text", "text": format!("Error: {message}") }],
        "isError": true
    })
}

#[derive(Debug)]
struct RpcError {
    code: i64,
    message: String,
    data: Option<Value>,
}

impl RpcError {
    fn invalid_request(message: impl Into<String>) -> Self {
        Self {
            code: -32600,
            message: message.into(),
            data: None,
        }
    }

    fn method_not_found(method: &str) -> Self {
        Self {
            code: -32601,
            message: format!("Method not found: {method}"),
            data: None,
        }
    }

    fn invalid_params(message: impl Into<String>) -> Self {
        Self {
            code: -32602,
            message: message.into(),
            data: None,
        }
    }

    fn resource_not_found(uri: &str) -> Self {
        Self {
            code: -32002,
            message: format!("Resource not found: {uri}"),
            data: Some(json!({ "uri": uri })),
        }
    }
}

fn success_response(id: Value, result: Value) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "result": result
    })
}

fn error_response(id: Value, error: RpcError) -> Value {
    let mut payload = json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": {
            "code": error.code,
            "message": error.message
        }
    });
    if let Some(data) = error.data {
        payload["error"]["data"] = data;
    }
    payload
}

async fn read_framed_json<R>(reader: &mut R) -> Result<Option<Value>, std::io::Error>
where
    R: AsyncBufRead + Unpin,
{
    let mut content_length: Option<usize> = None;

    loop {
        let mut line = String::new();
        let bytes_read = reader.read_line(&mut line).await?;
        if bytes_read == 0 {
            if content_length.is_none() {
                return Ok(None);
            }
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "Unexpected EOF while reading MCP headers",
            ));
        }

        if line == "\r\n" {
            break;
        }

        let line = line.trim_end_matches(['\r', '\n']);
        if line.to_ascii_lowercase().starts_with("content-length:") {
            let raw_len = line
                .split_once(':')
                .map(|(_, right)| right.trim())
                .unwrap_or_default();
            let parsed = raw_len.parse::<usize>().map_err(|_| {
                std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    "Invalid Content-Length header",
                )
            })?;
            content_length = Some(parsed);
        }
    }

    let content_length = content_length.ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "Missing Content-Length header",
        )
    })?;
    let mut payload = vec![0_u8; content_length];
    reader.read_exact(&mut payload).await?;

    let json: Value = serde_json::from_slice(&payload).map_err(|e| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("Invalid JSON payload: {e}"),
        )
    })?;
    Ok(Some(json))
}

async fn write_framed_json<W>(writer: &mut W, value: &Value) -> Result<(), std::io::Error>
where
    W: AsyncWrite + Unpin,
{
    let body = serde_json::to_vec(value).map_err(|e| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("Failed to serialize JSON: {e}"),
        )
    })?;
    let header = format!(
        "Content-Length: {}\r\nContent-Type: application/json\r\n\r\n",
        body.len()
    );
    writer.write_all(header.as_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upstream::Tool;

    fn server() -> McpServer {
        McpServer::new(Arc::new(ProxySession::new("http://127.0.0.1:64342")))
    }

    #[test]
    fn initialize_payload_announces_protocol_and_server() {
        let payload = server().initialize_payload();
        assert_eq!(
            payload.get("protocolVersion").and_then(Value::as_str),
            Some(MCP_PROTOCOL_VERSION)
        );
        assert_eq!(
            payload.pointer("/serverInfo/name").and_then(Value::as_str),
            Some(MCP_SERVER_NAME)
        );
        assert!(payload.pointer("/capabilities/tools").is_some());
        assert!(payload.pointer("/capabilities/resources").is_some());
    }

    #[tokio::test]
    async fn tools_list_defaults_description_and_schema() {
        let server = server();
        server.session.replace_tools(vec![
            Tool {
                name: "echo".to_string(),
                description: Some("Echoes input".to_string()),
                input_schema: None,
            },
            Tool {
                name: "bare".to_string(),
                description: None,
                input_schema: None,
            },
        ]);

        let payload = server.tools_list_payload().await;
        let tools = payload.get("tools").and_then(Value::as_array).unwrap();
        assert_eq!(tools.len(), 2);
        assert_eq!(
            tools[0].get("description").and_then(Value::as_str),
            Some("Echoes input")
        );
        assert_eq!(
            tools[1].get("description").and_then(Value::as_str),
            Some("JetBrains tool: bare")
        );
        assert_eq!(
            tools[1].get("inputSchema"),
            Some(&json!({"type": "object", "properties": {}, "required": []}))
        );
    }

    #[tokio::test]
    async fn tools_list_on_a_disconnected_session_serves_the_cache() {
        let payload = server().tools_list_payload().await;
        assert_eq!(payload, json!({ "tools": [] }));
    }

    #[tokio::test]
    async fn tools_call_while_disconnected_reports_in_band() {
        let result = server()
            .handle_tools_call(json!({ "name": "echo", "arguments": {} }))
            .await
            .expect("never a protocol fault");

        assert_eq!(result.get("isError"), Some(&json!(true)));
        let text = result
            .pointer("/content/0/text")
            .and_then(Value::as_str)
            .unwrap();
        assert_eq!(text, "Error: not connected to the JetBrains MCP proxy");
    }

    #[tokio::test]
    async fn tools_call_rejects_non_object_arguments() {
        let err = server()
            .handle_tools_call(json!({ "name": "echo", "arguments": 3 }))
            .await
            .expect_err("invalid params");
        assert_eq!(err.code, -32602);
    }

    #[test]
    fn content_envelopes_pass_through_unchanged() {
        let envelope = json!({
            "content": [
                { "type": "text", "text": "first" },
                { "type": "text", "text": "second" }
            ]
        });
        assert_eq!(format_tool_result(envelope.clone()), envelope);
    }

    #[test]
    fn bare_string_results_wrap_as_one_text_item() {
        let result = format_tool_result(json!("done"));
        assert_eq!(
            result,
            json!({ "content": [{ "type": "text", "text": "done" }] })
        );
    }

    #[test]
    fn structured_results_wrap_as_pretty_json_text() {
        let result = format_tool_result(json!({ "status": "ok" }));
        let text = result
            .pointer("/content/0/text")
            .and_then(Value::as_str)
            .unwrap();
        assert!(text.contains("\"status\": \"ok\""));
        let content = result.get("content").and_then(Value::as_array).unwrap();
        assert_eq!(content.len(), 1);
    }

    #[test]
    fn array_results_wrap_as_pretty_json_text() {
        let result = format_tool_result(json!([{ "file": "a.rs" }, { "file": "b.rs" }]));
        let text = result
            .pointer("/content/0/text")
            .and_then(Value::as_str)
            .unwrap();
        assert!(text.contains("\"file\": \"a.rs\""));
        assert!(text.contains('\n'));
        let content = result.get("content").and_then(Value::as_array).unwrap();
        assert_eq!(content.len(), 1);
    }

    #[test]
    fn resources_read_always_faults_with_the_uri() {
        let err = server()
            .handle_resources_read(&json!({ "uri": "jetbrains://whatever" }))
            .expect_err("structural fault");
        assert_eq!(err.code, -32002);
        assert!(err.message.contains("jetbrains://whatever"));
    }

    #[tokio::test]
    async fn unknown_methods_fault_with_method_not_found() {
        let response = server()
            .handle_single_message(json!({
                "jsonrpc": "2.0",
                "id": 1,
                "method": "sampling/createMessage"
            }))
            .await
            .expect("requests get responses");
        assert_eq!(
            response.pointer("/error/code").and_then(Value::as_i64),
            Some(-32601)
        );
    }

    #[tokio::test]
    async fn notifications_produce_no_response() {
        let response = server()
            .handle_single_message(json!({
                "jsonrpc": "2.0",
                "method": "notifications/initialized"
            }))
            .await;
        assert!(response.is_none());
    }

    #[tokio::test]
    async fn wrong_jsonrpc_version_is_rejected() {
        let response = server()
            .handle_single_message(json!({ "jsonrpc": "1.0", "id": 4, "method": "ping" }))
            .await
            .expect("invalid requests get error responses");
        assert_eq!(
            response.pointer("/error/code").and_then(Value::as_i64),
            Some(-32600)
        );
    }

    #[tokio::test]
    async fn batches_answer_each_request_in_order() {
        let responses = server()
            .handle_incoming_message(json!([
                { "jsonrpc": "2.0", "id": 1, "method": "ping" },
                { "jsonrpc": "2.0", "id": 2, "method": "resources/list" }
            ]))
            .await;
        assert_eq!(responses.len(), 2);
        assert_eq!(responses[0].get("id"), Some(&json!(1)));
        assert_eq!(
            responses[1].pointer("/result/resources"),
            Some(&json!([]))
        );
    }

    #[tokio::test]
    async fn framed_codec_round_trips() {
        let message = json!({ "jsonrpc": "2.0", "id": 1, "method": "ping" });
        let mut wire: Vec<u8> = Vec::new();
        write_framed_json(&mut wire, &message).await.unwrap();

        let mut reader = BufReader::new(wire.as_slice());
        let decoded = read_framed_json(&mut reader).await.unwrap();
        assert_eq!(decoded, Some(message));
        assert_eq!(read_framed_json(&mut reader).await.unwrap(), None);
    }
}
