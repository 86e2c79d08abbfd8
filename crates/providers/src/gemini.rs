//! Google Gemini adapter.
//!
//! Implements the `generateContent` API. Auth is via an API key passed
//! as a query parameter (`key={api_key}`), so request URLs must never be
//! logged verbatim.

use serde_json::Value;

use fl_domain::chat::{ContentPart, Message, MessageContent, Role, ToolCall, ToolDefinition, Usage};
use fl_domain::{Error, Result};

use crate::traits::{ChatModel, ChatRequest, ChatResponse};
use crate::util::{from_reqwest, status_error};

pub struct GeminiModel {
    base_url: String,
    api_key: String,
    model: String,
    client: reqwest::Client,
}

impl GeminiModel {
    pub fn new(base_url: &str, api_key: String, model: String) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(120))
            .build()
            .map_err(from_reqwest)?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            model,
            client,
        })
    }

    fn generate_url(&self) -> String {
        format!(
            "{}/v1beta/models/{}:generateContent?key={}",
            self.base_url, self.model, self.api_key
        )
    }

    fn build_body(&self, req: &ChatRequest) -> Value {
        let mut contents: Vec<Value> = Vec::new();
        let mut system_instruction: Option<Value> = None;

        for msg in &req.messages {
            match msg.role {
                Role::System => {
                    let text = msg.content.extract_all_text();
                    system_instruction = Some(serde_json::json!({
                        "parts": [{"text": text}]
                    }));
                }
                Role::User => contents.push(serde_json::json!({
                    "role": "user",
                    "parts": [{"text": msg.content.extract_all_text()}],
                })),
                Role::Assistant => contents.push(assistant_to_gemini(msg)),
                Role::Tool => contents.push(tool_result_to_gemini(msg)),
            }
        }

        let mut body = serde_json::json!({ "contents": contents });
        if let Some(si) = system_instruction {
            body["systemInstruction"] = si;
        }
        if !req.tools.is_empty() {
            let decls: Vec<Value> = req.tools.iter().map(tool_to_gemini).collect();
            body["tools"] = serde_json::json!([{ "functionDeclarations": decls }]);
        }

        let mut gen_config = serde_json::json!({});
        if let Some(temp) = req.temperature {
            gen_config["temperature"] = serde_json::json!(temp);
        }
        if let Some(max) = req.max_tokens {
            gen_config["maxOutputTokens"] = serde_json::json!(max);
        }
        if gen_config.as_object().is_some_and(|o| !o.is_empty()) {
            body["generationConfig"] = gen_config;
        }
        body
    }
}

#[async_trait::async_trait]
impl ChatModel for GeminiModel {
    async fn complete(&self, req: &ChatRequest) -> Result<ChatResponse> {
        let resp = self
            .client
            .post(self.generate_url())
            .header("Content-Type", "application/json")
            .json(&self.build_body(req))
            .send()
            .await
            .map_err(from_reqwest)?;

        let status = resp.status();
        let body_text = resp.text().await.map_err(from_reqwest)?;
        if !status.is_success() {
            return Err(status_error("gemini", status, &body_text));
        }

        let body: Value = serde_json::from_str(&body_text)?;
        parse_gemini_response(&self.model, &body)
    }

    fn model_id(&self) -> &str {
        &self.model
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Serialization helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn assistant_to_gemini(msg: &Message) -> Value {
    let mut parts: Vec<Value> = Vec::new();
    match &msg.content {
        MessageContent::Text(t) => parts.push(serde_json::json!({"text": t})),
        MessageContent::Parts(ps) => {
            for p in ps {
                match p {
                    ContentPart::Text { text } => parts.push(serde_json::json!({"text": text})),
                    ContentPart::ToolUse { name, input, .. } => {
                        parts.push(serde_json::json!({
                            "functionCall": {"name": name, "args": input}
                        }));
                    }
                    _ => {}
                }
            }
        }
    }
    serde_json::json!({"role": "model", "parts": parts})
}

fn tool_result_to_gemini(msg: &Message) -> Value {
    if let MessageContent::Parts(parts) = &msg.content {
        for p in parts {
            if let ContentPart::ToolResult {
                tool_use_id,
                content,
                ..
            } = p
            {
                // Gemini matches function responses by name; the call id
                // doubles as the name on this path (set by the engine).
                return serde_json::json!({
                    "role": "user",
                    "parts": [{
                        "functionResponse": {
                            "name": tool_use_id,
                            "response": {"content": content},
                        }
                    }]
                });
            }
        }
    }
    serde_json::json!({"role": "user", "parts": [{"text": msg.content.extract_all_text()}]})
}

fn tool_to_gemini(tool: &ToolDefinition) -> Value {
    serde_json::json!({
        "name": tool.name,
        "description": tool.description,
        "parameters": tool.parameters,
    })
}

fn parse_gemini_response(model: &str, body: &Value) -> Result<ChatResponse> {
    let candidate = body
        .get("candidates")
        .and_then(|c| c.as_array())
        .and_then(|a| a.first())
        .ok_or_else(|| Error::LlmProtocol("gemini: no candidates in response".into()))?;

    let parts = candidate
        .pointer("/content/parts")
        .and_then(|p| p.as_array())
        .cloned()
        .unwrap_or_default();

    let mut content = String::new();
    let mut tool_calls = Vec::new();
    for (i, part) in parts.iter().enumerate() {
        if let Some(text) = part.get("text").and_then(|t| t.as_str()) {
            if !content.is_empty() {
                content.push('\n');
            }
            content.push_str(text);
        }
        if let Some(fc) = part.get("functionCall") {
            let name = fc
                .get("name")
                .and_then(|n| n.as_str())
                .unwrap_or_default()
                .to_string();
            tool_calls.push(ToolCall {
                call_id: format!("{name}#{i}"),
                tool_name: name,
                arguments: fc.get("args").cloned().unwrap_or(Value::Null),
            });
        }
    }

    let finish_reason = candidate
        .get("finishReason")
        .and_then(|v| v.as_str())
        .map(String::from);

    let usage = body.get("usageMetadata").map(|u| Usage {
        prompt_tokens: u
            .get("promptTokenCount")
            .and_then(|v| v.as_u64())
            .unwrap_or(0) as u32,
        completion_tokens: u
            .get("candidatesTokenCount")
            .and_then(|v| v.as_u64())
            .unwrap_or(0) as u32,
        total_tokens: u
            .get("totalTokenCount")
            .and_then(|v| v.as_u64())
            .unwrap_or(0) as u32,
    });

    Ok(ChatResponse {
        content,
        tool_calls,
        usage,
        model: model.to_string(),
        finish_reason,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_function_call() {
        let body = serde_json::json!({
            "candidates": [{
                "content": {
                    "parts": [
                        {"text": "Let me check the logs."},
                        {"functionCall": {"name": "logs.errors.loki", "args": {"service": "api-gw"}}}
                    ]
                },
                "finishReason": "STOP"
            }],
            "usageMetadata": {"promptTokenCount": 50, "candidatesTokenCount": 10, "totalTokenCount": 60}
        });
        let resp = parse_gemini_response("gemini-2.0-flash", &body).unwrap();
        assert_eq!(resp.tool_calls.len(), 1);
        assert_eq!(resp.tool_calls[0].tool_name, "logs.errors.loki");
        assert_eq!(resp.content, "Let me check the logs.");
        assert_eq!(resp.usage.unwrap().total_tokens, 60);
    }

    #[test]
    fn empty_candidates_is_protocol_error() {
        let body = serde_json::json!({"candidates": []});
        assert_eq!(
            parse_gemini_response("m", &body).unwrap_err().kind(),
            "llm_protocol"
        );
    }
}
