use std::io::{BufRead, BufReader};
use std::ops::ControlFlow;
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::blocking::Client;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue};
use serde_json::{Value, json};
use termchat_common::ModelConfig;
use termchat_core::{ChatMessage, TransportError};
use tracing::debug;

/// Something that can produce a streamed completion for a conversation.
///
/// `on_delta` returns [`ControlFlow::Break`] once nobody is listening; the
/// source then stops reading and returns `Ok(())`.
pub trait CompletionSource: Send + Sync {
    fn stream_completion(
        &self,
        messages: &[ChatMessage],
        api_key: &str,
        on_delta: &mut dyn FnMut(&str) -> ControlFlow<()>,
    ) -> Result<(), TransportError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseEvent {
    Delta(String),
    Error(String),
    Done,
}

/// Interprets one line of an OpenAI-style chat completions SSE body.
pub fn parse_sse_line(line: &str) -> Option<SseEvent> {
    let payload = line.trim().strip_prefix("data:")?.trim();
    if payload.is_empty() {
        return None;
    }
    if payload == "[DONE]" {
        return Some(SseEvent::Done);
    }
    let value: Value = serde_json::from_str(payload).ok()?;
    if let Some(error) = value.get("error") {
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("upstream error")
            .to_string();
        return Some(SseEvent::Error(message));
    }
    let delta = value
        .get("choices")
        .and_then(|choices| choices.get(0))
        .and_then(|choice| choice.get("delta"))
        .and_then(|delta| delta.get("content"))
        .and_then(Value::as_str)?;
    if delta.is_empty() {
        return None;
    }
    Some(SseEvent::Delta(delta.to_string()))
}

/// OpenAI-compatible chat completions client used by the relay server.
#[derive(Debug, Clone)]
pub struct UpstreamClient {
    client: Client,
    endpoint: String,
    model_id: String,
    system_prompt: String,
}

impl UpstreamClient {
    pub fn new(model: &ModelConfig, timeout_ms: u64) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let client = Client::builder()
            .timeout(Duration::from_millis(timeout_ms))
            .default_headers(headers)
            .build()
            .with_context(|| "failed to build upstream HTTP client")?;
        Ok(Self {
            client,
            endpoint: model.endpoint.trim_end_matches('/').to_string(),
            model_id: model.model_id.clone(),
            system_prompt: model.system_prompt.clone(),
        })
    }

    fn request_body(&self, messages: &[ChatMessage]) -> Value {
        let mut wire = vec![json!({ "role": "system", "content": self.system_prompt })];
        wire.extend(
            messages
                .iter()
                .map(|message| json!({ "role": message.role.as_str(), "content": message.content })),
        );
        json!({
            "model": self.model_id,
            "stream": true,
            "messages": wire,
        })
    }
}

impl CompletionSource for UpstreamClient {
    fn stream_completion(
        &self,
        messages: &[ChatMessage],
        api_key: &str,
        on_delta: &mut dyn FnMut(&str) -> ControlFlow<()>,
    ) -> Result<(), TransportError> {
        let auth = HeaderValue::from_str(&format!("Bearer {}", api_key.trim()))
            .map_err(|_| TransportError::Request("api key is not a valid header value".into()))?;
        let response = self
            .client
            .post(format!("{}/chat/completions", self.endpoint))
            .header(AUTHORIZATION, auth)
            .json(&self.request_body(messages))
            .send()
            .map_err(|err| TransportError::Request(err.to_string()))?;
        if !response.status().is_success() {
            let code = response.status().as_u16();
            let body = response.text().unwrap_or_default();
            return Err(TransportError::Status { code, body });
        }

        let reader = BufReader::new(response);
        for line in reader.lines() {
            let line = line.map_err(|err| TransportError::Stream(err.to_string()))?;
            match parse_sse_line(&line) {
                Some(SseEvent::Delta(delta)) => {
                    if on_delta(&delta).is_break() {
                        debug!(model = %self.model_id, "listener gone, dropping upstream stream");
                        return Ok(());
                    }
                }
                Some(SseEvent::Error(message)) => return Err(TransportError::Stream(message)),
                Some(SseEvent::Done) => {
                    debug!(model = %self.model_id, "upstream stream finished");
                    return Ok(());
                }
                None => {}
            }
        }
        // Some compatible servers close the body without a [DONE] sentinel.
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delta_lines_yield_content() {
        let line = r#"data: {"choices":[{"delta":{"content":"hel"}}]}"#;
        assert_eq!(parse_sse_line(line), Some(SseEvent::Delta("hel".to_string())));
    }

    #[test]
    fn role_only_and_comment_lines_are_ignored() {
        assert_eq!(
            parse_sse_line(r#"data: {"choices":[{"delta":{"role":"assistant"}}]}"#),
            None
        );
        assert_eq!(parse_sse_line(": keep-alive"), None);
        assert_eq!(parse_sse_line(""), None);
    }

    #[test]
    fn done_and_error_are_terminal() {
        assert_eq!(parse_sse_line("data: [DONE]"), Some(SseEvent::Done));
        assert_eq!(
            parse_sse_line(r#"data: {"error":{"message":"rate limited"}}"#),
            Some(SseEvent::Error("rate limited".to_string()))
        );
    }

    #[test]
    fn request_body_prepends_system_prompt() {
        let client = UpstreamClient::new(&ModelConfig::default(), 1_000).expect("client");
        let body = client.request_body(&[ChatMessage::user("hi")]);
        assert_eq!(body["stream"], json!(true));
        assert_eq!(body["model"], json!("gpt-4o-mini"));
        assert_eq!(body["messages"][0]["role"], json!("system"));
        assert_eq!(body["messages"][1], json!({"role": "user", "content": "hi"}));
    }
}
