use std::io::{BufRead, BufReader};
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::blocking::Client;
use reqwest::header::{ACCEPT, HeaderMap, HeaderValue};
use serde::{Deserialize, Serialize};
use termchat_core::{ChatMessage, ChatRequest, ChatTransport, CredentialCheck, TransportError};
use tracing::debug;

use crate::stream::{DataStreamPart, decode_line};

pub const CHECK_KEY_PATH: &str = "/api/check-key";
pub const CHAT_PATH: &str = "/api/terminal-chat";

#[derive(Debug, Deserialize)]
struct CheckKeyResponse {
    #[serde(rename = "hasApiKey", alias = "hasCredential")]
    has_api_key: bool,
}

#[derive(Debug, Serialize)]
pub struct ChatRequestBody<'a> {
    pub messages: &'a [ChatMessage],
    #[serde(rename = "apiKey", skip_serializing_if = "Option::is_none")]
    pub api_key: Option<&'a str>,
}

fn build_client(timeout_ms: u64) -> Result<Client> {
    let mut headers = HeaderMap::new();
    headers.insert(ACCEPT, HeaderValue::from_static("application/json, text/plain"));
    Client::builder()
        .timeout(Duration::from_millis(timeout_ms))
        .default_headers(headers)
        .build()
        .with_context(|| "failed to build termchat HTTP client")
}

fn join_url(base_url: &str, path: &str) -> String {
    format!("{}{path}", base_url.trim_end_matches('/'))
}

/// Asks a termchat server whether it holds its own provider key.
#[derive(Debug, Clone)]
pub struct HttpCredentialCheck {
    client: Client,
    url: String,
}

impl HttpCredentialCheck {
    pub fn new(base_url: &str, timeout_ms: u64) -> Result<Self> {
        Ok(Self {
            client: build_client(timeout_ms)?,
            url: join_url(base_url, CHECK_KEY_PATH),
        })
    }
}

impl CredentialCheck for HttpCredentialCheck {
    fn has_server_credential(&self) -> Result<bool, TransportError> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .map_err(|err| TransportError::Request(err.to_string()))?;
        if !response.status().is_success() {
            let code = response.status().as_u16();
            let body = response.text().unwrap_or_default();
            return Err(TransportError::Status { code, body });
        }
        let parsed = response
            .json::<CheckKeyResponse>()
            .map_err(|err| TransportError::Malformed(err.to_string()))?;
        debug!(has_api_key = parsed.has_api_key, "credential check answered");
        Ok(parsed.has_api_key)
    }
}

/// Streams replies from a termchat server's chat relay.
#[derive(Debug, Clone)]
pub struct HttpChatTransport {
    client: Client,
    url: String,
}

impl HttpChatTransport {
    pub fn new(base_url: &str, timeout_ms: u64) -> Result<Self> {
        Ok(Self {
            client: build_client(timeout_ms)?,
            url: join_url(base_url, CHAT_PATH),
        })
    }
}

impl ChatTransport for HttpChatTransport {
    fn stream(
        &self,
        request: &ChatRequest,
        on_snapshot: &mut dyn FnMut(&str),
    ) -> Result<(), TransportError> {
        let body = ChatRequestBody {
            messages: &request.messages,
            api_key: request.api_key.as_deref(),
        };
        let response = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .map_err(|err| TransportError::Request(err.to_string()))?;
        if !response.status().is_success() {
            let code = response.status().as_u16();
            let body = response.text().unwrap_or_default();
            return Err(TransportError::Status { code, body });
        }

        read_reply(BufReader::new(response), on_snapshot)
    }
}

/// Folds a data stream into cumulative snapshots. The stream must end with a
/// finish part; a body that just stops counts as a failure.
pub fn read_reply(
    reader: impl BufRead,
    on_snapshot: &mut dyn FnMut(&str),
) -> Result<(), TransportError> {
    let mut accumulated = String::new();
    for line in reader.lines() {
        let line = line.map_err(|err| TransportError::Stream(err.to_string()))?;
        match decode_line(&line)? {
            Some(DataStreamPart::Text(delta)) => {
                if delta.is_empty() {
                    continue;
                }
                accumulated.push_str(&delta);
                on_snapshot(&accumulated);
            }
            Some(DataStreamPart::Error(message)) => return Err(TransportError::Stream(message)),
            Some(DataStreamPart::Finish(record)) => {
                debug!(reason = %record.finish_reason, chars = accumulated.len(), "reply finished");
                return Ok(());
            }
            None => {}
        }
    }
    Err(TransportError::Stream(
        "stream closed without a finish signal".to_string(),
    ))
}
