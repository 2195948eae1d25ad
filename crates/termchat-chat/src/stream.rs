//! Line-oriented reply stream spoken between `termchat serve` and the client.
//!
//! Every line is `<code>:<json>`: `0` carries a text delta, `3` a terminal
//! error message, `d` the finish record. Unknown codes are skipped so the
//! server can grow new part types without breaking older clients.

use serde::{Deserialize, Serialize};
use termchat_core::TransportError;

pub const DATA_STREAM_HEADER: &str = "x-vercel-ai-data-stream";
pub const DATA_STREAM_VERSION: &str = "v1";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataStreamPart {
    Text(String),
    Error(String),
    Finish(FinishRecord),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinishRecord {
    pub finish_reason: String,
}

impl DataStreamPart {
    pub fn finish(reason: impl Into<String>) -> Self {
        Self::Finish(FinishRecord {
            finish_reason: reason.into(),
        })
    }
}

/// Encodes one part as a newline-terminated line.
pub fn encode_part(part: &DataStreamPart) -> String {
    // Serializing a String or a plain struct cannot fail.
    let (code, payload) = match part {
        DataStreamPart::Text(text) => ("0", serde_json::to_string(text)),
        DataStreamPart::Error(message) => ("3", serde_json::to_string(message)),
        DataStreamPart::Finish(record) => ("d", serde_json::to_string(record)),
    };
    format!("{code}:{}\n", payload.unwrap_or_else(|_| "null".to_string()))
}

pub fn decode_line(line: &str) -> Result<Option<DataStreamPart>, TransportError> {
    let line = line.trim_end_matches(['\r', '\n']);
    if line.trim().is_empty() {
        return Ok(None);
    }
    let (code, payload) = line
        .split_once(':')
        .ok_or_else(|| TransportError::Malformed(format!("stream line without code: {line}")))?;
    let part = match code {
        "0" => DataStreamPart::Text(parse_payload(code, payload)?),
        "3" => DataStreamPart::Error(parse_payload(code, payload)?),
        "d" => DataStreamPart::Finish(parse_payload(code, payload)?),
        _ => return Ok(None),
    };
    Ok(Some(part))
}

fn parse_payload<T: for<'de> Deserialize<'de>>(code: &str, payload: &str) -> Result<T, TransportError> {
    serde_json::from_str(payload)
        .map_err(|err| TransportError::Malformed(format!("bad `{code}` part: {err}")))
}
