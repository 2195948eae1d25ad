use thiserror::Error;

/// Rejected credential submission. Surfaced next to the credential input, never in the transcript.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("empty")]
    Empty,
    #[error("the server already supplies an API key")]
    ServerManaged,
}

/// Failure talking to the credential check or the chat backend.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("request failed: {0}")]
    Request(String),
    #[error("backend returned {code}: {body}")]
    Status { code: u16, body: String },
    #[error("malformed response: {0}")]
    Malformed(String),
    #[error("stream failed: {0}")]
    Stream(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NotFoundError {
    #[error("Project {0} not found. Type 'projects' to see the list.")]
    Project(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TranscriptError {
    #[error("no assistant entry at the end of the transcript to replace")]
    NothingToReplace,
}
