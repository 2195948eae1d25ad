pub mod client;
pub mod stream;
pub mod upstream;

pub use client::{CHAT_PATH, CHECK_KEY_PATH, HttpChatTransport, HttpCredentialCheck, read_reply};
pub use stream::{DataStreamPart, decode_line, encode_part};
pub use upstream::{CompletionSource, SseEvent, UpstreamClient, parse_sse_line};
