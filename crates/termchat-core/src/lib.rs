//! Session state machine for the terminal chat: command dispatch, credential
//! lifecycle, and reconciliation of streamed assistant replies into one transcript.

pub mod chat;
pub mod commands;
pub mod credential;
pub mod error;
pub mod reconcile;
pub mod session;
pub mod transcript;

pub use chat::{ChatMessage, ChatRequest, ChatTransport};
pub use commands::{Clock, CommandInterpreter, CommandOutcome, FixedClock, SystemClock};
pub use credential::{CredentialCheck, CredentialService, CredentialState, ResolutionTicket};
pub use error::{NotFoundError, TranscriptError, TransportError, ValidationError};
pub use reconcile::{StreamReconciler, StreamingTurn, TurnId};
pub use session::{
    Effect, FocusTarget, Notification, SessionController, SessionEvent, SessionState, Submission,
};
pub use transcript::{Role, TranscriptEntry, TranscriptStore};
