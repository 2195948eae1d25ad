use tracing::{debug, info, warn};

use crate::chat::{ChatMessage, ChatRequest};
use crate::commands::{CLEARKEY_RESPONSE, CommandInterpreter, CommandOutcome};
use crate::credential::{CredentialService, CredentialState, KEY_SAVED, ResolutionTicket};
use crate::error::{TransportError, ValidationError};
use crate::reconcile::{StreamReconciler, StreamingTurn, TurnClosed, TurnId};
use crate::transcript::{TranscriptEntry, TranscriptStore};

pub const WELCOME_LINE: &str = "Welcome to the terminal! Type \"help\" for available commands.";
pub const ENTER_KEY_FIRST: &str = "Please enter your API Key above first.";
pub const STILL_CHECKING: &str =
    "Still checking whether the server has an API key. Try again in a moment.";
pub const INVALID_KEY: &str = "Please enter a valid API Key.";
pub const NO_KEY_STORED: &str = "No API Key stored in local storage.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    AwaitingCredential,
    AwaitingCommand,
    AwaitingReply,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FocusTarget {
    CommandInput,
    CredentialInput,
}

/// Pushed to subscribers whenever observable session state moves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    TranscriptChanged,
    StateChanged(SessionState),
    CredentialError(Option<String>),
    Focus(FocusTarget),
}

/// Work the driver must perform; results come back as [`SessionEvent`]s.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    CheckCredential(ResolutionTicket),
    SendChat(ChatRequest),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Submission {
    /// Blank line, nothing happened.
    Empty,
    /// A reply is streaming; the line stays in the input buffer.
    Blocked,
    Accepted(Vec<Effect>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    CredentialChecked {
        ticket: ResolutionTicket,
        result: Result<bool, TransportError>,
    },
    InputEdited(String),
    InputSubmitted,
    CredentialInputEdited,
    CredentialSubmitted(String),
    ChatSnapshot {
        turn: TurnId,
        text: String,
    },
    ChatCompleted {
        turn: TurnId,
    },
    ChatFailed {
        turn: TurnId,
        error: TransportError,
    },
}

type Listener = Box<dyn FnMut(&Notification) + Send>;

#[derive(Clone, Copy)]
struct Observed {
    revision: u64,
    state: SessionState,
}

pub struct SessionController {
    transcript: TranscriptStore,
    credentials: CredentialService,
    interpreter: CommandInterpreter,
    reconciler: StreamReconciler,
    history: Vec<ChatMessage>,
    input: String,
    credential_error: Option<String>,
    listeners: Vec<Listener>,
}

impl SessionController {
    pub fn new(credentials: CredentialService, interpreter: CommandInterpreter) -> Self {
        let mut transcript = TranscriptStore::new();
        transcript.append(TranscriptEntry::system(WELCOME_LINE));
        Self {
            transcript,
            credentials,
            interpreter,
            reconciler: StreamReconciler::new(),
            history: Vec::new(),
            input: String::new(),
            credential_error: None,
            listeners: Vec::new(),
        }
    }

    /// Kicks off credential resolution for a fresh session.
    pub fn start(&mut self) -> Vec<Effect> {
        vec![Effect::CheckCredential(self.credentials.begin_resolution())]
    }

    pub fn subscribe(&mut self, listener: impl FnMut(&Notification) + Send + 'static) {
        self.listeners.push(Box::new(listener));
    }

    pub fn state(&self) -> SessionState {
        if self.reconciler.is_open() {
            SessionState::AwaitingReply
        } else if self.credentials.is_resolved()
            && *self.credentials.state() == CredentialState::Missing
        {
            SessionState::AwaitingCredential
        } else {
            SessionState::AwaitingCommand
        }
    }

    pub fn transcript(&self) -> &TranscriptStore {
        &self.transcript
    }

    pub fn entries(&self) -> &[TranscriptEntry] {
        self.transcript.entries()
    }

    pub fn credential_state(&self) -> &CredentialState {
        self.credentials.state()
    }

    /// True while a server credential check is outstanding.
    pub fn is_checking_credential(&self) -> bool {
        self.credentials.is_resolving()
    }

    pub fn input(&self) -> &str {
        &self.input
    }

    pub fn credential_error(&self) -> Option<&str> {
        self.credential_error.as_deref()
    }

    pub fn history(&self) -> &[ChatMessage] {
        &self.history
    }

    pub fn streaming_turn(&self) -> Option<&StreamingTurn> {
        self.reconciler.current()
    }

    pub fn handle(&mut self, event: SessionEvent) -> Vec<Effect> {
        match event {
            SessionEvent::CredentialChecked { ticket, result } => {
                self.credential_checked(ticket, result);
                Vec::new()
            }
            SessionEvent::InputEdited(text) => {
                self.edit_input(text);
                Vec::new()
            }
            SessionEvent::InputSubmitted => match self.submit_input() {
                Submission::Accepted(effects) => effects,
                Submission::Empty | Submission::Blocked => Vec::new(),
            },
            SessionEvent::CredentialInputEdited => {
                self.edit_credential_input();
                Vec::new()
            }
            SessionEvent::CredentialSubmitted(secret) => {
                let _ = self.submit_credential(&secret);
                Vec::new()
            }
            SessionEvent::ChatSnapshot { turn, text } => {
                self.chat_snapshot(turn, &text);
                Vec::new()
            }
            SessionEvent::ChatCompleted { turn } => {
                self.chat_completed(turn);
                Vec::new()
            }
            SessionEvent::ChatFailed { turn, error } => {
                self.chat_failed(turn, &error);
                Vec::new()
            }
        }
    }

    pub fn credential_checked(
        &mut self,
        ticket: ResolutionTicket,
        result: Result<bool, TransportError>,
    ) {
        let before = self.observe();
        if let Some(resolution) = self.credentials.complete_resolution(ticket, result)
            && let Some(prompt) = resolution.prompt
        {
            self.transcript.append(TranscriptEntry::system(prompt));
        }
        self.publish(before);
    }

    /// Input edits are always accepted, even while a reply streams.
    pub fn edit_input(&mut self, text: impl Into<String>) {
        self.input = text.into();
    }

    pub fn submit_input(&mut self) -> Submission {
        let state = self.state();
        if state == SessionState::AwaitingReply {
            debug!("holding input until the current reply finishes");
            return Submission::Blocked;
        }
        let line = self.input.trim().to_string();
        if line.is_empty() {
            return Submission::Empty;
        }

        let before = self.observe();
        self.input.clear();
        let effects = match state {
            SessionState::AwaitingCredential => {
                self.transcript.append(TranscriptEntry::user(&line));
                self.transcript.append(TranscriptEntry::system(ENTER_KEY_FIRST));
                Vec::new()
            }
            _ => self.run_line(line),
        };
        self.publish(before);
        Submission::Accepted(effects)
    }

    /// Convenience for drivers that deliver whole lines.
    pub fn submit_line(&mut self, line: impl Into<String>) -> Submission {
        self.edit_input(line);
        self.submit_input()
    }

    pub fn edit_credential_input(&mut self) {
        if self.credential_error.take().is_some() {
            self.emit(Notification::CredentialError(None));
        }
    }

    pub fn submit_credential(&mut self, secret: &str) -> Result<CredentialState, ValidationError> {
        let before = self.observe();
        match self.credentials.submit(secret) {
            Ok(state) => {
                self.edit_credential_input();
                self.transcript.append(TranscriptEntry::system(KEY_SAVED));
                let changed = before.state != self.state();
                self.publish(before);
                if !changed {
                    self.emit(Notification::Focus(FocusTarget::CommandInput));
                }
                Ok(state)
            }
            Err(err) => {
                let message = match err {
                    ValidationError::Empty => INVALID_KEY.to_string(),
                    ValidationError::ServerManaged => err.to_string(),
                };
                self.credential_error = Some(message.clone());
                self.emit(Notification::CredentialError(Some(message)));
                Err(err)
            }
        }
    }

    pub fn chat_snapshot(&mut self, turn: TurnId, text: &str) {
        let before = self.observe();
        self.reconciler
            .apply_snapshot(turn, text, &mut self.transcript);
        self.publish(before);
    }

    pub fn chat_completed(&mut self, turn: TurnId) {
        let before = self.observe();
        if let Some(TurnClosed::Reply(text)) = self.reconciler.complete(turn, &mut self.transcript)
        {
            self.history.push(ChatMessage::assistant(text));
        }
        self.publish(before);
    }

    pub fn chat_failed(&mut self, turn: TurnId, error: &TransportError) {
        let before = self.observe();
        let message = format!("Error: {error}");
        if self
            .reconciler
            .fail(turn, &message, &mut self.transcript)
            .is_some()
        {
            warn!(turn = %turn, error = %error, "chat turn failed");
        }
        self.publish(before);
    }

    fn run_line(&mut self, line: String) -> Vec<Effect> {
        self.transcript.append(TranscriptEntry::user(&line));
        match self.interpreter.interpret(&line) {
            CommandOutcome::Literal(text) => {
                self.transcript.append(TranscriptEntry::system(text));
            }
            CommandOutcome::ClearTranscript => {
                self.transcript.clear();
                self.input.clear();
            }
            CommandOutcome::ShowSecret => {
                let text = match self.credentials.masked_secret() {
                    Some(masked) => format!("Stored API Key: {masked}"),
                    None => NO_KEY_STORED.to_string(),
                };
                self.transcript.append(TranscriptEntry::system(text));
            }
            CommandOutcome::ClearSecret => {
                self.credentials.clear();
                self.transcript
                    .append(TranscriptEntry::system(CLEARKEY_RESPONSE));
            }
            CommandOutcome::Unrecognized(text) => return self.start_turn(text),
        }
        Vec::new()
    }

    fn start_turn(&mut self, text: String) -> Vec<Effect> {
        if !self.credentials.is_resolved() {
            self.transcript.append(TranscriptEntry::system(STILL_CHECKING));
            return Vec::new();
        }
        // A resolved `Missing` session is in `AwaitingCredential`, which
        // `submit_input` answers before any line reaches this point.
        let api_key = self.credentials.state().api_key().map(str::to_string);
        let Some(turn) = self.reconciler.begin(&mut self.transcript) else {
            return Vec::new();
        };
        self.history.push(ChatMessage::user(text));
        info!(turn = %turn, messages = self.history.len(), "forwarding input to chat");
        vec![Effect::SendChat(ChatRequest {
            turn,
            messages: self.history.clone(),
            api_key,
        })]
    }

    fn observe(&self) -> Observed {
        Observed {
            revision: self.transcript.revision(),
            state: self.state(),
        }
    }

    fn publish(&mut self, before: Observed) {
        if self.transcript.revision() != before.revision {
            self.emit(Notification::TranscriptChanged);
        }
        let state = self.state();
        if state != before.state {
            debug!(?state, "session state changed");
            self.emit(Notification::StateChanged(state));
            match state {
                SessionState::AwaitingCommand => {
                    self.emit(Notification::Focus(FocusTarget::CommandInput));
                }
                SessionState::AwaitingCredential => {
                    self.emit(Notification::Focus(FocusTarget::CredentialInput));
                }
                SessionState::AwaitingReply => {}
            }
        }
    }

    fn emit(&mut self, notification: Notification) {
        for listener in &mut self.listeners {
            listener(&notification);
        }
    }
}
