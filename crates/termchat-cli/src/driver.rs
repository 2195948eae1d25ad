use std::collections::VecDeque;
use std::io::{BufRead, Write};
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread;

use anyhow::Result;
use termchat_core::{
    ChatTransport, CredentialCheck, Effect, Notification, SessionController, SessionEvent,
    SessionState,
};
use tracing::{debug, warn};

use crate::render::TerminalRenderer;

/// Network side of an interactive session.
#[derive(Clone)]
pub struct Backends {
    pub check: Arc<dyn CredentialCheck>,
    pub transport: Arc<dyn ChatTransport>,
}

enum DriverEvent {
    Line(String),
    InputClosed,
    Session(SessionEvent),
}

/// A line plus the prompt it answered. Only lines typed at the key prompt
/// may become a credential.
enum Typed {
    Command(String),
    Credential(String),
}

/// Runs `controller` against line input until the input closes and no work is
/// left in flight.
///
/// Lines typed while a reply streams (or while the startup credential check is
/// still out) are held and submitted in order once the session is idle again.
/// A held line keeps the mode it was typed in, so a command typed before the
/// check resolved is never saved as the key.
pub fn run_session<R, W>(
    mut controller: SessionController,
    backends: Backends,
    input: R,
    renderer: &mut TerminalRenderer<W>,
) -> Result<()>
where
    R: BufRead + Send + 'static,
    W: Write,
{
    let (tx, rx) = mpsc::channel::<DriverEvent>();
    let (notes_tx, notes_rx) = mpsc::channel::<Notification>();
    controller.subscribe(move |note| {
        let _ = notes_tx.send(note.clone());
    });

    spawn_reader(input, tx.clone());
    let effects = controller.start();
    execute(&backends, &tx, effects);
    refresh(&controller, renderer, &notes_rx)?;

    let mut held = VecDeque::new();
    let mut input_closed = false;
    while let Ok(event) = rx.recv() {
        match event {
            DriverEvent::Line(line) => {
                renderer.line_entered(&line);
                let typed = if controller.state() == SessionState::AwaitingCredential {
                    Typed::Credential(line)
                } else {
                    Typed::Command(line)
                };
                held.push_back(typed);
            }
            DriverEvent::InputClosed => input_closed = true,
            DriverEvent::Session(event) => {
                let effects = controller.handle(event);
                execute(&backends, &tx, effects);
            }
        }

        while is_idle(&controller) {
            let Some(typed) = held.pop_front() else {
                break;
            };
            let effects = submit(&mut controller, typed);
            execute(&backends, &tx, effects);
            refresh(&controller, renderer, &notes_rx)?;
        }
        refresh(&controller, renderer, &notes_rx)?;

        if is_idle(&controller) {
            if input_closed {
                break;
            }
            renderer.prompt(controller.state())?;
        }
    }
    Ok(())
}

fn is_idle(controller: &SessionController) -> bool {
    controller.state() != SessionState::AwaitingReply && !controller.is_checking_credential()
}

fn submit(controller: &mut SessionController, typed: Typed) -> Vec<Effect> {
    match typed {
        Typed::Credential(secret) => controller.handle(SessionEvent::CredentialSubmitted(secret)),
        Typed::Command(line) => {
            controller.handle(SessionEvent::InputEdited(line));
            controller.handle(SessionEvent::InputSubmitted)
        }
    }
}

fn refresh<W: Write>(
    controller: &SessionController,
    renderer: &mut TerminalRenderer<W>,
    notes: &Receiver<Notification>,
) -> Result<()> {
    renderer.render(controller.entries(), controller.streaming_turn().is_some())?;
    for note in notes.try_iter() {
        match note {
            Notification::CredentialError(Some(message)) => renderer.notice(&message)?,
            Notification::StateChanged(state) => debug!(?state, "session state changed"),
            Notification::TranscriptChanged
            | Notification::CredentialError(None)
            | Notification::Focus(_) => {}
        }
    }
    Ok(())
}

fn execute(backends: &Backends, tx: &Sender<DriverEvent>, effects: Vec<Effect>) {
    for effect in effects {
        match effect {
            Effect::CheckCredential(ticket) => {
                let check = Arc::clone(&backends.check);
                let tx = tx.clone();
                thread::spawn(move || {
                    let result = check.has_server_credential();
                    let _ = tx.send(DriverEvent::Session(SessionEvent::CredentialChecked {
                        ticket,
                        result,
                    }));
                });
            }
            Effect::SendChat(request) => {
                let transport = Arc::clone(&backends.transport);
                let tx = tx.clone();
                thread::spawn(move || {
                    let turn = request.turn;
                    let result = transport.stream(&request, &mut |text| {
                        let _ = tx.send(DriverEvent::Session(SessionEvent::ChatSnapshot {
                            turn,
                            text: text.to_string(),
                        }));
                    });
                    let event = match result {
                        Ok(()) => SessionEvent::ChatCompleted { turn },
                        Err(error) => SessionEvent::ChatFailed { turn, error },
                    };
                    let _ = tx.send(DriverEvent::Session(event));
                });
            }
        }
    }
}

fn spawn_reader<R: BufRead + Send + 'static>(input: R, tx: Sender<DriverEvent>) {
    thread::spawn(move || {
        for line in input.lines() {
            match line {
                Ok(line) => {
                    if tx.send(DriverEvent::Line(line)).is_err() {
                        return;
                    }
                }
                Err(err) => {
                    warn!(error = %err, "stopped reading input");
                    break;
                }
            }
        }
        let _ = tx.send(DriverEvent::InputClosed);
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{self, BufReader, Read};
    use std::sync::Mutex;
    use std::thread::JoinHandle;
    use std::time::{Duration, Instant};

    use termchat_core::session::ENTER_KEY_FIRST;
    use termchat_core::{ChatRequest, CommandInterpreter, CredentialService, TransportError};
    use termchat_keystore::{KeyStore, KeyStoreError};

    const KEY_PROMPT: &str = "OpenAI API Key not found. Please enter your key:";

    struct FixedCheck(Result<bool, TransportError>);

    impl CredentialCheck for FixedCheck {
        fn has_server_credential(&self) -> Result<bool, TransportError> {
            self.0.clone()
        }
    }

    /// Answers "no server key" only after a delay, like a slow network.
    struct SlowCheck(Duration);

    impl CredentialCheck for SlowCheck {
        fn has_server_credential(&self) -> Result<bool, TransportError> {
            thread::sleep(self.0);
            Ok(false)
        }
    }

    #[derive(Default)]
    struct ScriptedTransport {
        requests: Mutex<Vec<ChatRequest>>,
    }

    impl ChatTransport for ScriptedTransport {
        fn stream(
            &self,
            request: &ChatRequest,
            on_snapshot: &mut dyn FnMut(&str),
        ) -> Result<(), TransportError> {
            self.requests.lock().expect("requests").push(request.clone());
            on_snapshot("Hi");
            on_snapshot("Hi there");
            Ok(())
        }
    }

    #[derive(Clone, Default)]
    struct SharedStore(Arc<Mutex<Option<String>>>);

    impl SharedStore {
        fn seeded(secret: &str) -> Self {
            Self(Arc::new(Mutex::new(Some(secret.to_string()))))
        }

        fn value(&self) -> Option<String> {
            self.0.lock().expect("store lock").clone()
        }
    }

    impl KeyStore for SharedStore {
        fn get(&self) -> Result<Option<String>, KeyStoreError> {
            Ok(self.value())
        }

        fn set(&mut self, secret: &str) -> Result<(), KeyStoreError> {
            *self.0.lock().expect("store lock") = Some(secret.to_string());
            Ok(())
        }

        fn remove(&mut self) -> Result<(), KeyStoreError> {
            *self.0.lock().expect("store lock") = None;
            Ok(())
        }
    }

    #[derive(Clone, Default)]
    struct SharedOutput(Arc<Mutex<Vec<u8>>>);

    impl SharedOutput {
        fn text(&self) -> String {
            String::from_utf8(self.0.lock().expect("output lock").clone()).expect("utf8")
        }
    }

    impl Write for SharedOutput {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().expect("output lock").extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    /// Stdin stand-in fed one line at a time; EOF once the sender is dropped.
    struct ChannelInput {
        lines: Receiver<String>,
        pending: Vec<u8>,
        offset: usize,
    }

    impl Read for ChannelInput {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.offset == self.pending.len() {
                let Ok(line) = self.lines.recv() else {
                    return Ok(0);
                };
                self.pending = format!("{line}\n").into_bytes();
                self.offset = 0;
            }
            let count = buf.len().min(self.pending.len() - self.offset);
            buf[..count].copy_from_slice(&self.pending[self.offset..self.offset + count]);
            self.offset += count;
            Ok(count)
        }
    }

    struct Terminal {
        lines: Option<Sender<String>>,
        output: SharedOutput,
        transport: Arc<ScriptedTransport>,
        session: JoinHandle<()>,
    }

    impl Terminal {
        fn open(check: impl CredentialCheck + 'static, store: SharedStore) -> Self {
            let (lines, receiver) = mpsc::channel();
            let output = SharedOutput::default();
            let transport = Arc::new(ScriptedTransport::default());
            let backends = Backends {
                check: Arc::new(check),
                transport: transport.clone(),
            };
            let out = output.clone();
            let session = thread::spawn(move || {
                let controller = SessionController::new(
                    CredentialService::new(Box::new(store)),
                    CommandInterpreter::with_defaults(),
                );
                let input = ChannelInput {
                    lines: receiver,
                    pending: Vec::new(),
                    offset: 0,
                };
                let mut renderer = TerminalRenderer::new(out, false);
                run_session(controller, backends, BufReader::new(input), &mut renderer)
                    .expect("session");
            });
            Self {
                lines: Some(lines),
                output,
                transport,
                session,
            }
        }

        fn type_line(&self, line: &str) {
            if let Some(lines) = &self.lines {
                lines.send(line.to_string()).expect("session reading input");
            }
        }

        fn wait_for(&self, needle: &str) {
            let deadline = Instant::now() + Duration::from_secs(5);
            while !self.output.text().contains(needle) {
                assert!(
                    Instant::now() < deadline,
                    "timed out waiting for {needle:?}; output so far:\n{}",
                    self.output.text()
                );
                thread::sleep(Duration::from_millis(10));
            }
        }

        /// Closes input and waits for the session to wind down.
        fn close(mut self) -> (String, Arc<ScriptedTransport>) {
            self.lines.take();
            self.session.join().expect("session thread");
            (self.output.text(), self.transport)
        }
    }

    #[test]
    fn key_prompt_then_chat() {
        let store = SharedStore::default();
        let terminal = Terminal::open(FixedCheck(Ok(false)), store.clone());
        terminal.wait_for(KEY_PROMPT);
        terminal.type_line("sk-test-123456");
        terminal.type_line("hello");
        let (output, transport) = terminal.close();

        assert!(output.contains("$ API Key saved successfully.\n"));
        assert!(output.contains("> hello\n$ Hi there\n"));
        assert_eq!(store.value().as_deref(), Some("sk-test-123456"));
        let requests = transport.requests.lock().expect("requests");
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].api_key.as_deref(), Some("sk-test-123456"));
    }

    #[test]
    fn blank_key_reports_inline_error() {
        let terminal = Terminal::open(FixedCheck(Ok(false)), SharedStore::default());
        terminal.wait_for(KEY_PROMPT);
        terminal.type_line("");
        let (output, transport) = terminal.close();

        assert!(output.contains("$ Please enter a valid API Key.\n"));
        assert!(transport.requests.lock().expect("requests").is_empty());
    }

    #[test]
    fn command_typed_during_a_slow_check_is_not_saved_as_the_key() {
        let store = SharedStore::default();
        let terminal = Terminal::open(SlowCheck(Duration::from_millis(200)), store.clone());
        terminal.type_line("help");
        terminal.wait_for(ENTER_KEY_FIRST);
        assert_eq!(store.value(), None);

        terminal.type_line("sk-typed-at-prompt");
        terminal.wait_for("API Key saved successfully.");
        let (output, _) = terminal.close();

        let prompt = output.find(KEY_PROMPT).expect("key prompt");
        let typed = output.find("> help\n").expect("held command");
        let rejected = output.find(ENTER_KEY_FIRST).expect("rejection");
        assert!(prompt < typed && typed < rejected);
        assert_eq!(store.value().as_deref(), Some("sk-typed-at-prompt"));
    }

    #[test]
    fn server_key_skips_prompt_and_sends_no_key() {
        let terminal = Terminal::open(FixedCheck(Ok(true)), SharedStore::seeded("sk-stale"));
        terminal.type_line("help");
        terminal.type_line("what is rust?");
        let (output, transport) = terminal.close();

        assert!(!output.contains("Please enter your key"));
        assert!(output.contains("> help\n$ Available commands:"));
        assert!(output.contains("> what is rust?\n$ Hi there\n"));
        let requests = transport.requests.lock().expect("requests");
        assert_eq!(requests[0].api_key, None);
    }

    #[test]
    fn lines_after_chat_wait_for_the_reply() {
        let terminal = Terminal::open(
            FixedCheck(Err(TransportError::Request("offline".to_string()))),
            SharedStore::seeded("sk-local-key"),
        );
        terminal.type_line("first");
        terminal.type_line("second");
        let (output, transport) = terminal.close();

        let first = output.find("> first").expect("first line");
        let second = output.find("> second").expect("second line");
        let reply = output[first..].find("$ Hi there").expect("reply") + first;
        assert!(reply < second);
        let requests = transport.requests.lock().expect("requests");
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[1].messages.len(), 3);
    }
}
