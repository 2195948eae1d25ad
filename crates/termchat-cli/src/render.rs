use std::io::{self, Write};

use termchat_core::{Role, SessionState, TranscriptEntry};

const CLEAR_SCREEN: &str = "\x1b[2J\x1b[H";
const CLEAR_LINE: &str = "\r\x1b[2K";

/// Writes transcript entries to a line terminal as they appear.
///
/// Entries are printed once, in order. The entry owned by an open streaming
/// turn is written incrementally and only newline-terminated once the turn
/// closes. A transcript that shrinks is treated as a `clear`.
pub struct TerminalRenderer<W: Write> {
    out: W,
    show_prompts: bool,
    committed: usize,
    live: Option<String>,
    prompt_visible: bool,
    typed: Option<String>,
}

impl<W: Write> TerminalRenderer<W> {
    /// `show_prompts` is for a human at a tty. Without it, user lines are
    /// echoed back since nobody typed them on screen.
    pub fn new(out: W, show_prompts: bool) -> Self {
        Self {
            out,
            show_prompts,
            committed: 0,
            live: None,
            prompt_visible: false,
            typed: None,
        }
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    pub fn render(&mut self, entries: &[TranscriptEntry], streaming: bool) -> io::Result<()> {
        let shown = self.committed + usize::from(self.live.is_some());
        if entries.len() < shown || (self.live.is_some() && entries.len() <= self.committed) {
            self.clear_screen()?;
        }

        while self.committed < entries.len() {
            let index = self.committed;
            let entry = &entries[index];
            if streaming && index + 1 == entries.len() {
                if !entry.is_placeholder() {
                    self.write_partial(entry)?;
                }
                break;
            }
            self.finish_entry(entry)?;
            self.committed += 1;
        }
        self.out.flush()
    }

    /// Records that the user typed `line` at a visible prompt, so the matching
    /// transcript entry is already on screen.
    pub fn line_entered(&mut self, line: &str) {
        if self.prompt_visible {
            self.typed = Some(line.trim().to_string());
        }
        self.prompt_visible = false;
    }

    pub fn prompt(&mut self, state: SessionState) -> io::Result<()> {
        if !self.show_prompts || self.prompt_visible || self.live.is_some() {
            return Ok(());
        }
        let text = match state {
            SessionState::AwaitingCredential => "API Key: ",
            SessionState::AwaitingCommand => "> ",
            SessionState::AwaitingReply => return Ok(()),
        };
        write!(self.out, "{text}")?;
        self.prompt_visible = true;
        self.out.flush()
    }

    /// Out-of-band message that is not part of the transcript.
    pub fn notice(&mut self, message: &str) -> io::Result<()> {
        self.break_prompt()?;
        if self.live.take().is_some() {
            writeln!(self.out)?;
        }
        writeln!(self.out, "$ {message}")?;
        self.out.flush()
    }

    fn finish_entry(&mut self, entry: &TranscriptEntry) -> io::Result<()> {
        if entry.is_placeholder() {
            return Ok(());
        }
        if entry.role() == Role::User
            && let Some(typed) = self.typed.take()
            && typed == entry.text()
        {
            return Ok(());
        }
        self.break_prompt()?;
        let text = entry.text();
        match self.live.take() {
            Some(written) if entry.role() == Role::Assistant && text.starts_with(&written) => {
                writeln!(self.out, "{}", &text[written.len()..])
            }
            Some(_) => {
                writeln!(self.out)?;
                writeln!(self.out, "{} {text}", marker(entry.role()))
            }
            None => writeln!(self.out, "{} {text}", marker(entry.role())),
        }
    }

    fn write_partial(&mut self, entry: &TranscriptEntry) -> io::Result<()> {
        let text = entry.text();
        match self.live.take() {
            Some(written) if text.starts_with(&written) => {
                write!(self.out, "{}", &text[written.len()..])?;
            }
            Some(_) => {
                writeln!(self.out)?;
                write!(self.out, "{} {text}", marker(entry.role()))?;
            }
            None => {
                self.break_prompt()?;
                write!(self.out, "{} {text}", marker(entry.role()))?;
            }
        }
        self.live = Some(text.to_string());
        Ok(())
    }

    fn break_prompt(&mut self) -> io::Result<()> {
        if self.prompt_visible {
            write!(self.out, "{CLEAR_LINE}")?;
            self.prompt_visible = false;
        }
        Ok(())
    }

    fn clear_screen(&mut self) -> io::Result<()> {
        write!(self.out, "{CLEAR_SCREEN}")?;
        self.committed = 0;
        self.live = None;
        self.prompt_visible = false;
        self.typed = None;
        Ok(())
    }
}

fn marker(role: Role) -> &'static str {
    match role {
        Role::User => ">",
        Role::System | Role::Assistant => "$",
    }
}
