use serde::{Deserialize, Serialize};

use crate::error::TranscriptError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    System,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::System => "system",
            Self::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscriptEntry {
    role: Role,
    text: String,
    placeholder: bool,
}

impl TranscriptEntry {
    pub fn new(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            text: text.into(),
            placeholder: false,
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Role::User, text)
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::new(Role::System, text)
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::new(Role::Assistant, text)
    }

    /// Assistant entry standing in for a reply that has not produced text yet.
    pub fn placeholder(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            text: text.into(),
            placeholder: true,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn is_placeholder(&self) -> bool {
        self.placeholder
    }
}

/// Ordered log of everything the terminal shows.
///
/// Entries are only ever appended, except that the trailing assistant entry may be
/// swapped in place while its reply streams, and `clear` drops everything.
#[derive(Debug, Default)]
pub struct TranscriptStore {
    entries: Vec<TranscriptEntry>,
    revision: u64,
}

impl TranscriptStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, entry: TranscriptEntry) -> usize {
        self.entries.push(entry);
        self.revision += 1;
        self.entries.len() - 1
    }

    pub fn replace_last(&mut self, entry: TranscriptEntry) -> Result<(), TranscriptError> {
        let last = self
            .entries
            .last_mut()
            .filter(|last| last.role == Role::Assistant)
            .ok_or(TranscriptError::NothingToReplace)?;
        *last = entry;
        self.revision += 1;
        Ok(())
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.revision += 1;
    }

    /// Drops placeholders left behind by a turn that never produced output.
    pub fn purge_placeholders(&mut self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|entry| !entry.placeholder);
        let removed = before - self.entries.len();
        if removed > 0 {
            self.revision += 1;
        }
        removed
    }

    pub fn entries(&self) -> &[TranscriptEntry] {
        &self.entries
    }

    pub fn last(&self) -> Option<&TranscriptEntry> {
        self.entries.last()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Bumps on every mutation; observers compare it to detect changes.
    pub fn revision(&self) -> u64 {
        self.revision
    }
}
