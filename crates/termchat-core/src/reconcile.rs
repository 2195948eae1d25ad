use std::fmt;

use tracing::debug;
use uuid::Uuid;

use crate::transcript::{Role, TranscriptEntry, TranscriptStore};

pub const PLACEHOLDER_TEXT: &str = "Thinking...";
pub const EMPTY_REPLY_TEXT: &str = "The assistant returned an empty response.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TurnId(Uuid);

impl TurnId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TurnId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TurnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// The assistant reply currently being streamed.
#[derive(Debug, Clone)]
pub struct StreamingTurn {
    id: TurnId,
    accumulated_text: String,
    is_open: bool,
    entry_index: Option<usize>,
    snapshots: usize,
}

impl StreamingTurn {
    pub fn id(&self) -> TurnId {
        self.id
    }

    pub fn accumulated_text(&self) -> &str {
        &self.accumulated_text
    }

    pub fn is_open(&self) -> bool {
        self.is_open
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnapshotApplied {
    Replaced,
    Appended,
    /// Snapshot belonged to a turn that is no longer open.
    Stale,
}

/// How a turn ended, handed back so the caller can record history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnClosed {
    Reply(String),
    Empty,
    Failed,
}

/// Folds cumulative snapshots of one assistant reply into a single transcript entry.
#[derive(Debug, Default)]
pub struct StreamReconciler {
    turn: Option<StreamingTurn>,
}

impl StreamReconciler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Option<&StreamingTurn> {
        self.turn.as_ref().filter(|turn| turn.is_open)
    }

    pub fn is_open(&self) -> bool {
        self.current().is_some()
    }

    /// Opens a turn behind a fresh placeholder. Leftover placeholders go first.
    /// Returns `None` while another turn is still open.
    pub fn begin(&mut self, transcript: &mut TranscriptStore) -> Option<TurnId> {
        if self.is_open() {
            return None;
        }
        let purged = transcript.purge_placeholders();
        if purged > 0 {
            debug!(purged, "purged stale placeholders");
        }
        let entry_index = transcript.append(TranscriptEntry::placeholder(PLACEHOLDER_TEXT));
        let turn = StreamingTurn {
            id: TurnId::new(),
            accumulated_text: String::new(),
            is_open: true,
            entry_index: Some(entry_index),
            snapshots: 0,
        };
        let id = turn.id;
        self.turn = Some(turn);
        debug!(turn = %id, "turn opened");
        Some(id)
    }

    pub fn apply_snapshot(
        &mut self,
        id: TurnId,
        text: &str,
        transcript: &mut TranscriptStore,
    ) -> SnapshotApplied {
        let Some(turn) = self.open_turn_mut(id) else {
            debug!(turn = %id, "ignoring snapshot for closed turn");
            return SnapshotApplied::Stale;
        };
        turn.accumulated_text = text.to_string();
        turn.snapshots += 1;

        let entry = TranscriptEntry::assistant(text);
        if owns_last_entry(turn, transcript) && transcript.replace_last(entry.clone()).is_ok() {
            return SnapshotApplied::Replaced;
        }
        turn.entry_index = Some(transcript.append(entry));
        SnapshotApplied::Appended
    }

    /// Closes the turn on a normal end of stream. A turn that never produced
    /// text leaves a notice where its placeholder was.
    pub fn complete(&mut self, id: TurnId, transcript: &mut TranscriptStore) -> Option<TurnClosed> {
        let turn = self.open_turn_mut(id)?;
        turn.is_open = false;
        if turn.snapshots > 0 && !turn.accumulated_text.is_empty() {
            debug!(turn = %id, snapshots = turn.snapshots, "turn completed");
            return Some(TurnClosed::Reply(turn.accumulated_text.clone()));
        }
        settle_last(turn, transcript, TranscriptEntry::system(EMPTY_REPLY_TEXT));
        debug!(turn = %id, "turn completed without output");
        Some(TurnClosed::Empty)
    }

    /// Closes the turn on a transport error, swapping its entry for `message`.
    pub fn fail(
        &mut self,
        id: TurnId,
        message: &str,
        transcript: &mut TranscriptStore,
    ) -> Option<TurnClosed> {
        let turn = self.open_turn_mut(id)?;
        turn.is_open = false;
        settle_last(turn, transcript, TranscriptEntry::system(message));
        debug!(turn = %id, "turn failed");
        Some(TurnClosed::Failed)
    }

    fn open_turn_mut(&mut self, id: TurnId) -> Option<&mut StreamingTurn> {
        self.turn
            .as_mut()
            .filter(|turn| turn.is_open && turn.id == id)
    }
}

fn owns_last_entry(turn: &StreamingTurn, transcript: &TranscriptStore) -> bool {
    let last_index = transcript.len().checked_sub(1);
    turn.entry_index.is_some()
        && turn.entry_index == last_index
        && transcript
            .last()
            .is_some_and(|entry| entry.role() == Role::Assistant)
}

fn settle_last(turn: &StreamingTurn, transcript: &mut TranscriptStore, entry: TranscriptEntry) {
    if owns_last_entry(turn, transcript) && transcript.replace_last(entry.clone()).is_ok() {
        return;
    }
    transcript.append(entry);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cumulative_snapshots_collapse_into_one_entry() {
        let mut transcript = TranscriptStore::new();
        transcript.append(TranscriptEntry::user("hi"));
        let mut reconciler = StreamReconciler::new();
        let turn = reconciler.begin(&mut transcript).expect("turn");

        assert_eq!(
            reconciler.apply_snapshot(turn, "Hi", &mut transcript),
            SnapshotApplied::Replaced
        );
        reconciler.apply_snapshot(turn, "Hi there", &mut transcript);
        reconciler.apply_snapshot(turn, "Hi there!", &mut transcript);
        assert_eq!(
            reconciler.complete(turn, &mut transcript),
            Some(TurnClosed::Reply("Hi there!".to_string()))
        );

        let assistant: Vec<&TranscriptEntry> = transcript
            .entries()
            .iter()
            .filter(|entry| entry.role() == Role::Assistant)
            .collect();
        assert_eq!(assistant.len(), 1);
        assert_eq!(assistant[0].text(), "Hi there!");
        assert_eq!(transcript.len(), 2);
        assert!(!reconciler.is_open());
    }

    #[test]
    fn only_one_turn_open_at_a_time() {
        let mut transcript = TranscriptStore::new();
        let mut reconciler = StreamReconciler::new();
        let first = reconciler.begin(&mut transcript).expect("turn");
        assert_eq!(reconciler.begin(&mut transcript), None);
        reconciler.complete(first, &mut transcript);
        assert!(reconciler.begin(&mut transcript).is_some());
    }

    #[test]
    fn snapshots_after_close_are_stale() {
        let mut transcript = TranscriptStore::new();
        let mut reconciler = StreamReconciler::new();
        let turn = reconciler.begin(&mut transcript).expect("turn");
        reconciler.apply_snapshot(turn, "done", &mut transcript);
        reconciler.complete(turn, &mut transcript);

        assert_eq!(
            reconciler.apply_snapshot(turn, "done and more", &mut transcript),
            SnapshotApplied::Stale
        );
        assert_eq!(transcript.last().map(TranscriptEntry::text), Some("done"));
        assert_eq!(reconciler.complete(turn, &mut transcript), None);
    }

    #[test]
    fn failure_replaces_placeholder_with_error() {
        let mut transcript = TranscriptStore::new();
        let mut reconciler = StreamReconciler::new();
        let turn = reconciler.begin(&mut transcript).expect("turn");
        reconciler.apply_snapshot(turn, "partial", &mut transcript);

        assert_eq!(
            reconciler.fail(turn, "Error: boom", &mut transcript),
            Some(TurnClosed::Failed)
        );
        assert_eq!(transcript.len(), 1);
        let last = transcript.last().expect("entry");
        assert_eq!(last.role(), Role::System);
        assert_eq!(last.text(), "Error: boom");
    }

    #[test]
    fn empty_reply_leaves_no_placeholder() {
        let mut transcript = TranscriptStore::new();
        let mut reconciler = StreamReconciler::new();
        let turn = reconciler.begin(&mut transcript).expect("turn");
        assert_eq!(
            reconciler.complete(turn, &mut transcript),
            Some(TurnClosed::Empty)
        );
        assert!(transcript.entries().iter().all(|entry| !entry.is_placeholder()));
        assert_eq!(transcript.last().map(TranscriptEntry::text), Some(EMPTY_REPLY_TEXT));
    }

    #[test]
    fn begin_purges_leftover_placeholders() {
        let mut transcript = TranscriptStore::new();
        transcript.append(TranscriptEntry::placeholder(PLACEHOLDER_TEXT));
        transcript.append(TranscriptEntry::user("next"));
        let mut reconciler = StreamReconciler::new();
        reconciler.begin(&mut transcript).expect("turn");

        let placeholders = transcript
            .entries()
            .iter()
            .filter(|entry| entry.is_placeholder())
            .count();
        assert_eq!(placeholders, 1);
        assert_eq!(transcript.len(), 2);
        assert!(transcript.last().is_some_and(TranscriptEntry::is_placeholder));
    }

    #[test]
    fn snapshot_appends_when_turn_no_longer_owns_the_tail() {
        let mut transcript = TranscriptStore::new();
        let mut reconciler = StreamReconciler::new();
        let turn = reconciler.begin(&mut transcript).expect("turn");
        transcript.clear();

        assert_eq!(
            reconciler.apply_snapshot(turn, "Hi", &mut transcript),
            SnapshotApplied::Appended
        );
        assert_eq!(
            reconciler.apply_snapshot(turn, "Hi there", &mut transcript),
            SnapshotApplied::Replaced
        );
        assert_eq!(transcript.len(), 1);
    }
}
