use serde::Serialize;
use shared::domain::{Peer, StoryEntry, StoryId, StoryItem};

/// Display-ready snapshot of one peer's story focus: the peer, the resolved
/// focused item, its list-adjacent neighbors, and the full ordered entry
/// list. Superseded wholesale on every reconciliation pass.
#[derive(Debug, Clone, Serialize)]
pub struct StorySlice {
    pub peer: Peer,
    /// The focused item's content, absent while the focus rests on a
    /// placeholder or the list is empty.
    pub focused: Option<StoryItem>,
    pub focused_id: Option<StoryId>,
    pub total_count: usize,
    pub previous_id: Option<StoryId>,
    pub next_id: Option<StoryId>,
    pub entries: Vec<StoryEntry>,
}

impl StorySlice {
    pub fn focused_index(&self) -> Option<usize> {
        let focused_id = self.focused_id?;
        self.entries.iter().position(|entry| entry.id() == focused_id)
    }
}

/// Structural equality over peer identity and entry identity only, so change
/// detection never deep-compares item content.
impl PartialEq for StorySlice {
    fn eq(&self, other: &Self) -> bool {
        self.peer.id == other.peer.id
            && self.focused_id == other.focused_id
            && self.entries.len() == other.entries.len()
            && self
                .entries
                .iter()
                .zip(&other.entries)
                .all(|(left, right)| left.identity() == right.identity())
    }
}

/// The coalesced three-slice view published to consumers: the central peer
/// plus its warm previous/next neighbors.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StoryFeedState {
    pub previous: Option<StorySlice>,
    pub current: Option<StorySlice>,
    pub next: Option<StorySlice>,
}
