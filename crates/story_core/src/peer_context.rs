use std::{collections::HashSet, sync::Arc};

use shared::domain::{Peer, PeerId, PeerPresence, StoryEntry, StoryId, StoryKey};
use storage::{PeerStoriesView, StoryLoader, StoryStore};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::{slice::StorySlice, AbortOnDrop};

/// Reconciles one peer's story collection into a [`StorySlice`]: confirmed
/// items merged with locally pending ones, a focused id resolved to a stable
/// index, neighbors recomputed from the current merged list on every pass.
///
/// A dedicated task owns all reconciliation state. It re-runs whenever the
/// store signals a change for this peer or the desired focus id is replaced;
/// the focus watch doubles as the change token that wakes the combined
/// computation.
pub struct PeerContext {
    peer_id: PeerId,
    focus_tx: watch::Sender<Option<StoryId>>,
    slice_rx: watch::Receiver<Option<StorySlice>>,
    ready_rx: watch::Receiver<bool>,
    _task: AbortOnDrop,
}

impl PeerContext {
    pub fn new(
        store: StoryStore,
        loader: Arc<dyn StoryLoader>,
        peer_id: PeerId,
        initial_focus: Option<StoryId>,
        load_radius: usize,
    ) -> Self {
        let (focus_tx, focus_rx) = watch::channel(initial_focus);
        let (slice_tx, slice_rx) = watch::channel(None);
        let (ready_tx, ready_rx) = watch::channel(false);
        let task = tokio::spawn(run(
            store, loader, peer_id, focus_rx, slice_tx, ready_tx, load_radius,
        ));
        Self {
            peer_id,
            focus_tx,
            slice_rx,
            ready_rx,
            _task: AbortOnDrop(task),
        }
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    /// Replaces the desired focus. `None` returns the context to the default
    /// focus rule on its next pass.
    pub fn set_focused_id(&self, id: Option<StoryId>) {
        let _ = self.focus_tx.send(id);
    }

    pub fn current_slice(&self) -> Option<StorySlice> {
        self.slice_rx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<StorySlice>> {
        self.slice_rx.clone()
    }

    /// One-way latch, set after the first reconciliation pass completes.
    pub fn subscribe_ready(&self) -> watch::Receiver<bool> {
        self.ready_rx.clone()
    }
}

struct ReconcileState {
    /// Focus resolved on the previous pass, or the externally commanded id.
    focused_id: Option<StoryId>,
    /// Merged id list from the previous pass, used to find the nearest
    /// surviving neighbor when the focused item is deleted.
    previous_ids: Vec<StoryId>,
    /// Placeholder keys already handed to the loader.
    requested_loads: HashSet<StoryKey>,
}

async fn run(
    store: StoryStore,
    loader: Arc<dyn StoryLoader>,
    peer_id: PeerId,
    mut focus_rx: watch::Receiver<Option<StoryId>>,
    slice_tx: watch::Sender<Option<StorySlice>>,
    ready_tx: watch::Sender<bool>,
    load_radius: usize,
) {
    let mut stories_rx = store.subscribe_stories(peer_id).await;
    let mut state = ReconcileState {
        focused_id: *focus_rx.borrow_and_update(),
        previous_ids: Vec::new(),
        requested_loads: HashSet::new(),
    };
    loop {
        reconcile(
            &store, &loader, peer_id, &mut state, &slice_tx, &ready_tx, load_radius,
        )
        .await;
        tokio::select! {
            changed = stories_rx.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            changed = focus_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                state.focused_id = *focus_rx.borrow_and_update();
            }
        }
    }
}

async fn reconcile(
    store: &StoryStore,
    loader: &Arc<dyn StoryLoader>,
    peer_id: PeerId,
    state: &mut ReconcileState,
    slice_tx: &watch::Sender<Option<StorySlice>>,
    ready_tx: &watch::Sender<bool>,
    load_radius: usize,
) {
    let view = store.peer_stories(peer_id).await;
    let peer = store
        .peer(peer_id)
        .await
        .unwrap_or_else(|| unloaded_peer(peer_id));

    // Pending ids are allocated above every server id, so appending keeps the
    // merged list ordered.
    let mut entries = view.entries.clone();
    entries.extend(view.pending.iter().cloned().map(StoryEntry::Item));
    let ids: Vec<StoryId> = entries.iter().map(StoryEntry::id).collect();

    let focus_index = resolve_focus_index(&ids, &entries, &view, state);
    let focused_id = focus_index.map(|index| ids[index]);
    let previous_id = focus_index
        .and_then(|index| index.checked_sub(1))
        .map(|index| ids[index]);
    let next_id = focus_index.and_then(|index| ids.get(index + 1).copied());
    let focused = focus_index.and_then(|index| entries[index].item().cloned());

    if let Some(index) = focus_index {
        request_placeholder_window(loader, peer_id, &entries, index, load_radius, state);
    }

    state.focused_id = focused_id;
    state.previous_ids = ids;

    let slice = StorySlice {
        peer,
        focused,
        focused_id,
        total_count: entries.len(),
        previous_id,
        next_id,
        entries,
    };
    slice_tx.send_if_modified(|current| {
        if current.as_ref() == Some(&slice) {
            false
        } else {
            *current = Some(slice);
            true
        }
    });
    ready_tx.send_if_modified(|ready| {
        if *ready {
            false
        } else {
            *ready = true;
            true
        }
    });
}

/// Focus resolution, in priority order: exact id match, pending-to-confirmed
/// remap, nearest preceding survivor from the previous list, then the default
/// rule (first pending, first unseen, first).
fn resolve_focus_index(
    ids: &[StoryId],
    entries: &[StoryEntry],
    view: &PeerStoriesView,
    state: &ReconcileState,
) -> Option<usize> {
    if ids.is_empty() {
        return None;
    }
    if let Some(want) = state.focused_id {
        if let Some(index) = ids.iter().position(|id| *id == want) {
            return Some(index);
        }
        if let Some(mapped) = view.remaps.get(&want) {
            if let Some(index) = ids.iter().position(|id| id == mapped) {
                return Some(index);
            }
        }
        if let Some(old_index) = state.previous_ids.iter().position(|id| *id == want) {
            for earlier in state.previous_ids[..old_index].iter().rev() {
                if let Some(index) = ids.iter().position(|id| id == earlier) {
                    return Some(index);
                }
            }
        }
        return Some(0);
    }
    if let Some(index) = entries
        .iter()
        .position(|entry| entry.item().is_some_and(|item| item.is_pending))
    {
        return Some(index);
    }
    if let Some(index) = ids.iter().position(|id| *id > view.max_read_id) {
        return Some(index);
    }
    Some(0)
}

fn request_placeholder_window(
    loader: &Arc<dyn StoryLoader>,
    peer_id: PeerId,
    entries: &[StoryEntry],
    focus_index: usize,
    load_radius: usize,
    state: &mut ReconcileState,
) {
    let start = focus_index.saturating_sub(load_radius);
    let end = (focus_index + load_radius).min(entries.len() - 1);
    let mut batch = Vec::new();
    for entry in &entries[start..=end] {
        if !entry.is_placeholder() {
            continue;
        }
        let key = StoryKey {
            peer_id,
            id: entry.id(),
        };
        if state.requested_loads.insert(key) {
            batch.push(key);
        }
    }
    if batch.is_empty() {
        return;
    }
    debug!(
        peer_id = peer_id.0,
        count = batch.len(),
        "requesting placeholder content"
    );
    let loader = Arc::clone(loader);
    tokio::spawn(async move {
        if let Err(err) = loader.load_stories(batch).await {
            warn!(peer_id = peer_id.0, error = %err, "placeholder load request failed");
        }
    });
}

/// Stand-in record while the peer itself has not been loaded; the slice is
/// still renderable and readiness is not held back.
pub(crate) fn unloaded_peer(peer_id: PeerId) -> Peer {
    Peer {
        id: peer_id,
        name: String::new(),
        notifications_muted: false,
        presence: PeerPresence::Hidden,
        can_send_voice_messages: false,
    }
}

#[cfg(test)]
#[path = "tests/peer_context_tests.rs"]
mod tests;
