use std::{
    collections::{BTreeMap, HashMap, HashSet},
    ops::Range,
    sync::{Arc, Mutex as StdMutex, MutexGuard},
};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shared::{
    domain::{
        MediaId, MediaReference, Peer, PeerId, StoryEntry, StoryId, StoryItem, StoryKey,
        StorySubscription, PENDING_STORY_ID_BASE,
    },
    error::StoreError,
};
use tokio::sync::{watch, Mutex};
use tracing::debug;

/// In-memory, change-notifying story/peer store. Every mutation bumps a
/// per-peer story version and the subscriptions version; consumers hold
/// `watch` receivers and re-read snapshots when a version changes.
#[derive(Clone)]
pub struct StoryStore {
    inner: Arc<Mutex<StoreInner>>,
}

struct StoreInner {
    peers: HashMap<PeerId, Peer>,
    peers_notify: watch::Sender<u64>,
    stories: HashMap<PeerId, PeerStories>,
    subscription_order: Vec<PeerId>,
    subscriptions_notify: watch::Sender<u64>,
    next_pending_id: i32,
}

struct PeerStories {
    entries: BTreeMap<StoryId, StoryEntry>,
    pending: Vec<StoryItem>,
    max_read_id: StoryId,
    remaps: HashMap<StoryId, StoryId>,
    notify: watch::Sender<u64>,
}

impl PeerStories {
    fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
            pending: Vec::new(),
            max_read_id: StoryId(0),
            remaps: HashMap::new(),
            notify: watch::channel(0).0,
        }
    }

    fn has_unseen(&self) -> bool {
        self.entries
            .keys()
            .next_back()
            .is_some_and(|last| *last > self.max_read_id)
    }

    fn bump(&self) {
        let next = *self.notify.borrow() + 1;
        let _ = self.notify.send(next);
    }
}

/// Point-in-time snapshot of one peer's story state, ordered by ascending id.
#[derive(Debug, Clone)]
pub struct PeerStoriesView {
    pub entries: Vec<StoryEntry>,
    pub pending: Vec<StoryItem>,
    pub max_read_id: StoryId,
    pub remaps: HashMap<StoryId, StoryId>,
}

impl Default for StoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl StoryStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(StoreInner {
                peers: HashMap::new(),
                peers_notify: watch::channel(0).0,
                stories: HashMap::new(),
                subscription_order: Vec::new(),
                subscriptions_notify: watch::channel(0).0,
                next_pending_id: PENDING_STORY_ID_BASE.0,
            })),
        }
    }

    pub async fn upsert_peer(&self, peer: Peer) {
        let mut guard = self.inner.lock().await;
        let peer_id = peer.id;
        guard.peers.insert(peer_id, peer);
        bump(&guard.peers_notify);
        if let Some(stories) = guard.stories.get(&peer_id) {
            stories.bump();
        }
    }

    pub async fn peer(&self, peer_id: PeerId) -> Option<Peer> {
        let guard = self.inner.lock().await;
        guard.peers.get(&peer_id).cloned()
    }

    pub async fn subscribe_peers(&self) -> watch::Receiver<u64> {
        let guard = self.inner.lock().await;
        guard.peers_notify.subscribe()
    }

    /// Replaces a peer's confirmed story list wholesale. Pending items, the
    /// read watermark, and the remap table are preserved.
    pub async fn set_stories(&self, peer_id: PeerId, items: Vec<StoryItem>) {
        let mut guard = self.inner.lock().await;
        let stories = guard.stories.entry(peer_id).or_insert_with(PeerStories::new);
        stories.entries = items
            .into_iter()
            .map(|item| (item.id, StoryEntry::Item(item)))
            .collect();
        debug!(
            peer_id = peer_id.0,
            count = stories.entries.len(),
            "replaced story list"
        );
        stories.bump();
        bump(&guard.subscriptions_notify);
    }

    pub async fn insert_placeholder(
        &self,
        peer_id: PeerId,
        id: StoryId,
        timestamp: DateTime<Utc>,
    ) {
        let mut guard = self.inner.lock().await;
        let stories = guard.stories.entry(peer_id).or_insert_with(PeerStories::new);
        stories
            .entries
            .entry(id)
            .or_insert(StoryEntry::Placeholder { id, timestamp });
        stories.bump();
        bump(&guard.subscriptions_notify);
    }

    /// Fills a placeholder with fetched content. The placeholder must exist;
    /// fully loaded entries are overwritten only by `set_stories`.
    pub async fn resolve_placeholder(
        &self,
        peer_id: PeerId,
        item: StoryItem,
    ) -> Result<(), StoreError> {
        let mut guard = self.inner.lock().await;
        let key = item.key(peer_id);
        let stories = guard
            .stories
            .get_mut(&peer_id)
            .ok_or(StoreError::UnknownPeer(peer_id))?;
        match stories.entries.get_mut(&item.id) {
            Some(entry) if entry.is_placeholder() => {
                *entry = StoryEntry::Item(item);
                stories.bump();
                bump(&guard.subscriptions_notify);
                Ok(())
            }
            Some(_) => Ok(()),
            None => Err(StoreError::UnknownStory(key)),
        }
    }

    /// Registers a locally authored story. Assigns the next local id (above
    /// `PENDING_STORY_ID_BASE`) and returns it.
    pub async fn add_pending(&self, peer_id: PeerId, mut item: StoryItem) -> StoryId {
        let mut guard = self.inner.lock().await;
        let local_id = StoryId(guard.next_pending_id);
        guard.next_pending_id += 1;
        item.id = local_id;
        item.is_pending = true;
        let stories = guard.stories.entry(peer_id).or_insert_with(PeerStories::new);
        stories.pending.push(item);
        stories.bump();
        bump(&guard.subscriptions_notify);
        local_id
    }

    /// Completes a pending story's upload: the local entry is replaced by the
    /// server-confirmed item and the local id is remapped to the new id.
    pub async fn commit_pending(
        &self,
        peer_id: PeerId,
        local_id: StoryId,
        mut confirmed: StoryItem,
    ) -> Result<(), StoreError> {
        let mut guard = self.inner.lock().await;
        let stories = guard
            .stories
            .get_mut(&peer_id)
            .ok_or(StoreError::UnknownPeer(peer_id))?;
        let position = stories
            .pending
            .iter()
            .position(|item| item.id == local_id)
            .ok_or(StoreError::NotPending(StoryKey {
                peer_id,
                id: local_id,
            }))?;
        stories.pending.remove(position);
        confirmed.is_pending = false;
        debug!(
            peer_id = peer_id.0,
            local_id = local_id.0,
            confirmed_id = confirmed.id.0,
            "pending story confirmed"
        );
        stories.remaps.insert(local_id, confirmed.id);
        stories.entries.insert(confirmed.id, StoryEntry::Item(confirmed));
        stories.bump();
        bump(&guard.subscriptions_notify);
        Ok(())
    }

    pub async fn delete_story(&self, key: StoryKey) {
        let mut guard = self.inner.lock().await;
        let Some(stories) = guard.stories.get_mut(&key.peer_id) else {
            return;
        };
        let removed_entry = stories.entries.remove(&key.id).is_some();
        let pending_len = stories.pending.len();
        stories.pending.retain(|item| item.id != key.id);
        if removed_entry || stories.pending.len() != pending_len {
            stories.bump();
            bump(&guard.subscriptions_notify);
        }
    }

    /// Advances the peer's read watermark. The watermark is monotonic; marking
    /// an already-seen id is a no-op.
    pub async fn mark_seen(&self, key: StoryKey) {
        let mut guard = self.inner.lock().await;
        let stories = guard
            .stories
            .entry(key.peer_id)
            .or_insert_with(PeerStories::new);
        if key.id > stories.max_read_id {
            stories.max_read_id = key.id;
            stories.bump();
            bump(&guard.subscriptions_notify);
        }
    }

    pub async fn peer_stories(&self, peer_id: PeerId) -> PeerStoriesView {
        let guard = self.inner.lock().await;
        match guard.stories.get(&peer_id) {
            Some(stories) => PeerStoriesView {
                entries: stories.entries.values().cloned().collect(),
                pending: stories.pending.clone(),
                max_read_id: stories.max_read_id,
                remaps: stories.remaps.clone(),
            },
            None => PeerStoriesView {
                entries: Vec::new(),
                pending: Vec::new(),
                max_read_id: StoryId(0),
                remaps: HashMap::new(),
            },
        }
    }

    pub async fn subscribe_stories(&self, peer_id: PeerId) -> watch::Receiver<u64> {
        let mut guard = self.inner.lock().await;
        guard
            .stories
            .entry(peer_id)
            .or_insert_with(PeerStories::new)
            .notify
            .subscribe()
    }

    pub async fn set_subscription_order(&self, order: Vec<PeerId>) {
        let mut guard = self.inner.lock().await;
        guard.subscription_order = order;
        bump(&guard.subscriptions_notify);
    }

    /// The subscriptions feed: peers from the configured order that currently
    /// have at least one story, with derived unseen/pending flags.
    pub async fn subscriptions(&self) -> Vec<StorySubscription> {
        let guard = self.inner.lock().await;
        guard
            .subscription_order
            .iter()
            .filter_map(|peer_id| {
                let stories = guard.stories.get(peer_id)?;
                if stories.entries.is_empty() && stories.pending.is_empty() {
                    return None;
                }
                Some(StorySubscription {
                    peer_id: *peer_id,
                    has_unseen: stories.has_unseen(),
                    has_pending: !stories.pending.is_empty(),
                })
            })
            .collect()
    }

    pub async fn subscribe_subscriptions(&self) -> watch::Receiver<u64> {
        let guard = self.inner.lock().await;
        guard.subscriptions_notify.subscribe()
    }
}

fn bump(notify: &watch::Sender<u64>) {
    let next = *notify.borrow() + 1;
    let _ = notify.send(next);
}

/// Fetch urgency for speculative media loads; lower values run sooner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FetchPriority(pub u32);

#[async_trait]
pub trait MediaFetcher: Send + Sync {
    /// Fetches a media resource into the local cache, optionally restricted
    /// to a byte range. Resolves once the requested bytes are cached.
    async fn fetch(
        &self,
        media: MediaReference,
        priority: FetchPriority,
        range: Option<Range<u64>>,
    ) -> Result<()>;

    /// Extracts and caches the first frame of a video resource.
    async fn extract_first_frame(&self, media: MediaReference) -> Result<()>;
}

#[async_trait]
pub trait StoryLoader: Send + Sync {
    /// Requests content for placeholder entries by key.
    async fn load_stories(&self, keys: Vec<StoryKey>) -> Result<()>;

    /// Requests fresh view-receipt metadata for one story.
    async fn refresh_story_views(&self, key: StoryKey) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRecord {
    pub media_id: MediaId,
    pub priority: FetchPriority,
    pub range: Option<Range<u64>>,
}

/// Recording fetcher. In gated mode a fetch stays live until its media id is
/// released, so callers can observe which fetch tasks are still running and
/// that cancelled tasks leave the live set.
pub struct MemoryMediaFetcher {
    gated: bool,
    state: StdMutex<FetcherState>,
    release_notify: watch::Sender<u64>,
}

#[derive(Default)]
struct FetcherState {
    started: Vec<FetchRecord>,
    active: HashSet<MediaId>,
    released: HashSet<MediaId>,
    first_frames: Vec<MediaId>,
}

impl Default for MemoryMediaFetcher {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryMediaFetcher {
    /// Fetches resolve immediately.
    pub fn new() -> Self {
        Self {
            gated: false,
            state: StdMutex::new(FetcherState::default()),
            release_notify: watch::channel(0).0,
        }
    }

    /// Fetches stay live until released.
    pub fn gated() -> Self {
        Self {
            gated: true,
            ..Self::new()
        }
    }

    pub fn release(&self, media_id: MediaId) {
        self.state_guard().released.insert(media_id);
        bump(&self.release_notify);
    }

    pub fn release_all(&self) {
        {
            let mut state = self.state_guard();
            let active: Vec<MediaId> = state.active.iter().copied().collect();
            state.released.extend(active);
        }
        bump(&self.release_notify);
    }

    /// Media ids with a live fetch, sorted for stable assertions.
    pub fn active(&self) -> Vec<MediaId> {
        let mut ids: Vec<MediaId> = self.state_guard().active.iter().copied().collect();
        ids.sort();
        ids
    }

    pub fn started(&self) -> Vec<FetchRecord> {
        self.state_guard().started.clone()
    }

    pub fn first_frames(&self) -> Vec<MediaId> {
        self.state_guard().first_frames.clone()
    }

    fn state_guard(&self) -> MutexGuard<'_, FetcherState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

struct LiveFetchGuard<'a> {
    fetcher: &'a MemoryMediaFetcher,
    media_id: MediaId,
}

impl Drop for LiveFetchGuard<'_> {
    fn drop(&mut self) {
        self.fetcher.state_guard().active.remove(&self.media_id);
    }
}

#[async_trait]
impl MediaFetcher for MemoryMediaFetcher {
    async fn fetch(
        &self,
        media: MediaReference,
        priority: FetchPriority,
        range: Option<Range<u64>>,
    ) -> Result<()> {
        let mut release_rx = self.release_notify.subscribe();
        {
            let mut state = self.state_guard();
            state.started.push(FetchRecord {
                media_id: media.media_id,
                priority,
                range,
            });
            state.active.insert(media.media_id);
        }
        let _guard = LiveFetchGuard {
            fetcher: self,
            media_id: media.media_id,
        };
        if self.gated {
            loop {
                if self.state_guard().released.contains(&media.media_id) {
                    break;
                }
                if release_rx.changed().await.is_err() {
                    break;
                }
            }
        }
        Ok(())
    }

    async fn extract_first_frame(&self, media: MediaReference) -> Result<()> {
        self.state_guard().first_frames.push(media.media_id);
        Ok(())
    }
}

/// Recording loader for placeholder fetches and view-receipt refreshes.
#[derive(Default)]
pub struct MemoryStoryLoader {
    requested: StdMutex<Vec<StoryKey>>,
    refreshed: StdMutex<Vec<StoryKey>>,
}

impl MemoryStoryLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn requested_loads(&self) -> Vec<StoryKey> {
        self.requested
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn refreshed_views(&self) -> Vec<StoryKey> {
        self.refreshed
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

#[async_trait]
impl StoryLoader for MemoryStoryLoader {
    async fn load_stories(&self, keys: Vec<StoryKey>) -> Result<()> {
        self.requested
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .extend(keys);
        Ok(())
    }

    async fn refresh_story_views(&self, key: StoryKey) -> Result<()> {
        self.refreshed
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(key);
        Ok(())
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
