//! Single-item and single-peer instantiations of the pager pattern: one
//! always-central context, no subscription ordering, no neighbor peers.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use shared::domain::{PeerId, StoryEntry, StoryId, StoryKey};
use storage::{MediaFetcher, StoryLoader, StoryStore};
use tokio::sync::{broadcast, watch};
use tracing::{debug, warn};

use crate::{
    peer_context::{unloaded_peer, PeerContext},
    reconcile_prefetch_tasks,
    slice::{StoryFeedState, StorySlice},
    AbortOnDrop, ItemNavigation, Navigation, PagerConfig, StoryContentContext,
};

/// Direct navigation to one known story: a single-entry slice with no
/// neighbors. Placeholder content is requested once; pending-id remaps are
/// followed so a deep link survives the upload completing underneath it.
pub struct SingleStoryContext {
    store: StoryStore,
    state_rx: watch::Receiver<StoryFeedState>,
    updated_tx: broadcast::Sender<()>,
    ready_rx: watch::Receiver<bool>,
    _task: AbortOnDrop,
}

impl SingleStoryContext {
    pub fn new(
        store: StoryStore,
        fetcher: Arc<dyn MediaFetcher>,
        loader: Arc<dyn StoryLoader>,
        key: StoryKey,
        config: PagerConfig,
    ) -> Self {
        let (state_tx, state_rx) = watch::channel(StoryFeedState::default());
        let (updated_tx, _) = broadcast::channel(64);
        let (ready_tx, ready_rx) = watch::channel(false);
        let task = tokio::spawn(run_single(
            store.clone(),
            fetcher,
            loader,
            key,
            config,
            state_tx,
            updated_tx.clone(),
            ready_tx,
        ));
        Self {
            store,
            state_rx,
            updated_tx,
            ready_rx,
            _task: AbortOnDrop(task),
        }
    }

    pub fn subscribe_ready(&self) -> watch::Receiver<bool> {
        self.ready_rx.clone()
    }
}

#[async_trait]
impl StoryContentContext for SingleStoryContext {
    fn state(&self) -> StoryFeedState {
        self.state_rx.borrow().clone()
    }

    fn subscribe_state(&self) -> watch::Receiver<StoryFeedState> {
        self.state_rx.clone()
    }

    fn subscribe_updated(&self) -> broadcast::Receiver<()> {
        self.updated_tx.subscribe()
    }

    async fn navigate(&self, _navigation: Navigation) {
        debug!("navigation unavailable in single-story context");
    }

    async fn mark_as_seen(&self, key: StoryKey) {
        self.store.mark_seen(key).await;
    }

    async fn reset_side_states(&self) {}
}

#[allow(clippy::too_many_arguments)]
async fn run_single(
    store: StoryStore,
    fetcher: Arc<dyn MediaFetcher>,
    loader: Arc<dyn StoryLoader>,
    key: StoryKey,
    config: PagerConfig,
    state_tx: watch::Sender<StoryFeedState>,
    updated_tx: broadcast::Sender<()>,
    ready_tx: watch::Sender<bool>,
) {
    let mut stories_rx = store.subscribe_stories(key.peer_id).await;
    let mut requested_load = false;
    let mut prefetch_task: Option<AbortOnDrop> = None;
    loop {
        let view = store.peer_stories(key.peer_id).await;
        let peer = store
            .peer(key.peer_id)
            .await
            .unwrap_or_else(|| unloaded_peer(key.peer_id));

        let resolved_id = match view.remaps.get(&key.id) {
            Some(mapped) if !view.entries.iter().any(|entry| entry.id() == key.id) => *mapped,
            _ => key.id,
        };
        let entry = view
            .entries
            .iter()
            .find(|entry| entry.id() == resolved_id)
            .cloned()
            .or_else(|| {
                view.pending
                    .iter()
                    .find(|item| item.id == resolved_id)
                    .cloned()
                    .map(StoryEntry::Item)
            });

        let state = match entry {
            Some(entry) => {
                match &entry {
                    StoryEntry::Item(item) => {
                        if prefetch_task.is_none() {
                            let fetcher = Arc::clone(&fetcher);
                            let media = item.media;
                            let video_head_bytes = config.video_head_bytes;
                            prefetch_task = Some(AbortOnDrop(tokio::spawn(async move {
                                let preload = crate::prefetch::preload_story_media(
                                    fetcher.as_ref(),
                                    media,
                                    storage::FetchPriority(0),
                                    video_head_bytes,
                                )
                                .await;
                                if let Err(err) = preload {
                                    warn!(media_id = media.media_id.0, error = %err, "story media preload failed");
                                }
                            })));
                        }
                    }
                    StoryEntry::Placeholder { .. } => {
                        if !requested_load {
                            requested_load = true;
                            let loader = Arc::clone(&loader);
                            let load_key = StoryKey {
                                peer_id: key.peer_id,
                                id: resolved_id,
                            };
                            tokio::spawn(async move {
                                if let Err(err) = loader.load_stories(vec![load_key]).await {
                                    warn!(error = %err, "placeholder load request failed");
                                }
                            });
                        }
                    }
                }
                StoryFeedState {
                    current: Some(StorySlice {
                        peer,
                        focused: entry.item().cloned(),
                        focused_id: Some(entry.id()),
                        total_count: 1,
                        previous_id: None,
                        next_id: None,
                        entries: vec![entry],
                    }),
                    ..StoryFeedState::default()
                }
            }
            None => StoryFeedState::default(),
        };

        let changed = state_tx.send_if_modified(|value| {
            if *value == state {
                false
            } else {
                *value = state;
                true
            }
        });
        if changed {
            let _ = updated_tx.send(());
        }
        ready_tx.send_if_modified(|ready| {
            if *ready {
                false
            } else {
                *ready = true;
                true
            }
        });

        if stories_rx.changed().await.is_err() {
            break;
        }
    }
}

/// One peer's full story list with item navigation only, for pinned/archive
/// style screens. The single context is always central.
pub struct PeerStoriesContext {
    store: StoryStore,
    central: Arc<PeerContext>,
    state_rx: watch::Receiver<StoryFeedState>,
    updated_tx: broadcast::Sender<()>,
    _task: AbortOnDrop,
}

impl PeerStoriesContext {
    pub fn new(
        store: StoryStore,
        fetcher: Arc<dyn MediaFetcher>,
        loader: Arc<dyn StoryLoader>,
        peer_id: PeerId,
        initial_focus: Option<StoryId>,
        config: PagerConfig,
    ) -> Self {
        let central = Arc::new(PeerContext::new(
            store.clone(),
            loader,
            peer_id,
            initial_focus,
            config.load_radius,
        ));
        let (state_tx, state_rx) = watch::channel(StoryFeedState::default());
        let (updated_tx, _) = broadcast::channel(64);
        let task = tokio::spawn(forward_central(
            central.subscribe(),
            fetcher,
            config,
            state_tx,
            updated_tx.clone(),
        ));
        Self {
            store,
            central,
            state_rx,
            updated_tx,
            _task: AbortOnDrop(task),
        }
    }

    pub fn subscribe_ready(&self) -> watch::Receiver<bool> {
        self.central.subscribe_ready()
    }
}

#[async_trait]
impl StoryContentContext for PeerStoriesContext {
    fn state(&self) -> StoryFeedState {
        self.state_rx.borrow().clone()
    }

    fn subscribe_state(&self) -> watch::Receiver<StoryFeedState> {
        self.state_rx.clone()
    }

    fn subscribe_updated(&self) -> broadcast::Receiver<()> {
        self.updated_tx.subscribe()
    }

    async fn navigate(&self, navigation: Navigation) {
        let item_navigation = match navigation {
            Navigation::Item(item_navigation) => item_navigation,
            Navigation::Peer(_) => {
                debug!("peer navigation unavailable in single-peer context");
                return;
            }
        };
        let Some(slice) = self.central.current_slice() else {
            return;
        };
        let target = match item_navigation {
            ItemNavigation::Previous => slice.previous_id,
            ItemNavigation::Next => slice.next_id,
            ItemNavigation::Id(id) => Some(id),
        };
        match target {
            Some(id) => self.central.set_focused_id(Some(id)),
            None => debug!(
                peer_id = self.central.peer_id().0,
                "item navigation at list boundary"
            ),
        }
    }

    async fn mark_as_seen(&self, key: StoryKey) {
        self.store.mark_seen(key).await;
    }

    async fn reset_side_states(&self) {}
}

async fn forward_central(
    mut slice_rx: watch::Receiver<Option<StorySlice>>,
    fetcher: Arc<dyn MediaFetcher>,
    config: PagerConfig,
    state_tx: watch::Sender<StoryFeedState>,
    updated_tx: broadcast::Sender<()>,
) {
    let mut prefetch_tasks: HashMap<shared::domain::MediaId, AbortOnDrop> = HashMap::new();
    loop {
        let state = StoryFeedState {
            current: slice_rx.borrow_and_update().clone(),
            ..StoryFeedState::default()
        };
        let committed = state.clone();
        let changed = state_tx.send_if_modified(|value| {
            if *value == state {
                false
            } else {
                *value = state;
                true
            }
        });
        if changed {
            let _ = updated_tx.send(());
            reconcile_prefetch_tasks(
                &mut prefetch_tasks,
                &fetcher,
                &committed,
                config.prefetch_count,
                config.video_head_bytes,
            );
        }
        if slice_rx.changed().await.is_err() {
            break;
        }
    }
}

#[cfg(test)]
#[path = "tests/single_tests.rs"]
mod tests;
